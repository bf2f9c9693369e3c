//! Dataset records, loading, splitting, validation and synthesis.

pub mod loader;
pub mod narrative;
pub mod record;
pub mod split;
pub mod synth;
pub mod validate;

pub use loader::{DatasetFormat, DatasetLoader};
pub use record::{
    DEFAULT_DOMAIN, JudgmentRecord, ObservationRecord, SituationClass, TrainingExample,
};
pub use split::{DataSplit, train_test_split};
pub use synth::{DatasetSchema, SyntheticGenerator, write_dataset};
pub use validate::{DatasetQualityReport, GuidelineRatios, IssueKind, validate_dataset};
