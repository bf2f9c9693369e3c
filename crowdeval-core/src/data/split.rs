//! Seeded train / held-out split.

use crate::data::record::TrainingExample;
use crate::error::PipelineError;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Train and held-out partitions of a dataset.
#[derive(Debug, Clone)]
pub struct DataSplit {
    pub train: Vec<TrainingExample>,
    pub test: Vec<TrainingExample>,
}

/// Shuffle with `seed` and hold out `ceil(len * test_ratio)` examples.
///
/// The same seed and input order always produce the same partition, so a
/// training run and a later evaluation run agree on which rows were held out.
pub fn train_test_split(
    examples: Vec<TrainingExample>,
    test_ratio: f64,
    seed: u64,
) -> Result<DataSplit, PipelineError> {
    if !(0.0..1.0).contains(&test_ratio) {
        return Err(PipelineError::invalid_input(format!(
            "test_ratio must be in [0, 1), got {test_ratio}"
        )));
    }
    let total = examples.len();
    let mut test_len = (total as f64 * test_ratio).ceil() as usize;
    if test_len >= total && total > 0 {
        test_len = total - 1;
    }

    let mut shuffled = examples;
    let mut rng = StdRng::seed_from_u64(seed);
    shuffled.shuffle(&mut rng);

    let test = shuffled.split_off(total - test_len);
    Ok(DataSplit {
        train: shuffled,
        test,
    })
}
