//! Transductive train/test splitting of a rating matrix.
//!
//! The held-out cells are a uniform sample without replacement over the
//! observed cell coordinates. A split is identified by a content hash of
//! the sorted held-out flat indices, so the same id always reconstructs
//! the same split.

use std::path::Path;

use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::matrix::{Matrix, MISSING};
use crate::storage::{self, StorageError};

#[derive(Error, Debug)]
pub enum SplitError {
    #[error("hold-out percentage must lie in [0, 100], got {0}")]
    InvalidPercent(f64),
    #[error("rating matrix has no observed cells to split")]
    EmptyMatrix,
    #[error("stored split {id} does not contain variable {name}")]
    MissingVariable { id: String, name: String },
    #[error("stored split {stored} rehashes to {actual}; the data does not match its id")]
    IdMismatch { stored: String, actual: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A disjoint partition of the observed cells of one rating matrix.
///
/// `train` and `test` have the shape of the source matrix. Held-out cells
/// are missing in `train` and are the only observed cells of `test`.
#[derive(Debug, Clone)]
pub struct TrainTestSplit {
    pub train: Matrix,
    pub test: Matrix,
    /// Content hash of the sorted held-out flat indices (FNV-1a 64, hex).
    pub id: String,
}

/// Partition the observed cells of `ratings` into train and test sets.
///
/// The test set holds `floor(percent / 100 * observed)` cells; fractional
/// remainders stay in train. Selection is uniform without replacement.
pub fn train_test_split<R: Rng + ?Sized>(
    ratings: &Matrix,
    percent: f64,
    rng: &mut R,
) -> Result<TrainTestSplit, SplitError> {
    if !(0.0..=100.0).contains(&percent) {
        return Err(SplitError::InvalidPercent(percent));
    }
    let observed: Vec<(usize, usize)> = ratings.observed_cells().map(|(i, j, _)| (i, j)).collect();
    if observed.is_empty() {
        return Err(SplitError::EmptyMatrix);
    }

    let test_size = (observed.len() as f64 * percent / 100.0).floor() as usize;
    let chosen = rand::seq::index::sample(rng, observed.len(), test_size);

    let mut held_out: Vec<usize> = chosen
        .iter()
        .map(|k| {
            let (i, j) = observed[k];
            i * ratings.ncols() + j
        })
        .collect();
    held_out.sort_unstable();

    let mut train = ratings.clone();
    let mut test = Matrix::filled(ratings.nrows(), ratings.ncols(), MISSING);
    for &flat in &held_out {
        let (i, j) = (flat / ratings.ncols(), flat % ratings.ncols());
        test.set(i, j, ratings.get(i, j));
        train.set(i, j, MISSING);
    }

    let split = TrainTestSplit {
        train,
        test,
        id: hash_indices(&held_out),
    };
    split.check_invariants(ratings);
    debug!(
        id = split.id.as_str(),
        test_size,
        train_size = observed.len() - test_size,
        "split rating matrix"
    );
    Ok(split)
}

impl TrainTestSplit {
    /// Persist both matrices under `root`, keyed by the split id.
    pub fn save(&self, root: &Path) -> Result<(), StorageError> {
        storage::save_snapshot(
            &root.join(format!("split-{}", self.id)),
            &[("train", &self.train), ("test", &self.test)],
        )
    }

    /// Load a previously saved split and verify that its content still
    /// hashes to `id`.
    pub fn load(root: &Path, id: &str) -> Result<TrainTestSplit, SplitError> {
        let mut vars = storage::load_snapshot(&root.join(format!("split-{id}")))?;
        let mut take = |name: &str| {
            vars.remove(name).ok_or_else(|| SplitError::MissingVariable {
                id: id.to_string(),
                name: name.to_string(),
            })
        };
        let train = take("train")?;
        let test = take("test")?;

        let mut held_out: Vec<usize> = test
            .observed_cells()
            .map(|(i, j, _)| i * test.ncols() + j)
            .collect();
        held_out.sort_unstable();
        let actual = hash_indices(&held_out);
        if actual != id {
            return Err(SplitError::IdMismatch {
                stored: id.to_string(),
                actual,
            });
        }
        Ok(TrainTestSplit { train, test, id: actual })
    }

    fn check_invariants(&self, source: &Matrix) {
        let total = source.nrows() * source.ncols();
        let observed = source.count_observed();
        let test_size = self.test.count_observed();
        let train_size = observed - test_size;
        assert!(self.test.count_missing() == total - test_size);
        assert!(self.train.count_missing() == total - train_size);
        for (i, j, _) in source.observed_cells() {
            assert!(
                self.train.is_observed(i, j) != self.test.is_observed(i, j),
                "cell ({i}, {j}) must land in exactly one of train/test"
            );
        }
    }
}

/// FNV-1a 64 over the little-endian bytes of the sorted held-out indices.
/// Stable across platforms and releases, unlike `DefaultHasher`.
fn hash_indices(sorted: &[usize]) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &idx in sorted {
        for byte in (idx as u64).to_le_bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    format!("{hash:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn four_by_four() -> Matrix {
        // 16 cells, 4 missing, 12 observed
        Matrix::from_vec(
            4,
            4,
            vec![
                5.0, 3.0, MISSING, 1.0, //
                4.0, MISSING, MISSING, 1.0, //
                1.0, 1.0, MISSING, 5.0, //
                1.0, 2.0, 4.0, 4.0, //
            ],
        )
    }

    #[test]
    fn quarter_holdout_on_four_by_four() {
        let ratings = four_by_four();
        let mut rng = SmallRng::seed_from_u64(42);
        let split = train_test_split(&ratings, 25.0, &mut rng).unwrap();
        // floor(12 * 0.25) = 3 held-out cells
        assert_eq!(split.test.count_observed(), 3);
        assert_eq!(split.train.count_observed(), 9);
        assert_eq!(split.train.count_missing(), 16 - 9);
        assert_eq!(split.test.count_missing(), 16 - 3);
    }

    #[test]
    fn partition_is_exact() {
        let ratings = four_by_four();
        let mut rng = SmallRng::seed_from_u64(7);
        let split = train_test_split(&ratings, 50.0, &mut rng).unwrap();
        for (i, j, value) in ratings.observed_cells() {
            let in_train = split.train.is_observed(i, j);
            let in_test = split.test.is_observed(i, j);
            assert!(in_train ^ in_test);
            let kept = if in_train {
                split.train.get(i, j)
            } else {
                split.test.get(i, j)
            };
            assert_eq!(kept, value);
        }
    }

    #[test]
    fn same_seed_reproduces_the_id() {
        let ratings = four_by_four();
        let a = train_test_split(&ratings, 25.0, &mut SmallRng::seed_from_u64(3)).unwrap();
        let b = train_test_split(&ratings, 25.0, &mut SmallRng::seed_from_u64(3)).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.train, b.train);
        assert_eq!(a.test, b.test);
    }

    #[test]
    fn zero_percent_keeps_everything_in_train() {
        let ratings = four_by_four();
        let mut rng = SmallRng::seed_from_u64(0);
        let split = train_test_split(&ratings, 0.0, &mut rng).unwrap();
        assert_eq!(split.test.count_observed(), 0);
        assert_eq!(split.train, ratings);
    }

    #[test]
    fn invalid_percent_is_rejected() {
        let ratings = four_by_four();
        let mut rng = SmallRng::seed_from_u64(0);
        assert!(matches!(
            train_test_split(&ratings, 120.0, &mut rng),
            Err(SplitError::InvalidPercent(_))
        ));
    }

    #[test]
    fn save_and_load_round_trip() {
        let ratings = four_by_four();
        let mut rng = SmallRng::seed_from_u64(11);
        let split = train_test_split(&ratings, 25.0, &mut rng).unwrap();
        let dir = tempfile::tempdir().unwrap();
        split.save(dir.path()).unwrap();
        let loaded = TrainTestSplit::load(dir.path(), &split.id).unwrap();
        assert_eq!(loaded.train, split.train);
        assert_eq!(loaded.test, split.test);
        assert_eq!(loaded.id, split.id);
    }
}
