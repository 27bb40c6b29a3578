//! Shared error metric used by baselines and the PMF pipeline alike.

use thiserror::Error;

use crate::matrix::Matrix;

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("shape mismatch: ground truth is {0}x{1} but prediction is {2}x{3}")]
    ShapeMismatch(usize, usize, usize, usize),
    #[error("ground truth has no observed cells")]
    NoObservedCells,
}

/// Root-mean-squared error over the observed cells of `ground_truth`.
///
/// Cells that are missing in the ground truth are excluded from both the
/// numerator and the denominator, no matter what the prediction contains
/// there. Every method in the pipeline is scored through this one function
/// so the comparison across methods stays valid.
pub fn rmse(ground_truth: &Matrix, predicted: &Matrix) -> Result<f64, EvalError> {
    if ground_truth.shape() != predicted.shape() {
        let (gr, gc) = ground_truth.shape();
        let (pr, pc) = predicted.shape();
        return Err(EvalError::ShapeMismatch(gr, gc, pr, pc));
    }
    let mut sum = 0.0;
    let mut count = 0usize;
    for (i, j, value) in ground_truth.observed_cells() {
        let err = value - predicted.get(i, j);
        sum += err * err;
        count += 1;
    }
    if count == 0 {
        return Err(EvalError::NoObservedCells);
    }
    Ok((sum / count as f64).sqrt())
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn rmse_is_nonnegative(
            gt in proptest::collection::vec(-10.0f64..10.0, 12),
            pred in proptest::collection::vec(-10.0f64..10.0, 12),
        ) {
            let gt = Matrix::from_vec(3, 4, gt);
            let pred = Matrix::from_vec(3, 4, pred);
            let value = rmse(&gt, &pred).unwrap();
            prop_assert!(value >= 0.0);
        }

        #[test]
        fn rmse_against_self_is_zero(
            gt in proptest::collection::vec(-10.0f64..10.0, 12),
        ) {
            let gt = Matrix::from_vec(3, 4, gt);
            prop_assert_eq!(rmse(&gt, &gt).unwrap(), 0.0);
        }
    }
}
