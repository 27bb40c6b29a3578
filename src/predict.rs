//! Posterior-predictive aggregation and convergence diagnostics.
//!
//! A single `(U, V)` pair predicts by drawing every cell from
//! `Normal(dot(U_i, V_j), 1 / sqrt(alpha))` and clipping to the rating
//! bounds. A sample sequence is folded into a streaming running mean, so
//! memory stays `O(N * M)` no matter how many draws the trace holds.

use anyhow::Result;
use itertools::Itertools;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::{debug, warn};

use crate::evaluate::rmse;
use crate::math;
use crate::matrix::Matrix;

/// Draw one predicted rating matrix from a latent pair.
///
/// Every returned value lies inside `bounds`, whatever `u`, `v` and
/// `alpha` contain.
pub fn predict_point<R: Rng + ?Sized>(
    u: &Matrix,
    v: &Matrix,
    alpha: f64,
    bounds: (f64, f64),
    rng: &mut R,
) -> Matrix {
    assert!(u.ncols() == v.ncols(), "latent dimensions differ");
    assert!(alpha > 0.0 && alpha.is_finite());
    let noise = Normal::new(0.0, 1.0 / alpha.sqrt()).expect("positive std");

    let mut prediction = Matrix::zeros(u.nrows(), v.nrows());
    for i in 0..u.nrows() {
        for j in 0..v.nrows() {
            let mean = math::dot(u.row(i), v.row(j));
            let value = (mean + noise.sample(rng)).clamp(bounds.0, bounds.1);
            prediction.set(i, j, value);
        }
    }
    prediction
}

/// Streaming arithmetic mean of a sequence of equally shaped matrices.
pub struct RunningMean {
    mean: Matrix,
    count: u64,
}

impl RunningMean {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        RunningMean {
            mean: Matrix::zeros(nrows, ncols),
            count: 0,
        }
    }

    pub fn update(&mut self, value: &Matrix) {
        assert!(value.shape() == self.mean.shape());
        self.count += 1;
        let scale = 1.0 / self.count as f64;
        for i in 0..self.mean.nrows() {
            for j in 0..self.mean.ncols() {
                let old = self.mean.get(i, j);
                self.mean.set(i, j, old + scale * (value.get(i, j) - old));
            }
        }
    }

    pub fn current(&self) -> &Matrix {
        &self.mean
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Per-sample convergence traces of one aggregation pass.
///
/// All vectors have one entry per aggregated (post burn-in) sample, in
/// draw order. Per-step RMSE scores that single draw's prediction;
/// running RMSE scores the cumulative mean up to that index. A train
/// RMSE persistently below a widening test RMSE is the overfitting
/// signature.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub u_norms: Vec<f64>,
    pub v_norms: Vec<f64>,
    pub per_step_rmse_train: Vec<f64>,
    pub per_step_rmse_test: Vec<f64>,
    pub running_rmse_train: Vec<f64>,
    pub running_rmse_test: Vec<f64>,
}

/// Result of folding a sample sequence into a prediction.
#[derive(Debug)]
pub struct Aggregated {
    /// Running mean of the per-sample predicted matrices.
    pub prediction: Matrix,
    pub diagnostics: Diagnostics,
    /// Number of samples that entered the mean.
    pub used_samples: usize,
    /// Burn-in actually applied (clamped to the available samples).
    pub burn_in: usize,
}

/// Fold `samples` into a posterior-predictive mean with diagnostics.
///
/// `sample_count` must equal the total length of the sequence: the
/// burn-in clamp is decided from it before any sample is consumed. A
/// sequence of a different length is logged as a warning and the clamp
/// decision may then be wrong. A `burn_in` of at least `sample_count` is
/// silently clamped to zero so the full sequence is used. The sequence
/// order matters and is consumed strictly sequentially.
#[allow(clippy::too_many_arguments)]
pub fn aggregate<R, I, E>(
    samples: I,
    sample_count: usize,
    burn_in: usize,
    alpha: f64,
    bounds: (f64, f64),
    train: &Matrix,
    test: &Matrix,
    rng: &mut R,
) -> Result<Aggregated>
where
    R: Rng + ?Sized,
    I: IntoIterator<Item = Result<(Matrix, Matrix), E>>,
    E: Into<anyhow::Error>,
{
    let burn_in = if burn_in >= sample_count {
        debug!(
            burn_in,
            sample_count, "burn-in exceeds the trace; using the full sequence"
        );
        0
    } else {
        burn_in
    };

    let mut running = RunningMean::new(train.nrows(), train.ncols());
    let mut diagnostics = Diagnostics::default();

    let mut seen = 0usize;
    for (index, sample) in samples.into_iter().enumerate() {
        seen = index + 1;
        let (u, v) = sample.map_err(Into::into)?;
        if index < burn_in {
            continue;
        }
        let prediction = predict_point(&u, &v, alpha, bounds, rng);
        running.update(&prediction);

        diagnostics.u_norms.push(u.frob_norm());
        diagnostics.v_norms.push(v.frob_norm());
        diagnostics
            .per_step_rmse_train
            .push(rmse(train, &prediction)?);
        diagnostics.per_step_rmse_test.push(rmse(test, &prediction)?);
        diagnostics
            .running_rmse_train
            .push(rmse(train, running.current())?);
        diagnostics
            .running_rmse_test
            .push(rmse(test, running.current())?);
    }
    if seen != sample_count {
        warn!(
            declared = sample_count,
            actual = seen,
            "declared sample count disagrees with the sequence length"
        );
    }

    Ok(Aggregated {
        prediction: running.mean,
        used_samples: running.count as usize,
        diagnostics,
        burn_in,
    })
}

/// Split potential scale reduction factor (Gelman-Rubin R-hat) over one
/// scalar series per chain.
///
/// Pooled diagnostic across chains; the per-chain traces above are not
/// affected by it. Returns `None` when fewer than two half-chains of at
/// least two values are available.
pub fn potential_scale_reduction(chains: &[Vec<f64>]) -> Option<f64> {
    let half_len = chains.iter().map(|c| c.len() / 2).min()?;
    if half_len < 2 {
        return None;
    }
    let halves = chains
        .iter()
        .flat_map(|c| {
            let trimmed = &c[c.len() - 2 * half_len..];
            let (a, b) = trimmed.split_at(half_len);
            [a, b]
        })
        .collect_vec();
    if halves.len() < 2 {
        return None;
    }

    let n = half_len as f64;
    let m = halves.len() as f64;
    let means = halves.iter().map(|h| math::mean(h)).collect_vec();
    let grand_mean = math::mean(&means);
    let between = n / (m - 1.0)
        * means
            .iter()
            .map(|x| (x - grand_mean) * (x - grand_mean))
            .sum::<f64>();
    let within = halves
        .iter()
        .map(|h| {
            let mean = math::mean(h);
            h.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0)
        })
        .sum::<f64>()
        / m;
    if within <= 0.0 {
        return None;
    }
    let var_estimate = (n - 1.0) / n * within + between / n;
    Some((var_estimate / within).sqrt())
}
