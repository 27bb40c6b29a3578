//! The probabilistic matrix factorization model.
//!
//! Fixed generative model: each observed rating is Gaussian with mean
//! `dot(U_i, V_j)` and precision `alpha`; rows of `U` and `V` carry
//! spherical Gaussian priors with precisions `alpha_u` and `alpha_v`.
//! The two prior precisions are derived once from the mean row-wise and
//! column-wise variance of the mean-imputed training matrix and stay
//! fixed for the lifetime of the model.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;
use tracing::debug;

use crate::math;
use crate::matrix::Matrix;

/// Configuration surface of the inference engine.
#[derive(Debug, Clone, Copy)]
pub struct PmfConfig {
    /// Latent dimensionality `D`, fixed at model construction.
    pub dim: usize,
    /// Likelihood precision of a single rating.
    pub alpha: f64,
    /// Standard deviation of the Gaussian used to initialize `U` and `V`.
    /// Small, so initial predictions stay near zero.
    pub init_scale: f64,
    /// Inclusive bounds of the rating scale; predictions are clipped here.
    pub bounds: (f64, f64),
}

impl Default for PmfConfig {
    fn default() -> Self {
        PmfConfig {
            dim: 10,
            alpha: 2.0,
            init_scale: 0.01,
            bounds: (-10.0, 10.0),
        }
    }
}

/// Configuration errors. All of these fail fast, before any expensive
/// computation starts.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("latent dimensionality must be positive")]
    InvalidDim,
    #[error("likelihood precision alpha must be positive and finite, got {0}")]
    InvalidAlpha(f64),
    #[error("initialization noise scale must be positive and finite, got {0}")]
    InvalidInitScale(f64),
    #[error("rating bounds must satisfy low < high, got ({0}, {1})")]
    InvalidBounds(f64, f64),
    #[error("rating matrix has no observed cells")]
    EmptyMatrix,
    #[error("row {0} has no observed ratings; its variance is undefined")]
    DegenerateRow(usize),
    #[error("column {0} has no observed ratings; its variance is undefined")]
    DegenerateColumn(usize),
    #[error("derived precision {name} is not positive and finite (mean variance {mean_variance})")]
    DegeneratePrecision { name: &'static str, mean_variance: f64 },
}

/// Errors raised while evaluating the log density during sampling.
///
/// Recoverable errors are treated as divergences (the proposal is
/// rejected); non-recoverable errors abort the chain.
pub trait LogpError: std::error::Error {
    fn is_recoverable(&self) -> bool;
}

#[derive(Error, Debug)]
pub enum PmfLogpError {
    #[error("log density is not finite at the proposed position")]
    NonFinite,
}

impl LogpError for PmfLogpError {
    fn is_recoverable(&self) -> bool {
        // A non-finite density is an excursion of the trajectory, not a bug.
        matches!(self, PmfLogpError::NonFinite)
    }
}

/// One model instance: ratings plus derived hyperparameters.
///
/// The rating matrix is read-only and shared by every component and chain;
/// the model owns no mutable state.
pub struct PmfModel {
    ratings: Matrix,
    config: PmfConfig,
    alpha_u: f64,
    alpha_v: f64,
}

impl PmfModel {
    /// Build the joint-density specification for `ratings`.
    ///
    /// Missing cells are mean-imputed on a working copy that feeds *only*
    /// the variance-based derivation of `alpha_u` / `alpha_v`; the true
    /// missingness mask still governs the likelihood.
    pub fn new(ratings: Matrix, config: PmfConfig) -> Result<Self, ModelError> {
        if config.dim == 0 {
            return Err(ModelError::InvalidDim);
        }
        if !(config.alpha.is_finite() && config.alpha > 0.0) {
            return Err(ModelError::InvalidAlpha(config.alpha));
        }
        if !(config.init_scale.is_finite() && config.init_scale > 0.0) {
            return Err(ModelError::InvalidInitScale(config.init_scale));
        }
        if !(config.bounds.0 < config.bounds.1) {
            return Err(ModelError::InvalidBounds(config.bounds.0, config.bounds.1));
        }
        if ratings.count_observed() == 0 {
            return Err(ModelError::EmptyMatrix);
        }
        for i in 0..ratings.nrows() {
            if (0..ratings.ncols()).all(|j| !ratings.is_observed(i, j)) {
                return Err(ModelError::DegenerateRow(i));
            }
        }
        for j in 0..ratings.ncols() {
            if (0..ratings.nrows()).all(|i| !ratings.is_observed(i, j)) {
                return Err(ModelError::DegenerateColumn(j));
            }
        }

        let imputed = ratings.mean_imputed().expect("observed cells exist");
        let alpha_u = derived_precision("alpha_u", &imputed.row_variances())?;
        let alpha_v = derived_precision("alpha_v", &imputed.col_variances())?;
        debug!(alpha_u, alpha_v, dim = config.dim, "derived prior precisions");

        Ok(PmfModel {
            ratings,
            config,
            alpha_u,
            alpha_v,
        })
    }

    pub fn n_users(&self) -> usize {
        self.ratings.nrows()
    }

    pub fn n_items(&self) -> usize {
        self.ratings.ncols()
    }

    /// Latent dimensionality `D`.
    pub fn latent_dim(&self) -> usize {
        self.config.dim
    }

    /// Dimension of the flat parameter vector `flatten(U) ++ flatten(V)`.
    pub fn dim(&self) -> usize {
        self.config.dim * (self.n_users() + self.n_items())
    }

    pub fn alpha(&self) -> f64 {
        self.config.alpha
    }

    pub fn alpha_u(&self) -> f64 {
        self.alpha_u
    }

    pub fn alpha_v(&self) -> f64 {
        self.alpha_v
    }

    pub fn bounds(&self) -> (f64, f64) {
        self.config.bounds
    }

    pub fn ratings(&self) -> &Matrix {
        &self.ratings
    }

    /// Split a flat position into the `U` and `V` blocks.
    pub fn split_position<'a>(&self, position: &'a [f64]) -> (&'a [f64], &'a [f64]) {
        assert!(position.len() == self.dim());
        position.split_at(self.config.dim * self.n_users())
    }

    /// Copy a flat position into `(N,D)` and `(M,D)` matrices.
    pub fn unpack(&self, position: &[f64]) -> (Matrix, Matrix) {
        let (u, v) = self.split_position(position);
        (
            Matrix::from_vec(self.n_users(), self.config.dim, u.to_vec()),
            Matrix::from_vec(self.n_items(), self.config.dim, v.to_vec()),
        )
    }

    /// Flatten `(U, V)` back into one parameter vector.
    pub fn pack(&self, u: &Matrix, v: &Matrix) -> Vec<f64> {
        assert!(u.shape() == (self.n_users(), self.config.dim));
        assert!(v.shape() == (self.n_items(), self.config.dim));
        let mut position = Vec::with_capacity(self.dim());
        position.extend_from_slice(u.as_slice());
        position.extend_from_slice(v.as_slice());
        position
    }

    /// Unnormalized log joint density and its gradient.
    ///
    /// Only observed cells contribute to the likelihood sum. The gradient
    /// buffer must have length [`PmfModel::dim`].
    pub fn logp(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, PmfLogpError> {
        assert!(gradient.len() == position.len());
        let d = self.config.dim;
        let n_users = self.n_users();
        let (u, v) = self.split_position(position);
        gradient.fill(0.0);
        let (grad_u, grad_v) = gradient.split_at_mut(d * n_users);

        let mut logp = 0.0;
        for (i, j, rating) in self.ratings.observed_cells() {
            let ui = &u[i * d..(i + 1) * d];
            let vj = &v[j * d..(j + 1) * d];
            let residual = rating - math::dot(ui, vj);
            logp -= 0.5 * self.config.alpha * residual * residual;
            let scale = self.config.alpha * residual;
            math::axpy(vj, &mut grad_u[i * d..(i + 1) * d], scale);
            math::axpy(ui, &mut grad_v[j * d..(j + 1) * d], scale);
        }

        logp -= 0.5 * self.alpha_u * math::squared_norm(u);
        logp -= 0.5 * self.alpha_v * math::squared_norm(v);
        math::axpy(u, grad_u, -self.alpha_u);
        math::axpy(v, grad_v, -self.alpha_v);

        if !logp.is_finite() || gradient.iter().any(|g| !g.is_finite()) {
            return Err(PmfLogpError::NonFinite);
        }
        Ok(logp)
    }

    /// The MAP objective: sum of squared errors over observed cells plus
    /// quadratic regularization weighted by `alpha_u / alpha` and
    /// `alpha_v / alpha`. Minimizing this is equivalent to maximizing
    /// [`PmfModel::logp`].
    pub fn objective(&self, position: &[f64]) -> f64 {
        let d = self.config.dim;
        let (u, v) = self.split_position(position);
        let mut sse = 0.0;
        for (i, j, rating) in self.ratings.observed_cells() {
            let residual = rating - math::dot(&u[i * d..(i + 1) * d], &v[j * d..(j + 1) * d]);
            sse += residual * residual;
        }
        sse + self.alpha_u / self.config.alpha * math::squared_norm(u)
            + self.alpha_v / self.config.alpha * math::squared_norm(v)
    }

    /// Draw an initial position from a zero-mean Gaussian with the
    /// configured noise scale.
    pub fn init_position<R: Rng + ?Sized>(&self, rng: &mut R, position: &mut [f64]) {
        assert!(position.len() == self.dim());
        let noise = Normal::new(0.0, self.config.init_scale).expect("validated scale");
        position.iter_mut().for_each(|x| *x = noise.sample(rng));
    }
}

fn derived_precision(name: &'static str, variances: &[f64]) -> Result<f64, ModelError> {
    let mean_variance = math::mean(variances);
    let precision = 1.0 / mean_variance;
    if !(precision.is_finite() && precision > 0.0) {
        return Err(ModelError::DegeneratePrecision {
            name,
            mean_variance,
        });
    }
    Ok(precision)
}
