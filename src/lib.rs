//! Bayesian probabilistic matrix factorization.
//!
//! Predicts the missing entries of a sparse user-item rating matrix by
//! learning low-dimensional latent factors `U` (users) and `V` (items)
//! under a factorized Gaussian likelihood with spherical Gaussian priors.
//!
//! The pipeline, end to end:
//!
//! 1. [`train_test_split`] partitions the observed cells of a rating
//!    matrix into disjoint train/test sets, identified by a content hash.
//! 2. [`PmfModel::new`] derives the prior precisions and builds the joint
//!    density over `U` and `V`.
//! 3. [`Pmf::find_map`] finds a posterior mode with a derivative-free
//!    Powell search and persists it.
//! 4. [`Pmf::draw_samples`] runs parallel Hamiltonian chains seeded at the
//!    MAP point, persisting every draw incrementally.
//! 5. [`Pmf::predict`] folds the draws into a streaming posterior-
//!    predictive mean with convergence diagnostics, scored by [`rmse`].
//!
//! All randomness flows through explicitly passed, explicitly seeded
//! `rand` generators; logging goes through `tracing`, with the subscriber
//! lifecycle owned by the caller.

pub mod engine;
pub mod evaluate;
pub mod map;
pub(crate) mod math;
pub mod matrix;
pub mod model;
pub mod predict;
pub mod sampler;
pub mod split;
pub mod storage;

pub use engine::Pmf;
pub use evaluate::{rmse, EvalError};
pub use map::{
    fetch_or_compute, find_map, MapEstimate, MapSource, PowellOptions, PowellResult,
};
pub use matrix::{Matrix, MISSING};
pub use model::{LogpError, ModelError, PmfConfig, PmfLogpError, PmfModel};
pub use predict::{
    aggregate, potential_scale_reduction, predict_point, Aggregated, Diagnostics, RunningMean,
};
pub use sampler::{sample_chain, sample_chains, PmfChain, Progress, SampleSettings, SamplerError};
pub use split::{train_test_split, SplitError, TrainTestSplit};
pub use storage::{open_chains, StorageError, TraceReader, TraceWriter};
