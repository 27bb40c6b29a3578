//! The user-facing inference pipeline.
//!
//! [`Pmf`] ties one model to a storage root and owns the lazily produced
//! state: at most one MAP estimate and at most one persisted sample
//! sequence. Every operation the pipeline offers is declared here up
//! front; nothing is attached after construction.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use rand::Rng;
use tracing::info;

use crate::evaluate::{self, EvalError};
use crate::map::{self, MapEstimate, MapSource, PowellOptions};
use crate::matrix::Matrix;
use crate::model::PmfModel;
use crate::predict::{self, Aggregated};
use crate::sampler::{self, SampleSettings};
use crate::storage::{self, TraceReader};

pub struct Pmf {
    model: PmfModel,
    store: PathBuf,
    map: Option<MapEstimate>,
}

impl Pmf {
    pub fn new(model: PmfModel, store: impl Into<PathBuf>) -> Self {
        Pmf {
            model,
            store: store.into(),
            map: None,
        }
    }

    pub fn model(&self) -> &PmfModel {
        &self.model
    }

    pub fn map(&self) -> Option<&MapEstimate> {
        self.map.as_ref()
    }

    /// Trace location of this model, keyed by latent dimensionality like
    /// the MAP snapshot.
    pub fn trace_root(&self) -> PathBuf {
        self.store
            .join(format!("trace-d{:02}", self.model.latent_dim()))
    }

    /// Obtain the MAP estimate, reusing a cached or persisted one when
    /// available. Freshly computed estimates are persisted before this
    /// returns.
    pub fn find_map<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        options: &PowellOptions,
    ) -> Result<MapSource> {
        let (estimate, source) =
            map::fetch_or_compute(&self.model, self.map.take(), &self.store, rng, options)?;
        self.map = Some(estimate);
        Ok(source)
    }

    /// Load the persisted MAP estimate, bypassing optimization entirely.
    /// Absent or corrupt state is a hard failure.
    pub fn load_map(&mut self) -> Result<&MapEstimate> {
        let estimate = map::load_map(&self.store, &self.model)?;
        Ok(self.map.insert(estimate))
    }

    /// Draw posterior samples starting from the MAP estimate, persisting
    /// each chain incrementally under [`Pmf::trace_root`].
    pub fn draw_samples(&mut self, settings: &SampleSettings) -> Result<()> {
        let Some(estimate) = &self.map else {
            bail!("no MAP estimate available; call find_map or load_map before sampling");
        };
        let start = self.model.pack(&estimate.u, &estimate.v);
        sampler::sample_chains(&self.model, &start, settings, &self.trace_root())
    }

    /// Open the persisted trace, one reader per chain in chain-id order.
    pub fn load_trace(&self) -> Result<Vec<TraceReader>> {
        storage::open_chains(&self.trace_root()).with_context(|| {
            format!(
                "failed to open trace at {}",
                self.trace_root().display()
            )
        })
    }

    /// Posterior-predictive mean plus convergence diagnostics.
    ///
    /// Uses the persisted trace when one exists (chains concatenated in
    /// chain-id order), otherwise falls back to a single draw from the
    /// MAP point.
    pub fn predict<R: Rng + ?Sized>(
        &self,
        burn_in: usize,
        train: &Matrix,
        test: &Matrix,
        rng: &mut R,
    ) -> Result<Aggregated> {
        let alpha = self.model.alpha();
        let bounds = self.model.bounds();

        let root = self.trace_root();
        if root.is_dir() {
            let readers = storage::open_chains(&root)?;
            let total: usize = readers.iter().map(TraceReader::len).sum();
            if total > 0 {
                info!(samples = total, chains = readers.len(), "predicting from trace");
                let samples = readers.iter().flat_map(|reader| reader.iter());
                return predict::aggregate(
                    samples, total, burn_in, alpha, bounds, train, test, rng,
                );
            }
        }

        let Some(estimate) = &self.map else {
            bail!("nothing to predict from: no trace on disk and no MAP estimate");
        };
        info!("predicting from the MAP point estimate");
        let single = std::iter::once(anyhow::Ok((estimate.u.clone(), estimate.v.clone())));
        predict::aggregate(single, 1, 0, alpha, bounds, train, test, rng)
    }

    /// RMSE of a prediction against ground truth, observed cells only.
    pub fn evaluate(&self, ground_truth: &Matrix, predicted: &Matrix) -> Result<f64, EvalError> {
        evaluate::rmse(ground_truth, predicted)
    }
}
