//! Gradient-informed Hamiltonian sampler for the PMF posterior.
//!
//! Each chain starts from a caller-supplied position (by design the MAP
//! estimate; the posterior is non-convex, so arbitrary starting points are
//! allowed but not recommended). The diagonal mass matrix and the initial
//! step size are derived from the curvature at the starting point; the
//! step size then follows dual averaging during the adaptation window.
//!
//! Divergent trajectories are rejected like any Metropolis rejection.
//! During warmup they are expected while the step size settles and never
//! fail the chain; once warmup is over, the run fails when the divergence
//! ratio of the sampling draws exceeds its budget.

use std::path::Path;

use anyhow::{Context, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{LogpError, PmfLogpError, PmfModel};
use crate::storage::{self, StorageError, TraceWriter};

/// Settings for a sampling run.
#[derive(Debug, Clone, Copy)]
pub struct SampleSettings {
    /// Number of posterior draws per chain (`K`).
    pub num_draws: u64,
    /// Number of independent parallel chains.
    pub num_chains: usize,
    /// Seed of the per-chain random streams.
    pub seed: u64,
    /// Leapfrog steps per proposed trajectory.
    pub num_leapfrog: u64,
    /// Draws during which the step size keeps adapting.
    pub num_adapt: u64,
    /// Target acceptance statistic for dual averaging.
    pub target_accept: f64,
    /// Energy error above which a leapfrog step counts as a divergence.
    pub max_energy_error: f64,
    /// The chain fails once diverged / total over the post-warmup draws
    /// exceeds this ratio. Warmup draws are not counted.
    pub max_divergence_ratio: f64,
    /// Post-warmup draws before the divergence ratio is enforced.
    pub divergence_grace: u64,
}

impl Default for SampleSettings {
    fn default() -> Self {
        SampleSettings {
            num_draws: 100,
            num_chains: 2,
            seed: 0,
            num_leapfrog: 32,
            num_adapt: 50,
            target_accept: 0.8,
            max_energy_error: 1000.0,
            max_divergence_ratio: 0.25,
            divergence_grace: 10,
        }
    }
}

/// Diagnostic information about a single draw.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Progress {
    pub draw: u64,
    pub chain: u64,
    pub diverging: bool,
    pub tuning: bool,
    pub step_size: f64,
    pub num_steps: u64,
}

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error(
        "chain {chain}: {divergences} of {draws} sampling draws diverged, \
         exceeding the budget of {limit:.0}%"
    )]
    TooManyDivergences {
        chain: u64,
        divergences: u64,
        draws: u64,
        limit: f64,
    },
    #[error("log density failed at the starting position")]
    BadStartPosition(#[source] PmfLogpError),
}

/// Dual-averaging step size adaptation (Hoffman & Gelman 2014).
#[derive(Clone)]
struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
}

impl DualAverage {
    const K: f64 = 0.75;
    const T0: f64 = 10.0;
    const GAMMA: f64 = 0.05;

    fn new(initial_step: f64) -> Self {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.0,
            mu: (10.0 * initial_step).ln(),
            count: 1,
        }
    }

    fn advance(&mut self, accept_stat: f64, target: f64) {
        let w = 1.0 / (self.count as f64 + Self::T0);
        self.hbar = (1.0 - w) * self.hbar + w * (target - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / Self::GAMMA;
        let mk = (self.count as f64).powf(-Self::K);
        self.log_step_adapted = mk * self.log_step + (1.0 - mk) * self.log_step_adapted;
        self.count += 1;
    }

    fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    fn adapted_step_size(&self) -> f64 {
        self.log_step_adapted.exp()
    }
}

/// One Hamiltonian chain over the PMF posterior.
pub struct PmfChain<'a, R: Rng> {
    model: &'a PmfModel,
    settings: SampleSettings,
    chain: u64,
    rng: R,
    position: Vec<f64>,
    gradient: Vec<f64>,
    logp: f64,
    /// Diagonal of the inverse mass matrix.
    inv_mass: Vec<f64>,
    step: DualAverage,
    draw_count: u64,
    divergences: u64,
    sampling_draws: u64,
    sampling_divergences: u64,
}

impl<'a, R: Rng> PmfChain<'a, R> {
    /// Create a chain positioned at `start`.
    ///
    /// Fails if the log density can not be evaluated there.
    pub fn new(
        model: &'a PmfModel,
        settings: SampleSettings,
        chain: u64,
        start: &[f64],
        rng: R,
    ) -> Result<Self, SamplerError> {
        assert!(start.len() == model.dim());
        let mut gradient = vec![0.0; model.dim()];
        let logp = model
            .logp(start, &mut gradient)
            .map_err(SamplerError::BadStartPosition)?;

        // Curvature-scaled diagonal mass matrix: steep coordinates get
        // small inverse mass, flat ones a large one.
        let inv_mass: Vec<f64> = gradient
            .iter()
            .map(|g| (1.0 / g.abs().max(1e-10)).clamp(1e-6, 1e6))
            .collect();

        let mut chain_state = PmfChain {
            model,
            settings,
            chain,
            rng,
            position: start.to_vec(),
            gradient,
            logp,
            inv_mass,
            step: DualAverage::new(1.0),
            draw_count: 0,
            divergences: 0,
            sampling_draws: 0,
            sampling_divergences: 0,
        };
        let initial_step = chain_state.find_initial_step_size();
        chain_state.step = DualAverage::new(initial_step);
        debug!(chain, initial_step, "initialized chain");
        Ok(chain_state)
    }

    /// Probe the energy error of full-length trajectories, doubling or
    /// halving the step size until the acceptance statistic crosses 0.5.
    /// Probing with `num_leapfrog` steps keeps the accumulated error of
    /// real trajectories comparable to what the probe saw.
    fn find_initial_step_size(&mut self) -> f64 {
        let num_steps = self.settings.num_leapfrog;
        let mut step = 0.1;
        let mut direction = 0i32;
        for _ in 0..32 {
            let momentum = self.draw_momentum();
            let energy = -self.logp + self.kinetic_energy(&momentum);
            let error = match self.trajectory(step, num_steps, momentum) {
                Ok((_, _, _, new_energy)) => new_energy - energy,
                Err(_) => f64::INFINITY,
            };
            let accept = (-error).exp();
            let new_direction = if accept > 0.5 { 1 } else { -1 };
            if direction != 0 && direction != new_direction {
                break;
            }
            direction = new_direction;
            step *= if new_direction == 1 { 2.0 } else { 0.5 };
            if !(1e-10..=1e3).contains(&step) {
                break;
            }
        }
        step.clamp(1e-10, 1e3)
    }

    fn draw_momentum(&mut self) -> Vec<f64> {
        self.inv_mass
            .iter()
            .map(|&im| {
                let z: f64 = self.rng.sample(StandardNormal);
                z / im.sqrt()
            })
            .collect()
    }

    fn kinetic_energy(&self, momentum: &[f64]) -> f64 {
        0.5 * momentum
            .iter()
            .zip(&self.inv_mass)
            .map(|(p, im)| im * p * p)
            .sum::<f64>()
    }

    /// Integrate a leapfrog trajectory from the current state.
    ///
    /// Returns the end position, gradient, log density and total energy,
    /// or the recoverable error that made the trajectory diverge.
    #[allow(clippy::type_complexity)]
    fn trajectory(
        &mut self,
        step: f64,
        num_steps: u64,
        mut momentum: Vec<f64>,
    ) -> Result<(Vec<f64>, Vec<f64>, f64, f64), PmfLogpError> {
        let mut position = self.position.clone();
        let mut gradient = self.gradient.clone();
        let mut logp = self.logp;

        // half step for momentum at the start
        crate::math::axpy(&gradient, &mut momentum, 0.5 * step);
        for leapfrog in 0..num_steps {
            for ((q, p), im) in position
                .iter_mut()
                .zip(&momentum)
                .zip(&self.inv_mass)
            {
                *q += step * im * p;
            }
            logp = self.model.logp(&position, &mut gradient)?;
            let scale = if leapfrog + 1 == num_steps {
                0.5 * step
            } else {
                step
            };
            crate::math::axpy(&gradient, &mut momentum, scale);
        }

        let energy = -logp + self.kinetic_energy(&momentum);
        if !energy.is_finite() {
            return Err(PmfLogpError::NonFinite);
        }
        Ok((position, gradient, logp, energy))
    }

    /// Draw one sample, returning the new position and diagnostics.
    pub fn draw(&mut self) -> Result<(Box<[f64]>, Progress)> {
        let momentum = self.draw_momentum();
        let initial_energy = -self.logp + self.kinetic_energy(&momentum);

        // jitter guards against resonant trajectory lengths
        let step = self.step.current_step_size() * self.rng.random_range(0.8..=1.0);
        let num_steps = self.settings.num_leapfrog;

        let mut diverging = false;
        let mut accept_stat = 0.0;
        match self.trajectory(step, num_steps, momentum) {
            Ok((position, gradient, logp, energy)) => {
                let energy_error = energy - initial_energy;
                if energy_error > self.settings.max_energy_error {
                    diverging = true;
                } else {
                    accept_stat = (-energy_error).exp().min(1.0);
                    if self.rng.random::<f64>() < accept_stat {
                        self.position = position;
                        self.gradient = gradient;
                        self.logp = logp;
                    }
                }
            }
            Err(err) if err.is_recoverable() => {
                diverging = true;
            }
            Err(err) => {
                return Err(err).context("log density failed unrecoverably during a trajectory");
            }
        }

        let tuning = self.draw_count < self.settings.num_adapt;
        if tuning {
            self.step.advance(accept_stat, self.settings.target_accept);
        } else if self.draw_count == self.settings.num_adapt {
            // freeze the smoothed estimate for the rest of the run
            self.step = DualAverage::new(self.step.adapted_step_size());
        }

        self.draw_count += 1;
        if diverging {
            self.divergences += 1;
        }
        // The budget covers sampling draws only; warmup divergences are
        // part of step-size adaptation, not a sign of a broken chain.
        if !tuning {
            self.sampling_draws += 1;
            if diverging {
                self.sampling_divergences += 1;
            }
            let ratio = self.sampling_divergences as f64 / self.sampling_draws as f64;
            if self.sampling_draws >= self.settings.divergence_grace
                && ratio > self.settings.max_divergence_ratio
            {
                return Err(SamplerError::TooManyDivergences {
                    chain: self.chain,
                    divergences: self.sampling_divergences,
                    draws: self.sampling_draws,
                    limit: self.settings.max_divergence_ratio * 100.0,
                }
                .into());
            }
        }

        let progress = Progress {
            draw: self.draw_count - 1,
            chain: self.chain,
            diverging,
            tuning,
            step_size: self.step.current_step_size(),
            num_steps,
        };
        Ok((self.position.clone().into_boxed_slice(), progress))
    }

    pub fn dim(&self) -> usize {
        self.model.dim()
    }

    pub fn divergences(&self) -> u64 {
        self.divergences
    }
}

/// Run one chain to completion, persisting every draw before the next one
/// starts. A killed process leaves a valid truncated trace.
pub fn sample_chain<R: Rng>(
    model: &PmfModel,
    start: &[f64],
    settings: &SampleSettings,
    chain_id: u64,
    writer: &mut TraceWriter,
    rng: R,
) -> Result<()> {
    let mut chain = PmfChain::new(model, *settings, chain_id, start, rng)
        .with_context(|| format!("chain {chain_id} failed to initialize"))?;
    for _ in 0..settings.num_draws {
        let (position, progress) = chain
            .draw()
            .with_context(|| format!("chain {chain_id} failed"))?;
        if progress.diverging {
            debug!(
                chain = chain_id,
                draw = progress.draw,
                "divergent trajectory rejected"
            );
        }
        let (u, v) = model.unpack(&position);
        writer
            .append(&u, &v)
            .with_context(|| format!("chain {chain_id} failed to persist a draw"))?;
    }
    if chain.divergences() > 0 {
        warn!(
            chain = chain_id,
            divergences = chain.divergences(),
            "chain finished with divergences"
        );
    }
    Ok(())
}

/// Draw samples with `settings.num_chains` independent parallel chains.
///
/// Chains share the read-only model and starting point; each owns its
/// random stream and writes to its own `chain-NN` directory under
/// `trace_root`. The run refuses to start if `trace_root` already holds
/// output from a prior run.
pub fn sample_chains(
    model: &PmfModel,
    start: &[f64],
    settings: &SampleSettings,
    trace_root: &Path,
) -> Result<()> {
    if trace_root.exists() && trace_root.read_dir()?.next().is_some() {
        return Err(StorageError::WouldClobber(trace_root.to_path_buf()))
            .context("trace location holds a prior run; move or delete it first");
    }

    // Create every writer before any chain starts, so persistence
    // conflicts surface before expensive work begins.
    let mut writers = Vec::with_capacity(settings.num_chains);
    for chain_id in 0..settings.num_chains as u64 {
        writers.push(TraceWriter::create(&storage::chain_dir(trace_root, chain_id))?);
    }

    info!(
        chains = settings.num_chains,
        draws = settings.num_draws,
        root = %trace_root.display(),
        "starting sampling run"
    );

    writers
        .into_par_iter()
        .enumerate()
        .map(|(chain_id, mut writer)| {
            let chain_id = chain_id as u64;
            let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
            rng.set_stream(chain_id);
            sample_chain(model, start, settings, chain_id, &mut writer, rng)
        })
        .collect::<Result<Vec<()>>>()?;

    info!("sampling run finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{find_map, PowellOptions};
    use crate::matrix::Matrix;
    use crate::model::PmfConfig;
    use crate::storage::{open_chains, TraceReader};
    use pretty_assertions::assert_eq;
    use rand::rngs::SmallRng;

    fn model() -> PmfModel {
        let ratings = Matrix::from_vec(
            3,
            3,
            vec![
                5.0, 3.0, 1.0, //
                4.0, 2.0, 1.0, //
                1.0, 2.0, 5.0, //
            ],
        );
        PmfModel::new(
            ratings,
            PmfConfig {
                dim: 2,
                alpha: 2.0,
                init_scale: 0.05,
                bounds: (1.0, 5.0),
            },
        )
        .unwrap()
    }

    fn map_start(model: &PmfModel) -> Vec<f64> {
        let mut rng = SmallRng::seed_from_u64(0);
        let options = PowellOptions {
            max_iters: 20,
            ..Default::default()
        };
        let (estimate, _) = find_map(model, &mut rng, &options);
        model.pack(&estimate.u, &estimate.v)
    }

    #[test]
    fn chain_produces_finite_draws() {
        let model = model();
        let start = map_start(&model);
        let settings = SampleSettings {
            num_draws: 20,
            num_adapt: 10,
            num_leapfrog: 8,
            ..Default::default()
        };
        let rng = SmallRng::seed_from_u64(123);
        let mut chain = PmfChain::new(&model, settings, 0, &start, rng).unwrap();
        for expected_draw in 0..settings.num_draws {
            let (position, progress) = chain.draw().unwrap();
            assert_eq!(position.len(), model.dim());
            assert!(position.iter().all(|x| x.is_finite()));
            assert_eq!(progress.draw, expected_draw);
            assert_eq!(progress.chain, 0);
        }
    }

    #[test]
    fn draws_move_the_chain() {
        let model = model();
        let start = map_start(&model);
        let settings = SampleSettings {
            num_draws: 30,
            num_adapt: 15,
            num_leapfrog: 8,
            ..Default::default()
        };
        let rng = SmallRng::seed_from_u64(5);
        let mut chain = PmfChain::new(&model, settings, 0, &start, rng).unwrap();
        let mut moved = false;
        for _ in 0..settings.num_draws {
            let (position, _) = chain.draw().unwrap();
            if position.iter().zip(&start).any(|(a, b)| a != b) {
                moved = true;
            }
        }
        assert!(moved, "every proposal was rejected");
    }

    #[test]
    fn warmup_divergences_do_not_fail_the_chain() {
        let model = model();
        let start = map_start(&model);
        // a negative threshold marks nearly every trajectory divergent
        let settings = SampleSettings {
            num_draws: 20,
            num_adapt: 20,
            num_leapfrog: 8,
            max_energy_error: -1.0,
            ..Default::default()
        };
        let rng = SmallRng::seed_from_u64(21);
        let mut chain = PmfChain::new(&model, settings, 0, &start, rng).unwrap();
        for _ in 0..settings.num_draws {
            let (_, progress) = chain.draw().unwrap();
            assert!(progress.tuning);
        }
        assert!(chain.divergences() > 0);
    }

    #[test]
    fn persistent_sampling_divergences_fail_the_chain() {
        let model = model();
        let start = map_start(&model);
        let settings = SampleSettings {
            num_draws: 50,
            num_adapt: 0,
            num_leapfrog: 8,
            max_energy_error: -1.0,
            divergence_grace: 5,
            ..Default::default()
        };
        let rng = SmallRng::seed_from_u64(22);
        let mut chain = PmfChain::new(&model, settings, 3, &start, rng).unwrap();
        let mut failure = None;
        for _ in 0..settings.num_draws {
            if let Err(err) = chain.draw() {
                failure = Some(err);
                break;
            }
        }
        let err = failure
            .expect("divergence budget never tripped")
            .downcast::<SamplerError>()
            .unwrap();
        assert!(matches!(
            err,
            SamplerError::TooManyDivergences { chain: 3, .. }
        ));
    }

    #[test]
    fn parallel_chains_persist_disjoint_traces() {
        let model = model();
        let start = map_start(&model);
        let settings = SampleSettings {
            num_draws: 10,
            num_chains: 2,
            num_adapt: 5,
            num_leapfrog: 8,
            seed: 9,
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("trace");
        sample_chains(&model, &start, &settings, &root).unwrap();

        let readers = open_chains(&root).unwrap();
        assert_eq!(readers.len(), 2);
        for reader in &readers {
            assert_eq!(reader.len(), 10);
            for draw in reader.iter() {
                let (u, v) = draw.unwrap();
                assert_eq!(u.shape(), (3, 2));
                assert_eq!(v.shape(), (3, 2));
            }
        }
    }

    #[test]
    fn refuses_to_overwrite_a_prior_run() {
        let model = model();
        let start = map_start(&model);
        let settings = SampleSettings {
            num_draws: 5,
            num_chains: 1,
            num_adapt: 2,
            num_leapfrog: 4,
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("trace");
        sample_chains(&model, &start, &settings, &root).unwrap();

        let err = sample_chains(&model, &start, &settings, &root).unwrap_err();
        assert!(err.to_string().contains("prior run"), "{err}");

        // the prior output is untouched
        let reader = TraceReader::open(&storage::chain_dir(&root, 0)).unwrap();
        assert_eq!(reader.len(), 5);
    }
}
