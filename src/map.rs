//! MAP estimation via derivative-free direction-set (Powell) search.
//!
//! The optimizer minimizes [`crate::model::PmfModel::objective`] over the
//! flat parameter vector. Runs are long, so a finished estimate is
//! persisted to a snapshot keyed by the latent dimensionality before it is
//! returned; later invocations load instead of recomputing.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use rand::Rng;
use tracing::{info, warn};

use crate::matrix::Matrix;
use crate::model::PmfModel;
use crate::storage;

/// Options for the Powell search.
#[derive(Debug, Clone, Copy)]
pub struct PowellOptions {
    /// Maximum number of full direction-set sweeps.
    pub max_iters: usize,
    /// Relative tolerance on the objective decrease per sweep.
    pub ftol: f64,
    /// Relative tolerance of each Brent line minimization.
    pub line_tol: f64,
    /// Iteration cap for each line minimization.
    pub max_line_iters: usize,
}

impl Default for PowellOptions {
    fn default() -> Self {
        PowellOptions {
            max_iters: 60,
            ftol: 1e-6,
            line_tol: 1e-4,
            max_line_iters: 100,
        }
    }
}

/// Outcome of one Powell run.
#[derive(Debug, Clone)]
pub struct PowellResult {
    pub position: Vec<f64>,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Objective value after every sweep, starting with the initial value.
    /// Non-increasing by construction.
    pub objective_trace: Vec<f64>,
}

/// A mode of the posterior.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEstimate {
    pub u: Matrix,
    pub v: Matrix,
}

/// How a MAP estimate was obtained by [`fetch_or_compute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapSource {
    /// The caller already held a computed estimate.
    Cached,
    /// Loaded from the snapshot store.
    Loaded,
    /// Freshly optimized (and persisted).
    Computed,
}

/// Minimize `f` with Powell's direction-set method.
///
/// Non-convergence within `max_iters` is not fatal; the best iterate is
/// returned with `converged == false`.
pub fn minimize<F>(mut f: F, x0: &[f64], options: &PowellOptions) -> PowellResult
where
    F: FnMut(&[f64]) -> f64,
{
    let n = x0.len();
    let mut p = x0.to_vec();
    let mut fret = f(&p);
    let mut objective_trace = vec![fret];

    // direction set starts as the coordinate basis
    let mut directions = (0..n)
        .map(|i| {
            let mut e = vec![0.0; n];
            e[i] = 1.0;
            e
        })
        .collect_vec();

    let mut pt = p.clone();
    for iteration in 0..options.max_iters {
        let fp = fret;
        let mut biggest_drop = 0.0;
        let mut biggest_dir = 0;

        for (i, direction) in directions.iter_mut().enumerate() {
            let before = fret;
            fret = line_minimize(&mut f, &mut p, direction, options);
            if before - fret > biggest_drop {
                biggest_drop = before - fret;
                biggest_dir = i;
            }
        }
        objective_trace.push(fret);

        if 2.0 * (fp - fret) <= options.ftol * (fp.abs() + fret.abs()) + 1e-20 {
            return PowellResult {
                position: p,
                value: fret,
                iterations: iteration + 1,
                converged: true,
                objective_trace,
            };
        }

        // Powell's extrapolation test: maybe replace the direction of the
        // largest decrease with the average direction of this sweep.
        let extrapolated = p.iter().zip(&pt).map(|(p, pt)| 2.0 * p - pt).collect_vec();
        let mut average = p.iter().zip(&pt).map(|(p, pt)| p - pt).collect_vec();
        pt.copy_from_slice(&p);

        let fptt = f(&extrapolated);
        if fptt < fp {
            let t = 2.0 * (fp - 2.0 * fret + fptt) * (fp - fret - biggest_drop).powi(2)
                - biggest_drop * (fp - fptt).powi(2);
            if t < 0.0 {
                fret = line_minimize(&mut f, &mut p, &mut average, options);
                directions.swap_remove(biggest_dir);
                directions.push(average);
            }
        }
    }

    PowellResult {
        position: p,
        value: fret,
        iterations: options.max_iters,
        converged: false,
        objective_trace,
    }
}

/// Minimize `f` along `p + t * direction`, moving `p` to the minimum and
/// scaling `direction` by the chosen step. Returns the new objective value.
fn line_minimize<F>(
    f: &mut F,
    p: &mut [f64],
    direction: &mut [f64],
    options: &PowellOptions,
) -> f64
where
    F: FnMut(&[f64]) -> f64,
{
    let mut scratch = p.to_vec();
    let mut eval = |t: f64| {
        for ((s, p), d) in scratch.iter_mut().zip(p.iter()).zip(direction.iter()) {
            *s = p + t * d;
        }
        f(&scratch)
    };

    let (a, b, c) = bracket(&mut eval, 0.0, 1.0);
    let (tmin, fmin) = brent(&mut eval, a, b, c, options.line_tol, options.max_line_iters);

    for (p, d) in p.iter_mut().zip(direction.iter_mut()) {
        *d *= tmin;
        *p += *d;
    }
    fmin
}

/// Bracket a minimum of `f` by golden-ratio expansion starting from
/// `(a, b)`. Returns `(a, b, c)` with `f(b) <= min(f(a), f(c))`.
fn bracket<F: FnMut(f64) -> f64>(f: &mut F, mut a: f64, mut b: f64) -> (f64, f64, f64) {
    const GOLD: f64 = 1.618_034;
    const GLIMIT: f64 = 100.0;
    const TINY: f64 = 1e-20;

    let mut fa = f(a);
    let mut fb = f(b);
    if fb > fa {
        std::mem::swap(&mut a, &mut b);
        std::mem::swap(&mut fa, &mut fb);
    }
    let mut c = b + GOLD * (b - a);
    let mut fc = f(c);

    while fb > fc {
        let r = (b - a) * (fb - fc);
        let q = (b - c) * (fb - fa);
        let sign = if q - r >= 0.0 { 1.0 } else { -1.0 };
        let denom = 2.0 * (q - r).abs().max(TINY) * sign;
        let mut u = b - ((b - c) * q - (b - a) * r) / denom;
        let ulim = b + GLIMIT * (c - b);
        let mut fu;
        if (b - u) * (u - c) > 0.0 {
            fu = f(u);
            if fu < fc {
                return (b, u, c);
            } else if fu > fb {
                return (a, b, u);
            }
            u = c + GOLD * (c - b);
            fu = f(u);
        } else if (c - u) * (u - ulim) > 0.0 {
            fu = f(u);
            if fu < fc {
                let next = u + GOLD * (u - c);
                b = c;
                c = u;
                u = next;
                fb = fc;
                fc = fu;
                fu = f(u);
            }
        } else if (u - ulim) * (ulim - c) >= 0.0 {
            u = ulim;
            fu = f(u);
        } else {
            u = c + GOLD * (c - b);
            fu = f(u);
        }
        a = b;
        b = c;
        c = u;
        fa = fb;
        fb = fc;
        fc = fu;
    }
    (a, b, c)
}

/// Brent's parabolic-interpolation line minimizer on a bracketed interval.
fn brent<F: FnMut(f64) -> f64>(
    f: &mut F,
    a: f64,
    b: f64,
    c: f64,
    tol: f64,
    max_iters: usize,
) -> (f64, f64) {
    const CGOLD: f64 = 0.381_966_0;
    const ZEPS: f64 = 1e-10;

    let (mut lo, mut hi) = (a.min(c), a.max(c));
    let mut x = b;
    let mut w = b;
    let mut v = b;
    let mut fx = f(x);
    let mut fw = fx;
    let mut fv = fx;
    let mut e = 0.0f64;
    let mut d = 0.0f64;

    for _ in 0..max_iters {
        let xm = 0.5 * (lo + hi);
        let tol1 = tol * x.abs() + ZEPS;
        let tol2 = 2.0 * tol1;
        if (x - xm).abs() <= tol2 - 0.5 * (hi - lo) {
            break;
        }
        let mut use_golden = true;
        if e.abs() > tol1 {
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let etemp = e;
            e = d;
            if p.abs() < (0.5 * q * etemp).abs() && p > q * (lo - x) && p < q * (hi - x) {
                d = p / q;
                let u = x + d;
                if u - lo < tol2 || hi - u < tol2 {
                    d = tol1 * (xm - x).signum();
                }
                use_golden = false;
            }
        }
        if use_golden {
            e = if x >= xm { lo - x } else { hi - x };
            d = CGOLD * e;
        }
        let u = if d.abs() >= tol1 {
            x + d
        } else {
            x + tol1 * d.signum()
        };
        let fu = f(u);
        if fu <= fx {
            if u >= x {
                lo = x;
            } else {
                hi = x;
            }
            v = w;
            fv = fw;
            w = x;
            fw = fx;
            x = u;
            fx = fu;
        } else {
            if u < x {
                lo = u;
            } else {
                hi = u;
            }
            if fu <= fw || w == x {
                v = w;
                fv = fw;
                w = u;
                fw = fu;
            } else if fu <= fv || v == x || v == w {
                v = u;
                fv = fu;
            }
        }
    }
    (x, fx)
}

/// Run Powell from a fresh random initialization of the model.
///
/// Non-convergence within the iteration budget is reported as a warning;
/// the best iterate is still returned.
pub fn find_map<R: Rng + ?Sized>(
    model: &PmfModel,
    rng: &mut R,
    options: &PowellOptions,
) -> (MapEstimate, PowellResult) {
    let mut start = vec![0.0; model.dim()];
    model.init_position(rng, &mut start);
    info!(
        dim = model.dim(),
        max_iters = options.max_iters,
        "starting MAP optimization"
    );
    let result = minimize(|x| model.objective(x), &start, options);
    if result.converged {
        info!(
            iterations = result.iterations,
            value = result.value,
            "MAP optimization converged"
        );
    } else {
        warn!(
            iterations = result.iterations,
            value = result.value,
            "MAP optimization hit the iteration budget; returning best iterate"
        );
    }
    let (u, v) = model.unpack(&result.position);
    (MapEstimate { u, v }, result)
}

/// Snapshot location for the MAP estimate of a model with latent
/// dimensionality `latent_dim`.
pub fn snapshot_dir(store: &Path, latent_dim: usize) -> PathBuf {
    store.join(format!("map-d{latent_dim:02}"))
}

pub fn save_map(store: &Path, model: &PmfModel, estimate: &MapEstimate) -> Result<()> {
    let dir = snapshot_dir(store, model.latent_dim());
    storage::save_snapshot(&dir, &[("U_map", &estimate.u), ("V_map", &estimate.v)])
        .with_context(|| format!("failed to persist MAP estimate to {}", dir.display()))
}

/// Load a persisted MAP estimate. Corrupt or shape-mismatched state is a
/// hard failure.
pub fn load_map(store: &Path, model: &PmfModel) -> Result<MapEstimate> {
    let dir = snapshot_dir(store, model.latent_dim());
    let mut vars = storage::load_snapshot(&dir)
        .with_context(|| format!("failed to load MAP estimate from {}", dir.display()))?;
    let u = vars
        .remove("U_map")
        .with_context(|| format!("snapshot at {} is missing U_map", dir.display()))?;
    let v = vars
        .remove("V_map")
        .with_context(|| format!("snapshot at {} is missing V_map", dir.display()))?;

    let expected_u = (model.n_users(), model.latent_dim());
    let expected_v = (model.n_items(), model.latent_dim());
    if u.shape() != expected_u || v.shape() != expected_v {
        bail!(
            "persisted MAP shapes {:?}/{:?} do not match the model's {:?}/{:?}",
            u.shape(),
            v.shape(),
            expected_u,
            expected_v
        );
    }
    if u.as_slice().iter().chain(v.as_slice()).any(|x| !x.is_finite()) {
        bail!("persisted MAP estimate at {} contains non-finite values", dir.display());
    }
    Ok(MapEstimate { u, v })
}

pub fn map_exists(store: &Path, latent_dim: usize) -> bool {
    storage::snapshot_exists(&snapshot_dir(store, latent_dim))
}

/// Return the MAP estimate, preferring (in order) the caller's cached
/// value, the snapshot store, and finally a fresh optimization whose
/// result is persisted before it is returned.
pub fn fetch_or_compute<R: Rng + ?Sized>(
    model: &PmfModel,
    cached: Option<MapEstimate>,
    store: &Path,
    rng: &mut R,
    options: &PowellOptions,
) -> Result<(MapEstimate, MapSource)> {
    if let Some(estimate) = cached {
        return Ok((estimate, MapSource::Cached));
    }
    if map_exists(store, model.latent_dim()) {
        let estimate = load_map(store, model)?;
        info!("loaded MAP estimate from store");
        return Ok((estimate, MapSource::Loaded));
    }
    let (estimate, _) = find_map(model, rng, options);
    save_map(store, model, &estimate)?;
    Ok((estimate, MapSource::Computed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::Matrix;
    use crate::model::PmfConfig;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn model() -> PmfModel {
        // 3 users x 3 items, fully observed, D = 2, alpha = 2
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

    #[test]
    fn minimizes_a_quadratic_bowl() {
        let f = |x: &[f64]| (x[0] - 3.0).powi(2) + 2.0 * (x[1] + 1.0).powi(2) + 5.0;
        let result = minimize(f, &[10.0, 10.0], &PowellOptions::default());
        assert!(result.converged);
        assert_abs_diff_eq!(result.position[0], 3.0, epsilon = 1e-3);
        assert_abs_diff_eq!(result.position[1], -1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(result.value, 5.0, epsilon = 1e-6);
    }

    #[test]
    fn minimizes_a_coupled_function() {
        // Rosenbrock-like coupling exercises the direction replacement rule
        let f = |x: &[f64]| {
            10.0 * (x[1] - x[0] * x[0]).powi(2) + (1.0 - x[0]).powi(2)
        };
        let options = PowellOptions {
            max_iters: 200,
            ..Default::default()
        };
        let result = minimize(f, &[-1.2, 1.0], &options);
        assert!(result.value < 1e-4, "value {}", result.value);
    }

    #[test]
    fn objective_trace_is_monotone_and_estimate_finite() {
        let model = model();
        let mut rng = SmallRng::seed_from_u64(42);
        let (estimate, result) = find_map(&model, &mut rng, &PowellOptions::default());

        for pair in result.objective_trace.windows(2) {
            assert!(
                pair[1] <= pair[0] + 1e-9,
                "objective increased: {} -> {}",
                pair[0],
                pair[1]
            );
        }
        assert!(estimate.u.as_slice().iter().all(|x| x.is_finite()));
        assert!(estimate.v.as_slice().iter().all(|x| x.is_finite()));
        assert!(result.value < result.objective_trace[0]);
    }

    #[test]
    fn fetch_or_compute_reports_its_source() {
        let model = model();
        let dir = tempfile::tempdir().unwrap();
        let mut rng = SmallRng::seed_from_u64(1);
        let options = PowellOptions {
            max_iters: 5,
            ..Default::default()
        };

        let (first, source) =
            fetch_or_compute(&model, None, dir.path(), &mut rng, &options).unwrap();
        assert_eq!(source, MapSource::Computed);

        let (loaded, source) =
            fetch_or_compute(&model, None, dir.path(), &mut rng, &options).unwrap();
        assert_eq!(source, MapSource::Loaded);
        assert_eq!(loaded, first);

        let (cached, source) =
            fetch_or_compute(&model, Some(loaded.clone()), dir.path(), &mut rng, &options)
                .unwrap();
        assert_eq!(source, MapSource::Cached);
        assert_eq!(cached, loaded);
    }

    #[test]
    fn corrupt_snapshot_is_a_hard_failure() {
        let model = model();
        let dir = tempfile::tempdir().unwrap();
        let mut rng = SmallRng::seed_from_u64(2);
        let options = PowellOptions {
            max_iters: 3,
            ..Default::default()
        };
        fetch_or_compute(&model, None, dir.path(), &mut rng, &options).unwrap();

        // shrink U_map behind the manifest's back
        let snap = snapshot_dir(dir.path(), model.latent_dim());
        std::fs::write(snap.join("U_map.bin"), vec![0u8; 3 * 8]).unwrap();
        assert!(load_map(dir.path(), &model).is_err());
    }
}
