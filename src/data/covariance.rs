//! Robust covariance estimation for outlier scoring.
//!
//! [`MinCovDet`] is a FastMCD-style Minimum Covariance Determinant estimator:
//! random half-sample starts refined with concentration steps, then a
//! consistency correction and one reweighting pass. Squared Mahalanobis
//! distances under the final estimate drive the elliptic-envelope outlier
//! filter in `preprocess`.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::error::{PipelineError, Result};

const N_TRIALS: usize = 30;
const N_REFINED: usize = 10;
const INITIAL_C_STEPS: usize = 2;
const MAX_C_STEPS: usize = 30;
/// Standard normal 0.975 quantile, for the chi-square reweighting cutoff
const Z_975: f64 = 1.959_963_984_540_054;

const MAX_SWEEPS: usize = 64;
/// Eigenvalues below this fraction of the largest one are treated as zero
const RANK_RTOL: f64 = 1e-10;

/// Eigen-decomposition of a symmetric matrix by cyclic Jacobi rotations.
/// `vectors` holds the eigenvectors as columns.
#[derive(Debug, Clone)]
pub struct SymmetricEigen {
    pub values: Array1<f64>,
    pub vectors: Array2<f64>,
}

impl SymmetricEigen {
    pub fn new(a: &Array2<f64>) -> Self {
        let n = a.nrows();
        let mut m = a.clone();
        let mut v = Array2::<f64>::eye(n);
        let scale = a.iter().map(|x| x * x).sum::<f64>().max(f64::MIN_POSITIVE);

        for _ in 0..MAX_SWEEPS {
            let mut off = 0.0;
            for i in 0..n {
                for j in 0..n {
                    if i != j {
                        off += m[[i, j]] * m[[i, j]];
                    }
                }
            }
            if off <= scale * 1e-24 {
                break;
            }
            for p in 0..n {
                for q in (p + 1)..n {
                    let apq = m[[p, q]];
                    if apq == 0.0 {
                        continue;
                    }
                    let theta = (m[[q, q]] - m[[p, p]]) / (2.0 * apq);
                    let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                    let c = 1.0 / (t * t + 1.0).sqrt();
                    let s = t * c;
                    for k in 0..n {
                        let (akp, akq) = (m[[k, p]], m[[k, q]]);
                        m[[k, p]] = c * akp - s * akq;
                        m[[k, q]] = s * akp + c * akq;
                    }
                    for k in 0..n {
                        let (apk, aqk) = (m[[p, k]], m[[q, k]]);
                        m[[p, k]] = c * apk - s * aqk;
                        m[[q, k]] = s * apk + c * aqk;
                    }
                    for k in 0..n {
                        let (vkp, vkq) = (v[[k, p]], v[[k, q]]);
                        v[[k, p]] = c * vkp - s * vkq;
                        v[[k, q]] = s * vkp + c * vkq;
                    }
                }
            }
        }

        Self {
            values: m.diag().to_owned(),
            vectors: v,
        }
    }
}

/// Moore-Penrose inverse of a covariance matrix. Directions with no spread
/// contribute nothing to distances instead of an arbitrarily large penalty.
#[derive(Debug, Clone)]
pub struct Precision {
    matrix: Array2<f64>,
    rank: usize,
    /// `-inf` when the covariance is singular
    log_det: f64,
}

impl Precision {
    pub fn pseudo_inverse(covariance: &Array2<f64>) -> Result<Self> {
        if covariance.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::MalformedData(
                "covariance matrix has non-finite entries".to_string(),
            ));
        }
        let p = covariance.nrows();
        let eigen = SymmetricEigen::new(covariance);
        let largest = eigen.values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        let cutoff = largest * RANK_RTOL;

        let mut matrix = Array2::<f64>::zeros((p, p));
        let mut rank = 0;
        let mut log_det = 0.0;
        for (k, &value) in eigen.values.iter().enumerate() {
            if largest > 0.0 && value > cutoff {
                let u = eigen.vectors.column(k);
                for i in 0..p {
                    for j in 0..p {
                        matrix[[i, j]] += u[i] * u[j] / value;
                    }
                }
                rank += 1;
                log_det += value.ln();
            }
        }
        if rank < p {
            debug!("Covariance has rank {} of {}", rank, p);
            log_det = f64::NEG_INFINITY;
        }

        Ok(Self {
            matrix,
            rank,
            log_det,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn log_det(&self) -> f64 {
        self.log_det
    }

    /// `diffᵀ Σ⁺ diff`
    pub fn mahalanobis_sq(&self, diff: ArrayView1<f64>) -> f64 {
        diff.dot(&self.matrix.dot(&diff))
    }
}

/// Location and maximum-likelihood covariance (divides by n) of the given rows
pub fn mean_and_covariance(x: ArrayView2<f64>, rows: &[usize]) -> (Array1<f64>, Array2<f64>) {
    let subset = x.select(Axis(0), rows);
    let n = subset.nrows().max(1) as f64;
    let location = subset.sum_axis(Axis(0)) / n;
    let centered = &subset - &location;
    let covariance = centered.t().dot(&centered) / n;
    (location, covariance)
}

/// Chi-square quantile by the Wilson–Hilferty approximation
pub fn chi2_quantile(dof: usize, z: f64) -> f64 {
    let k = dof as f64;
    let c = 2.0 / (9.0 * k);
    k * (1.0 - c + z * c.sqrt()).powi(3)
}

#[derive(Debug, Clone)]
pub struct RobustCovariance {
    pub location: Array1<f64>,
    precision: Precision,
    /// Rows kept by the reweighting step
    pub support: Vec<usize>,
}

impl RobustCovariance {
    pub fn rank(&self) -> usize {
        self.precision.rank()
    }

    pub fn mahalanobis(&self, x: ArrayView2<f64>) -> Array1<f64> {
        distances(x, &self.location, &self.precision)
    }
}

#[derive(Debug, Clone)]
pub struct MinCovDet {
    seed: u64,
}

struct Candidate {
    location: Array1<f64>,
    covariance: Array2<f64>,
    precision: Precision,
    distances: Array1<f64>,
}

impl MinCovDet {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn fit(&self, x: ArrayView2<f64>) -> Result<RobustCovariance> {
        let (n, p) = x.dim();
        if p == 0 || n < p + 2 {
            return Err(PipelineError::MalformedData(format!(
                "robust covariance needs more than {} rows for {} features, got {}",
                p + 1,
                p,
                n
            )));
        }
        let h = ((n + p + 1) as f64 / 2.0).ceil() as usize;
        let h = h.min(n);

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut candidates = Vec::with_capacity(N_TRIALS);
        let mut order: Vec<usize> = (0..n).collect();
        for _ in 0..N_TRIALS {
            order.shuffle(&mut rng);
            let support = order[..h].to_vec();
            candidates.push(c_steps(x, support, h, INITIAL_C_STEPS)?);
        }

        candidates.sort_by(|a, b| a.precision.log_det().total_cmp(&b.precision.log_det()));
        let mut best: Option<Candidate> = None;
        for candidate in candidates.into_iter().take(N_REFINED) {
            let support = smallest(&candidate.distances, h);
            let refined = c_steps(x, support, h, MAX_C_STEPS)?;
            if best
                .as_ref()
                .map_or(true, |b| refined.precision.log_det() < b.precision.log_det())
            {
                best = Some(refined);
            }
        }
        let raw = best.ok_or_else(|| {
            PipelineError::MalformedData("no covariance candidate converged".to_string())
        })?;
        let dof = raw.precision.rank().max(1);
        debug!(
            "MCD raw estimate: h={}, rank={}, log_det={:.4}",
            h,
            raw.precision.rank(),
            raw.precision.log_det()
        );

        // consistency correction: rescale so the median distance matches the chi2 median
        let mut sorted: Vec<f64> = raw.distances.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let median = sorted[sorted.len() / 2];
        let correction = median / chi2_quantile(dof, 0.0);
        let (covariance, scaled) = if correction.is_finite() && correction > 0.0 {
            (&raw.covariance * correction, &raw.distances / correction)
        } else {
            (raw.covariance.clone(), raw.distances.clone())
        };

        // reweighting: keep rows inside the 97.5% chi2 ellipsoid
        let cutoff = chi2_quantile(dof, Z_975);
        let support: Vec<usize> = (0..n).filter(|&i| scaled[i] < cutoff).collect();
        if support.len() <= p {
            return Ok(RobustCovariance {
                location: raw.location,
                precision: Precision::pseudo_inverse(&covariance)?,
                support: (0..n).collect(),
            });
        }

        let (location, covariance) = mean_and_covariance(x, &support);
        let precision = Precision::pseudo_inverse(&covariance)?;
        debug!(
            "MCD reweighted support: {}/{} rows, rank {}",
            support.len(),
            n,
            precision.rank()
        );
        Ok(RobustCovariance {
            location,
            precision,
            support,
        })
    }
}

fn distances(x: ArrayView2<f64>, location: &Array1<f64>, precision: &Precision) -> Array1<f64> {
    x.outer_iter()
        .map(|row| {
            let diff = &row - location;
            precision.mahalanobis_sq(diff.view())
        })
        .collect()
}

fn c_steps(x: ArrayView2<f64>, mut support: Vec<usize>, h: usize, max_steps: usize) -> Result<Candidate> {
    let mut best: Option<Candidate> = None;
    for _ in 0..max_steps.max(1) {
        let (location, covariance) = mean_and_covariance(x, &support);
        let precision = Precision::pseudo_inverse(&covariance)?;
        let improved = best
            .as_ref()
            .map_or(true, |b| precision.log_det() < b.precision.log_det() - 1e-12);
        if !improved {
            break;
        }
        let distances = distances(x, &location, &precision);
        support = smallest(&distances, h);
        let singular = precision.rank() < covariance.nrows();
        best = Some(Candidate {
            location,
            covariance,
            precision,
            distances,
        });
        // a singular support cannot shrink its determinant further
        if singular {
            break;
        }
    }
    best.ok_or_else(|| PipelineError::MalformedData("empty concentration step".to_string()))
}

/// Indices of the `k` smallest values
fn smallest(values: &Array1<f64>, k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    idx.truncate(k);
    idx
}

/// Housing-shaped feature matrix in the Boston column order: a rare binary
/// river flag, a mostly-zero zoning share and a discrete highway index.
#[cfg(test)]
pub(crate) fn housing_like_matrix(n: usize, seed: u64) -> Array2<f64> {
    use rand::Rng;

    const RAD_LEVELS: [f64; 9] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 24.0];
    let mut rng = StdRng::seed_from_u64(seed);
    let mut x = Array2::<f64>::zeros((n, 13));
    for i in 0..n {
        let lstat: f64 = rng.random_range(2.0..35.0);
        let rm = 8.5 - 0.08 * lstat + rng.random_range(-0.5..0.5);
        let zn = if i % 4 == 0 { rng.random_range(12.5..100.0) } else { 0.0 };
        let chas = if i % 14 == 0 { 1.0 } else { 0.0 };
        let rad = RAD_LEVELS[rng.random_range(0..RAD_LEVELS.len())];
        let indus = 20.0 - zn * 0.15 + rng.random_range(0.0..6.0);
        let nox = 0.38 + indus * 0.012 + rng.random_range(0.0..0.1);
        let age = (lstat * 2.5 + rng.random_range(0.0..30.0)).min(100.0);
        let dis = 12.0 - age * 0.09 + rng.random_range(0.0..2.0);
        let tax = 190.0 + 18.0 * rad + rng.random_range(0.0..120.0);
        let ptratio = 13.0 + rng.random_range(0.0..9.0);
        let crim: f64 = (rng.random_range(-4.0..2.0) + rad * 0.08).exp();
        let b = 396.9 - rng.random_range(0.0..1.0_f64).powi(6) * 390.0;
        let row = [crim, zn, indus, chas, nox, rm, age, dis, rad, tax, ptratio, b, lstat];
        for (j, v) in row.iter().enumerate() {
            x[[i, j]] = *v;
        }
    }
    x
}
