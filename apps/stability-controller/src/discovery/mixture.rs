//! Diagonal Gaussian mixture over two standardized features, fitted with EM and selected by BIC.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::{Continuous, Normal};
use std::collections::HashSet;

pub(crate) type Point = [f64; 2];

const VAR_FLOOR: f64 = 1e-6;
const LLOYD_ROUNDS: usize = 10;

#[derive(Debug, Clone)]
struct Component {
    weight: f64,
    mean: Point,
    var: Point,
}

#[derive(Debug, Clone)]
pub(crate) struct MixtureFit {
    pub(crate) components: usize,
    pub(crate) labels: Vec<usize>,
    pub(crate) bic: f64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FitOptions {
    pub(crate) min_components: usize,
    pub(crate) max_components: usize,
    pub(crate) seed: u64,
    pub(crate) max_iterations: usize,
    pub(crate) tolerance: f64,
}

/// Scales each column to zero mean and unit variance. Constant columns are only centred.
pub(crate) fn standardize(points: &[Point]) -> Vec<Point> {
    if points.is_empty() {
        return Vec::new();
    }
    let n = points.len() as f64;
    let mut mean = [0.0; 2];
    let mut scale = [1.0; 2];
    for d in 0..2 {
        mean[d] = points.iter().map(|p| p[d]).sum::<f64>() / n;
        let var = points.iter().map(|p| (p[d] - mean[d]).powi(2)).sum::<f64>() / n;
        if var > 0.0 {
            scale[d] = var.sqrt();
        }
    }
    points
        .iter()
        .map(|p| [(p[0] - mean[0]) / scale[0], (p[1] - mean[1]) / scale[1]])
        .collect()
}

fn distinct_points(points: &[Point], cap: usize) -> usize {
    let mut seen = HashSet::new();
    for p in points {
        seen.insert((p[0].to_bits(), p[1].to_bits()));
        if seen.len() >= cap {
            break;
        }
    }
    seen.len()
}

fn sq_dist(a: &Point, b: &Point) -> f64 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)
}

fn nearest(centers: &[Point], p: &Point) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (i, c) in centers.iter().enumerate() {
        let d = sq_dist(c, p);
        if d < best_d {
            best_d = d;
            best = i;
        }
    }
    best
}

/// k-means++ seeding followed by a few Lloyd rounds.
fn seed_centers(points: &[Point], k: usize, rng: &mut StdRng) -> Vec<Point> {
    let mut centers = vec![points[rng.gen_range(0..points.len())]];
    while centers.len() < k {
        let dists: Vec<f64> = points
            .iter()
            .map(|p| centers.iter().map(|c| sq_dist(c, p)).fold(f64::INFINITY, f64::min))
            .collect();
        let total: f64 = dists.iter().sum();
        if total <= 0.0 {
            break;
        }
        let mut target = rng.gen::<f64>() * total;
        let mut chosen = points.len() - 1;
        for (i, d) in dists.iter().enumerate() {
            if target < *d {
                chosen = i;
                break;
            }
            target -= d;
        }
        centers.push(points[chosen]);
    }

    for _ in 0..LLOYD_ROUNDS {
        let mut sums = vec![[0.0; 2]; centers.len()];
        let mut counts = vec![0usize; centers.len()];
        for p in points {
            let j = nearest(&centers, p);
            sums[j][0] += p[0];
            sums[j][1] += p[1];
            counts[j] += 1;
        }
        for (j, center) in centers.iter_mut().enumerate() {
            if counts[j] > 0 {
                *center = [sums[j][0] / counts[j] as f64, sums[j][1] / counts[j] as f64];
            }
        }
    }
    centers
}

fn initial_components(points: &[Point], centers: &[Point]) -> Vec<Component> {
    let n = points.len() as f64;
    let k = centers.len();
    let mut counts = vec![0usize; k];
    let mut sq = vec![[0.0; 2]; k];
    for p in points {
        let j = nearest(centers, p);
        counts[j] += 1;
        for d in 0..2 {
            sq[j][d] += (p[d] - centers[j][d]).powi(2);
        }
    }
    (0..k)
        .map(|j| {
            let count = counts[j].max(1) as f64;
            Component {
                weight: (counts[j] as f64 / n).max(1.0 / n),
                mean: centers[j],
                var: [
                    (sq[j][0] / count).max(VAR_FLOOR),
                    (sq[j][1] / count).max(VAR_FLOOR),
                ],
            }
        })
        .collect()
}

/// Per-point log joint densities `ln w_j + ln N(x | mu_j, sigma_j)`.
fn log_joint(points: &[Point], components: &[Component]) -> Option<Vec<Vec<f64>>> {
    let mut dists = Vec::with_capacity(components.len());
    for c in components {
        let x = Normal::new(c.mean[0], c.var[0].sqrt()).ok()?;
        let y = Normal::new(c.mean[1], c.var[1].sqrt()).ok()?;
        dists.push((c.weight.ln(), x, y));
    }
    Some(
        points
            .iter()
            .map(|p| {
                dists
                    .iter()
                    .map(|(lw, x, y)| lw + x.ln_pdf(p[0]) + y.ln_pdf(p[1]))
                    .collect()
            })
            .collect(),
    )
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

fn fit_k(points: &[Point], k: usize, options: &FitOptions) -> Option<MixtureFit> {
    let n = points.len();
    let mut rng = StdRng::seed_from_u64(options.seed.wrapping_add(k as u64));
    let centers = seed_centers(points, k, &mut rng);
    if centers.len() < k {
        return None;
    }
    let mut components = initial_components(points, &centers);
    let mut previous = f64::NEG_INFINITY;
    let mut log_likelihood = f64::NEG_INFINITY;
    let mut resp = vec![vec![0.0; k]; n];

    for _ in 0..options.max_iterations {
        let joint = log_joint(points, &components)?;
        log_likelihood = 0.0;
        for (i, row) in joint.iter().enumerate() {
            let norm = log_sum_exp(row);
            log_likelihood += norm;
            for j in 0..k {
                resp[i][j] = (row[j] - norm).exp();
            }
        }
        if !log_likelihood.is_finite() {
            return None;
        }

        for (j, component) in components.iter_mut().enumerate() {
            let nk: f64 = resp.iter().map(|r| r[j]).sum::<f64>().max(f64::EPSILON);
            let mut mean = [0.0; 2];
            for (r, p) in resp.iter().zip(points) {
                mean[0] += r[j] * p[0];
                mean[1] += r[j] * p[1];
            }
            mean = [mean[0] / nk, mean[1] / nk];
            let mut var = [0.0; 2];
            for (r, p) in resp.iter().zip(points) {
                var[0] += r[j] * (p[0] - mean[0]).powi(2);
                var[1] += r[j] * (p[1] - mean[1]).powi(2);
            }
            component.weight = (nk / n as f64).max(f64::EPSILON);
            component.mean = mean;
            component.var = [var[0] / nk + VAR_FLOOR, var[1] / nk + VAR_FLOOR];
        }

        if ((log_likelihood - previous) / n as f64).abs() < options.tolerance {
            break;
        }
        previous = log_likelihood;
    }

    let labels = log_joint(points, &components)?
        .iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (j, v)| if *v > best.1 { (j, *v) } else { best })
                .0
        })
        .collect();
    // weights (k - 1), two means and two variances per component
    let params = (5 * k - 1) as f64;
    Some(MixtureFit {
        components: k,
        labels,
        bic: -2.0 * log_likelihood + params * (n as f64).ln(),
    })
}

/// Fits every component count in range and keeps the lowest BIC. `None` when no count can be
/// fitted (for example fewer distinct points than the smallest count).
pub(crate) fn select_mixture(points: &[Point], options: &FitOptions) -> Option<MixtureFit> {
    if points.is_empty() {
        return None;
    }
    let distinct = distinct_points(points, options.max_components);
    let mut best: Option<MixtureFit> = None;
    for k in options.min_components..=options.max_components {
        if k > distinct || k > points.len() {
            break;
        }
        let Some(fit) = fit_k(points, k, options) else {
            tracing::debug!(components = k, "mixture fit failed; skipping");
            continue;
        };
        tracing::debug!(components = k, bic = fit.bic, "mixture candidate");
        if best.as_ref().map(|b| fit.bic < b.bic).unwrap_or(true) {
            best = Some(fit);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> FitOptions {
        FitOptions {
            min_components: 2,
            max_components: 5,
            seed: 42,
            max_iterations: 100,
            tolerance: 1e-5,
        }
    }

    fn blobs() -> Vec<Point> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut points = Vec::new();
        for center in [[0.0, 0.0], [10.0, 10.0], [0.0, 10.0]] {
            for _ in 0..150 {
                points.push([
                    center[0] + rng.gen_range(-0.5..0.5),
                    center[1] + rng.gen_range(-0.5..0.5),
                ]);
            }
        }
        points
    }

    #[test]
    fn separated_blobs_get_distinct_labels() {
        let points = standardize(&blobs());
        let fit = select_mixture(&points, &options()).unwrap();
        assert!(fit.components >= 3);
        let label_sets: Vec<HashSet<usize>> = (0..3)
            .map(|blob| fit.labels[blob * 150..(blob + 1) * 150].iter().copied().collect())
            .collect();
        assert!(label_sets[0].is_disjoint(&label_sets[1]));
        assert!(label_sets[1].is_disjoint(&label_sets[2]));
        assert!(label_sets[0].is_disjoint(&label_sets[2]));
    }

    #[test]
    fn same_seed_same_partition() {
        let points = standardize(&blobs());
        let first = select_mixture(&points, &options()).unwrap();
        let second = select_mixture(&points, &options()).unwrap();
        assert_eq!(first.labels, second.labels);
        assert_eq!(first.components, second.components);
    }

    #[test]
    fn single_distinct_point_cannot_be_split() {
        let points = vec![[1.0, 1.0]; 50];
        assert!(select_mixture(&points, &options()).is_none());
    }

    #[test]
    fn standardize_leaves_constant_column_centred() {
        let out = standardize(&[[1.0, 5.0], [3.0, 5.0]]);
        assert_eq!(out[0], [-1.0, 0.0]);
        assert_eq!(out[1], [1.0, 0.0]);
    }
}
