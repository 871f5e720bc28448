//! CPU k-means kernel
//!
//! Implements [`ClusterKernel`] on the host so the compute path runs without
//! an accelerator. For each cluster count in the requested range it runs
//! Lloyd iterations `loops` times, stopping a run once the fraction of
//! points changing cluster falls to the threshold or after
//! [`MAX_ITERATIONS`]. The run with the lowest squared error wins for each
//! count. Across counts, RMSE picks the winner when requested; otherwise
//! the largest count is kept.
//!
//! Status codes:
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `-1` | matrix shape does not match the feature slice |
//! | `-2` | cluster range empty or larger than the point count |
//! | `-3` | output file could not be written |

use super::kernel::{ClusterKernel, ClusterOutput, ClusterRequest};
use std::io::Write;
use tracing::{debug, info, warn};

/// Iteration cap per run
pub const MAX_ITERATIONS: usize = 500;

const STATUS_BAD_SHAPE: i32 = -1;
const STATUS_BAD_RANGE: i32 = -2;
const STATUS_OUTPUT: i32 = -3;

/// Host-CPU clustering kernel
#[derive(Debug, Default, Clone)]
pub struct SoftwareKmeans {
    runs: usize,
}

impl SoftwareKmeans {
    /// New kernel
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed `cluster` calls
    #[must_use]
    pub const fn runs(&self) -> usize {
        self.runs
    }
}

struct Run {
    membership: Vec<i32>,
    centres: Vec<f32>,
    sse: f64,
}

impl ClusterKernel for SoftwareKmeans {
    fn cluster(&mut self, req: &ClusterRequest<'_>) -> Result<ClusterOutput, i32> {
        let (n, f) = (req.points, req.features_per_point);
        if n == 0 || f == 0 || req.features.len() != n * f {
            warn!(
                "k-means shape {n}x{f} does not match {} values",
                req.features.len()
            );
            return Err(STATUS_BAD_SHAPE);
        }
        if req.min_clusters == 0 || req.min_clusters > req.max_clusters || req.max_clusters > n {
            warn!(
                "k-means range {}..={} invalid for {n} points",
                req.min_clusters, req.max_clusters
            );
            return Err(STATUS_BAD_RANGE);
        }
        debug!("k-means image {} ignored on host", req.bit_image.display());

        let mut best: Option<(usize, Run, f64)> = None;
        for k in req.min_clusters..=req.max_clusters {
            let Some(run) = (0..req.loops.max(1))
                .map(|attempt| lloyd(req, k, attempt))
                .min_by(|a, b| a.sse.total_cmp(&b.sse))
            else {
                continue;
            };

            #[allow(clippy::cast_precision_loss)]
            let rmse = (run.sse / n as f64).sqrt();
            let better = match &best {
                None => true,
                Some((_, _, best_rmse)) => !req.compute_rmse || rmse < *best_rmse,
            };
            if better {
                best = Some((k, run, rmse));
            }
        }

        let (best_clusters, run, rmse) = best.ok_or(STATUS_BAD_RANGE)?;

        if let Some(path) = req.output_path {
            write_membership(path, &run.membership).map_err(|e| {
                warn!("Cannot write membership to {}: {e}", path.display());
                STATUS_OUTPUT
            })?;
        }

        self.runs += 1;
        info!("k-means on {n}x{f}: best k={best_clusters}");

        #[allow(clippy::cast_possible_truncation)]
        let rmse = req.compute_rmse.then_some(rmse as f32);
        Ok(ClusterOutput {
            membership: run.membership,
            best_clusters,
            centres: run.centres,
            rmse,
        })
    }
}

/// One Lloyd run seeded from consecutive points starting at `attempt * k`
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
fn lloyd(req: &ClusterRequest<'_>, k: usize, attempt: usize) -> Run {
    let (n, f) = (req.points, req.features_per_point);
    let point = |i: usize| &req.features[i * f..(i + 1) * f];

    let mut centres: Vec<f32> = (0..k)
        .flat_map(|j| point((attempt * k + j) % n).iter().copied())
        .collect();
    let mut membership = vec![-1i32; n];

    for _ in 0..MAX_ITERATIONS {
        let mut changed = 0usize;
        let mut sums = vec![0f64; k * f];
        let mut counts = vec![0usize; k];

        for i in 0..n {
            let nearest = nearest_centre(point(i), &centres, f);
            let label = nearest as i32;
            if membership[i] != label {
                membership[i] = label;
                changed += 1;
            }
            counts[nearest] += 1;
            for (sum, &x) in sums[nearest * f..(nearest + 1) * f].iter_mut().zip(point(i)) {
                *sum += f64::from(x);
            }
        }

        for j in 0..k {
            // empty clusters keep their previous centre
            if counts[j] == 0 {
                continue;
            }
            for d in 0..f {
                centres[j * f + d] = (sums[j * f + d] / counts[j] as f64) as f32;
            }
        }

        let delta = changed as f32 / n as f32;
        if delta <= req.threshold {
            break;
        }
    }

    let sse = (0..n)
        .map(|i| {
            let j = membership[i] as usize;
            distance_sq(point(i), &centres[j * f..(j + 1) * f])
        })
        .sum();

    Run {
        membership,
        centres,
        sse,
    }
}

fn nearest_centre(point: &[f32], centres: &[f32], f: usize) -> usize {
    centres
        .chunks_exact(f)
        .map(|c| distance_sq(point, c))
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(0, |(j, _)| j)
}

fn distance_sq(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = f64::from(x) - f64::from(y);
            d * d
        })
        .sum()
}

fn write_membership(path: &std::path::Path, membership: &[i32]) -> std::io::Result<()> {
    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    for (row, cluster) in membership.iter().enumerate() {
        writeln!(out, "{row} {cluster}")?;
    }
    out.flush()
}
