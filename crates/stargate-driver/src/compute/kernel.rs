//! Clustering kernel contract
//!
//! The kernel is an external collaborator: it receives a staged feature
//! matrix and a search range, blocks until done, and returns per-row
//! membership plus the centres for the best cluster count it found.

use std::fmt::Debug;
use std::path::Path;

/// Arguments to one kernel run
#[derive(Debug, Clone, Copy)]
pub struct ClusterRequest<'a> {
    /// Row-major features, `points * features_per_point` values
    pub features: &'a [f32],
    /// Number of points (rows)
    pub points: usize,
    /// Features per point (columns)
    pub features_per_point: usize,
    /// Smallest cluster count to try
    pub min_clusters: usize,
    /// Largest cluster count to try
    pub max_clusters: usize,
    /// Convergence threshold
    pub threshold: f32,
    /// Runs per cluster count
    pub loops: usize,
    /// Compute RMSE and select the best count by it
    pub compute_rmse: bool,
    /// Membership destination, written after a successful run
    pub output_path: Option<&'a Path>,
    /// Kernel binary image
    pub bit_image: &'a Path,
}

/// Result of a successful kernel run
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOutput {
    /// Cluster index per point
    pub membership: Vec<i32>,
    /// Cluster count chosen
    pub best_clusters: usize,
    /// `best_clusters * features_per_point` centre values
    pub centres: Vec<f32>,
    /// Root mean squared error, when requested
    pub rmse: Option<f32>,
}

/// Clustering kernel
///
/// Failure is reported as the kernel's non-zero status code.
pub trait ClusterKernel: Debug + Send {
    /// Run clustering synchronously
    ///
    /// # Errors
    ///
    /// Returns the kernel's status code on failure.
    fn cluster(&mut self, request: &ClusterRequest<'_>) -> Result<ClusterOutput, i32>;
}
