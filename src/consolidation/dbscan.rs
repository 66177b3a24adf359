//! Density-Based Spatial Clustering (DBSCAN) over embedding vectors.
//!
//! Groups near-duplicate memories by local neighborhood density in cosine
//! distance. Points without a dense neighborhood are noise and are left
//! untouched by consolidation.

use crate::index::cosine_distance;

// =============================================================================
// DBSCAN Clusterer
// =============================================================================

/// Parameters for density-based clustering.
#[derive(Debug, Clone)]
pub struct DbscanConfig {
    /// Neighborhood radius in cosine distance.
    pub eps: f32,
    /// Minimum neighborhood size (the point itself included) for a core
    /// point, and minimum members for a reported cluster.
    pub min_cluster_size: usize,
}

impl Default for DbscanConfig {
    fn default() -> Self {
        Self {
            eps: 0.3,
            min_cluster_size: 2,
        }
    }
}

/// Clustering outcome: member indices per cluster, plus noise indices.
#[derive(Debug, Clone, Default)]
pub struct ClusterOutcome {
    pub clusters: Vec<Vec<usize>>,
    pub noise: Vec<usize>,
}

/// Clusterer over a slice of embedding vectors.
#[derive(Debug)]
pub struct DbscanClusterer {
    config: DbscanConfig,
}

impl DbscanClusterer {
    /// Create a clusterer with default parameters.
    pub fn new() -> Self {
        Self {
            config: DbscanConfig::default(),
        }
    }

    /// Create with custom configuration.
    pub fn with_config(config: DbscanConfig) -> Self {
        Self { config }
    }

    /// Cluster `points` by cosine-distance density.
    ///
    /// Returns clusters of at least `min_cluster_size` members; everything
    /// else is noise. Indices refer into the input slice.
    pub fn cluster(&self, points: &[Vec<f32>]) -> ClusterOutcome {
        let n = points.len();
        if n < self.config.min_cluster_size {
            return ClusterOutcome {
                clusters: Vec::new(),
                noise: (0..n).collect(),
            };
        }

        const UNLABELED: isize = -2;
        const NOISE: isize = -1;
        let mut labels = vec![UNLABELED; n];
        let mut next_cluster: isize = 0;

        for point in 0..n {
            if labels[point] != UNLABELED {
                continue;
            }

            let neighbors = self.region_query(points, point);
            if neighbors.len() < self.config.min_cluster_size {
                labels[point] = NOISE;
                continue;
            }

            // New cluster: expand from this core point.
            let cluster = next_cluster;
            next_cluster += 1;
            labels[point] = cluster;

            let mut frontier = neighbors;
            let mut cursor = 0;
            while cursor < frontier.len() {
                let candidate = frontier[cursor];
                cursor += 1;

                if labels[candidate] == NOISE {
                    // Border point reached from a core point.
                    labels[candidate] = cluster;
                }
                if labels[candidate] != UNLABELED {
                    continue;
                }
                labels[candidate] = cluster;

                let candidate_neighbors = self.region_query(points, candidate);
                if candidate_neighbors.len() >= self.config.min_cluster_size {
                    frontier.extend(candidate_neighbors);
                }
            }
        }

        let mut clusters: Vec<Vec<usize>> =
            vec![Vec::new(); usize::try_from(next_cluster).unwrap_or(0)];
        let mut noise = Vec::new();
        for (i, &label) in labels.iter().enumerate() {
            if label >= 0 {
                clusters[usize::try_from(label).unwrap_or(0)].push(i);
            } else {
                noise.push(i);
            }
        }
        clusters.retain(|c| c.len() >= self.config.min_cluster_size);

        ClusterOutcome { clusters, noise }
    }

    /// Indices within `eps` of `point`, the point itself included.
    fn region_query(&self, points: &[Vec<f32>], point: usize) -> Vec<usize> {
        points
            .iter()
            .enumerate()
            .filter(|(_, other)| cosine_distance(&points[point], other) <= self.config.eps)
            .map(|(i, _)| i)
            .collect()
    }
}

impl Default for DbscanClusterer {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_nothing() {
        let clusterer = DbscanClusterer::new();
        let outcome = clusterer.cluster(&[]);
        assert!(outcome.clusters.is_empty());
        assert!(outcome.noise.is_empty());
    }

    #[test]
    fn single_point_is_noise() {
        let clusterer = DbscanClusterer::new();
        let outcome = clusterer.cluster(&[vec![1.0, 0.0]]);
        assert!(outcome.clusters.is_empty());
        assert_eq!(outcome.noise, vec![0]);
    }

    #[test]
    fn near_duplicates_cluster_and_outlier_is_noise() {
        let clusterer = DbscanClusterer::new();
        let points = vec![
            vec![1.0, 0.0],
            vec![0.99, 0.05],
            vec![0.0, 1.0], // far from the others in cosine distance
        ];

        let outcome = clusterer.cluster(&points);
        assert_eq!(outcome.clusters.len(), 1);
        let mut members = outcome.clusters[0].clone();
        members.sort_unstable();
        assert_eq!(members, vec![0, 1]);
        assert_eq!(outcome.noise, vec![2]);
    }

    #[test]
    fn identical_points_form_one_cluster() {
        let clusterer = DbscanClusterer::new();
        let points = vec![vec![0.5, 0.5]; 4];

        let outcome = clusterer.cluster(&points);
        assert_eq!(outcome.clusters.len(), 1);
        assert_eq!(outcome.clusters[0].len(), 4);
        assert!(outcome.noise.is_empty());
    }

    #[test]
    fn min_cluster_size_is_honored() {
        let clusterer = DbscanClusterer::with_config(DbscanConfig {
            eps: 0.3,
            min_cluster_size: 3,
        });
        // Only a pair: below the minimum, so both stay noise.
        let points = vec![vec![1.0, 0.0], vec![0.99, 0.05]];

        let outcome = clusterer.cluster(&points);
        assert!(outcome.clusters.is_empty());
        assert_eq!(outcome.noise.len(), 2);
    }

    #[test]
    fn two_separate_groups_form_two_clusters() {
        let clusterer = DbscanClusterer::new();
        let points = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.98, 0.02, 0.0],
            vec![0.0, 0.0, 1.0],
            vec![0.0, 0.05, 0.99],
        ];

        let outcome = clusterer.cluster(&points);
        assert_eq!(outcome.clusters.len(), 2);
        assert!(outcome.noise.is_empty());
    }
}
