//! k-means clustering and cluster-sorted permutations.
//!
//! The reorder pipeline clusters the segment's vectors and emits a
//! permutation that lays each cluster out contiguously, members sorted by
//! distance to their centroid. Neighboring vectors in the graph tend to
//! fall in the same cluster, so a traversal touches far fewer pages after
//! the rewrite.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::{ReorderError, Result};
use crate::permutation::Permutation;
use crate::reorder::PermutationSource;

/// Distance function the index was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    L2,
    InnerProduct,
}

impl Metric {
    /// Map the metric code stored in index headers (0 = inner product,
    /// 1 = L2).
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Metric::InnerProduct),
            1 => Ok(Metric::L2),
            other => Err(ReorderError::Invariant(format!(
                "unknown metric code {other}"
            ))),
        }
    }
}

/// k-means clustering over flat row-major vector storage.
///
/// Uses k-means++ initialization and Lloyd iterations over squared L2
/// distance, which is what the centroid mean minimizes regardless of the
/// index's search metric.
pub struct KMeans {
    /// Centroids (k x dimension)
    centroids: Vec<Vec<f32>>,
    dimension: usize,
    k: usize,
    seed: Option<u64>,
}

impl KMeans {
    pub fn new(dimension: usize, k: usize) -> Result<Self> {
        if dimension == 0 || k == 0 {
            return Err(ReorderError::Invariant(
                "dimension and k must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            centroids: Vec::new(),
            dimension,
            k,
            seed: None,
        })
    }

    /// Configure a deterministic seed for k-means++ initialization.
    ///
    /// When set, repeated `fit(...)` calls on the same inputs produce
    /// identical results, and therefore identical permutations.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Train on `num_vectors` rows of `vectors`.
    pub fn fit(&mut self, vectors: &[f32], num_vectors: usize) -> Result<()> {
        if vectors.len() < num_vectors * self.dimension {
            return Err(ReorderError::Invariant(format!(
                "{} floats cannot hold {num_vectors} vectors of dimension {}",
                vectors.len(),
                self.dimension
            )));
        }
        if num_vectors < self.k {
            return Err(ReorderError::Invariant(format!(
                "cannot place {} centroids over {num_vectors} vectors",
                self.k
            )));
        }

        self.centroids = self.kmeans_plus_plus(vectors, num_vectors);

        for _iteration in 0..100 {
            let (assignments, _) = self.assign(vectors, num_vectors);
            let new_centroids = self.update_centroids(vectors, num_vectors, &assignments);

            let mut converged = true;
            for (old, new) in self.centroids.iter().zip(new_centroids.iter()) {
                if squared_l2(old, new) > 1e-6 {
                    converged = false;
                    break;
                }
            }

            self.centroids = new_centroids;
            if converged {
                break;
            }
        }

        Ok(())
    }

    /// k-means++ initialization.
    fn kmeans_plus_plus(&self, vectors: &[f32], num_vectors: usize) -> Vec<Vec<f32>> {
        // Use an explicit seed when configured; otherwise derive one from entropy.
        let seed = self.seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed);

        let mut centroids = Vec::with_capacity(self.k);

        let first_idx = rng.random_range(0..num_vectors);
        centroids.push(self.get_vector(vectors, first_idx).to_vec());

        // Subsequent centroids: weighted by distance to nearest existing one.
        for _ in 1..self.k {
            let mut distances = Vec::with_capacity(num_vectors);
            let mut total_distance = 0.0f64;

            for i in 0..num_vectors {
                let vec = self.get_vector(vectors, i);
                let min_dist = centroids
                    .iter()
                    .map(|c| squared_l2(vec, c))
                    .fold(f32::INFINITY, f32::min);
                distances.push(min_dist);
                total_distance += min_dist as f64;
            }

            let threshold = rng.random::<f64>() * total_distance;
            let mut cumulative = 0.0f64;
            let mut chosen = num_vectors - 1;
            for (i, &dist) in distances.iter().enumerate() {
                cumulative += dist as f64;
                if cumulative >= threshold {
                    chosen = i;
                    break;
                }
            }
            centroids.push(self.get_vector(vectors, chosen).to_vec());
        }

        centroids
    }

    /// Assign each vector to its nearest centroid.
    ///
    /// Returns the cluster index and the squared L2 distance to it, per
    /// vector.
    pub fn assign(&self, vectors: &[f32], num_vectors: usize) -> (Vec<u32>, Vec<f32>) {
        let mut assignments = Vec::with_capacity(num_vectors);
        let mut distances = Vec::with_capacity(num_vectors);

        for i in 0..num_vectors {
            let vec = self.get_vector(vectors, i);
            let mut best_cluster = 0u32;
            let mut best_dist = f32::INFINITY;
            for (cluster_idx, centroid) in self.centroids.iter().enumerate() {
                let dist = squared_l2(vec, centroid);
                if dist < best_dist {
                    best_dist = dist;
                    best_cluster = cluster_idx as u32;
                }
            }
            assignments.push(best_cluster);
            distances.push(best_dist);
        }

        (assignments, distances)
    }

    fn update_centroids(
        &self,
        vectors: &[f32],
        num_vectors: usize,
        assignments: &[u32],
    ) -> Vec<Vec<f32>> {
        let mut cluster_sums = vec![vec![0.0f32; self.dimension]; self.k];
        let mut cluster_counts = vec![0usize; self.k];

        for (i, &cluster) in assignments.iter().enumerate().take(num_vectors) {
            cluster_counts[cluster as usize] += 1;
            let vec = self.get_vector(vectors, i);
            for (j, &val) in vec.iter().enumerate() {
                cluster_sums[cluster as usize][j] += val;
            }
        }

        let mut new_centroids = Vec::with_capacity(self.k);
        for (cluster, (sums, &count)) in
            cluster_sums.iter().zip(cluster_counts.iter()).enumerate()
        {
            if count > 0 {
                new_centroids.push(sums.iter().map(|&s| s / count as f32).collect());
            } else {
                // Empty cluster: keep the old centroid.
                new_centroids.push(self.centroids[cluster].clone());
            }
        }

        new_centroids
    }

    fn get_vector<'a>(&self, vectors: &'a [f32], idx: usize) -> &'a [f32] {
        let start = idx * self.dimension;
        &vectors[start..start + self.dimension]
    }

    pub fn centroids(&self) -> &[Vec<f32>] {
        &self.centroids
    }
}

/// Build the cluster-sorted permutation: ordinals grouped by cluster, each
/// group ordered by distance to its centroid.
///
/// L2 sorts nearest-first; inner product sorts farthest-first, since large
/// distance from the centroid there correlates with high scores being
/// found early.
pub fn sort_by_cluster(
    assignments: &[u32],
    distances: &[f32],
    metric: Metric,
) -> Result<Permutation> {
    if assignments.len() != distances.len() {
        return Err(ReorderError::Invariant(format!(
            "{} assignments but {} distances",
            assignments.len(),
            distances.len()
        )));
    }

    let mut order: Vec<u32> = (0..assignments.len() as u32).collect();
    order.sort_by(|&a, &b| {
        let (a, b) = (a as usize, b as usize);
        assignments[a].cmp(&assignments[b]).then_with(|| {
            let cmp = distances[a]
                .partial_cmp(&distances[b])
                .unwrap_or(std::cmp::Ordering::Equal);
            match metric {
                Metric::L2 => cmp,
                Metric::InnerProduct => cmp.reverse(),
            }
        })
    });

    Permutation::new(order)
}

/// Default permutation source: k-means then cluster sort.
pub struct ClusterReorder {
    pub clusters: usize,
    pub metric: Metric,
    pub seed: u64,
}

impl ClusterReorder {
    pub fn new(clusters: usize, metric: Metric) -> Self {
        Self {
            clusters,
            metric,
            seed: 0,
        }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

impl PermutationSource for ClusterReorder {
    fn permutation(
        &self,
        vectors: &[f32],
        count: usize,
        dimension: usize,
    ) -> Result<Permutation> {
        if count == 0 {
            return Permutation::new(Vec::new());
        }
        let k = self.clusters.min(count);
        let mut km = KMeans::new(dimension, k)?.with_seed(self.seed);
        km.fit(vectors, count)?;
        let (assignments, distances) = km.assign(vectors, count);
        debug!(count, clusters = k, "computed cluster assignments");
        sort_by_cluster(&assignments, &distances, self.metric)
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&x, &y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn metric_codes_match_index_headers() {
        assert_eq!(Metric::from_code(0).unwrap(), Metric::InnerProduct);
        assert_eq!(Metric::from_code(1).unwrap(), Metric::L2);
        assert!(Metric::from_code(5).is_err());
    }

    #[test]
    fn sort_groups_by_cluster_then_distance() {
        let assignments = [1, 0, 1, 0];
        let distances = [2.0, 5.0, 1.0, 3.0];
        let perm = sort_by_cluster(&assignments, &distances, Metric::L2).unwrap();
        assert_eq!(perm.as_slice(), &[3, 1, 2, 0]);
    }

    #[test]
    fn inner_product_sorts_farthest_first() {
        let assignments = [0, 0, 0];
        let distances = [1.0, 3.0, 2.0];
        let perm = sort_by_cluster(&assignments, &distances, Metric::InnerProduct).unwrap();
        assert_eq!(perm.as_slice(), &[1, 2, 0]);
    }

    #[test]
    fn separable_clusters_become_contiguous() {
        // Two tight 2-d clusters around (0,0) and (10,10).
        let vectors = [
            0.0, 0.1, 10.0, 10.1, 0.1, 0.0, 9.9, 10.0, 0.0, 0.0, 10.0, 10.0,
        ];
        let source = ClusterReorder::new(2, Metric::L2).with_seed(7);
        let perm = source.permutation(&vectors, 6, 2).unwrap();

        // Cluster membership by original ordinal parity.
        let groups: Vec<usize> = perm.as_slice().iter().map(|&o| o as usize % 2).collect();
        let flips = groups.windows(2).filter(|w| w[0] != w[1]).count();
        assert_eq!(flips, 1, "each cluster occupies one contiguous run");
    }

    #[test]
    fn more_clusters_than_vectors_rejected_by_fit() {
        let mut km = KMeans::new(2, 5).unwrap().with_seed(1);
        assert!(km.fit(&[0.0, 0.0, 1.0, 1.0], 2).is_err());
    }

    proptest! {
        #[test]
        fn prop_fit_is_deterministic_given_seed(
            seed in any::<u64>(),
            dimension in 1usize..8,
            num_vectors in 2usize..32,
            raw in proptest::collection::vec(-1.0f32..1.0f32, 2usize..(32 * 8)),
        ) {
            let needed = num_vectors * dimension;
            prop_assume!(raw.len() >= needed);
            let vectors = &raw[..needed];
            let k = 2.min(num_vectors);

            let mut km1 = KMeans::new(dimension, k).unwrap().with_seed(seed);
            let mut km2 = KMeans::new(dimension, k).unwrap().with_seed(seed);
            km1.fit(vectors, num_vectors).unwrap();
            km2.fit(vectors, num_vectors).unwrap();

            let (a1, _) = km1.assign(vectors, num_vectors);
            let (a2, _) = km2.assign(vectors, num_vectors);
            prop_assert_eq!(a1, a2);
        }

        #[test]
        fn prop_cluster_sort_is_a_permutation(
            assignments in proptest::collection::vec(0u32..4, 1..64),
        ) {
            let distances: Vec<f32> = (0..assignments.len()).map(|i| i as f32).collect();
            let perm = sort_by_cluster(&assignments, &distances, Metric::L2).unwrap();
            prop_assert_eq!(perm.len(), assignments.len());
        }
    }
}
