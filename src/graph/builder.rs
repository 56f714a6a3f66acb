//! 近似 k-NN グラフの構築。
//! ランダム射影木で初期候補を作り、NN-descent で改良する。

use std::time::{Duration, Instant};

use ndarray::{Array2, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::descent::{fill_random, refine_pass, seed_from_leaves, squared_distance};
use super::heap::NeighborHeaps;
use super::{NeighborGraph, derive_seed, rp_forest};
use crate::error::{ApproximationWarning, FlowError};
use crate::matrix::FeatureMatrix;

/// 乱数シード未指定時の既定値。
pub const DEFAULT_SEED: u64 = 42;

/// 木の本数の既定値: `5 + round(sqrt(N) / 20)`。
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn default_n_trees(n_points: usize) -> usize {
    5 + ((n_points as f64).sqrt() / 20.0).round() as usize
}

/// 改良パス数の既定値: `max(5, round(log2 N))`。
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn default_n_iters(n_points: usize) -> usize {
    if n_points == 0 {
        return 5;
    }
    ((n_points as f64).log2().round() as usize).max(5)
}

/// 近傍探索のパラメータ。`None` の項目はデータサイズから決める。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderParams {
    pub n_trees: Option<usize>,
    pub n_iters: Option<usize>,
    /// 葉の最大点数（既定は `max(10, k)`）
    pub leaf_size: Option<usize>,
    /// 1パスで局所結合に使う候補数の上限（既定は `min(60, k)`）
    pub max_candidates: Option<usize>,
    /// 更新数が `delta * k * N` 以下になったら改良を打ち切る
    pub delta: f32,
    pub seed: u64,
    /// 再現率を測るサンプル点数（0で無効）
    pub recall_sample: usize,
    pub recall_warn_threshold: f32,
    /// N がこの値以下なら厳密探索を使う
    pub brute_force_threshold: usize,
}

impl Default for BuilderParams {
    fn default() -> Self {
        Self {
            n_trees: None,
            n_iters: None,
            leaf_size: None,
            max_candidates: None,
            delta: 0.001,
            seed: DEFAULT_SEED,
            recall_sample: 0,
            recall_warn_threshold: 0.9,
            brute_force_threshold: 0,
        }
    }
}

/// 構築結果の統計。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildReport {
    pub n_points: usize,
    pub requested_k: usize,
    pub k: usize,
    pub n_trees: usize,
    pub n_iters: usize,
    /// 実際に実行した改良パス数
    pub passes: usize,
    /// パスごとのヒープ更新数
    pub updates: Vec<usize>,
    pub exact: bool,
    pub elapsed: Duration,
    pub recall: Option<f32>,
    pub warning: Option<ApproximationWarning>,
}

/// 近似 k-NN グラフのビルダー。
#[derive(Debug, Clone, Default)]
pub struct NeighborGraphBuilder {
    params: BuilderParams,
}

impl NeighborGraphBuilder {
    #[must_use]
    pub fn new(params: BuilderParams) -> Self {
        Self { params }
    }

    #[must_use]
    pub fn params(&self) -> &BuilderParams {
        &self.params
    }

    /// 近似 k-NN グラフを構築する。
    ///
    /// # Errors
    /// 行列が空・非有限値を含む、または `k < 1` の場合は [`FlowError::InvalidInput`] を返す。
    pub fn build(&self, features: &FeatureMatrix, k: usize) -> Result<NeighborGraph, FlowError> {
        self.build_with_report(features, k).map(|(graph, _)| graph)
    }

    /// グラフと構築統計を返す。
    ///
    /// `N <= k` の場合は k を `N - 1` に切り詰める。
    ///
    /// # Errors
    /// [`NeighborGraphBuilder::build`] と同じ。
    pub fn build_with_report(
        &self,
        features: &FeatureMatrix,
        k: usize,
    ) -> Result<(NeighborGraph, BuildReport), FlowError> {
        if k < 1 {
            return Err(FlowError::invalid("neighbor count k must be at least 1"));
        }
        features.validate()?;

        let started = Instant::now();
        let data = features.view();
        let n_points = features.n_points();
        let effective_k = if n_points <= k {
            let clamped = n_points - 1;
            tracing::warn!(
                requested_k = k,
                clamped_k = clamped,
                n_points,
                "neighbor count clamped to point count minus one"
            );
            clamped
        } else {
            k
        };

        let n_trees = self.params.n_trees.unwrap_or_else(|| default_n_trees(n_points));
        let n_iters = self.params.n_iters.unwrap_or_else(|| default_n_iters(n_points));
        let exact = n_points <= self.params.brute_force_threshold;

        tracing::info!(
            n_points,
            n_features = features.n_features(),
            k = effective_k,
            n_trees,
            n_iters,
            exact,
            "building neighbor graph"
        );

        let (graph, passes, updates) = if exact {
            (exact_graph(data, effective_k)?, 0, Vec::new())
        } else {
            self.descend(data, effective_k, n_trees, n_iters)?
        };

        let recall = if self.params.recall_sample > 0 && !exact && effective_k > 0 {
            Some(self.estimate_recall(data, &graph))
        } else {
            None
        };
        let warning = recall
            .filter(|recall| *recall < self.params.recall_warn_threshold)
            .map(|recall| ApproximationWarning {
                recall,
                sampled: self.params.recall_sample.min(n_points),
                threshold: self.params.recall_warn_threshold,
            });
        if let Some(warning) = &warning {
            tracing::warn!(
                recall = warning.recall,
                sampled = warning.sampled,
                threshold = warning.threshold,
                "approximate neighbor recall below threshold"
            );
        }

        let report = BuildReport {
            n_points,
            requested_k: k,
            k: effective_k,
            n_trees,
            n_iters,
            passes,
            updates,
            exact,
            elapsed: started.elapsed(),
            recall,
            warning,
        };

        tracing::info!(
            n_points,
            k = effective_k,
            passes = report.passes,
            elapsed_ms = report.elapsed.as_millis(),
            recall = ?report.recall,
            "neighbor graph built"
        );

        Ok((graph, report))
    }

    fn descend(
        &self,
        data: ArrayView2<'_, f32>,
        k: usize,
        n_trees: usize,
        n_iters: usize,
    ) -> Result<(NeighborGraph, usize, Vec<usize>), FlowError> {
        let n_points = data.nrows();
        let seed = self.params.seed;
        let leaf_size = self.params.leaf_size.unwrap_or_else(|| k.max(10));
        let max_candidates = self.params.max_candidates.unwrap_or_else(|| k.min(60)).max(1);

        let mut heaps = NeighborHeaps::new(n_points, k);
        if k > 0 {
            let leaves = rp_forest::build_leaves(data, n_trees, leaf_size, seed);
            seed_from_leaves(data, &mut heaps, &leaves);
            fill_random(data, &mut heaps, seed);
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let stop_below = (f64::from(self.params.delta) * (k * n_points) as f64) as usize;
        let mut updates = Vec::new();
        for pass in 0..n_iters {
            if k == 0 {
                break;
            }
            let changed = refine_pass(data, &mut heaps, max_candidates, seed, pass);
            tracing::debug!(pass, changed, "nn-descent pass");
            updates.push(changed);
            if changed <= stop_below {
                break;
            }
        }

        let (indices, distances) = heaps.into_sorted();
        let graph = NeighborGraph::from_parts(indices, distances)?;
        Ok((graph, updates.len(), updates))
    }

    /// サンプル点について厳密な k-NN と比較し、再現率を求める。
    #[allow(clippy::cast_precision_loss)]
    fn estimate_recall(&self, data: ArrayView2<'_, f32>, graph: &NeighborGraph) -> f32 {
        let n_points = data.nrows();
        let k = graph.k();
        let amount = self.params.recall_sample.min(n_points);
        let mut rng = StdRng::seed_from_u64(derive_seed(self.params.seed, u64::MAX - 1));
        let sample = rand::seq::index::sample(&mut rng, n_points, amount).into_vec();

        let hits: usize = sample
            .par_iter()
            .map(|&point| {
                let exact = exact_row(data, point, k);
                let approx = graph.indices().row(point).to_vec();
                exact
                    .iter()
                    .filter(|(_, neighbor)| approx.contains(neighbor))
                    .count()
            })
            .sum();

        hits as f32 / (amount * k) as f32
    }
}

/// 全点対を走査して厳密な k-NN グラフを作る。
#[allow(clippy::cast_possible_truncation)]
fn exact_graph(data: ArrayView2<'_, f32>, k: usize) -> Result<NeighborGraph, FlowError> {
    let n_points = data.nrows();
    let rows: Vec<Vec<(f64, usize)>> = (0..n_points)
        .into_par_iter()
        .map(|point| exact_row(data, point, k))
        .collect();

    let mut indices = Array2::zeros((n_points, k));
    let mut distances = Array2::zeros((n_points, k));
    for (point, row) in rows.into_iter().enumerate() {
        for (slot, (distance, neighbor)) in row.into_iter().enumerate() {
            indices[[point, slot]] = neighbor;
            distances[[point, slot]] = distance.sqrt() as f32;
        }
    }
    NeighborGraph::from_parts(indices, distances)
}

/// 自身を除いた最近傍 k 件を `(二乗距離, インデックス)` の昇順で返す。
fn exact_row(data: ArrayView2<'_, f32>, point: usize, k: usize) -> Vec<(f64, usize)> {
    let mut row: Vec<(f64, usize)> = (0..data.nrows())
        .filter(|other| *other != point)
        .map(|other| (squared_distance(data, point, other), other))
        .collect();
    let order = |a: &(f64, usize), b: &(f64, usize)| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1));
    if row.len() > k {
        row.select_nth_unstable_by(k, order);
        row.truncate(k);
    }
    row.sort_by(order);
    row
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1, 5)]
    #[case(400, 6)]
    #[case(10_000, 10)]
    fn n_trees_heuristic(#[case] n_points: usize, #[case] expected: usize) {
        assert_eq!(default_n_trees(n_points), expected);
    }

    #[rstest]
    #[case(1, 5)]
    #[case(16, 5)]
    #[case(1024, 10)]
    #[case(100_000, 17)]
    fn n_iters_heuristic(#[case] n_points: usize, #[case] expected: usize) {
        assert_eq!(default_n_iters(n_points), expected);
    }

    #[test]
    fn rejects_zero_k() {
        let features = FeatureMatrix::new(array![[0.0], [1.0]]);
        let error = NeighborGraphBuilder::default().build(&features, 0).unwrap_err();
        assert!(matches!(error, FlowError::InvalidInput { .. }));
    }

    #[test]
    fn clamps_k_to_point_count() {
        let features = FeatureMatrix::new(array![[0.0], [1.0], [3.0]]);
        let (graph, report) = NeighborGraphBuilder::default()
            .build_with_report(&features, 5)
            .unwrap();
        assert_eq!(report.requested_k, 5);
        assert_eq!(report.k, 2);
        assert_eq!(graph.k(), 2);
        assert_eq!(graph.neighbors(2).collect::<Vec<_>>(), vec![(1, 2.0), (0, 3.0)]);
    }

    #[rstest]
    #[case(0)]
    #[case(100)]
    fn far_apart_points_get_complete_rows(#[case] brute_force_threshold: usize) {
        let features = FeatureMatrix::new(array![[0.0], [1.0e20], [3.0e20], [6.0e20]]);
        let params = BuilderParams {
            brute_force_threshold,
            ..BuilderParams::default()
        };
        let graph = NeighborGraphBuilder::new(params).build(&features, 1).unwrap();
        for point in 0..4 {
            let (index, distance) = graph.neighbors(point).next().unwrap();
            assert!(index < 4 && index != point);
            assert!(distance.is_finite());
        }
        assert_eq!(graph.neighbors(0).next().unwrap().0, 1);
        assert_eq!(graph.neighbors(3).next().unwrap().0, 2);
    }

    #[test]
    fn distances_beyond_f32_range_are_rejected() {
        let features = FeatureMatrix::new(array![[-3.0e38], [3.0e38]]);
        let error = NeighborGraphBuilder::default().build(&features, 1).unwrap_err();
        assert!(matches!(error, FlowError::InvalidInput { .. }));
    }

    #[test]
    fn single_point_yields_zero_width_graph() {
        let features = FeatureMatrix::new(array![[4.0, 2.0]]);
        let graph = NeighborGraphBuilder::default().build(&features, 3).unwrap();
        assert_eq!(graph.n_points(), 1);
        assert_eq!(graph.k(), 0);
    }

    #[test]
    fn exact_mode_matches_brute_force_order() {
        let features = FeatureMatrix::new(array![[0.0], [1.0], [5.0], [5.1]]);
        let params = BuilderParams {
            brute_force_threshold: 100,
            ..BuilderParams::default()
        };
        let (graph, report) = NeighborGraphBuilder::new(params)
            .build_with_report(&features, 2)
            .unwrap();
        assert!(report.exact);
        let first: Vec<usize> = graph.neighbors(0).map(|(index, _)| index).collect();
        assert_eq!(first, vec![1, 2]);
    }

    #[test]
    fn recall_is_reported_when_sampled() {
        let features = FeatureMatrix::new(ndarray::Array2::from_shape_fn((300, 2), |(i, j)| {
            if j == 0 { (i % 20) as f32 } else { (i / 20) as f32 }
        }));
        let params = BuilderParams {
            recall_sample: 30,
            ..BuilderParams::default()
        };
        let (_, report) = NeighborGraphBuilder::new(params)
            .build_with_report(&features, 4)
            .unwrap();
        let recall = report.recall.expect("recall should be sampled");
        assert!((0.0..=1.0).contains(&recall));
    }
}
