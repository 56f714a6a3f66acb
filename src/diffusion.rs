//! 同期式のラベル拡散（activation flow）。
//!
//! 各反復で全点が「前の反復の状態」だけを読み、1ホップ先の近傍から最小コストのラベルを採用する。
//! 次状態は別バッファに書き込み、反復の終わりに入れ替える。
//! 同じ反復内で更新済みの値を読むことはない。

use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::graph::NeighborGraph;
use crate::label::{LabelId, LabelVector};

/// 点に到達したラベルとその累積コスト（ポテンシャル）。
/// ラベルとポテンシャルを一つの値で持つので、片方だけが設定された状態は表現できない。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    pub label: LabelId,
    pub cost: f32,
}

/// 1回の拡散実行の状態。反復境界で中断・再開できる。
#[derive(Debug, Clone)]
pub struct DiffusionState {
    seeds: Vec<Option<LabelId>>,
    current: Vec<Option<Activation>>,
    next: Vec<Option<Activation>>,
    iterations: usize,
    last_changed: Option<usize>,
}

impl DiffusionState {
    fn from_seed(seed: &LabelVector) -> Self {
        let seeds = seed.as_slice().to_vec();
        let current: Vec<Option<Activation>> = seeds
            .iter()
            .map(|label| label.map(|label| Activation { label, cost: 0.0 }))
            .collect();
        let next = current.clone();
        Self {
            seeds,
            current,
            next,
            iterations: 0,
            last_changed: None,
        }
    }

    /// これまでに実行した反復数。
    #[must_use]
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// 直前の反復で状態が変わった点の数。まだ反復していなければ `None`。
    #[must_use]
    pub fn last_changed(&self) -> Option<usize> {
        self.last_changed
    }

    /// 直前の反復で何も変わらなかった（不動点に達した）か。
    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.last_changed == Some(0)
    }

    #[must_use]
    pub fn activations(&self) -> &[Option<Activation>] {
        &self.current
    }

    #[must_use]
    pub fn labels(&self) -> LabelVector {
        self.current
            .iter()
            .map(|activation| activation.map(|activation| activation.label))
            .collect()
    }

    /// 各点のポテンシャル。`None` は未到達（無限大）を表す。
    #[must_use]
    pub fn potentials(&self) -> Vec<Option<f32>> {
        self.current
            .iter()
            .map(|activation| activation.map(|activation| activation.cost))
            .collect()
    }

    /// まだラベルが届いていない点の数。
    #[must_use]
    pub fn unreached(&self) -> usize {
        self.current.iter().filter(|activation| activation.is_none()).count()
    }

    #[must_use]
    pub fn into_labels(self) -> LabelVector {
        self.labels()
    }
}

/// 拡散結果の状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationStatus {
    Propagated,
    /// シードにラベルがなく、何も伝播しなかった
    NothingToPropagate,
}

/// [`LabelDiffuser::spread_report`] の結果。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Propagation {
    pub labels: LabelVector,
    pub potentials: Vec<Option<f32>>,
    pub iterations: usize,
    pub converged_early: bool,
    pub unreached: usize,
    pub status: PropagationStatus,
}

/// 近傍グラフ上でシードラベルを拡散する。
///
/// グラフは `Arc` で保持するので、同じグラフに対して複数のシードを並行に拡散できる。
#[derive(Debug, Clone)]
pub struct LabelDiffuser {
    graph: Arc<NeighborGraph>,
    stop_when_stable: bool,
}

impl LabelDiffuser {
    #[must_use]
    pub fn new(graph: Arc<NeighborGraph>) -> Self {
        Self {
            graph,
            stop_when_stable: false,
        }
    }

    /// 状態が変化しなくなった時点で反復を打ち切る。結果は変わらない。
    #[must_use]
    pub fn with_stop_when_stable(mut self, stop_when_stable: bool) -> Self {
        self.stop_when_stable = stop_when_stable;
        self
    }

    #[must_use]
    pub fn graph(&self) -> &NeighborGraph {
        &self.graph
    }

    /// シードから初期状態を作る。
    ///
    /// # Errors
    /// シード長がグラフの点数と異なる場合は [`FlowError::ShapeMismatch`]、
    /// ラベルが一つもない場合は [`FlowError::NothingToPropagate`] を返す。
    pub fn start(&self, seed: &LabelVector) -> Result<DiffusionState, FlowError> {
        self.check_seed(seed)?;
        if !seed.has_labels() {
            return Err(FlowError::NothingToPropagate { points: seed.len() });
        }
        Ok(DiffusionState::from_seed(seed))
    }

    /// 1反復（同期緩和）を実行し、状態が変わった点の数を返す。
    pub fn step(&self, state: &mut DiffusionState) -> usize {
        let graph = &*self.graph;
        let current = &state.current;
        let seeds = &state.seeds;

        state
            .next
            .par_iter_mut()
            .enumerate()
            .for_each(|(point, slot)| {
                *slot = match seeds[point] {
                    Some(label) => Some(Activation { label, cost: 0.0 }),
                    None => relax(graph, current, point),
                };
            });

        let changed = state
            .next
            .par_iter()
            .zip(state.current.par_iter())
            .filter(|(next, current)| next != current)
            .count();

        std::mem::swap(&mut state.current, &mut state.next);
        state.iterations += 1;
        state.last_changed = Some(changed);
        changed
    }

    /// 既存の状態に対して最大 `iterations` 回の反復を追加で実行し、実行した回数を返す。
    pub fn advance(&self, state: &mut DiffusionState, iterations: usize) -> usize {
        let mut run = 0;
        while run < iterations {
            if self.stop_when_stable && state.is_stable() {
                break;
            }
            let changed = self.step(state);
            run += 1;
            tracing::debug!(iteration = state.iterations, changed, "diffusion step");
        }
        run
    }

    /// シードから `iterations` 回拡散し、ラベルを返す。呼び出しごとに独立している。
    ///
    /// # Errors
    /// [`LabelDiffuser::start`] と同じ。
    pub fn spread(&self, seed: &LabelVector, iterations: usize) -> Result<LabelVector, FlowError> {
        let mut state = self.start(seed)?;
        self.advance(&mut state, iterations);
        Ok(state.into_labels())
    }

    /// [`LabelDiffuser::spread`] の詳細版。
    /// ラベルのないシードはエラーにせず、シードと同一のラベルと
    /// [`PropagationStatus::NothingToPropagate`] を返す。
    ///
    /// # Errors
    /// シード長がグラフの点数と異なる場合は [`FlowError::ShapeMismatch`] を返す。
    pub fn spread_report(
        &self,
        seed: &LabelVector,
        iterations: usize,
    ) -> Result<Propagation, FlowError> {
        self.check_seed(seed)?;
        if !seed.has_labels() {
            tracing::warn!(
                points = seed.len(),
                "seed carries no labels; nothing to propagate"
            );
            return Ok(Propagation {
                labels: seed.clone(),
                potentials: vec![None; seed.len()],
                iterations: 0,
                converged_early: false,
                unreached: seed.len(),
                status: PropagationStatus::NothingToPropagate,
            });
        }

        let started = Instant::now();
        let mut state = DiffusionState::from_seed(seed);
        let run = self.advance(&mut state, iterations);
        let unreached = state.unreached();

        tracing::info!(
            points = seed.len(),
            seeds = seed.labeled_count(),
            requested_iterations = iterations,
            iterations = run,
            unreached,
            elapsed_ms = started.elapsed().as_millis(),
            "label diffusion completed"
        );

        Ok(Propagation {
            potentials: state.potentials(),
            labels: state.labels(),
            iterations: run,
            converged_early: run < iterations,
            unreached,
            status: PropagationStatus::Propagated,
        })
    }

    fn check_seed(&self, seed: &LabelVector) -> Result<(), FlowError> {
        if seed.len() != self.graph.n_points() {
            return Err(FlowError::shape(
                "seed length",
                self.graph.n_points(),
                seed.len(),
            ));
        }
        Ok(())
    }
}

/// 点 `point` の近傍から最小コストの候補を選ぶ。
/// 同コストの場合は近傍リストで先に現れた（順位の高い）候補を採る。
fn relax(graph: &NeighborGraph, current: &[Option<Activation>], point: usize) -> Option<Activation> {
    let mut best: Option<Activation> = None;
    for (neighbor, distance) in graph.neighbors(point) {
        let Some(source) = current[neighbor] else {
            continue;
        };
        let cost = source.cost + distance;
        if best.is_none_or(|best| cost < best.cost) {
            best = Some(Activation {
                label: source.label,
                cost,
            });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    const A: LabelId = LabelId(1);
    const B: LabelId = LabelId(2);

    /// 0-1-2-3 の直線グラフ（辺の重みはすべて1）。端点は同じ近傍を2回持つ。
    fn line_graph() -> Arc<NeighborGraph> {
        let indices = array![[1, 1], [0, 2], [1, 3], [2, 2]];
        let distances = array![[1.0, 1.0], [1.0, 1.0], [1.0, 1.0], [1.0, 1.0]];
        Arc::new(NeighborGraph::from_parts(indices, distances).unwrap())
    }

    #[test]
    fn line_graph_advances_one_hop_per_iteration() {
        let diffuser = LabelDiffuser::new(line_graph());
        let seed = LabelVector::from_sparse(4, &[(0, A)]).unwrap();
        let mut state = diffuser.start(&seed).unwrap();

        diffuser.step(&mut state);
        assert_eq!(state.labels().as_slice(), &[Some(A), Some(A), None, None]);
        assert_eq!(state.potentials()[1], Some(1.0));

        diffuser.step(&mut state);
        assert_eq!(state.labels().get(2), Some(A));
        assert_eq!(state.labels().get(3), None);
        assert_eq!(state.potentials()[2], Some(2.0));

        diffuser.step(&mut state);
        assert_eq!(state.labels().get(3), Some(A));
        assert_eq!(state.potentials()[3], Some(3.0));
        assert_eq!(state.unreached(), 0);
    }

    #[test]
    fn one_hop_cost_equals_edge_distance() {
        let indices = array![[1], [0], [1]];
        let distances = array![[0.75], [0.75], [2.5]];
        let graph = Arc::new(NeighborGraph::from_parts(indices, distances).unwrap());
        let diffuser = LabelDiffuser::new(graph);
        let seed = LabelVector::from_sparse(3, &[(1, B)]).unwrap();

        let mut state = diffuser.start(&seed).unwrap();
        diffuser.step(&mut state);
        assert_eq!(state.activations()[0], Some(Activation { label: B, cost: 0.75 }));
        assert_eq!(state.activations()[2], Some(Activation { label: B, cost: 2.5 }));
    }

    #[test]
    fn winner_replaces_state_from_previous_snapshot_only() {
        // 点1は反復1の時点では点2が未設定なので点0経由のコスト3を採る。
        // 反復2で点2（コスト1）経由のコスト1.5に置き換わる。
        let indices = array![[1, 1], [0, 2], [3, 3], [2, 2]];
        let distances = array![[3.0, 3.0], [3.0, 0.5], [1.0, 1.0], [1.0, 1.0]];
        let graph = Arc::new(NeighborGraph::from_parts(indices, distances).unwrap());
        let diffuser = LabelDiffuser::new(graph);
        let seed = LabelVector::from_sparse(4, &[(0, A), (3, B)]).unwrap();

        let mut state = diffuser.start(&seed).unwrap();
        diffuser.step(&mut state);
        assert_eq!(state.activations()[1], Some(Activation { label: A, cost: 3.0 }));
        assert_eq!(state.activations()[2], Some(Activation { label: B, cost: 1.0 }));

        diffuser.step(&mut state);
        assert_eq!(state.activations()[1], Some(Activation { label: B, cost: 1.5 }));
    }

    #[test]
    fn chains_reach_points_behind_unlabeled_neighbors() {
        let indices = array![[1], [0], [0], [2]];
        let distances = array![[1.0], [1.0], [1.0], [1.0]];
        let graph = Arc::new(NeighborGraph::from_parts(indices, distances).unwrap());
        let diffuser = LabelDiffuser::new(graph);
        let seed = LabelVector::from_sparse(4, &[(0, A)]).unwrap();
        let mut state = diffuser.start(&seed).unwrap();

        diffuser.advance(&mut state, 1);
        assert_eq!(state.labels().get(3), None);
        diffuser.advance(&mut state, 1);
        assert_eq!(state.labels().as_slice(), &[Some(A), Some(A), Some(A), Some(A)]);
        assert_eq!(state.potentials()[3], Some(2.0));
    }

    #[test]
    fn unreachable_points_stay_unset() {
        let indices = array![[1], [0], [3], [2]];
        let distances = array![[1.0], [1.0], [1.0], [1.0]];
        let graph = Arc::new(NeighborGraph::from_parts(indices, distances).unwrap());
        let report = LabelDiffuser::new(graph)
            .spread_report(&LabelVector::from_sparse(4, &[(0, A)]).unwrap(), 10)
            .unwrap();
        assert_eq!(report.labels.as_slice(), &[Some(A), Some(A), None, None]);
        assert_eq!(report.potentials[2], None);
        assert_eq!(report.unreached, 2);
        assert_eq!(report.status, PropagationStatus::Propagated);
    }

    #[test]
    fn ties_prefer_lower_neighbor_rank() {
        let indices = array![[1, 2], [1, 1], [2, 2]];
        let distances = array![[1.0, 1.0], [0.0, 0.0], [0.0, 0.0]];
        let graph = Arc::new(NeighborGraph::from_parts(indices, distances).unwrap());
        let diffuser = LabelDiffuser::new(graph);
        let seed = LabelVector::from_sparse(3, &[(1, B), (2, A)]).unwrap();

        let first = diffuser.spread(&seed, 3).unwrap();
        for _ in 0..10 {
            assert_eq!(diffuser.spread(&seed, 3).unwrap(), first);
        }
        assert_eq!(first.get(0), Some(B));
    }

    #[test]
    fn empty_seed_is_reported() {
        let diffuser = LabelDiffuser::new(line_graph());
        let seed = LabelVector::unset(4);

        let error = diffuser.spread(&seed, 5).unwrap_err();
        assert_eq!(error, FlowError::NothingToPropagate { points: 4 });

        for iterations in [0, 1, 7] {
            let report = diffuser.spread_report(&seed, iterations).unwrap();
            assert_eq!(report.status, PropagationStatus::NothingToPropagate);
            assert_eq!(report.labels, seed);
        }
    }

    #[test]
    fn seed_length_must_match_graph() {
        let diffuser = LabelDiffuser::new(line_graph());
        let seed = LabelVector::from_sparse(3, &[(0, A)]).unwrap();
        assert!(matches!(
            diffuser.spread(&seed, 1),
            Err(FlowError::ShapeMismatch { expected: 4, actual: 3, .. })
        ));
        assert!(diffuser.spread_report(&seed, 1).is_err());
    }

    #[test]
    fn zero_iterations_return_seed() {
        let diffuser = LabelDiffuser::new(line_graph());
        let seed = LabelVector::from_sparse(4, &[(2, B)]).unwrap();
        assert_eq!(diffuser.spread(&seed, 0).unwrap(), seed);
    }

    #[test]
    fn resumed_advance_matches_one_shot_spread() {
        let diffuser = LabelDiffuser::new(line_graph());
        let seed = LabelVector::from_sparse(4, &[(3, B)]).unwrap();
        let mut state = diffuser.start(&seed).unwrap();
        diffuser.advance(&mut state, 1);
        diffuser.advance(&mut state, 2);
        assert_eq!(state.iterations(), 3);
        assert_eq!(state.into_labels(), diffuser.spread(&seed, 3).unwrap());
    }

    #[test]
    fn early_stop_does_not_change_results() {
        let graph = line_graph();
        let seed = LabelVector::from_sparse(4, &[(0, A), (3, B)]).unwrap();
        let eager = LabelDiffuser::new(Arc::clone(&graph)).with_stop_when_stable(true);
        let full = LabelDiffuser::new(graph);

        let report = eager.spread_report(&seed, 50).unwrap();
        assert!(report.converged_early);
        assert!(report.iterations < 50);
        for iterations in [1, 2, 3, 50] {
            assert_eq!(
                eager.spread(&seed, iterations).unwrap(),
                full.spread(&seed, iterations).unwrap()
            );
        }
    }
}
