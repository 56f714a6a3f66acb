//! 近傍グラフ構築とラベル拡散をまとめたファサード。
//! グローバルな状態は持たず、呼び出し側が所有して使い回す。

use std::sync::Arc;
use std::time::Instant;

use ndarray::ArrayView2;

use crate::config::Config;
use crate::diffusion::{LabelDiffuser, Propagation, PropagationStatus};
use crate::error::FlowError;
use crate::graph::{BuildReport, NeighborGraph, NeighborGraphBuilder};
use crate::label::LabelVector;
use crate::matrix::{FeatureMatrix, RowMask};
use crate::observability::metrics::Metrics;

/// 1つの特徴行列に対する分類セッション。
///
/// グラフは一度だけ構築し、シードを変えて何度でも [`ActivationFlow::classify`] できる。
#[derive(Debug, Clone)]
pub struct ActivationFlow {
    config: Config,
    graph: Arc<NeighborGraph>,
    report: BuildReport,
    metrics: Option<Arc<Metrics>>,
}

impl ActivationFlow {
    /// 特徴行列から近傍グラフを構築する。
    ///
    /// # Errors
    /// 行列が不正な場合は [`FlowError::InvalidInput`] を返す。
    pub fn fit(features: &FeatureMatrix, config: &Config) -> Result<Self, FlowError> {
        Self::fit_with_metrics(features, config, None)
    }

    /// [`ActivationFlow::fit`] に加えて、構築・拡散の統計を `metrics` に記録する。
    ///
    /// # Errors
    /// [`ActivationFlow::fit`] と同じ。
    pub fn fit_with_metrics(
        features: &FeatureMatrix,
        config: &Config,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, FlowError> {
        let builder = NeighborGraphBuilder::new(config.builder_params());
        let (graph, report) = builder.build_with_report(features, config.k())?;
        if let Some(metrics) = &metrics {
            metrics.record_build(&report);
        }
        Ok(Self {
            config: config.clone(),
            graph: Arc::new(graph),
            report,
            metrics,
        })
    }

    /// 構築済みのグラフからセッションを作る。
    #[must_use]
    pub fn from_graph(graph: Arc<NeighborGraph>, report: BuildReport, config: &Config) -> Self {
        Self {
            config: config.clone(),
            graph,
            report,
            metrics: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<NeighborGraph> {
        &self.graph
    }

    #[must_use]
    pub fn build_report(&self) -> &BuildReport {
        &self.report
    }

    /// グラフを共有する拡散器を返す。並行に複数のシードを拡散する場合に使う。
    #[must_use]
    pub fn diffuser(&self) -> LabelDiffuser {
        LabelDiffuser::new(Arc::clone(&self.graph))
            .with_stop_when_stable(self.config.stop_when_stable())
    }

    /// 特徴行列がこのグラフと同じ点数かを確認する。
    ///
    /// # Errors
    /// 点数が異なる場合は [`FlowError::ShapeMismatch`] を返す。
    pub fn check_features(&self, features: &FeatureMatrix) -> Result<(), FlowError> {
        if features.n_points() != self.graph.n_points() {
            return Err(FlowError::shape(
                "feature matrix rows",
                self.graph.n_points(),
                features.n_points(),
            ));
        }
        Ok(())
    }

    /// 設定の反復数でシードを拡散する。毎回シードから独立に計算する。
    ///
    /// # Errors
    /// シード長がグラフの点数と異なる場合は [`FlowError::ShapeMismatch`] を返す。
    pub fn classify(&self, seed: &LabelVector) -> Result<Propagation, FlowError> {
        let started = Instant::now();
        let propagation = self.diffuser().spread_report(seed, self.config.iterations())?;
        if let Some(metrics) = &self.metrics {
            if propagation.status == PropagationStatus::NothingToPropagate {
                metrics.empty_seeds.inc();
            } else {
                metrics.record_diffusion(&propagation, started.elapsed().as_secs_f64());
            }
        }
        Ok(propagation)
    }

    /// 無効行を含む元の行列に対して、有効行だけでグラフを作り、結果を元の行順で返す。
    ///
    /// # Errors
    /// マスク・シードの長さが行数と一致しない場合は [`FlowError::ShapeMismatch`]、
    /// 有効行がない場合は [`FlowError::InvalidInput`] を返す。
    pub fn classify_masked(
        full: ArrayView2<'_, f32>,
        mask: &RowMask,
        full_seed: &LabelVector,
        config: &Config,
    ) -> Result<LabelVector, FlowError> {
        let (features, map) = FeatureMatrix::compact(full, mask)?;
        let seed = map.gather(full_seed)?;
        tracing::info!(
            full_rows = map.full_len(),
            valid_rows = map.compact_len(),
            "classifying masked feature matrix"
        );
        let flow = Self::fit(&features, config)?;
        let propagation = flow.classify(&seed)?;
        map.scatter(&propagation.labels)
    }
}
