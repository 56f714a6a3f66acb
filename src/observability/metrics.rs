/// Prometheusメトリクス定義。
use prometheus::{
    Counter, Gauge, Histogram, Registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_with_registry,
};

use crate::diffusion::Propagation;
use crate::graph::BuildReport;

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // カウンター
    pub graph_builds: Counter,
    pub diffusion_runs: Counter,
    pub diffusion_iterations: Counter,
    pub empty_seeds: Counter,
    pub approximation_warnings: Counter,

    // ヒストグラム
    pub graph_build_duration: Histogram,
    pub diffusion_duration: Histogram,

    // ゲージ
    pub graph_points: Gauge,
    pub graph_recall: Gauge,
    pub unreached_points: Gauge,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成し、`registry` に登録する。
    ///
    /// # Errors
    /// 同名のメトリクスが既に登録されている場合はエラーを返す。
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            graph_builds: register_counter_with_registry!(
                "activation_flow_graph_builds_total",
                "Total number of neighbor graphs built",
                registry
            )?,
            diffusion_runs: register_counter_with_registry!(
                "activation_flow_diffusion_runs_total",
                "Total number of label diffusion runs",
                registry
            )?,
            diffusion_iterations: register_counter_with_registry!(
                "activation_flow_diffusion_iterations_total",
                "Total number of relaxation iterations executed",
                registry
            )?,
            empty_seeds: register_counter_with_registry!(
                "activation_flow_empty_seeds_total",
                "Number of diffusion requests whose seed carried no labels",
                registry
            )?,
            approximation_warnings: register_counter_with_registry!(
                "activation_flow_approximation_warnings_total",
                "Number of graph builds whose sampled recall fell below the threshold",
                registry
            )?,
            graph_build_duration: register_histogram_with_registry!(
                "activation_flow_graph_build_duration_seconds",
                "Duration of neighbor graph construction",
                registry
            )?,
            diffusion_duration: register_histogram_with_registry!(
                "activation_flow_diffusion_duration_seconds",
                "Duration of a label diffusion run",
                registry
            )?,
            graph_points: register_gauge_with_registry!(
                "activation_flow_graph_points",
                "Number of points in the current neighbor graph",
                registry
            )?,
            graph_recall: register_gauge_with_registry!(
                "activation_flow_graph_recall",
                "Sampled recall of the current neighbor graph",
                registry
            )?,
            unreached_points: register_gauge_with_registry!(
                "activation_flow_unreached_points",
                "Points left without a label by the last diffusion run",
                registry
            )?,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn record_build(&self, report: &BuildReport) {
        self.graph_builds.inc();
        self.graph_build_duration
            .observe(report.elapsed.as_secs_f64());
        self.graph_points.set(report.n_points as f64);
        if let Some(recall) = report.recall {
            self.graph_recall.set(f64::from(recall));
        }
        if report.warning.is_some() {
            self.approximation_warnings.inc();
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn record_diffusion(&self, propagation: &Propagation, seconds: f64) {
        self.diffusion_runs.inc();
        self.diffusion_iterations
            .inc_by(propagation.iterations as f64);
        self.diffusion_duration.observe(seconds);
        self.unreached_points.set(propagation.unreached as f64);
    }
}
