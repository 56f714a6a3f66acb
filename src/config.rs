use std::env;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::builder::{BuilderParams, DEFAULT_SEED};

/// activation flow の設定値。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    k: usize,
    iterations: usize,
    seed: Option<u64>,
    n_trees: Option<usize>,
    n_iters: Option<usize>,
    leaf_size: Option<usize>,
    max_candidates: Option<usize>,
    delta: f32,
    recall_sample: usize,
    recall_warn_threshold: f32,
    brute_force_threshold: usize,
    stop_when_stable: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: 15,
            iterations: 50,
            seed: None,
            n_trees: None,
            n_iters: None,
            leaf_size: None,
            max_candidates: None,
            delta: 0.001,
            recall_sample: 0,
            recall_warn_threshold: 0.9,
            brute_force_threshold: 0,
            stop_when_stable: false,
        }
    }
}

impl Config {
    /// 近傍数と反復数を指定して設定を作る。その他は既定値。
    ///
    /// # Errors
    /// `k` が0の場合は [`ConfigError`] を返す。
    pub fn new(k: usize, iterations: usize) -> Result<Self, ConfigError> {
        let config = Self {
            k,
            iterations,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// 環境変数から設定値を読み込み、検証する。未設定の項目は既定値を使う。
    ///
    /// # Errors
    /// 値のパースに失敗した場合、または範囲外の値の場合は [`ConfigError`] を返す。
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let k = parse_usize("ACTIVATION_FLOW_K", defaults.k)?;
        let iterations = parse_usize("ACTIVATION_FLOW_ITERATIONS", defaults.iterations)?;
        let seed = parse_optional_u64("ACTIVATION_FLOW_SEED")?;

        // 近傍探索のヒューリスティクス上書き
        let n_trees = parse_optional_usize("ACTIVATION_FLOW_N_TREES")?;
        let n_iters = parse_optional_usize("ACTIVATION_FLOW_N_ITERS")?;
        let leaf_size = parse_optional_usize("ACTIVATION_FLOW_LEAF_SIZE")?;
        let max_candidates = parse_optional_usize("ACTIVATION_FLOW_MAX_CANDIDATES")?;
        let delta = parse_f32("ACTIVATION_FLOW_DELTA", defaults.delta)?;

        // 品質診断
        let recall_sample = parse_usize("ACTIVATION_FLOW_RECALL_SAMPLE", defaults.recall_sample)?;
        let recall_warn_threshold = parse_f32(
            "ACTIVATION_FLOW_RECALL_WARN_THRESHOLD",
            defaults.recall_warn_threshold,
        )?;
        let brute_force_threshold = parse_usize(
            "ACTIVATION_FLOW_BRUTE_FORCE_THRESHOLD",
            defaults.brute_force_threshold,
        )?;
        let stop_when_stable =
            parse_bool("ACTIVATION_FLOW_STOP_WHEN_STABLE", defaults.stop_when_stable)?;

        let config = Self {
            k,
            iterations,
            seed,
            n_trees,
            n_iters,
            leaf_size,
            max_candidates,
            delta,
            recall_sample,
            recall_warn_threshold,
            brute_force_threshold,
            stop_when_stable,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.k < 1 {
            return Err(ConfigError::Invalid {
                name: "k",
                source: anyhow::anyhow!("neighbor count must be at least 1"),
            });
        }
        if !(0.0..=1.0).contains(&self.delta) {
            return Err(ConfigError::Invalid {
                name: "delta",
                source: anyhow::anyhow!("value must be between 0 and 1"),
            });
        }
        if !(0.0..=1.0).contains(&self.recall_warn_threshold) {
            return Err(ConfigError::Invalid {
                name: "recall_warn_threshold",
                source: anyhow::anyhow!("value must be between 0 and 1"),
            });
        }
        if matches!(self.n_trees, Some(0)) {
            return Err(ConfigError::Invalid {
                name: "n_trees",
                source: anyhow::anyhow!("at least one tree is required"),
            });
        }
        Ok(())
    }

    /// 近傍数を変更する。
    ///
    /// # Errors
    /// `k` が0の場合は [`ConfigError`] を返す。
    pub fn with_k(mut self, k: usize) -> Result<Self, ConfigError> {
        self.k = k;
        self.validate()?;
        Ok(self)
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    #[must_use]
    pub fn with_n_trees(mut self, n_trees: usize) -> Self {
        self.n_trees = Some(n_trees.max(1));
        self
    }

    #[must_use]
    pub fn with_n_iters(mut self, n_iters: usize) -> Self {
        self.n_iters = Some(n_iters);
        self
    }

    #[must_use]
    pub fn with_recall_sample(mut self, recall_sample: usize) -> Self {
        self.recall_sample = recall_sample;
        self
    }

    #[must_use]
    pub fn with_brute_force_threshold(mut self, brute_force_threshold: usize) -> Self {
        self.brute_force_threshold = brute_force_threshold;
        self
    }

    #[must_use]
    pub fn with_stop_when_stable(mut self, stop_when_stable: bool) -> Self {
        self.stop_when_stable = stop_when_stable;
        self
    }

    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    #[must_use]
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    #[must_use]
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    #[must_use]
    pub fn n_trees(&self) -> Option<usize> {
        self.n_trees
    }

    #[must_use]
    pub fn n_iters(&self) -> Option<usize> {
        self.n_iters
    }

    #[must_use]
    pub fn recall_sample(&self) -> usize {
        self.recall_sample
    }

    #[must_use]
    pub fn stop_when_stable(&self) -> bool {
        self.stop_when_stable
    }

    /// グラフ構築用のパラメータへ変換する。シード未指定時は固定値を使う。
    #[must_use]
    pub fn builder_params(&self) -> BuilderParams {
        BuilderParams {
            n_trees: self.n_trees,
            n_iters: self.n_iters,
            leaf_size: self.leaf_size,
            max_candidates: self.max_candidates,
            delta: self.delta,
            seed: self.seed.unwrap_or(DEFAULT_SEED),
            recall_sample: self.recall_sample,
            recall_warn_threshold: self.recall_warn_threshold,
            brute_force_threshold: self.brute_force_threshold,
        }
    }
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_optional_usize(name: &'static str) -> Result<Option<usize>, ConfigError> {
    env::var(name)
        .ok()
        .map(|raw| {
            raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
                name,
                source: anyhow::Error::new(error),
            })
        })
        .transpose()
}

fn parse_optional_u64(name: &'static str) -> Result<Option<u64>, ConfigError> {
    env::var(name)
        .ok()
        .map(|raw| {
            raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
                name,
                source: anyhow::Error::new(error),
            })
        })
        .transpose()
}

fn parse_f32(name: &'static str, default: f32) -> Result<f32, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<f32>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("invalid boolean value: {raw}"),
        }),
    }
}
