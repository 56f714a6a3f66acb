use thiserror::Error;

/// グラフ構築とラベル拡散で発生するエラー。
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FlowError {
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// シードにラベルが一つも含まれていない。致命的ではなく、呼び出し側で回復できる。
    #[error("seed of {points} points carries no labels; nothing to propagate")]
    NothingToPropagate { points: usize },
}

impl FlowError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(what: &'static str, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            what,
            expected,
            actual,
        }
    }

    /// 呼び出し側がメッセージを出して処理を続けられる種類のエラーかどうか。
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NothingToPropagate { .. })
    }
}

/// 近似近傍探索の品質シグナル。エラーではなく、呼び出し側がログに残すための診断値。
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct ApproximationWarning {
    /// サンプル点で測定した再現率 (0.0..=1.0)
    pub recall: f32,
    /// 厳密探索と比較した点の数
    pub sampled: usize,
    /// 警告の閾値
    pub threshold: f32,
}

impl std::fmt::Display for ApproximationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "approximate neighbor recall {:.3} below {:.3} ({} sampled points)",
            self.recall, self.threshold, self.sampled
        )
    }
}
