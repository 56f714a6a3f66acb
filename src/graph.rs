//! 近似 k-NN グラフ。
//! 各点について距離昇順に並んだ k 個の近傍インデックスと距離を保持する。

pub mod builder;
mod descent;
mod heap;
mod rp_forest;

use ndarray::{Array2, ArrayView2};

use crate::error::FlowError;

pub use builder::{BuildReport, BuilderParams, NeighborGraphBuilder};

/// 構築後は不変の近傍グラフ。`Arc` で複数の拡散処理から共有できる。
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborGraph {
    indices: Array2<usize>,
    distances: Array2<f32>,
}

impl NeighborGraph {
    /// 外部で用意したインデックス行列と距離行列からグラフを作成する。
    ///
    /// # Errors
    /// 行列の形が一致しない場合は [`FlowError::ShapeMismatch`]、
    /// インデックスが範囲外・距離が負または非有限の場合は [`FlowError::InvalidInput`] を返す。
    pub fn from_parts(indices: Array2<usize>, distances: Array2<f32>) -> Result<Self, FlowError> {
        if indices.nrows() != distances.nrows() {
            return Err(FlowError::shape(
                "distance matrix rows",
                indices.nrows(),
                distances.nrows(),
            ));
        }
        if indices.ncols() != distances.ncols() {
            return Err(FlowError::shape(
                "distance matrix columns",
                indices.ncols(),
                distances.ncols(),
            ));
        }
        let n_points = indices.nrows();
        if let Some(((row, col), index)) = indices.indexed_iter().find(|(_, index)| **index >= n_points) {
            return Err(FlowError::invalid(format!(
                "neighbor index {index} at ({row}, {col}) is out of range for {n_points} points"
            )));
        }
        if let Some(((row, col), distance)) = distances
            .indexed_iter()
            .find(|(_, distance)| !distance.is_finite() || **distance < 0.0)
        {
            return Err(FlowError::invalid(format!(
                "neighbor distance {distance} at ({row}, {col}) must be finite and non-negative"
            )));
        }
        Ok(Self { indices, distances })
    }

    #[must_use]
    pub fn n_points(&self) -> usize {
        self.indices.nrows()
    }

    /// 1行あたりの近傍数。
    #[must_use]
    pub fn k(&self) -> usize {
        self.indices.ncols()
    }

    /// 点 `point` の近傍を順位順に `(インデックス, 距離)` で返す。
    pub fn neighbors(&self, point: usize) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.indices
            .row(point)
            .into_iter()
            .copied()
            .zip(self.distances.row(point).into_iter().copied())
    }

    #[must_use]
    pub fn indices(&self) -> ArrayView2<'_, usize> {
        self.indices.view()
    }

    #[must_use]
    pub fn distances(&self) -> ArrayView2<'_, f32> {
        self.distances.view()
    }

    #[must_use]
    pub fn into_parts(self) -> (Array2<usize>, Array2<f32>) {
        (self.indices, self.distances)
    }
}

/// 基底シードとストリーム番号から独立した乱数シードを導出する (splitmix64)。
pub(crate) fn derive_seed(seed: u64, stream: u64) -> u64 {
    let mut z = seed
        .wrapping_add(stream.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
