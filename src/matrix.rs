//! 特徴行列とマスク処理。
//! 無効画素（NaN・no-data）を含む行をコアに渡す前に取り除き、結果を元の行順に戻す。

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

use crate::error::FlowError;
use crate::label::LabelVector;

/// N点 × F特徴の行優先行列。
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    data: Array2<f32>,
}

impl FeatureMatrix {
    #[must_use]
    pub fn new(data: Array2<f32>) -> Self {
        Self { data }
    }

    /// フラットな行優先バッファから行列を作成する。
    ///
    /// # Errors
    /// `data.len() != n_points * n_features` の場合は [`FlowError::ShapeMismatch`] を返す。
    pub fn from_shape_vec(
        n_points: usize,
        n_features: usize,
        data: Vec<f32>,
    ) -> Result<Self, FlowError> {
        let expected = n_points * n_features;
        if data.len() != expected {
            return Err(FlowError::shape("feature buffer length", expected, data.len()));
        }
        let data = Array2::from_shape_vec((n_points, n_features), data)
            .map_err(|error| FlowError::invalid(error.to_string()))?;
        Ok(Self { data })
    }

    /// 行ベクトルの列から行列を作成する。
    ///
    /// # Errors
    /// 行の長さが揃っていない場合は [`FlowError::ShapeMismatch`] を返す。
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self, FlowError> {
        let n_points = rows.len();
        let n_features = rows.first().map_or(0, Vec::len);
        let mut flat = Vec::with_capacity(n_points * n_features);
        for row in rows {
            if row.len() != n_features {
                return Err(FlowError::shape("feature row width", n_features, row.len()));
            }
            flat.extend(row);
        }
        Self::from_shape_vec(n_points, n_features, flat)
    }

    #[must_use]
    pub fn n_points(&self) -> usize {
        self.data.nrows()
    }

    #[must_use]
    pub fn n_features(&self) -> usize {
        self.data.ncols()
    }

    #[must_use]
    pub fn row(&self, index: usize) -> ArrayView1<'_, f32> {
        self.data.row(index)
    }

    #[must_use]
    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    /// 近傍探索に渡せる行列かを検証する。
    ///
    /// # Errors
    /// 行数・列数が0、または非有限値を含む場合は [`FlowError::InvalidInput`] を返す。
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.n_points() == 0 {
            return Err(FlowError::invalid("feature matrix has no rows"));
        }
        if self.n_features() == 0 {
            return Err(FlowError::invalid("feature matrix has no columns"));
        }
        for (row, values) in self.data.axis_iter(Axis(0)).enumerate() {
            if let Some(column) = values.iter().position(|value| !value.is_finite()) {
                return Err(FlowError::invalid(format!(
                    "non-finite feature value at row {row}, column {column}"
                )));
            }
        }
        Ok(())
    }

    /// 有効行だけを取り出した行列と、元の行番号への対応表を返す。
    ///
    /// # Errors
    /// マスクの長さが行数と一致しない場合は [`FlowError::ShapeMismatch`] を返す。
    pub fn compact(full: ArrayView2<'_, f32>, mask: &RowMask) -> Result<(Self, RowMap), FlowError> {
        if mask.len() != full.nrows() {
            return Err(FlowError::shape("row mask length", full.nrows(), mask.len()));
        }
        let rows: Vec<usize> = mask.valid_indices().collect();
        let data = full.select(Axis(0), &rows);
        let map = RowMap {
            full_len: full.nrows(),
            rows,
        };
        Ok((Self { data }, map))
    }
}

impl From<Array2<f32>> for FeatureMatrix {
    fn from(data: Array2<f32>) -> Self {
        Self::new(data)
    }
}

/// 行ごとの有効フラグ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMask {
    valid: Vec<bool>,
}

impl RowMask {
    #[must_use]
    pub fn from_flags(valid: Vec<bool>) -> Self {
        Self { valid }
    }

    /// 非有限値、または `nodata` と等しい値を一つでも含む行を無効とする。
    #[must_use]
    pub fn from_nodata(full: ArrayView2<'_, f32>, nodata: Option<f32>) -> Self {
        let valid = full
            .axis_iter(Axis(0))
            .map(|row| {
                row.iter()
                    .all(|value| value.is_finite() && nodata.is_none_or(|nd| *value != nd))
            })
            .collect();
        Self { valid }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.valid.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }

    #[must_use]
    pub fn is_valid(&self, index: usize) -> bool {
        self.valid.get(index).copied().unwrap_or(false)
    }

    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|flag| **flag).count()
    }

    pub fn valid_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.valid
            .iter()
            .enumerate()
            .filter_map(|(index, flag)| flag.then_some(index))
    }
}

/// 圧縮後の行番号から元の行番号への対応表。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMap {
    full_len: usize,
    rows: Vec<usize>,
}

impl RowMap {
    #[must_use]
    pub fn full_len(&self) -> usize {
        self.full_len
    }

    #[must_use]
    pub fn compact_len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn full_index(&self, compact_index: usize) -> Option<usize> {
        self.rows.get(compact_index).copied()
    }

    /// 元の行順のシードを圧縮後の行順に射影する。無効行のマーカーは捨てられる。
    ///
    /// # Errors
    /// シード長が元の行数と一致しない場合は [`FlowError::ShapeMismatch`] を返す。
    pub fn gather(&self, full: &LabelVector) -> Result<LabelVector, FlowError> {
        if full.len() != self.full_len {
            return Err(FlowError::shape("full seed length", self.full_len, full.len()));
        }
        Ok(self.rows.iter().map(|&row| full.get(row)).collect())
    }

    /// 圧縮後の結果を元の行順に戻す。無効行は未設定になる。
    ///
    /// # Errors
    /// 結果の長さが圧縮後の行数と一致しない場合は [`FlowError::ShapeMismatch`] を返す。
    pub fn scatter(&self, compact: &LabelVector) -> Result<LabelVector, FlowError> {
        if compact.len() != self.rows.len() {
            return Err(FlowError::shape(
                "compact label length",
                self.rows.len(),
                compact.len(),
            ));
        }
        let mut full = vec![None; self.full_len];
        for (label, &row) in compact.iter().zip(&self.rows) {
            full[row] = label;
        }
        Ok(LabelVector::new(full))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::label::LabelId;

    #[test]
    fn from_rows_rejects_ragged_input() {
        let error = FeatureMatrix::from_rows(vec![vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert!(matches!(error, FlowError::ShapeMismatch { .. }));
    }

    #[test]
    fn from_shape_vec_checks_length() {
        assert!(FeatureMatrix::from_shape_vec(2, 3, vec![0.0; 5]).is_err());
        let matrix = FeatureMatrix::from_shape_vec(2, 3, vec![0.0; 6]).unwrap();
        assert_eq!(matrix.n_points(), 2);
        assert_eq!(matrix.n_features(), 3);
    }

    #[test]
    fn validate_rejects_nan_with_position() {
        let matrix = FeatureMatrix::new(array![[0.0, 1.0], [2.0, f32::NAN]]);
        let error = matrix.validate().unwrap_err();
        assert_eq!(
            error,
            FlowError::invalid("non-finite feature value at row 1, column 1")
        );
    }

    #[test]
    fn validate_rejects_empty_dimensions() {
        assert!(FeatureMatrix::new(Array2::zeros((0, 3))).validate().is_err());
        assert!(FeatureMatrix::new(Array2::zeros((3, 0))).validate().is_err());
    }

    #[test]
    fn nodata_mask_drops_invalid_rows() {
        let full = array![[1.0, 2.0], [-9999.0, 2.0], [f32::NAN, 0.0], [3.0, 4.0]];
        let mask = RowMask::from_nodata(full.view(), Some(-9999.0));
        assert_eq!(mask.valid_count(), 2);
        assert!(mask.is_valid(0));
        assert!(!mask.is_valid(1));
        assert!(!mask.is_valid(2));
        assert!(!mask.is_valid(99));
    }

    #[test]
    fn compact_gather_scatter_follow_row_map() {
        let full = array![[1.0], [f32::NAN], [3.0]];
        let mask = RowMask::from_nodata(full.view(), None);
        let (compact, map) = FeatureMatrix::compact(full.view(), &mask).unwrap();
        assert_eq!(compact.n_points(), 2);
        assert_eq!(map.full_index(1), Some(2));

        let full_seed = LabelVector::from_sparse(3, &[(1, LabelId(9)), (2, LabelId(4))]).unwrap();
        let seed = map.gather(&full_seed).unwrap();
        assert_eq!(seed.as_slice(), &[None, Some(LabelId(4))]);

        let dense = LabelVector::new(vec![Some(LabelId(4)), Some(LabelId(4))]);
        let back = map.scatter(&dense).unwrap();
        assert_eq!(back.as_slice(), &[Some(LabelId(4)), None, Some(LabelId(4))]);
    }

    #[test]
    fn compact_rejects_mask_of_wrong_length() {
        let full = array![[1.0], [2.0]];
        let mask = RowMask::from_flags(vec![true]);
        assert!(FeatureMatrix::compact(full.view(), &mask).is_err());
    }
}
