//! ラベルIDとラベルベクトル。
//! 未設定は数値の番兵ではなく `None` で表す。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::FlowError;

/// クラスラベルのID。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelId(pub u32);

impl From<u32> for LabelId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for LabelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 点ごとのラベル。シード（疎）と拡散結果（密）の両方に使う。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelVector {
    labels: Vec<Option<LabelId>>,
}

impl LabelVector {
    #[must_use]
    pub fn new(labels: Vec<Option<LabelId>>) -> Self {
        Self { labels }
    }

    /// 全点が未設定のベクトルを作成する。
    #[must_use]
    pub fn unset(len: usize) -> Self {
        Self {
            labels: vec![None; len],
        }
    }

    /// `(行インデックス, ラベル)` の組からシードを作成する。
    /// 同じインデックスが複数回現れた場合は後勝ち。
    ///
    /// # Errors
    /// インデックスが `len` 以上の場合は [`FlowError::ShapeMismatch`] を返す。
    pub fn from_sparse(len: usize, markers: &[(usize, LabelId)]) -> Result<Self, FlowError> {
        let mut labels = vec![None; len];
        for &(index, label) in markers {
            let slot = labels
                .get_mut(index)
                .ok_or_else(|| {
                    FlowError::shape("marker index bound", len, index.saturating_add(1))
                })?;
            *slot = Some(label);
        }
        Ok(Self { labels })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<LabelId> {
        self.labels.get(index).copied().flatten()
    }

    /// ラベルが設定されている点の数。
    #[must_use]
    pub fn labeled_count(&self) -> usize {
        self.labels.iter().filter(|label| label.is_some()).count()
    }

    #[must_use]
    pub fn has_labels(&self) -> bool {
        self.labels.iter().any(Option::is_some)
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<LabelId>> + '_ {
        self.labels.iter().copied()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Option<LabelId>] {
        &self.labels
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<Option<LabelId>> {
        self.labels
    }

    /// ラベルごとの点数。
    #[must_use]
    pub fn counts(&self) -> BTreeMap<LabelId, usize> {
        let mut counts = BTreeMap::new();
        for label in self.labels.iter().flatten() {
            *counts.entry(*label).or_default() += 1;
        }
        counts
    }
}

impl From<Vec<Option<LabelId>>> for LabelVector {
    fn from(labels: Vec<Option<LabelId>>) -> Self {
        Self::new(labels)
    }
}

impl FromIterator<Option<LabelId>> for LabelVector {
    fn from_iter<I: IntoIterator<Item = Option<LabelId>>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
