use ndarray::Array2;

/// 空きスロットを示す内部用インデックス。出力グラフには現れない。
pub(crate) const EMPTY: usize = usize::MAX;

/// 点ごとに固定長 k の最大ヒープ（根が最遠の候補）をフラット配列で保持する。
///
/// `fresh` は NN-descent の「新規」フラグで、まだ局所結合に使われていない候補を表す。
#[derive(Debug, Clone)]
pub(crate) struct NeighborHeaps {
    k: usize,
    n_points: usize,
    indices: Vec<usize>,
    distances: Vec<f64>,
    fresh: Vec<bool>,
}

impl NeighborHeaps {
    pub(crate) fn new(n_points: usize, k: usize) -> Self {
        Self {
            k,
            n_points,
            indices: vec![EMPTY; n_points * k],
            distances: vec![f64::INFINITY; n_points * k],
            fresh: vec![false; n_points * k],
        }
    }

    pub(crate) fn k(&self) -> usize {
        self.k
    }

    pub(crate) fn n_points(&self) -> usize {
        self.n_points
    }

    pub(crate) fn row_indices(&self, point: usize) -> &[usize] {
        &self.indices[point * self.k..(point + 1) * self.k]
    }

    pub(crate) fn row_fresh(&self, point: usize) -> &[bool] {
        &self.fresh[point * self.k..(point + 1) * self.k]
    }

    pub(crate) fn row_fresh_mut(&mut self, point: usize) -> &mut [bool] {
        &mut self.fresh[point * self.k..(point + 1) * self.k]
    }

    /// 現在の最遠候補までの距離。これより遠い候補は採用されない。
    pub(crate) fn threshold(&self, point: usize) -> f64 {
        if self.k == 0 {
            return f64::NEG_INFINITY;
        }
        self.distances[point * self.k]
    }

    pub(crate) fn thresholds(&self) -> Vec<f64> {
        (0..self.n_points).map(|point| self.threshold(point)).collect()
    }

    pub(crate) fn is_full(&self, point: usize) -> bool {
        !self.row_indices(point).contains(&EMPTY)
    }

    /// 候補を押し込む。採用された場合は `true`。
    /// 既に含まれている候補と、最遠候補以上の距離の候補は拒否する。
    /// 空きスロットが残っている間は距離に関係なく受け入れる。
    pub(crate) fn push(&mut self, point: usize, candidate: usize, distance: f64, fresh: bool) -> bool {
        let k = self.k;
        if k == 0 {
            return false;
        }
        let base = point * k;
        let dists = &mut self.distances[base..base + k];
        let ids = &mut self.indices[base..base + k];
        if ids[0] != EMPTY && distance >= dists[0] {
            return false;
        }
        if ids.contains(&candidate) {
            return false;
        }
        let flags = &mut self.fresh[base..base + k];

        // 根を置き換えてシフトダウン
        let mut pos = 0;
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut swap = pos;
            let mut largest = (distance, false);
            if left < k && outranks(dists[left], ids[left], largest) {
                swap = left;
                largest = (dists[left], ids[left] == EMPTY);
            }
            if right < k && outranks(dists[right], ids[right], largest) {
                swap = right;
            }
            if swap == pos {
                break;
            }
            dists[pos] = dists[swap];
            ids[pos] = ids[swap];
            flags[pos] = flags[swap];
            pos = swap;
        }
        dists[pos] = distance;
        ids[pos] = candidate;
        flags[pos] = fresh;
        true
    }

    /// 各行を距離の昇順（同距離はインデックス昇順）に並べた行列へ変換する。
    /// 距離は二乗距離として保持しているので、ここで平方根を取る。
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn into_sorted(self) -> (Array2<usize>, Array2<f32>) {
        let k = self.k;
        let mut indices = Array2::from_elem((self.n_points, k), EMPTY);
        let mut distances = Array2::zeros((self.n_points, k));
        let mut row = Vec::with_capacity(k);
        for point in 0..self.n_points {
            row.clear();
            let base = point * k;
            row.extend(
                self.distances[base..base + k]
                    .iter()
                    .copied()
                    .zip(self.indices[base..base + k].iter().copied()),
            );
            row.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            for (slot, (distance, index)) in row.iter().enumerate() {
                indices[[point, slot]] = *index;
                distances[[point, slot]] = distance.sqrt() as f32;
            }
        }
        (indices, distances)
    }
}

/// ヒープ順序: 空きスロットは常に根側、それ以外は距離の大きい方が根側。
fn outranks(distance: f64, index: usize, (largest, largest_empty): (f64, bool)) -> bool {
    if largest_empty {
        return false;
    }
    index == EMPTY || distance > largest
}
