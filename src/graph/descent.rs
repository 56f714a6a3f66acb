//! NN-descent による近傍リストの反復改良。
//! 「近傍の近傍」から良い候補を見つけてヒープを更新する。

use ndarray::ArrayView2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::derive_seed;
use super::heap::{EMPTY, NeighborHeaps};

/// 二乗ユークリッド距離。有限な f32 同士なら溢れないよう f64 で累積する。
pub(crate) fn squared_distance(data: ArrayView2<'_, f32>, a: usize, b: usize) -> f64 {
    data.row(a)
        .iter()
        .zip(data.row(b).iter())
        .map(|(x, y)| {
            let diff = f64::from(*x) - f64::from(*y);
            diff * diff
        })
        .sum()
}

/// 葉に同居する点の組で各点のヒープを初期化する。
pub(crate) fn seed_from_leaves(
    data: ArrayView2<'_, f32>,
    heaps: &mut NeighborHeaps,
    leaves: &[Vec<usize>],
) {
    let updates: Vec<Vec<(usize, usize, f64)>> = leaves
        .par_iter()
        .map(|leaf| {
            let mut pairs = Vec::with_capacity(leaf.len() * leaf.len().saturating_sub(1) / 2);
            for (offset, &p) in leaf.iter().enumerate() {
                for &q in &leaf[offset + 1..] {
                    pairs.push((p, q, squared_distance(data, p, q)));
                }
            }
            pairs
        })
        .collect();

    for (p, q, distance) in updates.into_iter().flatten() {
        heaps.push(p, q, distance, true);
        heaps.push(q, p, distance, true);
    }
}

/// 空きスロットが残る点をランダムな点で埋め、全ての行を k 件にする。
pub(crate) fn fill_random(data: ArrayView2<'_, f32>, heaps: &mut NeighborHeaps, seed: u64) {
    let n_points = heaps.n_points();
    let k = heaps.k();
    if k == 0 || n_points <= k {
        return;
    }
    let mut rng = StdRng::seed_from_u64(derive_seed(seed, u64::MAX));
    for point in 0..n_points {
        let mut attempts = 0;
        while !heaps.is_full(point) && attempts < 4 * k {
            attempts += 1;
            let candidate = rng.random_range(0..n_points);
            if candidate != point {
                heaps.push(point, candidate, squared_distance(data, point, candidate), true);
            }
        }
        // 乱択で埋まらない場合（k が N-1 に近い）は順に走査する
        if !heaps.is_full(point) {
            for candidate in (0..n_points).filter(|candidate| *candidate != point) {
                heaps.push(point, candidate, squared_distance(data, point, candidate), true);
            }
        }
    }
}

/// 1パス分の候補リスト（新規・既存）。
struct Candidates {
    fresh: Vec<Vec<usize>>,
    stale: Vec<Vec<usize>>,
}

/// 順方向・逆方向の近傍から候補を集め、`max_candidates` 件までランダムに間引く。
/// 新規として選ばれた候補はヒープ側で既存扱いに切り替える。
fn build_candidates(heaps: &mut NeighborHeaps, max_candidates: usize, rng: &mut StdRng) -> Candidates {
    let n_points = heaps.n_points();
    let mut fresh = vec![Vec::new(); n_points];
    let mut stale = vec![Vec::new(); n_points];

    for point in 0..n_points {
        let row = heaps.row_indices(point);
        let flags = heaps.row_fresh(point);
        for (&neighbor, &is_fresh) in row.iter().zip(flags) {
            if neighbor == EMPTY {
                continue;
            }
            if is_fresh {
                fresh[point].push(neighbor);
                fresh[neighbor].push(point);
            } else {
                stale[point].push(neighbor);
                stale[neighbor].push(point);
            }
        }
    }

    for list in fresh.iter_mut().chain(stale.iter_mut()) {
        list.sort_unstable();
        list.dedup();
        if list.len() > max_candidates {
            list.shuffle(rng);
            list.truncate(max_candidates);
            list.sort_unstable();
        }
    }

    for (point, sampled) in fresh.iter().enumerate() {
        let row: Vec<usize> = heaps.row_indices(point).to_vec();
        let flags = heaps.row_fresh_mut(point);
        for (slot, neighbor) in row.iter().enumerate() {
            if flags[slot] && sampled.binary_search(neighbor).is_ok() {
                flags[slot] = false;
            }
        }
    }

    Candidates { fresh, stale }
}

/// NN-descent を1パス実行し、ヒープに採用された更新数を返す。
///
/// 距離計算は点ごとに並列で行い、ヒープへの反映は入力順に逐次行う。
/// 反映順が固定されるため結果は決定的。
pub(crate) fn refine_pass(
    data: ArrayView2<'_, f32>,
    heaps: &mut NeighborHeaps,
    max_candidates: usize,
    seed: u64,
    pass: usize,
) -> usize {
    let mut rng = StdRng::seed_from_u64(derive_seed(seed, 1_000_003 + pass as u64));
    let candidates = build_candidates(heaps, max_candidates, &mut rng);
    let thresholds = heaps.thresholds();

    let updates: Vec<Vec<(usize, usize, f64)>> = (0..heaps.n_points())
        .into_par_iter()
        .map(|point| {
            let fresh = &candidates.fresh[point];
            let stale = &candidates.stale[point];
            let mut local = Vec::new();
            for (offset, &a) in fresh.iter().enumerate() {
                for &b in fresh[offset + 1..].iter().chain(stale.iter()) {
                    if a == b {
                        continue;
                    }
                    let distance = squared_distance(data, a, b);
                    if distance < thresholds[a] || distance < thresholds[b] {
                        local.push((a, b, distance));
                    }
                }
            }
            local
        })
        .collect();

    let mut changed = 0;
    for (a, b, distance) in updates.into_iter().flatten() {
        changed += usize::from(heaps.push(a, b, distance, true));
        changed += usize::from(heaps.push(b, a, distance, true));
    }
    changed
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn squared_distance_is_euclidean_squared() {
        let data = array![[0.0, 0.0], [3.0, 4.0]];
        assert!((squared_distance(data.view(), 0, 1) - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn squared_distance_does_not_overflow_for_large_finite_values() {
        let data = array![[0.0_f32], [3.0e20]];
        let distance = squared_distance(data.view(), 0, 1);
        assert!(distance.is_finite());
        assert!((distance.sqrt() - 3.0e20).abs() / 3.0e20 < 1e-6);
    }

    #[test]
    fn fill_random_completes_rows_of_far_apart_points() {
        let data = array![[0.0_f32], [1.0e20], [2.0e20], [3.0e20]];
        let mut heaps = NeighborHeaps::new(4, 2);
        fill_random(data.view(), &mut heaps, 3);
        for point in 0..4 {
            assert!(heaps.is_full(point));
            assert!(heaps.threshold(point).is_finite());
        }
    }

    #[test]
    fn fill_random_completes_every_row_without_self() {
        let data = array![[0.0], [1.0], [2.0], [3.0]];
        let mut heaps = NeighborHeaps::new(4, 3);
        fill_random(data.view(), &mut heaps, 5);
        for point in 0..4 {
            assert!(heaps.is_full(point));
            assert!(!heaps.row_indices(point).contains(&point));
        }
    }

    #[test]
    fn refine_pass_improves_random_lists_on_a_line() {
        let data = ndarray::Array2::from_shape_fn((40, 1), |(i, _)| i as f32);
        let mut heaps = NeighborHeaps::new(40, 4);
        fill_random(data.view(), &mut heaps, 11);
        let before: f64 = heaps.thresholds().iter().sum();
        for pass in 0..20 {
            if refine_pass(data.view(), &mut heaps, 20, 11, pass) == 0 {
                break;
            }
        }
        let after: f64 = heaps.thresholds().iter().sum();
        assert!(after <= before);

        let (indices, _) = heaps.into_sorted();
        let hits = (1..39)
            .filter(|&point| {
                let row = indices.row(point);
                row.iter().any(|&j| j == point - 1) && row.iter().any(|&j| j == point + 1)
            })
            .count();
        assert!(hits >= 30, "only {hits} of 38 interior points converged");
    }
}
