//! ランダム射影木による空間分割。
//! 葉に入った点同士を近傍候補の初期値として使う。

use ndarray::{Array1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::derive_seed;

/// 分割平面を選ぶ際に、重複点でない2点を探す試行回数。
const SPLIT_ATTEMPTS: usize = 8;

/// `n_trees` 本の木を並列に構築し、全ての葉を返す。
/// 木ごとに `seed` から導出した乱数列を使うので、スレッド数に依らず結果は同じ。
pub(crate) fn build_leaves(
    data: ArrayView2<'_, f32>,
    n_trees: usize,
    leaf_size: usize,
    seed: u64,
) -> Vec<Vec<usize>> {
    (0..n_trees)
        .into_par_iter()
        .map(|tree| {
            let mut rng = StdRng::seed_from_u64(derive_seed(seed, tree as u64));
            build_tree(data, leaf_size, &mut rng)
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect()
}

fn build_tree(data: ArrayView2<'_, f32>, leaf_size: usize, rng: &mut StdRng) -> Vec<Vec<usize>> {
    let leaf_size = leaf_size.max(1);
    let mut leaves = Vec::new();
    let mut pending = vec![(0..data.nrows()).collect::<Vec<_>>()];

    while let Some(points) = pending.pop() {
        if points.len() <= leaf_size {
            leaves.push(points);
            continue;
        }
        let (left, right) = split(data, points, rng);
        pending.push(right);
        pending.push(left);
    }

    leaves
}

/// 2点から等距離の超平面で点集合を二分する。
/// 片側が空になる退化ケースではランダムに半分ずつへ分ける。
fn split(
    data: ArrayView2<'_, f32>,
    mut points: Vec<usize>,
    rng: &mut StdRng,
) -> (Vec<usize>, Vec<usize>) {
    if let Some((normal, offset)) = hyperplane(data, &points, rng) {
        let mut left = Vec::with_capacity(points.len() / 2 + 1);
        let mut right = Vec::with_capacity(points.len() / 2 + 1);
        for &point in &points {
            let margin = data.row(point).dot(&normal) - offset;
            let goes_left = if margin == 0.0 {
                rng.random::<bool>()
            } else {
                margin > 0.0
            };
            if goes_left {
                left.push(point);
            } else {
                right.push(point);
            }
        }
        if !left.is_empty() && !right.is_empty() {
            return (left, right);
        }
    }

    points.shuffle(rng);
    let right = points.split_off(points.len() / 2);
    (points, right)
}

fn hyperplane(
    data: ArrayView2<'_, f32>,
    points: &[usize],
    rng: &mut StdRng,
) -> Option<(Array1<f32>, f32)> {
    for _ in 0..SPLIT_ATTEMPTS {
        let a = points[rng.random_range(0..points.len())];
        let b = points[rng.random_range(0..points.len())];
        if a == b {
            continue;
        }
        let (row_a, row_b) = (data.row(a), data.row(b));
        let normal = &row_a - &row_b;
        if normal.iter().all(|value| *value == 0.0) {
            continue;
        }
        let midpoint = (&row_a + &row_b) * 0.5;
        let offset = normal.dot(&midpoint);
        return Some((normal, offset));
    }
    None
}
