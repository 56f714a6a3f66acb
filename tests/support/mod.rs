#![allow(dead_code)]

use activation_flow::FeatureMatrix;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// 中心が `spacing` ずつ離れた一辺1の立方体に一様分布する点群。
/// 戻り値は (特徴行列, 各点の所属ブロブ)。
pub fn blobs(n_blobs: usize, per_blob: usize, dims: usize, spacing: f32, seed: u64) -> (FeatureMatrix, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let n_points = n_blobs * per_blob;
    let mut data = Array2::<f32>::zeros((n_points, dims));
    let mut membership = Vec::with_capacity(n_points);
    for row in 0..n_points {
        let blob = row / per_blob;
        membership.push(blob);
        for col in 0..dims {
            let center = if col == 0 { blob as f32 * spacing } else { 0.0 };
            data[[row, col]] = center + rng.random::<f32>() - 0.5;
        }
    }
    (FeatureMatrix::new(data), membership)
}

/// ブロブ `blob` の中心に最も近い点。
pub fn most_central(features: &FeatureMatrix, membership: &[usize], blob: usize, spacing: f32) -> usize {
    let center_x = blob as f32 * spacing;
    (0..features.n_points())
        .filter(|&row| membership[row] == blob)
        .min_by(|&a, &b| {
            let da = distance_to(features, a, center_x);
            let db = distance_to(features, b, center_x);
            da.total_cmp(&db)
        })
        .expect("blob must have points")
}

fn distance_to(features: &FeatureMatrix, row: usize, center_x: f32) -> f32 {
    features
        .row(row)
        .iter()
        .enumerate()
        .map(|(col, value)| {
            let center = if col == 0 { center_x } else { 0.0 };
            (value - center).powi(2)
        })
        .sum()
}

/// 全点対を走査した厳密な k-NN（自身を除く）。
pub fn exact_neighbors(features: &FeatureMatrix, point: usize, k: usize) -> Vec<usize> {
    let mut others: Vec<(f32, usize)> = (0..features.n_points())
        .filter(|&other| other != point)
        .map(|other| {
            let distance: f32 = features
                .row(point)
                .iter()
                .zip(features.row(other).iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum();
            (distance, other)
        })
        .collect();
    others.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    others.into_iter().take(k).map(|(_, index)| index).collect()
}
