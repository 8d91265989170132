use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// How rows are dealt into cross-validation folds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldStrategy {
    /// Every class is spread evenly across the folds.
    Stratified,
    /// Shuffled contiguous folds, ignoring class labels.
    Plain,
}

impl FoldStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stratified => "stratified",
            Self::Plain => "plain",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Stratify only when there are at least two classes and every class has
/// at least `n_splits` (and at least two) members.
pub fn choose_fold_strategy(labels: &[i64], n_splits: usize) -> FoldStrategy {
    let counts = class_counts(labels);
    let min_count = counts.values().copied().min().unwrap_or(0);
    if counts.len() >= 2 && min_count >= 2 && n_splits <= min_count {
        FoldStrategy::Stratified
    } else {
        FoldStrategy::Plain
    }
}

fn class_counts(labels: &[i64]) -> BTreeMap<i64, usize> {
    let mut counts = BTreeMap::new();
    for label in labels {
        *counts.entry(*label).or_insert(0) += 1;
    }
    counts
}

/// Number of folds actually used: at least 2, at most one per row.
pub fn effective_splits(requested: usize, n_rows: usize) -> usize {
    requested.min(n_rows).max(2)
}

/// Deterministic folds for the chosen strategy and seed.
pub fn make_folds(
    strategy: FoldStrategy,
    labels: &[i64],
    n_splits: usize,
    seed: u64,
) -> Vec<Fold> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = labels.len();
    let mut assignment = vec![0usize; n];

    match strategy {
        FoldStrategy::Plain => {
            let mut order: Vec<usize> = (0..n).collect();
            order.shuffle(&mut rng);
            let base = n / n_splits;
            let extra = n % n_splits;
            let mut cursor = 0;
            for fold in 0..n_splits {
                let size = base + usize::from(fold < extra);
                for &idx in &order[cursor..cursor + size] {
                    assignment[idx] = fold;
                }
                cursor += size;
            }
        }
        FoldStrategy::Stratified => {
            let mut by_class: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
            for (idx, label) in labels.iter().enumerate() {
                by_class.entry(*label).or_default().push(idx);
            }
            // continue dealing where the previous class stopped so fold sizes stay level
            let mut next_fold = 0;
            for members in by_class.values_mut() {
                members.shuffle(&mut rng);
                for &idx in members.iter() {
                    assignment[idx] = next_fold;
                    next_fold = (next_fold + 1) % n_splits;
                }
            }
        }
    }

    (0..n_splits)
        .map(|fold| {
            let (test, train): (Vec<usize>, Vec<usize>) =
                (0..n).partition(|&idx| assignment[idx] == fold);
            Fold { train, test }
        })
        .filter(|fold| !fold.test.is_empty())
        .collect()
}

pub fn mean_absolute_error(actual: &[i64], predicted: &[i64]) -> Option<f64> {
    if actual.is_empty() || actual.len() != predicted.len() {
        return None;
    }
    let total: i64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).abs())
        .sum();
    Some(total as f64 / actual.len() as f64)
}

pub fn within_one_rate(actual: &[i64], predicted: &[i64]) -> Option<f64> {
    if actual.is_empty() || actual.len() != predicted.len() {
        return None;
    }
    let hits = actual
        .iter()
        .zip(predicted)
        .filter(|(a, p)| (*a - *p).abs() <= 1)
        .count();
    Some(hits as f64 / actual.len() as f64)
}

/// Cohen's kappa with quadratic weights over the label indices of the
/// sorted union of observed and predicted labels. `None` when the expected
/// disagreement is zero (e.g. a single label).
pub fn quadratic_weighted_kappa(actual: &[i64], predicted: &[i64]) -> Option<f64> {
    if actual.is_empty() || actual.len() != predicted.len() {
        return None;
    }
    let mut labels: Vec<i64> = actual.iter().chain(predicted).copied().collect();
    labels.sort_unstable();
    labels.dedup();
    let k = labels.len();
    let index = |v: &i64| labels.binary_search(v).unwrap_or(0);

    let mut confusion = vec![vec![0.0; k]; k];
    for (a, p) in actual.iter().zip(predicted) {
        confusion[index(a)][index(p)] += 1.0;
    }
    let total = actual.len() as f64;
    let row_sums: Vec<f64> = confusion.iter().map(|row| row.iter().sum()).collect();
    let col_sums: Vec<f64> = (0..k)
        .map(|j| confusion.iter().map(|row| row[j]).sum())
        .collect();

    let mut observed = 0.0;
    let mut expected = 0.0;
    for i in 0..k {
        for j in 0..k {
            let weight = ((i as f64) - (j as f64)).powi(2);
            observed += weight * confusion[i][j];
            expected += weight * row_sums[i] * col_sums[j] / total;
        }
    }
    if expected == 0.0 {
        return None;
    }
    Some(1.0 - observed / expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stratification_requires_enough_members_per_class() {
        let labels = [0, 0, 0, 1, 1, 1];
        assert_eq!(choose_fold_strategy(&labels, 3), FoldStrategy::Stratified);
        assert_eq!(choose_fold_strategy(&labels, 4), FoldStrategy::Plain);
        assert_eq!(choose_fold_strategy(&[0, 1, 1, 1], 2), FoldStrategy::Plain);
        assert_eq!(choose_fold_strategy(&[2, 2, 2, 2], 2), FoldStrategy::Plain);
    }

    #[test]
    fn plain_folds_partition_rows() {
        let labels = vec![0; 11];
        let folds = make_folds(FoldStrategy::Plain, &labels, 3, 42);
        assert_eq!(folds.len(), 3);
        let mut seen: Vec<usize> = folds.iter().flat_map(|f| f.test.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..11).collect::<Vec<_>>());
        let sizes: Vec<usize> = folds.iter().map(|f| f.test.len()).collect();
        assert_eq!(sizes, vec![4, 4, 3]);
        for fold in &folds {
            assert_eq!(fold.train.len() + fold.test.len(), 11);
        }
    }

    #[test]
    fn stratified_folds_balance_classes() {
        let labels = [0, 0, 0, 1, 1, 1, 2, 2, 2];
        let folds = make_folds(FoldStrategy::Stratified, &labels, 3, 7);
        for fold in &folds {
            let mut classes: Vec<i64> = fold.test.iter().map(|&i| labels[i]).collect();
            classes.sort_unstable();
            assert_eq!(classes, vec![0, 1, 2]);
        }
    }

    #[test]
    fn folds_are_reproducible_for_a_seed() {
        let labels: Vec<i64> = (0..20).map(|i| i % 3).collect();
        let a = make_folds(FoldStrategy::Plain, &labels, 5, 42);
        let b = make_folds(FoldStrategy::Plain, &labels, 5, 42);
        assert_eq!(a, b);
    }

    #[test]
    fn kappa_reference_values() {
        assert_eq!(quadratic_weighted_kappa(&[1, 2, 3], &[1, 2, 3]), Some(1.0));
        // sklearn cohen_kappa_score([0,1,2,3],[0,1,3,2], weights="quadratic") == 0.8
        let kappa = quadratic_weighted_kappa(&[0, 1, 2, 3], &[0, 1, 3, 2]).unwrap();
        assert!((kappa - 0.8).abs() < 1e-12);
        assert_eq!(quadratic_weighted_kappa(&[2, 2], &[2, 2]), None);
    }

    #[test]
    fn error_metrics() {
        assert_eq!(mean_absolute_error(&[1, 2, 5], &[1, 3, 3]), Some(1.0));
        let rate = within_one_rate(&[1, 2, 5], &[1, 3, 3]).unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(effective_splits(5, 3), 3);
        assert_eq!(effective_splits(5, 1), 2);
    }
}
