//! Numeric building blocks for the snapshot pipeline.
//!
//! Missing values are represented as `Option<f64>` at the edges; helpers in
//! this module operate on already-filtered finite slices and return `None`
//! where a statistic is undefined.

pub mod crossval;
pub mod dist;
pub mod nonparametric;
pub mod ordinal;

/// Finite values from an iterator of optional numbers.
pub fn finite<I>(values: I) -> Vec<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    values
        .into_iter()
        .flatten()
        .filter(|v| v.is_finite())
        .collect()
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample variance (ddof = 1). Zero for a single value, `None` for none.
pub fn sample_variance(values: &[f64]) -> Option<f64> {
    match values.len() {
        0 => None,
        1 => Some(0.0),
        n => {
            let m = mean(values)?;
            let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
            Some(ss / (n as f64 - 1.0))
        }
    }
}

/// Sample standard deviation with the same edge cases as [`sample_variance`].
pub fn sample_sd(values: &[f64]) -> Option<f64> {
    sample_variance(values).map(f64::sqrt)
}

pub fn min(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::min)
}

pub fn max(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

/// Linear-interpolation quantile over sorted positions (numpy default).
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub fn median(values: &[f64]) -> Option<f64> {
    quantile(values, 0.5)
}

pub fn iqr(values: &[f64]) -> Option<f64> {
    Some(quantile(values, 0.75)? - quantile(values, 0.25)?)
}

/// 1-based ranks with ties sharing the average of the positions they span.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // positions start..end hold rank start+1 ..= end
        let shared = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = shared;
        }
        start = end;
    }
    ranks
}

/// Sum of `t^3 - t` over every group of tied values.
pub fn tie_term(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mut total = 0.0;
    let mut start = 0;
    while start < sorted.len() {
        let mut end = start + 1;
        while end < sorted.len() && sorted[end] == sorted[start] {
            end += 1;
        }
        let t = (end - start) as f64;
        total += t * t * t - t;
        start = end;
    }
    total
}

pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let mx = mean(x)?;
    let my = mean(y)?;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx) * (a - mx);
        syy += (b - my) * (b - my);
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return None;
    }
    Some(sxy / (sxx * syy).sqrt())
}

/// Spearman rank correlation; `None` when either side is constant.
pub fn spearman(x: &[f64], y: &[f64]) -> Option<f64> {
    pearson(&average_ranks(x), &average_ranks(y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sd_edge_cases() {
        assert_eq!(sample_sd(&[]), None);
        assert_eq!(sample_sd(&[4.2]), Some(0.0));
        let sd = sample_sd(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!((sd - 1.290994).abs() < 1e-6);
    }

    #[test]
    fn ranks_average_ties() {
        let ranks = average_ranks(&[10.0, 20.0, 10.0, 30.0]);
        assert_eq!(ranks, vec![1.5, 3.0, 1.5, 4.0]);
    }

    #[test]
    fn quantiles_interpolate_linearly() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert!((quantile(&values, 0.25).unwrap() - 1.75).abs() < 1e-12);
        assert!((median(&values).unwrap() - 2.5).abs() < 1e-12);
        assert!((iqr(&values).unwrap() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn tie_term_counts_groups() {
        // one pair and one triple: (8-2) + (27-3)
        assert_eq!(tie_term(&[1.0, 1.0, 2.0, 3.0, 3.0, 3.0]), 30.0);
    }

    #[test]
    fn spearman_is_undefined_for_constant_input() {
        assert_eq!(spearman(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]), None);
        let rho = spearman(&[1.0, 2.0, 3.0], &[10.0, 20.0, 30.0]).unwrap();
        assert!((rho - 1.0).abs() < 1e-12);
    }
}
