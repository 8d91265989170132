//! Rank-based group comparisons.

use super::dist::{chi2_sf, normal_sf};
use super::{average_ranks, tie_term};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KruskalWallis {
    pub h: f64,
    pub p_value: f64,
    pub n_total: usize,
    pub group_count: usize,
}

impl KruskalWallis {
    /// Epsilon-squared effect size, `(H - k + 1) / (n - k)`; needs `n > k`.
    pub fn epsilon_squared(&self) -> Option<f64> {
        if self.n_total <= self.group_count {
            return None;
        }
        let value = (self.h - self.group_count as f64 + 1.0)
            / (self.n_total - self.group_count) as f64;
        value.is_finite().then_some(value)
    }
}

/// Kruskal-Wallis H test with tie correction.
///
/// Empty groups are ignored; fewer than two non-empty groups, or every
/// observation tied, leaves the test undefined.
pub fn kruskal_wallis(groups: &[&[f64]]) -> Option<KruskalWallis> {
    let groups: Vec<&[f64]> = groups.iter().copied().filter(|g| !g.is_empty()).collect();
    if groups.len() < 2 {
        return None;
    }

    let pooled: Vec<f64> = groups.iter().flat_map(|g| g.iter().copied()).collect();
    let n = pooled.len() as f64;
    let ranks = average_ranks(&pooled);

    let mut offset = 0;
    let mut rank_term = 0.0;
    for group in &groups {
        let rank_sum: f64 = ranks[offset..offset + group.len()].iter().sum();
        rank_term += rank_sum * rank_sum / group.len() as f64;
        offset += group.len();
    }

    let correction = 1.0 - tie_term(&pooled) / (n * n * n - n);
    if correction <= 0.0 {
        return None;
    }
    let h = (12.0 / (n * (n + 1.0)) * rank_term - 3.0 * (n + 1.0)) / correction;
    let df = groups.len() - 1;

    Some(KruskalWallis {
        h,
        p_value: chi2_sf(h, df as f64),
        n_total: pooled.len(),
        group_count: groups.len(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MannWhitneyMethod {
    Exact,
    Asymptotic,
}

impl MannWhitneyMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Asymptotic => "asymptotic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MannWhitney {
    /// U statistic of the first sample.
    pub u: f64,
    pub p_value: f64,
    pub method: MannWhitneyMethod,
}

/// Exact when either sample has at most 8 observations and there are no
/// ties; otherwise the normal approximation with tie and continuity
/// correction.
pub fn choose_mann_whitney_method(n1: usize, n2: usize, has_ties: bool) -> MannWhitneyMethod {
    if (n1 > 8 && n2 > 8) || has_ties {
        MannWhitneyMethod::Asymptotic
    } else {
        MannWhitneyMethod::Exact
    }
}

/// Two-sided Mann-Whitney U test.
pub fn mann_whitney_u(a: &[f64], b: &[f64]) -> Option<MannWhitney> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let n1 = a.len();
    let n2 = b.len();
    let pooled: Vec<f64> = a.iter().chain(b).copied().collect();
    let ranks = average_ranks(&pooled);
    let r1: f64 = ranks[..n1].iter().sum();
    let u1 = r1 - (n1 * (n1 + 1)) as f64 / 2.0;
    let u2 = (n1 * n2) as f64 - u1;
    let u = u1.max(u2);

    let ties = tie_term(&pooled);
    let method = choose_mann_whitney_method(n1, n2, ties > 0.0);
    let p_value = match method {
        MannWhitneyMethod::Exact => 2.0 * exact_u_sf(u, n1, n2),
        MannWhitneyMethod::Asymptotic => {
            let n = (n1 + n2) as f64;
            let mu = (n1 * n2) as f64 / 2.0;
            let sigma =
                ((n1 * n2) as f64 / 12.0 * ((n + 1.0) - ties / (n * (n - 1.0)))).sqrt();
            if sigma > 0.0 {
                2.0 * normal_sf((u - mu - 0.5) / sigma)
            } else {
                1.0
            }
        }
    };

    Some(MannWhitney {
        u: u1,
        p_value: p_value.min(1.0),
        method,
    })
}

/// P(U >= u) under the null for sample sizes `n1`, `n2` without ties.
fn exact_u_sf(u: f64, n1: usize, n2: usize) -> f64 {
    let counts = u_frequencies(n1, n2);
    let total: f64 = counts.iter().sum();
    let start = u.ceil().max(0.0) as usize;
    let upper: f64 = counts.iter().skip(start).sum();
    upper / total
}

/// Number of orderings producing each U value, via
/// `c(m, n, u) = c(m - 1, n, u - n) + c(m, n - 1, u)`.
fn u_frequencies(n1: usize, n2: usize) -> Vec<f64> {
    let max_u = n1 * n2;
    // table[m][n] holds the distribution for sizes (m, n)
    let mut table: Vec<Vec<Vec<f64>>> = vec![vec![Vec::new(); n2 + 1]; n1 + 1];
    for m in 0..=n1 {
        for n in 0..=n2 {
            let mut dist = vec![0.0; m * n + 1];
            if m == 0 || n == 0 {
                dist[0] = 1.0;
            } else {
                for (u, slot) in dist.iter_mut().enumerate() {
                    let mut count = 0.0;
                    if u >= n {
                        count += table[m - 1][n].get(u - n).copied().unwrap_or(0.0);
                    }
                    count += table[m][n - 1].get(u).copied().unwrap_or(0.0);
                    *slot = count;
                }
            }
            table[m][n] = dist;
        }
    }
    let mut out = std::mem::take(&mut table[n1][n2]);
    out.resize(max_u + 1, 0.0);
    out
}

/// Cliff's delta: `(wins - losses) / (n_a * n_b)` over all cross pairs.
pub fn cliffs_delta(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let mut wins = 0i64;
    let mut losses = 0i64;
    for x in a {
        for y in b {
            if x > y {
                wins += 1;
            } else if x < y {
                losses += 1;
            }
        }
    }
    Some((wins - losses) as f64 / (a.len() * b.len()) as f64)
}

/// Holm step-down adjustment. Missing p-values stay missing but still count
/// toward the family size.
pub fn holm_adjust(p_values: &[Option<f64>]) -> Vec<Option<f64>> {
    let m = p_values.len();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| match (p_values[a], p_values[b]) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });

    let mut adjusted = vec![None; m];
    let mut running = 0.0f64;
    for (rank, &idx) in order.iter().enumerate() {
        let Some(raw) = p_values[idx].filter(|p| p.is_finite()) else {
            continue;
        };
        running = running.max((m - rank) as f64 * raw);
        adjusted[idx] = Some(running.min(1.0));
    }
    adjusted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kruskal_matches_reference() {
        // scipy.stats.kruskal([1,2,3],[4,5,6]) -> H=3.857143, p=0.049535
        let result = kruskal_wallis(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]).unwrap();
        assert!((result.h - 3.857_143).abs() < 1e-6);
        assert!((result.p_value - 0.049_535).abs() < 1e-6);
        assert_eq!(result.group_count, 2);
        let eps = result.epsilon_squared().unwrap();
        assert!((eps - (3.857_143 - 1.0) / 4.0).abs() < 1e-6);
    }

    #[test]
    fn kruskal_needs_two_groups_and_variation() {
        assert!(kruskal_wallis(&[&[1.0, 2.0], &[]]).is_none());
        assert!(kruskal_wallis(&[&[2.0, 2.0], &[2.0]]).is_none());
    }

    #[test]
    fn mann_whitney_exact_small_samples() {
        // scipy.stats.mannwhitneyu([1,2,3],[4,5,6]) -> U=0, p=0.1
        let result = mann_whitney_u(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]).unwrap();
        assert_eq!(result.method, MannWhitneyMethod::Exact);
        assert_eq!(result.u, 0.0);
        assert!((result.p_value - 0.1).abs() < 1e-12);
    }

    #[test]
    fn mann_whitney_with_ties_uses_normal_approximation() {
        // ranks of the first sample: 1.5 + 1.5 + 3.5 + 6 = 12.5
        let result = mann_whitney_u(&[1.0, 1.0, 2.0, 3.0], &[2.0, 3.0, 3.0, 4.0]).unwrap();
        assert_eq!(result.method, MannWhitneyMethod::Asymptotic);
        assert_eq!(result.u, 2.5);
        let n: f64 = 8.0;
        let ties = 6.0 + 6.0 + 24.0;
        let sigma = (16.0 / 12.0 * ((n + 1.0) - ties / (n * (n - 1.0)))).sqrt();
        let expected = 2.0 * normal_sf((13.5 - 8.0 - 0.5) / sigma);
        assert!((result.p_value - expected).abs() < 1e-12);
        assert!(result.p_value > 0.0 && result.p_value < 1.0);
    }

    #[test]
    fn mann_whitney_identical_samples_give_p_one() {
        let result = mann_whitney_u(&[3.0; 10], &[3.0; 10]).unwrap();
        assert_eq!(result.p_value, 1.0);
    }

    #[test]
    fn cliffs_delta_counts_dominance() {
        assert_eq!(cliffs_delta(&[3.0, 4.0], &[1.0, 2.0]), Some(1.0));
        assert_eq!(cliffs_delta(&[1.0, 2.0], &[3.0, 4.0]), Some(-1.0));
        assert_eq!(cliffs_delta(&[1.0, 3.0], &[2.0, 2.0]), Some(0.0));
        assert_eq!(cliffs_delta(&[], &[1.0]), None);
    }

    #[test]
    fn holm_is_monotone_and_bounded() {
        let raw = [Some(0.01), Some(0.04), Some(0.03), Some(0.5)];
        let adjusted = holm_adjust(&raw);
        assert!((adjusted[0].unwrap() - 0.04).abs() < 1e-12);
        assert!((adjusted[2].unwrap() - 0.09).abs() < 1e-12);
        assert!((adjusted[1].unwrap() - 0.09).abs() < 1e-12);
        assert_eq!(adjusted[3], Some(0.5));

        let mut pairs: Vec<(f64, f64)> = raw
            .iter()
            .zip(&adjusted)
            .map(|(r, a)| (r.unwrap(), a.unwrap()))
            .collect();
        pairs.sort_by(|x, y| x.0.total_cmp(&y.0));
        for window in pairs.windows(2) {
            assert!(window[1].1 >= window[0].1);
        }
        for (r, a) in pairs {
            assert!(a >= r && a <= 1.0);
        }
    }

    #[test]
    fn holm_caps_at_one_and_skips_missing() {
        let adjusted = holm_adjust(&[Some(0.6), None, Some(0.7)]);
        assert_eq!(adjusted, vec![Some(1.0), None, Some(1.0)]);
    }
}
