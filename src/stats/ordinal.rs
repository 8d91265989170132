//! Proportional-odds (ordered logit) regression.
//!
//! `P(y <= j | x) = logistic(theta_j - x.beta)`. Cutpoints are kept ordered
//! by fitting `theta_0` directly and every later gap on the log scale, so
//! the parameter vector is `[beta..., theta_0, ln(theta_1 - theta_0), ...]`.
//! The fit is a damped Newton ascent on the exact gradient with a
//! finite-difference Hessian; standard errors come from the inverse of the
//! observed information.

use nalgebra::{DMatrix, DVector};

use super::dist::{normal_sf, Z_975};
use crate::error::{Result, SnapshotError};

const MAX_ITER: usize = 200;
const GRAD_TOL: f64 = 1e-8;
const MIN_PROB: f64 = 1e-300;

#[derive(Debug, Clone)]
pub struct OrdinalFit {
    pub feature_names: Vec<String>,
    pub categories: Vec<i64>,
    pub params: Vec<f64>,
    pub std_errors: Vec<Option<f64>>,
    pub log_likelihood: f64,
    pub null_log_likelihood: f64,
    pub n_obs: usize,
    pub iterations: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamEstimate {
    pub name: String,
    pub is_coefficient: bool,
    pub coef: f64,
    pub std_error: Option<f64>,
    pub ci_low: Option<f64>,
    pub ci_high: Option<f64>,
    pub p_value: Option<f64>,
}

impl OrdinalFit {
    pub fn n_params(&self) -> usize {
        self.params.len()
    }

    pub fn aic(&self) -> f64 {
        -2.0 * self.log_likelihood + 2.0 * self.n_params() as f64
    }

    pub fn bic(&self) -> f64 {
        -2.0 * self.log_likelihood + self.n_params() as f64 * (self.n_obs as f64).ln()
    }

    /// McFadden pseudo R-squared, undefined when the null likelihood is ~0.
    pub fn pseudo_r2(&self) -> Option<f64> {
        if !self.log_likelihood.is_finite()
            || !self.null_log_likelihood.is_finite()
            || self.null_log_likelihood.abs() < 1e-12
        {
            return None;
        }
        Some(1.0 - self.log_likelihood / self.null_log_likelihood)
    }

    /// Parameter names: features first, then cutpoints labelled `lo/hi`.
    pub fn param_names(&self) -> Vec<String> {
        let mut names = self.feature_names.clone();
        names.extend(
            self.categories
                .windows(2)
                .map(|pair| format!("{}/{}", pair[0], pair[1])),
        );
        names
    }

    pub fn estimates(&self) -> Vec<ParamEstimate> {
        let k = self.feature_names.len();
        self.param_names()
            .into_iter()
            .enumerate()
            .map(|(idx, name)| {
                let coef = self.params[idx];
                let se = self.std_errors[idx];
                ParamEstimate {
                    name,
                    is_coefficient: idx < k,
                    coef,
                    std_error: se,
                    ci_low: se.map(|s| coef - Z_975 * s),
                    ci_high: se.map(|s| coef + Z_975 * s),
                    p_value: se.map(|s| 2.0 * normal_sf((coef / s).abs())),
                }
            })
            .collect()
    }

    pub fn cutpoints(&self) -> Vec<f64> {
        cutpoints(&self.params[self.feature_names.len()..])
    }

    /// Category probabilities for each row, in `categories` order.
    pub fn predict_proba(&self, x: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let k = self.feature_names.len();
        let beta = &self.params[..k];
        let thresholds = self.cutpoints();
        x.iter()
            .map(|row| {
                let eta = linear_predictor(row, beta);
                (0..self.categories.len())
                    .map(|j| category_prob(j, &thresholds, eta).0)
                    .collect()
            })
            .collect()
    }

    /// Arg-max category for each row; the lowest category wins ties.
    pub fn predict(&self, x: &[Vec<f64>]) -> Vec<i64> {
        self.predict_proba(x)
            .into_iter()
            .map(|probs| {
                let mut best = 0;
                for (idx, p) in probs.iter().enumerate() {
                    if *p > probs[best] {
                        best = idx;
                    }
                }
                self.categories[best]
            })
            .collect()
    }
}

fn logistic(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn logistic_density(z: f64) -> f64 {
    let f = logistic(z);
    f * (1.0 - f)
}

fn linear_predictor(row: &[f64], beta: &[f64]) -> f64 {
    row.iter().zip(beta).map(|(x, b)| x * b).sum()
}

fn cutpoints(threshold_params: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(threshold_params.len());
    let mut current = 0.0;
    for (idx, value) in threshold_params.iter().enumerate() {
        current = if idx == 0 { *value } else { current + value.exp() };
        out.push(current);
    }
    out
}

/// Probability of category `j` plus the densities at its upper and lower
/// cutpoints (zero at the open ends).
fn category_prob(j: usize, thresholds: &[f64], eta: f64) -> (f64, f64, f64) {
    let (upper_cdf, upper_pdf) = match thresholds.get(j) {
        Some(theta) => (logistic(theta - eta), logistic_density(theta - eta)),
        None => (1.0, 0.0),
    };
    let (lower_cdf, lower_pdf) = if j == 0 {
        (0.0, 0.0)
    } else {
        let theta = thresholds[j - 1];
        (logistic(theta - eta), logistic_density(theta - eta))
    };
    (upper_cdf - lower_cdf, upper_pdf, lower_pdf)
}

struct Problem<'a> {
    x: &'a [Vec<f64>],
    y: Vec<usize>,
    n_features: usize,
    n_categories: usize,
}

impl Problem<'_> {
    fn log_likelihood(&self, params: &[f64]) -> f64 {
        let beta = &params[..self.n_features];
        let thresholds = cutpoints(&params[self.n_features..]);
        self.x
            .iter()
            .zip(&self.y)
            .map(|(row, &j)| {
                let eta = linear_predictor(row, beta);
                category_prob(j, &thresholds, eta).0.max(MIN_PROB).ln()
            })
            .sum()
    }

    fn gradient(&self, params: &[f64]) -> Vec<f64> {
        let k = self.n_features;
        let beta = &params[..k];
        let threshold_params = &params[k..];
        let thresholds = cutpoints(threshold_params);
        let mut grad_beta = vec![0.0; k];
        let mut grad_theta = vec![0.0; self.n_categories - 1];

        for (row, &j) in self.x.iter().zip(&self.y) {
            let eta = linear_predictor(row, beta);
            let (p, upper_pdf, lower_pdf) = category_prob(j, &thresholds, eta);
            let p = p.max(MIN_PROB);
            for (g, x) in grad_beta.iter_mut().zip(row) {
                *g -= x * (upper_pdf - lower_pdf) / p;
            }
            if j < self.n_categories - 1 {
                grad_theta[j] += upper_pdf / p;
            }
            if j > 0 {
                grad_theta[j - 1] -= lower_pdf / p;
            }
        }

        // chain rule: theta_m = c_0 + sum_{l=1..m} exp(c_l)
        let mut grad = grad_beta;
        let mut tail = 0.0;
        let mut grad_c = vec![0.0; grad_theta.len()];
        for l in (0..grad_theta.len()).rev() {
            tail += grad_theta[l];
            grad_c[l] = if l == 0 {
                tail
            } else {
                tail * threshold_params[l].exp()
            };
        }
        grad.extend(grad_c);
        grad
    }

    fn hessian(&self, params: &[f64]) -> DMatrix<f64> {
        let n = params.len();
        let mut h = DMatrix::<f64>::zeros(n, n);
        for i in 0..n {
            let step = 1e-5 * params[i].abs().max(1.0);
            let mut forward = params.to_vec();
            let mut backward = params.to_vec();
            forward[i] += step;
            backward[i] -= step;
            let gf = self.gradient(&forward);
            let gb = self.gradient(&backward);
            for r in 0..n {
                h[(r, i)] = (gf[r] - gb[r]) / (2.0 * step);
            }
        }
        (&h + h.transpose()) * 0.5
    }
}

fn max_abs(values: &[f64]) -> f64 {
    values.iter().fold(0.0, |acc, v| acc.max(v.abs()))
}

/// Solve `(info + lambda I) step = grad`, preferring Cholesky.
fn damped_step(info: &DMatrix<f64>, grad: &[f64], lambda: f64) -> Option<DVector<f64>> {
    let n = info.nrows();
    let a = info + DMatrix::<f64>::identity(n, n) * lambda;
    let b = DVector::from_column_slice(grad);
    a.clone()
        .cholesky()
        .map(|chol| chol.solve(&b))
        .or_else(|| a.lu().solve(&b))
}

fn covariance_diag(info: &DMatrix<f64>) -> Vec<Option<f64>> {
    let n = info.nrows();
    let inverse = info
        .clone()
        .cholesky()
        .map(|chol| chol.inverse())
        .or_else(|| info.clone().try_inverse());
    match inverse {
        Some(inv) => (0..n)
            .map(|i| {
                let v = inv[(i, i)];
                (v.is_finite() && v > 0.0).then(|| v.sqrt())
            })
            .collect(),
        None => vec![None; n],
    }
}

/// Fit an ordered logit of `y` on the columns of `x`.
///
/// Requires at least two distinct outcome values; categories are the
/// sorted distinct values of `y`.
pub fn fit_ordered_logit(
    x: &[Vec<f64>],
    y: &[i64],
    feature_names: &[&str],
) -> Result<OrdinalFit> {
    if x.len() != y.len() || x.is_empty() {
        return Err(SnapshotError::StatisticalFit(format!(
            "design has {} rows but outcome has {}",
            x.len(),
            y.len()
        )));
    }
    if x.iter().any(|row| row.len() != feature_names.len()) {
        return Err(SnapshotError::StatisticalFit(
            "design row width does not match feature names".to_string(),
        ));
    }

    let mut categories: Vec<i64> = y.to_vec();
    categories.sort_unstable();
    categories.dedup();
    if categories.len() < 2 {
        return Err(SnapshotError::StatisticalFit(
            "outcome has fewer than 2 distinct classes".to_string(),
        ));
    }

    let y_idx: Vec<usize> = y
        .iter()
        .map(|v| categories.binary_search(v).unwrap_or(0))
        .collect();
    let n = y.len() as f64;
    let mut counts = vec![0usize; categories.len()];
    for &j in &y_idx {
        counts[j] += 1;
    }
    let null_log_likelihood: f64 = counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| c as f64 * (c as f64 / n).ln())
        .sum();

    // start from the null-model cutpoints with zero slopes
    let mut params = vec![0.0; feature_names.len()];
    let mut cumulative = 0usize;
    let mut previous = 0.0;
    for (j, &count) in counts[..counts.len() - 1].iter().enumerate() {
        cumulative += count;
        let share = (cumulative as f64 / n).clamp(1e-6, 1.0 - 1e-6);
        let theta = (share / (1.0 - share)).ln();
        if j == 0 {
            params.push(theta);
        } else {
            params.push((theta - previous).max(1e-6).ln());
        }
        previous = theta;
    }

    let problem = Problem {
        x,
        y: y_idx,
        n_features: feature_names.len(),
        n_categories: categories.len(),
    };

    let mut ll = problem.log_likelihood(&params);
    let mut iterations = 0;
    let mut converged = false;
    while iterations < MAX_ITER {
        iterations += 1;
        let grad = problem.gradient(&params);
        if max_abs(&grad) < GRAD_TOL {
            converged = true;
            break;
        }
        let info = -problem.hessian(&params);

        let mut lambda = 0.0;
        let mut accepted = None;
        while lambda < 1e12 {
            if let Some(step) = damped_step(&info, &grad, lambda) {
                let mut scale = 1.0;
                for _ in 0..30 {
                    let candidate: Vec<f64> = params
                        .iter()
                        .zip(step.iter())
                        .map(|(p, s)| p + scale * s)
                        .collect();
                    let candidate_ll = problem.log_likelihood(&candidate);
                    if candidate_ll.is_finite() && candidate_ll >= ll {
                        accepted = Some((candidate, candidate_ll));
                        break;
                    }
                    scale *= 0.5;
                }
            }
            if accepted.is_some() {
                break;
            }
            lambda = if lambda == 0.0 { 1e-4 } else { lambda * 10.0 };
        }

        let Some((candidate, candidate_ll)) = accepted else {
            break;
        };
        let improvement = candidate_ll - ll;
        params = candidate;
        ll = candidate_ll;
        if improvement.abs() < 1e-12 * (1.0 + ll.abs()) {
            converged = max_abs(&problem.gradient(&params)) < 1e-4;
            break;
        }
    }

    if !converged || params.iter().any(|p| !p.is_finite()) {
        return Err(SnapshotError::StatisticalFit(format!(
            "ordered logit did not converge after {iterations} iterations"
        )));
    }

    let info = -problem.hessian(&params);
    let std_errors = covariance_diag(&info);

    Ok(OrdinalFit {
        feature_names: feature_names.iter().map(|s| s.to_string()).collect(),
        categories,
        params,
        std_errors,
        log_likelihood: ll,
        null_log_likelihood,
        n_obs: y.len(),
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Vec<Vec<f64>>, Vec<i64>) {
        let x: Vec<Vec<f64>> = vec![
            vec![-1.5], vec![-1.2], vec![-0.9], vec![-0.7], vec![-0.4],
            vec![-0.2], vec![0.0], vec![0.1], vec![0.3], vec![0.5],
            vec![0.6], vec![0.8], vec![1.0], vec![1.3], vec![1.6],
        ];
        let y = vec![0, 0, 1, 0, 1, 0, 1, 2, 1, 2, 1, 2, 2, 1, 2];
        (x, y)
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let (x, y) = sample();
        let problem = Problem {
            x: &x,
            y: y.iter().map(|v| *v as usize).collect(),
            n_features: 1,
            n_categories: 3,
        };
        let params = vec![0.7, -0.3, 0.2];
        let grad = problem.gradient(&params);
        for i in 0..params.len() {
            let mut up = params.clone();
            let mut down = params.clone();
            up[i] += 1e-6;
            down[i] -= 1e-6;
            let numeric =
                (problem.log_likelihood(&up) - problem.log_likelihood(&down)) / 2e-6;
            assert!((numeric - grad[i]).abs() < 1e-5, "param {i}");
        }
    }

    #[test]
    fn fit_recovers_positive_slope() {
        let (x, y) = sample();
        let fit = fit_ordered_logit(&x, &y, &["score"]).unwrap();
        assert!(fit.params[0] > 0.0);
        assert!(fit.log_likelihood > fit.null_log_likelihood);
        let r2 = fit.pseudo_r2().unwrap();
        assert!(r2 > 0.0 && r2 < 1.0);

        let cut = fit.cutpoints();
        assert_eq!(cut.len(), 2);
        assert!(cut[0] < cut[1]);

        let names = fit.param_names();
        assert_eq!(names, vec!["score", "0/1", "1/2"]);

        let estimates = fit.estimates();
        assert!(estimates[0].is_coefficient);
        assert!(!estimates[1].is_coefficient);
        assert!(estimates[0].std_error.unwrap() > 0.0);
        assert!(estimates[0].ci_low.unwrap() < estimates[0].coef);
    }

    #[test]
    fn probabilities_sum_to_one_and_predictions_are_categories() {
        let (x, y) = sample();
        let fit = fit_ordered_logit(&x, &y, &["score"]).unwrap();
        for probs in fit.predict_proba(&x) {
            assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }
        let predicted = fit.predict(&[vec![-3.0], vec![3.0]]);
        assert_eq!(predicted, vec![0, 2]);
    }

    #[test]
    fn single_class_is_a_fit_error() {
        let err = fit_ordered_logit(&[vec![1.0], vec![2.0]], &[3, 3], &["x"]).unwrap_err();
        assert!(matches!(err, SnapshotError::StatisticalFit(_)));
    }

    #[test]
    fn null_likelihood_uses_marginal_shares() {
        let (x, y) = sample();
        let fit = fit_ordered_logit(&x, &y, &["score"]).unwrap();
        // 4 zeros, 6 ones, 5 twos out of 15
        let expected = 4.0 * (4.0f64 / 15.0).ln()
            + 6.0 * (6.0f64 / 15.0).ln()
            + 5.0 * (5.0f64 / 15.0).ln();
        assert!((fit.null_log_likelihood - expected).abs() < 1e-12);
    }
}
