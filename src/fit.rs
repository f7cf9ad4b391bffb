use crate::error::ModelError;
use crate::model::{BeliefRule, StatHistory};

/// Fit a belief rule to a statistic history.
///
/// Drops the first `burn_in` values, regresses each value on its predecessor
/// by ordinary least squares, and takes twice the root mean squared
/// prediction error as the noise width. A history whose regressor does not
/// vary is fitted by the flat law `p' = mean(p')`.
pub fn fit_belief_rule(history: &StatHistory, burn_in: usize) -> Result<BeliefRule, ModelError> {
    let vals = history.values().get(burn_in..).unwrap_or_default();
    let len = vals.len();
    if len < 3 {
        return Err(ModelError::DegenerateHistory {
            len,
            reason: "at least three values are needed".to_string(),
        });
    }

    let x = &vals[..len - 1];
    let y = &vals[1..];
    let n = x.len() as f64;
    let x_mean = x.iter().sum::<f64>() / n;
    let y_mean = y.iter().sum::<f64>() / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (&xi, &yi) in x.iter().zip(y) {
        sxx += (xi - x_mean).powi(2);
        sxy += (xi - x_mean) * (yi - y_mean);
    }

    // Absorbed population: every choice repeats, so no slope is identified.
    let slope = if sxx <= f64::EPSILON * n { 0.0 } else { sxy / sxx };
    let intercept = y_mean - slope * x_mean;
    let mse = x
        .iter()
        .zip(y)
        .map(|(&xi, &yi)| (yi - (intercept + slope * xi)).powi(2))
        .sum::<f64>()
        / n;

    Ok(BeliefRule::new(slope, intercept, 2.0 * mse.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn recovers_exact_linear_dynamics() {
        let mut vals = vec![0.9];
        for _ in 0..50 {
            let last = *vals.last().unwrap();
            vals.push(0.5 * last + 0.25);
        }
        // Keep the sequence away from its fixed point so it has variance.
        vals.truncate(12);
        let rule = fit_belief_rule(&StatHistory::from(vals), 0).unwrap();
        assert_relative_eq!(rule.slope, 0.5, epsilon = 1e-9);
        assert_relative_eq!(rule.intercept, 0.25, epsilon = 1e-9);
        assert_relative_eq!(rule.width, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn width_is_twice_rms_error() {
        // Alternating residuals of +-0.1 around p' = p.
        let vals = vec![0.5, 0.6, 0.5, 0.6, 0.5, 0.6, 0.5];
        let rule = fit_belief_rule(&StatHistory::from(vals), 0).unwrap();
        // Best fit is p' = -p + 1.1 with zero residuals.
        assert_relative_eq!(rule.slope, -1.0, epsilon = 1e-9);
        assert_relative_eq!(rule.intercept, 1.1, epsilon = 1e-9);
        assert_relative_eq!(rule.width, 0.0, epsilon = 1e-9);

        let vals = vec![0.2, 0.4, 0.4, 0.2, 0.2, 0.4, 0.4, 0.2, 0.2];
        let rule = fit_belief_rule(&StatHistory::from(vals), 0).unwrap();
        // Pairs (x, y): 4 with y = x and 4 with y = 0.6 - x.
        assert_relative_eq!(rule.slope, 0.0, epsilon = 1e-9);
        assert_relative_eq!(rule.intercept, 0.3, epsilon = 1e-9);
        assert_relative_eq!(rule.width, 0.2, epsilon = 1e-9);
    }

    #[test]
    fn burn_in_is_skipped() {
        let mut vals = vec![0.0, 1.0, 0.0, 1.0];
        vals.extend([0.9, 0.7, 0.6, 0.55, 0.525]);
        let rule = fit_belief_rule(&StatHistory::from(vals), 4).unwrap();
        assert_relative_eq!(rule.slope, 0.5, epsilon = 1e-9);
        assert_relative_eq!(rule.intercept, 0.25, epsilon = 1e-9);
    }

    #[test]
    fn short_histories_are_degenerate() {
        let short = StatHistory::from(vec![0.1, 0.2, 0.3]);
        assert!(matches!(
            fit_belief_rule(&short, 1),
            Err(ModelError::DegenerateHistory { len: 2, .. })
        ));
        assert!(matches!(
            fit_belief_rule(&short, 10),
            Err(ModelError::DegenerateHistory { len: 0, .. })
        ));
    }

    #[test]
    fn constant_history_is_a_flat_law() {
        let constant = StatHistory::from(vec![1.0; 200]);
        let rule = fit_belief_rule(&constant, 100).unwrap();
        assert_eq!(rule, BeliefRule::new(0.0, 1.0, 0.0));

        // Only the last value moves: the regressor is still constant.
        let mut vals = vec![0.4; 20];
        vals.push(0.6);
        let rule = fit_belief_rule(&StatHistory::from(vals), 0).unwrap();
        assert_eq!(rule.slope, 0.0);
        assert_relative_eq!(rule.intercept, 0.41, epsilon = 1e-12);
        assert!(rule.width > 0.0);
    }
}
