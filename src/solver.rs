use crate::error::ModelError;
use crate::interp::{LinearInterp, linspace};
use crate::model::{AgentParams, BeliefRule, Style};
use serde::{Deserialize, Serialize};

/// Individual decision rule derived from a belief rule.
///
/// Holds the switch probability function of each previous style over the
/// grid of punk proportions.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    switch_jock: LinearInterp,
    switch_punk: LinearInterp,
}

impl Policy {
    /// Probability of switching away from `prev` when the punk proportion is `p`.
    pub fn switch_prob(&self, prev: Style, p: f64) -> f64 {
        let prob = match prev {
            Style::Jock => self.switch_jock.eval(p),
            Style::Punk => self.switch_punk.eval(p),
        };
        prob.clamp(0.0, 1.0)
    }

    /// Probability of dressing as a punk next given `prev` and `p`.
    pub fn prob_punk(&self, prev: Style, p: f64) -> f64 {
        match prev {
            Style::Jock => self.switch_prob(Style::Jock, p),
            Style::Punk => 1.0 - self.switch_prob(Style::Punk, p),
        }
    }
}

/// Anything that can turn structural parameters and a belief rule into a policy.
///
/// Implementations must be deterministic: identical inputs give identical policies.
pub trait PolicySolver: Send + Sync {
    fn solve(&self, params: &AgentParams, rule: &BeliefRule) -> Result<Policy, ModelError>;
}

/// Settings of the backward induction solver.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    /// Number of points in the grid of punk proportions.
    pub p_count: usize,
    /// Number of nodes approximating the belief shock.
    pub p_next_count: usize,
    /// Sup-norm tolerance of value function iteration.
    pub vfi_tol: f64,
    /// Maximum number of value function iterations.
    pub max_vfi_iter: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            p_count: 51,
            p_next_count: 10,
            vfi_tol: 1e-8,
            max_vfi_iter: 10_000,
        }
    }
}

/// Infinite horizon solver iterating the one period Bellman step to a fixed point.
pub struct BackwardInduction {
    settings: SolverSettings,
    p_grid: Vec<f64>,
}

impl BackwardInduction {
    pub fn new(settings: SolverSettings) -> Result<Self, ModelError> {
        if settings.p_count < 2 {
            return Err(ModelError::domain("grid needs at least two points"));
        }
        if settings.p_next_count < 1 {
            return Err(ModelError::domain("belief shock needs at least one node"));
        }
        let p_grid = linspace(0.0001, 0.9999, settings.p_count);
        Ok(Self { settings, p_grid })
    }

    /// Next period proportions believed possible at each grid point.
    fn belief_nodes(&self, rule: &BeliefRule) -> Vec<Vec<f64>> {
        let n = self.settings.p_next_count;
        self.p_grid
            .iter()
            .map(|&p| {
                let mean = rule.slope * p + rule.intercept;
                (0..n)
                    .map(|k| mean + rule.width * (2.0 * k as f64 + 1.0 - n as f64) / n as f64)
                    .collect()
            })
            .collect()
    }

    fn interp(&self, vals: Vec<f64>) -> Result<LinearInterp, ModelError> {
        LinearInterp::new(self.p_grid.clone(), vals)
            .ok_or_else(|| ModelError::domain("invalid interpolation grid"))
    }
}

struct StepResult {
    v_jock: Vec<f64>,
    v_punk: Vec<f64>,
    switch_jock: Vec<f64>,
    switch_punk: Vec<f64>,
}

impl PolicySolver for BackwardInduction {
    fn solve(&self, params: &AgentParams, rule: &BeliefRule) -> Result<Policy, ModelError> {
        check_inputs(params, rule)?;

        let conform = ConformUtility::new(params.u_param_a, params.u_param_b)?;
        let u_punk = self
            .p_grid
            .iter()
            .map(|&p| conform.eval(p).map(|u| params.punk_utility + u))
            .collect::<Result<Vec<_>, ModelError>>()?;
        let u_jock = self
            .p_grid
            .iter()
            .map(|&p| conform.eval(1.0 - p).map(|u| params.jock_utility + u))
            .collect::<Result<Vec<_>, ModelError>>()?;
        let nodes = self.belief_nodes(rule);

        let n = self.p_grid.len();
        let mut v_jock = vec![0.0; n];
        let mut v_punk = vec![0.0; n];

        for i_iter in 0..self.settings.max_vfi_iter {
            let v_jock_next = self.interp(v_jock)?;
            let v_punk_next = self.interp(v_punk)?;
            let step = backward_step(params, &u_jock, &u_punk, &nodes, &v_jock_next, &v_punk_next);

            if step.v_jock.iter().chain(&step.v_punk).any(|v| !v.is_finite()) {
                return Err(ModelError::domain(format!(
                    "non-finite value at iteration {i_iter} under rule {rule}"
                )));
            }

            let diff = sup_diff(&step.v_jock, v_jock_next.y_vals())
                .max(sup_diff(&step.v_punk, v_punk_next.y_vals()));
            v_jock = step.v_jock;
            v_punk = step.v_punk;

            if diff < self.settings.vfi_tol {
                log::debug!("value iteration converged after {} steps", i_iter + 1);
                return Ok(Policy {
                    switch_jock: self.interp(step.switch_jock)?,
                    switch_punk: self.interp(step.switch_punk)?,
                });
            }
        }

        Err(ModelError::domain(format!(
            "value iteration did not converge in {} steps under rule {rule}",
            self.settings.max_vfi_iter
        )))
    }
}

fn check_inputs(params: &AgentParams, rule: &BeliefRule) -> Result<(), ModelError> {
    if !rule.is_finite() {
        return Err(ModelError::domain(format!("non-finite belief rule {rule}")));
    }
    if rule.width < 0.0 {
        return Err(ModelError::domain(format!("negative belief width {}", rule.width)));
    }
    if !(params.disc_fac > 0.0 && params.disc_fac < 1.0) {
        return Err(ModelError::domain(format!(
            "discount factor {} outside (0, 1)",
            params.disc_fac
        )));
    }
    if !(params.pref_shock_mag > 0.0) {
        return Err(ModelError::domain(format!(
            "preference shock magnitude {} must be positive",
            params.pref_shock_mag
        )));
    }
    Ok(())
}

fn backward_step(
    params: &AgentParams,
    u_jock: &[f64],
    u_punk: &[f64],
    nodes: &[Vec<f64>],
    v_jock_next: &LinearInterp,
    v_punk_next: &LinearInterp,
) -> StepResult {
    let n = u_jock.len();
    let mut step = StepResult {
        v_jock: Vec::with_capacity(n),
        v_punk: Vec::with_capacity(n),
        switch_jock: Vec::with_capacity(n),
        switch_punk: Vec::with_capacity(n),
    };

    let beta = params.disc_fac;
    let sigma = params.pref_shock_mag;
    for (i_p, p_nodes) in nodes.iter().enumerate() {
        let n_nodes = p_nodes.len() as f64;
        let ev_jock = beta * p_nodes.iter().map(|&p| v_jock_next.eval(p)).sum::<f64>() / n_nodes;
        let ev_punk = beta * p_nodes.iter().map(|&p| v_punk_next.eval(p)).sum::<f64>() / n_nodes;

        let v_j2j = u_jock[i_p] + ev_jock;
        let v_j2p = u_punk[i_p] - params.switch_cost_j2p + ev_punk;
        let v_p2j = u_jock[i_p] - params.switch_cost_p2j + ev_jock;
        let v_p2p = u_punk[i_p] + ev_punk;

        let (v_jock, switch_jock) = log_sum_exp(v_j2p, v_j2j, sigma);
        let (v_punk, switch_punk) = log_sum_exp(v_p2j, v_p2p, sigma);
        step.v_jock.push(v_jock);
        step.v_punk.push(v_punk);
        step.switch_jock.push(switch_jock);
        step.switch_punk.push(switch_punk);
    }
    step
}

/// Expected maximum of two options under extreme value shocks of scale `sigma`,
/// and the probability of choosing the first one.
fn log_sum_exp(first: f64, second: f64, sigma: f64) -> (f64, f64) {
    let best = first.max(second);
    let exp_first = ((first - best) / sigma).exp();
    let exp_second = ((second - best) / sigma).exp();
    let sum = exp_first + exp_second;
    (sigma * sum.ln() + best, exp_first / sum)
}

fn sup_diff(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

/// Conformity utility: the pdf of a beta distribution.
#[derive(Debug, Clone, Copy)]
pub struct ConformUtility {
    a: f64,
    b: f64,
    ln_norm: f64,
}

impl ConformUtility {
    pub fn new(a: f64, b: f64) -> Result<Self, ModelError> {
        if !(a > 0.0 && b > 0.0 && a.is_finite() && b.is_finite()) {
            return Err(ModelError::domain(format!(
                "beta shape parameters must be positive, got ({a}, {b})"
            )));
        }
        let ln_norm = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b);
        Ok(Self { a, b, ln_norm })
    }

    pub fn eval(&self, p: f64) -> Result<f64, ModelError> {
        if !(0.0..=1.0).contains(&p) {
            return Err(ModelError::domain(format!(
                "conformity utility evaluated at {p}, outside [0, 1]"
            )));
        }
        let val = (self.ln_norm + xlny(self.a - 1.0, p) + xlny(self.b - 1.0, 1.0 - p)).exp();
        if !val.is_finite() {
            return Err(ModelError::domain(format!(
                "conformity utility is singular at {p}"
            )));
        }
        Ok(val)
    }
}

/// `x * ln(y)`, taken as zero when `x` is zero.
fn xlny(x: f64, y: f64) -> f64 {
    if x == 0.0 { 0.0 } else { x * y.ln() }
}

/// Natural logarithm of the gamma function (Lanczos approximation, g = 7).
fn ln_gamma(x: f64) -> f64 {
    const G: f64 = 7.0;
    const COEFS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];

    if x < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }

    let x = x - 1.0;
    let mut acc = COEFS[0];
    for (i, &coef) in COEFS.iter().enumerate().skip(1) {
        acc += coef / (x + i as f64);
    }
    let t = x + G + 0.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}
