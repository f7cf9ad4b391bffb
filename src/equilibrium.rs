use crate::error::{EquilibriumError, ModelError};
use crate::history::simulate;
use crate::market::Market;
use crate::model::{BeliefRule, StatHistory};
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// External signal asking the search to stop at the next iteration.
///
/// Clones share the same flag. An optional deadline cancels automatically.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(time_limit: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + time_limit),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// An expired deadline sets the shared flag, so every clone sees it.
    pub fn is_cancelled(&self) -> bool {
        if self.deadline.is_some_and(|dl| Instant::now() >= dl) {
            self.cancel();
        }
        self.flag.load(Ordering::Relaxed)
    }
}

/// Current belief rule and convergence bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquilibriumState {
    pub rule: BeliefRule,
    pub prev_rule: Option<BeliefRule>,
    pub tolerance: f64,
    /// Number of fitted rules so far, across runs.
    pub iteration: usize,
    /// Every fitted rule, in order.
    pub trajectory: Vec<BeliefRule>,
}

impl EquilibriumState {
    pub fn new(initial_rule: BeliefRule, tolerance: f64) -> Self {
        Self {
            rule: initial_rule,
            prev_rule: None,
            tolerance,
            iteration: 0,
            trajectory: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    pub horizon: usize,
    pub initial_stat: f64,
    /// Maximum number of iterations of a single call to [`EquilibriumSolver::solve`].
    pub max_iter: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Converged,
    Cancelled,
}

/// Outcome of a search that did not fail.
#[derive(Debug, Clone)]
pub struct Solution {
    pub rule: BeliefRule,
    pub history: StatHistory,
    pub status: Status,
    pub iterations: usize,
    pub trajectory: Vec<BeliefRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initializing,
    Solving,
    Simulating,
    Fitting,
    Converged,
    DivergedOrMaxIterExceeded,
}

/// Fixed point search over the belief rule.
pub struct EquilibriumSolver {
    settings: SearchSettings,
    state: EquilibriumState,
    cancel: CancelToken,
}

impl EquilibriumSolver {
    pub fn new(settings: SearchSettings, state: EquilibriumState) -> Self {
        Self {
            settings,
            state,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn into_state(self) -> EquilibriumState {
        self.state
    }

    /// Solve agents, simulate and refit until consecutive rules are within tolerance.
    ///
    /// Cancellation is checked before every solve; a cancelled search returns
    /// the last fitted rule.
    pub fn solve<M: Market + ?Sized>(
        &mut self,
        market: &mut M,
        rng: &mut ChaCha12Rng,
    ) -> Result<Solution, EquilibriumError> {
        let mut phase = Phase::Initializing;
        let mut history = StatHistory::default();
        let mut n_iter = 0;

        loop {
            log::debug!("phase {phase:?}");
            phase = match phase {
                Phase::Initializing => {
                    log::info!("searching from rule {}", self.state.rule);
                    Phase::Solving
                }
                Phase::Solving => {
                    if self.cancel.is_cancelled() {
                        log::warn!("search cancelled at rule {}", self.state.rule);
                        return Ok(self.solution(history, Status::Cancelled));
                    }
                    let last_stat = history.last();
                    market
                        .solve_agents(&self.state.rule)
                        .map_err(|source| self.step_error(source, last_stat))?;
                    Phase::Simulating
                }
                Phase::Simulating => {
                    let last_stat = history.last();
                    history = simulate(
                        market,
                        &self.state.rule,
                        self.settings.horizon,
                        self.settings.initial_stat,
                        rng,
                    )
                    .map_err(|source| self.step_error(source, last_stat))?;
                    Phase::Fitting
                }
                Phase::Fitting => {
                    let candidate = market
                        .calc_dynamics(&history)
                        .map_err(|source| self.step_error(source, history.last()))?;
                    let distance = candidate.distance(&self.state.rule);

                    n_iter += 1;
                    self.state.iteration += 1;
                    self.state.trajectory.push(candidate);
                    self.state.prev_rule = Some(self.state.rule);
                    self.state.rule = candidate;
                    log::info!(
                        "iteration {}: rule {candidate}, distance {distance:.6}",
                        self.state.iteration
                    );

                    if distance < self.state.tolerance {
                        Phase::Converged
                    } else if n_iter >= self.settings.max_iter {
                        Phase::DivergedOrMaxIterExceeded
                    } else {
                        Phase::Solving
                    }
                }
                Phase::Converged => {
                    log::info!("converged to rule {}", self.state.rule);
                    return Ok(self.solution(history, Status::Converged));
                }
                Phase::DivergedOrMaxIterExceeded => {
                    return Err(EquilibriumError::ConvergenceFailure {
                        iterations: self.state.iteration,
                        last_rule: self.state.rule,
                        last_stat: history.last(),
                        trajectory: self.state.trajectory.clone(),
                        history,
                    });
                }
            };
        }
    }

    fn solution(&self, history: StatHistory, status: Status) -> Solution {
        Solution {
            rule: self.state.rule,
            history,
            status,
            iterations: self.state.iteration,
            trajectory: self.state.trajectory.clone(),
        }
    }

    fn step_error(&self, source: ModelError, last_stat: Option<f64>) -> EquilibriumError {
        EquilibriumError::Step {
            iteration: self.state.iteration,
            rule: self.state.rule,
            last_stat,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, Config};
    use crate::fit::fit_belief_rule;
    use crate::market::FashionMarket;
    use crate::model::AgentParams;
    use crate::population::{AgentGroup, Population, build_groups};
    use crate::solver::{BackwardInduction, SolverSettings};
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};

    /// Market whose statistic follows `p' = slope * p + intercept + U[-width, width]`
    /// whatever the agents believe.
    struct LinearMarket {
        truth: BeliefRule,
        solved_for: Option<BeliefRule>,
        n_solves: usize,
        cancel_after: Option<(usize, CancelToken)>,
    }

    impl LinearMarket {
        fn new(truth: BeliefRule) -> Self {
            Self {
                truth,
                solved_for: None,
                n_solves: 0,
                cancel_after: None,
            }
        }
    }

    impl Market for LinearMarket {
        fn solve_agents(&mut self, rule: &BeliefRule) -> Result<(), ModelError> {
            self.solved_for = Some(*rule);
            self.n_solves += 1;
            if let Some((n, token)) = &self.cancel_after {
                if self.n_solves >= *n {
                    token.cancel();
                }
            }
            Ok(())
        }

        fn solved_for(&self) -> Option<BeliefRule> {
            self.solved_for
        }

        fn step(&mut self, stat: f64, rng: &mut ChaCha12Rng) -> Result<f64, ModelError> {
            let noise = rng.random_range(-self.truth.width..=self.truth.width);
            Ok((self.truth.slope * stat + self.truth.intercept + noise).clamp(0.0, 1.0))
        }

        fn calc_dynamics(&self, history: &StatHistory) -> Result<BeliefRule, ModelError> {
            fit_belief_rule(history, 100)
        }
    }

    const TRUTH: BeliefRule = BeliefRule {
        slope: 0.5,
        intercept: 0.25,
        width: 0.1,
    };

    fn fitted_width() -> f64 {
        // Root mean square of U[-w, w] is w / sqrt(3).
        2.0 * TRUTH.width / 3f64.sqrt()
    }

    fn settings(horizon: usize, max_iter: usize) -> SearchSettings {
        SearchSettings {
            horizon,
            initial_stat: 0.5,
            max_iter,
        }
    }

    #[test]
    fn fixed_point_is_stable() {
        let fixed = BeliefRule::new(TRUTH.slope, TRUTH.intercept, fitted_width());
        let mut market = LinearMarket::new(TRUTH);
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        let mut solver =
            EquilibriumSolver::new(settings(20_000, 10), EquilibriumState::new(fixed, 0.03));
        let solution = solver.solve(&mut market, &mut rng).unwrap();
        assert_eq!(solution.status, Status::Converged);
        assert!(solution.iterations <= 2);
        assert_abs_diff_eq!(solution.rule.slope, TRUTH.slope, epsilon = 0.03);
        assert_abs_diff_eq!(solution.rule.intercept, TRUTH.intercept, epsilon = 0.03);
        assert_abs_diff_eq!(solution.rule.width, fitted_width(), epsilon = 0.03);
    }

    #[test]
    fn converges_from_a_distant_guess() {
        let mut market = LinearMarket::new(TRUTH);
        let mut rng = ChaCha12Rng::seed_from_u64(2);
        let initial = BeliefRule::new(0.8, 0.1, 0.1);
        let mut solver =
            EquilibriumSolver::new(settings(20_000, 10), EquilibriumState::new(initial, 0.03));
        let solution = solver.solve(&mut market, &mut rng).unwrap();
        assert_eq!(solution.status, Status::Converged);
        assert!(solution.iterations <= 3);
        assert_eq!(solution.trajectory.len(), solution.iterations);
        assert_eq!(market.n_solves, solution.iterations);
        assert_eq!(solution.history.len(), 20_000);
        assert!(solver.into_state().prev_rule.is_some());
    }

    #[test]
    fn longer_horizons_fit_closer_to_the_truth() {
        let fit_error = |horizon: usize| {
            let mut errors = Vec::new();
            for seed in 0..5 {
                let mut market = LinearMarket::new(TRUTH);
                market.solve_agents(&TRUTH).unwrap();
                let mut rng = ChaCha12Rng::seed_from_u64(100 + seed);
                let history = simulate(&mut market, &TRUTH, horizon, 0.5, &mut rng).unwrap();
                let rule = market.calc_dynamics(&history).unwrap();
                errors.push((rule.slope - TRUTH.slope).abs());
            }
            errors.iter().sum::<f64>() / errors.len() as f64
        };
        let short = fit_error(300);
        let long = fit_error(30_000);
        assert!(long < 0.02, "long horizon error {long}");
        assert!(long < short, "long {long} vs short {short}");
    }

    #[test]
    fn exceeding_max_iter_is_convergence_failure() {
        let mut market = LinearMarket::new(TRUTH);
        let mut rng = ChaCha12Rng::seed_from_u64(3);
        let initial = BeliefRule::new(0.8, 0.1, 0.1);
        let mut solver =
            EquilibriumSolver::new(settings(500, 3), EquilibriumState::new(initial, 1e-12));
        match solver.solve(&mut market, &mut rng) {
            Err(EquilibriumError::ConvergenceFailure {
                iterations,
                last_rule,
                last_stat,
                trajectory,
                history,
            }) => {
                assert_eq!(history.len(), 500);
                assert_eq!(iterations, 3);
                assert_eq!(trajectory.len(), 3);
                assert_eq!(trajectory.last(), Some(&last_rule));
                assert!(last_stat.is_some());
            }
            other => panic!("expected convergence failure, got {other:?}"),
        }
        // A second call gets a fresh budget.
        assert!(solver.solve(&mut market, &mut rng).is_err());
        assert_eq!(solver.into_state().iteration, 6);
    }

    #[test]
    fn cancelled_before_start_returns_initial_rule() {
        let mut market = LinearMarket::new(TRUTH);
        let mut rng = ChaCha12Rng::seed_from_u64(4);
        let initial = BeliefRule::new(0.8, 0.1, 0.1);
        let token = CancelToken::new();
        token.cancel();
        let mut solver =
            EquilibriumSolver::new(settings(500, 10), EquilibriumState::new(initial, 0.01))
                .with_cancel(token);
        let solution = solver.solve(&mut market, &mut rng).unwrap();
        assert_eq!(solution.status, Status::Cancelled);
        assert_eq!(solution.rule, initial);
        assert_eq!(solution.iterations, 0);
        assert_eq!(solution.history.len(), 0);
        assert_eq!(market.n_solves, 0);
    }

    #[test]
    fn cancellation_keeps_last_completed_rule() {
        let token = CancelToken::new();
        let mut market = LinearMarket::new(TRUTH);
        market.cancel_after = Some((1, token.clone()));
        let mut rng = ChaCha12Rng::seed_from_u64(5);
        let initial = BeliefRule::new(0.8, 0.1, 0.1);
        let mut solver =
            EquilibriumSolver::new(settings(2_000, 10), EquilibriumState::new(initial, 1e-12))
                .with_cancel(token);
        let solution = solver.solve(&mut market, &mut rng).unwrap();
        assert_eq!(solution.status, Status::Cancelled);
        assert_eq!(solution.iterations, 1);
        assert_eq!(solution.trajectory, vec![solution.rule]);
        assert_eq!(solution.history.len(), 2_000);
    }

    #[test]
    fn expired_deadline_cancels() {
        let token = CancelToken::with_deadline(Duration::ZERO);
        let clone = token.clone();
        assert!(token.is_cancelled());
        assert!(clone.flag.load(Ordering::Relaxed));
        assert!(!CancelToken::new().is_cancelled());
    }

    #[test]
    fn absorbed_market_converges_to_flat_law() {
        let absorbing = BeliefRule::new(0.0, 0.3, 0.0);
        let mut market = LinearMarket::new(absorbing);
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        let initial = BeliefRule::new(0.8, 0.1, 0.1);
        let mut solver =
            EquilibriumSolver::new(settings(400, 10), EquilibriumState::new(initial, 0.01));
        let solution = solver.solve(&mut market, &mut rng).unwrap();
        assert_eq!(solution.status, Status::Converged);
        assert_eq!(solution.iterations, 2);
        assert_eq!(solution.rule.slope, 0.0);
        assert_abs_diff_eq!(solution.rule.intercept, 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(solution.rule.width, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn model_errors_carry_context() {
        let mut market = LinearMarket::new(TRUTH);
        let mut rng = ChaCha12Rng::seed_from_u64(6);
        let initial = BeliefRule::new(0.8, 0.1, 0.1);
        // The fit needs more values than the burn-in.
        let mut solver =
            EquilibriumSolver::new(settings(50, 10), EquilibriumState::new(initial, 0.01));
        match solver.solve(&mut market, &mut rng) {
            Err(EquilibriumError::Step {
                iteration,
                rule,
                last_stat,
                source: ModelError::DegenerateHistory { .. },
            }) => {
                assert_eq!(iteration, 0);
                assert_eq!(rule, initial);
                assert!(last_stat.is_some());
            }
            other => panic!("expected degenerate history, got {other:?}"),
        }
    }

    fn search_fashion_market(groups: &[AgentGroup], seed: u64) -> Solution {
        let mut rng = ChaCha12Rng::seed_from_u64(seed);
        let population = Population::new(groups, 0.5, &mut rng).unwrap();
        let solver = BackwardInduction::new(SolverSettings::default()).unwrap();
        let mut market = FashionMarket::new(population, solver, 100);

        let initial = BeliefRule::new(0.8, 0.1, 0.1);
        let mut eq_solver =
            EquilibriumSolver::new(settings(1000, 50), EquilibriumState::new(initial, 0.01));
        eq_solver.solve(&mut market, &mut rng).unwrap()
    }

    #[test]
    fn symmetric_fashion_market_reaches_equilibrium() {
        // Symmetric conformity makes both styles equally attractive, so every
        // agent switches with the same logit probability whatever it believes.
        let agent = AgentConfig {
            params: AgentParams {
                u_param_a: 3.0,
                u_param_b: 3.0,
                ..AgentParams::default()
            },
            n_agents: 20,
        };
        let params = &agent.params;
        let switch = 1.0 / (1.0 + (params.switch_cost_j2p / params.pref_shock_mag).exp());
        let width = 2.0 * (switch * (1.0 - switch) / 20.0).sqrt();
        let groups = build_groups(&agent, &[]);

        for seed in [2024, 1, 2, 3] {
            let solution = search_fashion_market(&groups, seed);
            assert_eq!(solution.status, Status::Converged);
            assert!(solution.iterations <= 50);
            assert_eq!(solution.history.len(), 1000);
            assert_abs_diff_eq!(solution.rule.slope, 1.0 - 2.0 * switch, epsilon = 0.06);
            assert_abs_diff_eq!(solution.rule.intercept, switch, epsilon = 0.04);
            assert_abs_diff_eq!(solution.rule.width, width, epsilon = 0.01);
        }
    }

    #[test]
    fn notebook_market_reaches_equilibrium() {
        let cfg = Config::from_toml(include_str!("../demos/notebook/config.toml")).unwrap();
        let groups = build_groups(&cfg.agent, &cfg.types);
        assert_eq!(groups.len(), 22);
        assert_eq!(groups.iter().map(|grp| grp.n_agents).sum::<usize>(), 440);

        let solution = search_fashion_market(&groups, 2024);
        assert_eq!(solution.status, Status::Converged);
        assert!(solution.rule.slope > 0.8 && solution.rule.slope < 1.0);
        assert!(solution.rule.intercept > 0.0 && solution.rule.intercept < 0.1);
        assert!(solution.rule.width > 0.0 && solution.rule.width < 0.1);
    }
}
