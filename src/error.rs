use crate::model::{BeliefRule, StatHistory};
use thiserror::Error;

/// Errors raised by the model layer (solver, population, market, fitting).
#[derive(Debug, Error)]
pub enum ModelError {
    /// Policy computation was given inputs outside its domain.
    #[error("domain error: {0}")]
    Domain(String),

    #[error("population is empty")]
    EmptyPopulation,

    #[error("agents have not been solved for any rule")]
    Unsolved,

    /// An agent was asked to act on a policy solved for a different rule.
    #[error("policies were solved for {solved_for:?}, not for {rule}")]
    StalePolicy {
        rule: BeliefRule,
        solved_for: Option<BeliefRule>,
    },

    /// The history cannot identify a law of motion.
    #[error("degenerate history ({len} values after burn-in): {reason}")]
    DegenerateHistory { len: usize, reason: String },
}

impl ModelError {
    pub fn domain(msg: impl Into<String>) -> Self {
        Self::Domain(msg.into())
    }
}

/// Errors raised by the equilibrium search.
///
/// Every variant carries the iteration, the last belief rule and the last
/// statistic so a caller can diagnose or resume the search.
#[derive(Debug, Error)]
pub enum EquilibriumError {
    #[error("iteration {iteration} failed under rule {rule} (last statistic {last_stat:?})")]
    Step {
        iteration: usize,
        rule: BeliefRule,
        last_stat: Option<f64>,
        #[source]
        source: ModelError,
    },

    #[error(
        "no convergence after {iterations} iterations (last rule {last_rule}, last statistic {last_stat:?})"
    )]
    ConvergenceFailure {
        iterations: usize,
        last_rule: BeliefRule,
        last_stat: Option<f64>,
        trajectory: Vec<BeliefRule>,
        history: StatHistory,
    },
}
