use crate::error::ModelError;
use crate::fit::fit_belief_rule;
use crate::model::{BeliefRule, StatHistory, Style};
use crate::population::Population;
use crate::solver::PolicySolver;
use rand_chacha::ChaCha12Rng;

/// Interaction between a population of agents and the statistic they share.
///
/// One round sows the current statistic to the agents, lets them act,
/// reaps their choices and mills those into the next statistic.
pub trait Market {
    /// Re-derive every agent's policy under `rule`.
    fn solve_agents(&mut self, rule: &BeliefRule) -> Result<(), ModelError>;

    /// Rule the agents' policies were last derived from.
    fn solved_for(&self) -> Option<BeliefRule>;

    /// Run one round and return the next statistic.
    fn step(&mut self, stat: f64, rng: &mut ChaCha12Rng) -> Result<f64, ModelError>;

    /// Fit a law of motion to a statistic history.
    fn calc_dynamics(&self, history: &StatHistory) -> Result<BeliefRule, ModelError>;
}

/// Mill rule: proportion of punks among the choices.
pub fn aggregate(choices: &[Style]) -> Result<f64, ModelError> {
    if choices.is_empty() {
        return Err(ModelError::EmptyPopulation);
    }
    let n_punk: f64 = choices.iter().map(|style| style.indicator()).sum();
    Ok(n_punk / choices.len() as f64)
}

/// Market of fashion victims solved with a shared policy solver.
pub struct FashionMarket<S: PolicySolver> {
    population: Population,
    solver: S,
    burn_in: usize,
}

impl<S: PolicySolver> FashionMarket<S> {
    pub fn new(population: Population, solver: S, burn_in: usize) -> Self {
        Self {
            population,
            solver,
            burn_in,
        }
    }

    pub fn population(&self) -> &Population {
        &self.population
    }
}

impl<S: PolicySolver> Market for FashionMarket<S> {
    fn solve_agents(&mut self, rule: &BeliefRule) -> Result<(), ModelError> {
        self.population.resolve_all(&self.solver, rule)
    }

    fn solved_for(&self) -> Option<BeliefRule> {
        self.population.solved_for()
    }

    fn step(&mut self, stat: f64, rng: &mut ChaCha12Rng) -> Result<f64, ModelError> {
        let choices = self.population.step(stat, rng)?;
        aggregate(&choices)
    }

    fn calc_dynamics(&self, history: &StatHistory) -> Result<BeliefRule, ModelError> {
        fit_belief_rule(history, self.burn_in)
    }
}
