use crate::config::{AgentConfig, AgentOverride};
use crate::error::ModelError;
use crate::model::{Agent, AgentParams, BeliefRule, Style};
use crate::solver::PolicySolver;
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::Bernoulli;
use rayon::prelude::*;
use std::sync::Arc;

/// Parameter set shared by a number of identical agents.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentGroup {
    pub params: AgentParams,
    pub n_agents: usize,
}

/// Build independent agent groups from a base configuration and a list of overrides.
///
/// Without overrides the base configuration forms a single group.
pub fn build_groups(base: &AgentConfig, overrides: &[AgentOverride]) -> Vec<AgentGroup> {
    if overrides.is_empty() {
        return vec![AgentGroup {
            params: base.params.clone(),
            n_agents: base.n_agents,
        }];
    }
    overrides
        .iter()
        .map(|ovr| AgentGroup {
            params: ovr.apply(&base.params),
            n_agents: ovr.n_agents.unwrap_or(base.n_agents),
        })
        .collect()
}

/// Fixed-order collection of agents and the parameter groups they come from.
pub struct Population {
    groups: Vec<AgentParams>,
    agt_vec: Vec<Agent>,
    solved_for: Option<BeliefRule>,
}

impl Population {
    /// Create a population whose agents are punks with probability `p_init`.
    pub fn new<R: Rng + ?Sized>(
        groups: &[AgentGroup],
        p_init: f64,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        let dist = Bernoulli::new(p_init)
            .map_err(|err| ModelError::domain(format!("invalid initial proportion: {err}")))?;
        let n_agt: usize = groups.iter().map(|grp| grp.n_agents).sum();
        let styles: Vec<_> = (0..n_agt)
            .map(|_| {
                if dist.sample(rng) {
                    Style::Punk
                } else {
                    Style::Jock
                }
            })
            .collect();
        Self::with_styles(groups, &styles)
    }

    /// Create a population with the given styles, in agent order.
    pub fn with_styles(groups: &[AgentGroup], styles: &[Style]) -> Result<Self, ModelError> {
        let n_agt: usize = groups.iter().map(|grp| grp.n_agents).sum();
        if styles.len() != n_agt {
            return Err(ModelError::domain(format!(
                "expected {n_agt} styles, got {}",
                styles.len()
            )));
        }

        let mut agt_vec = Vec::with_capacity(n_agt);
        for (i_grp, grp) in groups.iter().enumerate() {
            for _ in 0..grp.n_agents {
                let id = agt_vec.len();
                agt_vec.push(Agent::new(id, i_grp, styles[id]));
            }
        }

        Ok(Self {
            groups: groups.iter().map(|grp| grp.params.clone()).collect(),
            agt_vec,
            solved_for: None,
        })
    }

    pub fn len(&self) -> usize {
        self.agt_vec.len()
    }

    pub fn styles(&self) -> Vec<Style> {
        self.agt_vec.iter().map(Agent::style).collect()
    }

    /// Rule the current policies were solved for.
    pub fn solved_for(&self) -> Option<BeliefRule> {
        self.solved_for
    }

    /// Solve every agent's problem under `rule` and replace their policies.
    ///
    /// Agents of a group share parameters, so each group is solved once.
    /// On error no policy is replaced.
    pub fn resolve_all<S: PolicySolver + ?Sized>(
        &mut self,
        solver: &S,
        rule: &BeliefRule,
    ) -> Result<(), ModelError> {
        let policies = self
            .groups
            .par_iter()
            .map(|params| solver.solve(params, rule).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        for agt in &mut self.agt_vec {
            agt.adopt_policy(policies[agt.group()].clone());
        }
        self.solved_for = Some(*rule);
        Ok(())
    }

    /// Let every agent choose its next style given the current punk proportion.
    ///
    /// Each agent draws from its own stream, keyed by a round seed taken from
    /// `rng`, so the outcome does not depend on the number of threads.
    pub fn step(&mut self, stat: f64, rng: &mut ChaCha12Rng) -> Result<Vec<Style>, ModelError> {
        if self.solved_for.is_none() {
            return Err(ModelError::Unsolved);
        }

        let round_seed: u64 = rng.random();
        self.agt_vec
            .par_iter_mut()
            .map(|agt| {
                let mut agt_rng = ChaCha12Rng::seed_from_u64(round_seed);
                agt_rng.set_stream(agt.id() as u64);
                agt.choose(stat, &mut agt_rng)
            })
            .collect()
    }
}
