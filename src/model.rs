use crate::error::ModelError;
use crate::solver::Policy;
use rand::Rng;
use rand_distr::{Bernoulli, Distribution};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Binary style choice of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Style {
    Jock,
    Punk,
}

impl Style {
    /// Indicator of the punk style.
    pub fn indicator(self) -> f64 {
        match self {
            Style::Jock => 0.0,
            Style::Punk => 1.0,
        }
    }
}

/// Structural parameters of a fashion victim.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentParams {
    /// Intertemporal discount factor.
    pub disc_fac: f64,
    /// Shape parameters of the beta pdf used as conformity utility.
    pub u_param_a: f64,
    pub u_param_b: f64,
    /// Direct utility of each style.
    pub punk_utility: f64,
    pub jock_utility: f64,
    /// Cost of switching from jock to punk and back.
    pub switch_cost_j2p: f64,
    pub switch_cost_p2j: f64,
    /// Scale of the extreme value preference shocks.
    pub pref_shock_mag: f64,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            disc_fac: 0.95,
            u_param_a: 1.0,
            u_param_b: 5.0,
            punk_utility: 0.0,
            jock_utility: 0.0,
            switch_cost_j2p: 2.0,
            switch_cost_p2j: 2.0,
            pref_shock_mag: 0.5,
        }
    }
}

/// Shared belief about the evolution of the punk proportion:
/// `p' = slope * p + intercept + U[-width, width]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeliefRule {
    pub slope: f64,
    pub intercept: f64,
    pub width: f64,
}

impl BeliefRule {
    pub fn new(slope: f64, intercept: f64, width: f64) -> Self {
        Self {
            slope,
            intercept,
            width,
        }
    }

    /// Sup-norm distance between two rules.
    pub fn distance(&self, other: &BeliefRule) -> f64 {
        [
            (self.slope - other.slope).abs(),
            (self.intercept - other.intercept).abs(),
            (self.width - other.width).abs(),
        ]
        .into_iter()
        .fold(0.0, f64::max)
    }

    pub fn is_finite(&self) -> bool {
        self.slope.is_finite() && self.intercept.is_finite() && self.width.is_finite()
    }
}

impl fmt::Display for BeliefRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(slope {:.6}, intercept {:.6}, width {:.6})",
            self.slope, self.intercept, self.width
        )
    }
}

/// Agent of the population.
#[derive(Debug, Clone)]
pub struct Agent {
    id: usize,
    group: usize,
    style: Style,
    policy: Option<Arc<Policy>>,
}

impl Agent {
    pub fn new(id: usize, group: usize, style: Style) -> Self {
        Self {
            id,
            group,
            style,
            policy: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn group(&self) -> usize {
        self.group
    }

    pub fn style(&self) -> Style {
        self.style
    }

    pub fn adopt_policy(&mut self, policy: Arc<Policy>) {
        self.policy = Some(policy);
    }

    /// Choose the next style given the current punk proportion and store it.
    pub fn choose<R: Rng + ?Sized>(&mut self, stat: f64, rng: &mut R) -> Result<Style, ModelError> {
        let policy = self.policy.as_ref().ok_or(ModelError::Unsolved)?;

        let prob_punk = policy.prob_punk(self.style, stat);
        let dist = Bernoulli::new(prob_punk).map_err(|err| {
            ModelError::domain(format!("invalid punk probability {prob_punk}: {err}"))
        })?;

        self.style = if dist.sample(rng) {
            Style::Punk
        } else {
            Style::Jock
        };
        Ok(self.style)
    }
}

/// Ordered sequence of population statistics produced by a simulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatHistory {
    vals: Vec<f64>,
}

impl StatHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            vals: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, val: f64) {
        self.vals.push(val);
    }

    pub fn values(&self) -> &[f64] {
        &self.vals
    }

    pub fn len(&self) -> usize {
        self.vals.len()
    }

    pub fn last(&self) -> Option<f64> {
        self.vals.last().copied()
    }
}

impl From<Vec<f64>> for StatHistory {
    fn from(vals: Vec<f64>) -> Self {
        Self { vals }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_sup_norm() {
        let a = BeliefRule::new(0.8, 0.1, 0.1);
        let b = BeliefRule::new(0.75, 0.13, 0.1);
        assert!((a.distance(&b) - 0.05).abs() < 1e-12);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn agent_without_policy_cannot_choose() {
        let mut agt = Agent::new(0, 0, Style::Jock);
        let mut rng = rand::rng();
        assert!(matches!(agt.choose(0.5, &mut rng), Err(ModelError::Unsolved)));
        assert_eq!(agt.style(), Style::Jock);
    }
}
