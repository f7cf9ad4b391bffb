use crate::model::{AgentParams, BeliefRule};
use crate::solver::SolverSettings;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Simulation configuration parameters.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base agent parameters.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Agent types derived from the base parameters.
    #[serde(default)]
    pub types: Vec<AgentOverride>,

    /// Initial guess of the belief rule.
    #[serde(default = "default_belief")]
    pub belief: BeliefRule,

    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub solver: SolverSettings,
}

/// Base agent parameters and the number of agents of each type.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    #[serde(flatten)]
    pub params: AgentParams,
    pub n_agents: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            params: AgentParams::default(),
            n_agents: 20,
        }
    }
}

/// Changes applied to the base parameters to make one agent type.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentOverride {
    pub disc_fac: Option<f64>,
    pub u_param_a: Option<f64>,
    pub u_param_b: Option<f64>,
    pub punk_utility: Option<f64>,
    pub jock_utility: Option<f64>,
    pub switch_cost_j2p: Option<f64>,
    pub switch_cost_p2j: Option<f64>,
    pub pref_shock_mag: Option<f64>,
    /// Exchange the two shape parameters of the conformity utility
    /// (applied before the explicit shape overrides).
    pub swap_shape: bool,
    pub n_agents: Option<usize>,
}

impl AgentOverride {
    pub fn apply(&self, base: &AgentParams) -> AgentParams {
        let mut params = base.clone();
        if self.swap_shape {
            std::mem::swap(&mut params.u_param_a, &mut params.u_param_b);
        }
        let fields = [
            (self.disc_fac, &mut params.disc_fac),
            (self.u_param_a, &mut params.u_param_a),
            (self.u_param_b, &mut params.u_param_b),
            (self.punk_utility, &mut params.punk_utility),
            (self.jock_utility, &mut params.jock_utility),
            (self.switch_cost_j2p, &mut params.switch_cost_j2p),
            (self.switch_cost_p2j, &mut params.switch_cost_p2j),
            (self.pref_shock_mag, &mut params.pref_shock_mag),
        ];
        for (ovr, field) in fields {
            if let Some(val) = ovr {
                *field = val;
            }
        }
        params
    }
}

/// Market and equilibrium search parameters.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarketConfig {
    /// Initial punk proportion, also the probability of starting as a punk.
    pub p_init: f64,
    /// Number of periods simulated per iteration.
    pub horizon: usize,
    /// Number of initial periods ignored when fitting the dynamics.
    pub burn_in: usize,
    /// Sup-norm tolerance between consecutive belief rules.
    pub tolerance: f64,
    /// Maximum number of iterations per run.
    pub max_iter: usize,
    /// Random seed (taken from the operating system if absent).
    pub seed: Option<u64>,
    /// Wall time after which the search stops at the next iteration.
    pub time_limit_secs: Option<f64>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            p_init: 0.5,
            horizon: 1000,
            burn_in: 100,
            tolerance: 0.01,
            max_iter: 50,
            seed: None,
            time_limit_secs: None,
        }
    }
}

fn default_belief() -> BeliefRule {
    BeliefRule::new(0.8, 0.1, 0.1)
}

impl Config {
    /// Load a [`Config`] from a file.
    ///
    /// The file must be TOML-encoded and contain a serialized [`Config`].
    /// Performs validation on all parameters before returning.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::from_toml(&contents)
    }

    /// Parse and validate a [`Config`] from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        check_params(&self.agent.params).context("invalid base agent parameters")?;
        check_num(self.agent.n_agents, 1..100_000).context("invalid number of agents")?;

        for (i_type, ovr) in self.types.iter().enumerate() {
            check_params(&ovr.apply(&self.agent.params))
                .with_context(|| format!("invalid parameters of type {i_type}"))?;
            if let Some(n_agents) = ovr.n_agents {
                check_num(n_agents, 1..100_000)
                    .with_context(|| format!("invalid number of agents of type {i_type}"))?;
            }
        }

        let belief = &self.belief;
        check_num(belief.slope, -10.0..=10.0).context("invalid belief slope")?;
        check_num(belief.intercept, -10.0..=10.0).context("invalid belief intercept")?;
        check_num(belief.width, 0.0..=10.0).context("invalid belief width")?;

        let market = &self.market;
        check_num(market.p_init, 0.0..=1.0).context("invalid initial punk proportion")?;
        check_num(market.horizon, 3..100_000_000).context("invalid horizon")?;
        check_num(market.burn_in, 0..market.horizon - 2).context("invalid burn-in")?;
        check_num(market.tolerance, f64::MIN_POSITIVE..1.0).context("invalid tolerance")?;
        check_num(market.max_iter, 1..100_000).context("invalid maximum number of iterations")?;
        if let Some(secs) = market.time_limit_secs {
            check_num(secs, f64::MIN_POSITIVE..1e9).context("invalid time limit")?;
        }

        let solver = &self.solver;
        check_num(solver.p_count, 2..100_000).context("invalid number of grid points")?;
        check_num(solver.p_next_count, 1..10_000).context("invalid number of shock nodes")?;
        check_num(solver.vfi_tol, f64::MIN_POSITIVE..1.0).context("invalid value tolerance")?;
        check_num(solver.max_vfi_iter, 1..10_000_000)
            .context("invalid maximum number of value iterations")?;

        Ok(())
    }
}

fn check_params(params: &AgentParams) -> Result<()> {
    check_num(params.disc_fac, f64::MIN_POSITIVE..1.0).context("invalid discount factor")?;
    check_num(params.u_param_a, f64::MIN_POSITIVE..1e6).context("invalid shape parameter a")?;
    check_num(params.u_param_b, f64::MIN_POSITIVE..1e6).context("invalid shape parameter b")?;
    check_num(params.punk_utility, -1e6..1e6).context("invalid punk utility")?;
    check_num(params.jock_utility, -1e6..1e6).context("invalid jock utility")?;
    check_num(params.switch_cost_j2p, 0.0..1e6).context("invalid jock to punk cost")?;
    check_num(params.switch_cost_p2j, 0.0..1e6).context("invalid punk to jock cost")?;
    check_num(params.pref_shock_mag, f64::MIN_POSITIVE..1e6)
        .context("invalid preference shock magnitude")?;
    Ok(())
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}
