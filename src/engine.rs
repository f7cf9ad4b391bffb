use crate::config::Config;
use crate::equilibrium::{CancelToken, EquilibriumSolver, EquilibriumState, SearchSettings, Status};
use crate::error::EquilibriumError;
use crate::market::FashionMarket;
use crate::model::{BeliefRule, StatHistory, Style};
use crate::population::{Population, build_groups};
use crate::solver::BackwardInduction;
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
    time::Duration,
};

/// Outcome of one equilibrium search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Converged,
    Cancelled,
    NotConverged,
}

impl From<Status> for RunStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::Converged => RunStatus::Converged,
            Status::Cancelled => RunStatus::Cancelled,
        }
    }
}

/// Result of one equilibrium search, as written to a record file.
#[derive(Debug, Serialize, Deserialize)]
pub struct Record {
    pub status: RunStatus,
    /// Final belief rule.
    pub rule: BeliefRule,
    /// Total number of iterations of the run so far.
    pub iteration: usize,
    /// Every rule fitted during the run so far.
    pub trajectory: Vec<BeliefRule>,
    /// Statistic history of the last iteration.
    pub history: StatHistory,
}

/// Simulation engine.
///
/// Holds the configuration, the equilibrium search state, the agents' styles
/// and the random number generator, and provides methods to initialize,
/// run, save, and load searches.
#[derive(Serialize, Deserialize)]
pub struct Engine {
    cfg: Config,
    state: EquilibriumState,
    styles: Vec<Style>,
    rng: ChaCha12Rng,
}

impl Engine {
    /// Create a new `Engine` with the given configuration and random initial styles.
    pub fn generate_initial_condition(cfg: Config) -> Result<Self> {
        let mut rng = match cfg.market.seed {
            Some(seed) => ChaCha12Rng::seed_from_u64(seed),
            None => ChaCha12Rng::try_from_os_rng()?,
        };

        let groups = build_groups(&cfg.agent, &cfg.types);
        let population = Population::new(&groups, cfg.market.p_init, &mut rng)
            .context("failed to create population")?;
        log::info!(
            "created {} agents in {} groups",
            population.len(),
            groups.len()
        );

        let state = EquilibriumState::new(cfg.belief, cfg.market.tolerance);
        let styles = population.styles();

        Ok(Self {
            cfg,
            state,
            styles,
            rng,
        })
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    pub fn state(&self) -> &EquilibriumState {
        &self.state
    }

    /// Search for the equilibrium and save the resulting record to a binary file.
    ///
    /// A search that runs out of iterations is not an error: its record is
    /// saved and it can be resumed.
    pub fn perform_search<P: AsRef<Path>>(&mut self, file: P) -> Result<RunStatus> {
        let file = file.as_ref();

        let groups = build_groups(&self.cfg.agent, &self.cfg.types);
        let population =
            Population::with_styles(&groups, &self.styles).context("failed to restore population")?;
        let solver =
            BackwardInduction::new(self.cfg.solver.clone()).context("failed to create solver")?;
        let mut market = FashionMarket::new(population, solver, self.cfg.market.burn_in);

        let settings = SearchSettings {
            horizon: self.cfg.market.horizon,
            initial_stat: self.cfg.market.p_init,
            max_iter: self.cfg.market.max_iter,
        };
        let cancel = match self.cfg.market.time_limit_secs {
            Some(secs) => CancelToken::with_deadline(Duration::from_secs_f64(secs)),
            None => CancelToken::new(),
        };
        let mut eq_solver =
            EquilibriumSolver::new(settings, self.state.clone()).with_cancel(cancel);

        let result = eq_solver.solve(&mut market, &mut self.rng);
        self.state = eq_solver.into_state();
        self.styles = market.population().styles();

        let record = match result {
            Ok(solution) => Record {
                status: solution.status.into(),
                rule: solution.rule,
                iteration: solution.iterations,
                trajectory: solution.trajectory,
                history: solution.history,
            },
            Err(EquilibriumError::ConvergenceFailure {
                iterations,
                last_rule,
                trajectory,
                history,
                ..
            }) => {
                log::warn!("no convergence after {iterations} iterations, last rule {last_rule}");
                Record {
                    status: RunStatus::NotConverged,
                    rule: last_rule,
                    iteration: iterations,
                    trajectory,
                    history,
                }
            }
            Err(err) => return Err(err).context("failed to search for equilibrium"),
        };
        let status = record.status;

        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write(&mut writer, &record).context("failed to serialize record")?;
        writer.flush().context("failed to flush writer stream")?;

        log::info!(
            "search finished: {status:?}, rule {}, {} periods in last history",
            record.rule,
            record.history.len()
        );
        Ok(status)
    }

    /// Save a checkpoint of the entire engine state.
    ///
    /// Can be used to resume the search later.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write(&mut writer, &self).context("failed to serialize engine")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }

    /// Load a previously saved engine checkpoint.
    pub fn load_checkpoint<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);
        let engine = decode::from_read(&mut reader).context("failed to deserialize engine")?;
        Ok(engine)
    }
}

/// Read a record written by [`Engine::perform_search`].
pub fn load_record<P: AsRef<Path>>(file: P) -> Result<Record> {
    let file = file.as_ref();
    let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
    let mut reader = BufReader::new(file);
    decode::from_read(&mut reader).context("failed to deserialize record")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> Config {
        Config::from_toml(
            r#"
[agent]
n_agents = 8

[market]
horizon = 150
burn_in = 20
tolerance = 0.5
max_iter = 3
seed = 9

[solver]
p_count = 21
"#,
        )
        .unwrap()
    }

    #[test]
    fn seeded_engines_are_reproducible() {
        let a = Engine::generate_initial_condition(small_config()).unwrap();
        let b = Engine::generate_initial_condition(small_config()).unwrap();
        assert_eq!(a.styles, b.styles);
        assert_eq!(a.state, b.state);
        assert_eq!(a.styles.len(), 8);
    }

    #[test]
    fn frozen_population_is_recorded_as_converged() {
        // Switching is so costly that nobody ever changes style.
        let cfg = Config::from_toml(
            r#"
[agent]
n_agents = 6
switch_cost_j2p = 40.0
switch_cost_p2j = 40.0

[market]
horizon = 120
burn_in = 20
seed = 3

[solver]
p_count = 21
"#,
        )
        .unwrap();
        let dir = std::env::temp_dir().join(format!("fashion-frozen-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut engine = Engine::generate_initial_condition(cfg).unwrap();
        let styles = engine.styles.clone();
        let status = engine.perform_search(dir.join("record.msgpack")).unwrap();
        assert_eq!(status, RunStatus::Converged);
        assert_eq!(engine.styles, styles);

        let record = load_record(dir.join("record.msgpack")).unwrap();
        let share = record.history.values()[0];
        assert!(record.history.values().iter().all(|&p| p == share));
        assert_eq!(record.rule.slope, 0.0);
        assert!(record.rule.width < 1e-12);
        assert_eq!(record.iteration, 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn search_writes_record_and_checkpoint_round_trips() {
        let dir = std::env::temp_dir().join(format!("fashion-engine-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut engine = Engine::generate_initial_condition(small_config()).unwrap();
        let status = engine.perform_search(dir.join("record.msgpack")).unwrap();
        assert_ne!(status, RunStatus::Cancelled);
        assert!(engine.state().iteration >= 1);

        let record = load_record(dir.join("record.msgpack")).unwrap();
        assert_eq!(record.status, status);
        assert_eq!(record.rule, engine.state().rule);
        assert_eq!(record.history.len(), 150);

        engine.save_checkpoint(dir.join("checkpoint.msgpack")).unwrap();
        let loaded = Engine::load_checkpoint(dir.join("checkpoint.msgpack")).unwrap();
        assert_eq!(loaded.cfg(), engine.cfg());
        assert_eq!(loaded.state(), engine.state());
        assert_eq!(loaded.styles, engine.styles);

        std::fs::remove_dir_all(&dir).ok();
    }
}
