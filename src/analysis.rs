use crate::engine::{Record, RunStatus, load_record};
use crate::stats::{Moments, SeriesStats};
use anyhow::{Context, Result};
use std::{fs::File, io::BufWriter, path::Path};

/// Quantity accumulated over the records of a run.
pub trait Obs {
    fn update(&mut self, record: &Record) -> Result<()>;
    fn report(&self) -> serde_json::Value;
}

/// Punk proportion over all recorded histories.
#[derive(Default)]
pub struct PunkProp {
    series: SeriesStats,
}

impl Obs for PunkProp {
    fn update(&mut self, record: &Record) -> Result<()> {
        self.series.extend(record.history.values());
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({ "punk_prop": self.series.report() })
    }
}

/// Final belief rule of each record.
#[derive(Default)]
pub struct FinalRule {
    slope: Moments,
    intercept: Moments,
    width: Moments,
}

impl Obs for FinalRule {
    fn update(&mut self, record: &Record) -> Result<()> {
        self.slope.add(record.rule.slope);
        self.intercept.add(record.rule.intercept);
        self.width.add(record.rule.width);
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({
            "final_rule": {
                "slope": self.slope.report(),
                "intercept": self.intercept.report(),
                "width": self.width.report(),
            }
        })
    }
}

/// Latest search status and iteration count.
#[derive(Default)]
pub struct Progress {
    status: Option<RunStatus>,
    iteration: usize,
    n_records: usize,
}

impl Obs for Progress {
    fn update(&mut self, record: &Record) -> Result<()> {
        self.status = Some(record.status);
        self.iteration = record.iteration;
        self.n_records += 1;
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({
            "progress": {
                "status": self.status,
                "iteration": self.iteration,
                "n_records": self.n_records,
            }
        })
    }
}

pub struct Analyzer {
    obs_ptr_vec: Vec<Box<dyn Obs>>,
}

impl Analyzer {
    pub fn new() -> Self {
        let obs_ptr_vec: Vec<Box<dyn Obs>> = vec![
            Box::new(PunkProp::default()),
            Box::new(FinalRule::default()),
            Box::new(Progress::default()),
        ];
        Self { obs_ptr_vec }
    }

    pub fn add_file<P: AsRef<Path>>(&mut self, file: P) -> Result<()> {
        let record = load_record(file).context("failed to read record")?;
        for obs in &mut self.obs_ptr_vec {
            obs.update(&record).context("failed to update observable")?;
        }
        Ok(())
    }

    pub fn reports(&self) -> Vec<serde_json::Value> {
        self.obs_ptr_vec.iter().map(|obs| obs.report()).collect()
    }

    pub fn save_results<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let writer = BufWriter::new(file);

        serde_json::to_writer_pretty(writer, &self.reports()).context("failed to write results")?;
        Ok(())
    }
}
