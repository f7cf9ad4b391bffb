use serde::{Deserialize, Serialize};

/// Running mean and variance (Welford).
#[derive(Debug, Clone, Default)]
pub struct Moments {
    n_vals: usize,
    mean: f64,
    diff_2_sum: f64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct MomentsReport {
    pub n_vals: usize,
    pub mean: f64,
    pub std_dev: f64,
}

impl Moments {
    pub fn add(&mut self, val: f64) {
        self.n_vals += 1;

        let diff_a = val - self.mean;
        self.mean += diff_a / self.n_vals as f64;

        let diff_b = val - self.mean;
        self.diff_2_sum += diff_a * diff_b;
    }

    pub fn report(&self) -> MomentsReport {
        MomentsReport {
            n_vals: self.n_vals,
            mean: if self.n_vals > 0 { self.mean } else { f64::NAN },
            std_dev: if self.n_vals > 1 {
                (self.diff_2_sum / (self.n_vals as f64 - 1.0)).sqrt()
            } else {
                f64::NAN
            },
        }
    }
}

/// Punk share history pooled over the records of a run.
#[derive(Debug, Clone, Default)]
pub struct SeriesStats {
    vals: Vec<f64>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct SeriesReport {
    pub n_vals: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub sem: f64,
    pub is_equil: bool,
}

impl SeriesStats {
    pub fn extend(&mut self, vals: &[f64]) {
        self.vals.extend_from_slice(vals);
    }

    /// Summarize the series after discarding its estimated transient.
    pub fn report(&self) -> SeriesReport {
        if self.vals.is_empty() {
            return SeriesReport {
                n_vals: 0,
                mean: f64::NAN,
                std_dev: f64::NAN,
                sem: f64::NAN,
                is_equil: false,
            };
        }
        let i_equil = compute_opt_i_equil(&self.vals);
        let equil_vals = &self.vals[i_equil..];
        SeriesReport {
            n_vals: equil_vals.len(),
            mean: compute_mean(equil_vals),
            std_dev: compute_var(equil_vals).sqrt(),
            sem: compute_sem(equil_vals),
            is_equil: i_equil != self.vals.len() / 2,
        }
    }
}

fn compute_mean(vals: &[f64]) -> f64 {
    if vals.is_empty() {
        return f64::NAN;
    }
    vals.iter().sum::<f64>() / vals.len() as f64
}

fn compute_var(vals: &[f64]) -> f64 {
    let n_vals = vals.len();
    if n_vals < 2 {
        return f64::NAN;
    }
    let mean = compute_mean(vals);
    vals.iter().map(|&val| (val - mean).powi(2)).sum::<f64>() / (n_vals - 1) as f64
}

/// Pairwise-averaged copy of a punk share history.
struct BlockLevel {
    /// Naive squared standard error of the mean at this level.
    sem2: f64,
    /// Uncertainty of `sem2`.
    sem2_err: f64,
}

fn blocking_levels(vals: &[f64]) -> Vec<BlockLevel> {
    let mut levels = Vec::new();
    let mut blocks = vals.to_vec();
    while blocks.len() >= 2 {
        let n_blocks = blocks.len() as f64;
        let sem2 = compute_var(&blocks) / n_blocks;
        levels.push(BlockLevel {
            sem2,
            sem2_err: sem2 * (2.0 / (n_blocks - 1.0)).sqrt(),
        });
        blocks = blocks
            .chunks_exact(2)
            .map(|pair| 0.5 * (pair[0] + pair[1]))
            .collect();
    }
    levels
}

/// Standard error of the mean punk share (Flyvbjerg-Petersen blocking).
///
/// Consecutive periods are correlated through the agents' switching costs,
/// so the estimate is read at the finest blocking level that already lies
/// above every coarser level's lower bound.
fn compute_sem(vals: &[f64]) -> f64 {
    let levels = blocking_levels(vals);
    levels
        .iter()
        .enumerate()
        .find(|(i_lvl, lvl)| {
            levels[*i_lvl..]
                .iter()
                .all(|coarser| lvl.sem2 > coarser.sem2 - coarser.sem2_err)
        })
        .map(|(_, lvl)| lvl)
        .or(levels.last())
        .map_or(f64::NAN, |lvl| lvl.sem2.sqrt())
}

/// First period of the stationary part of a punk share history.
///
/// The history is truncated at `n / 2^k` for every `k` and the truncation
/// with the smallest marginal standard error of what remains is kept.
fn compute_opt_i_equil(vals: &[f64]) -> usize {
    let n_vals = vals.len();
    if n_vals < 4 {
        return 0;
    }

    let marginal_se = |start: usize| {
        let tail = &vals[start..];
        let n_tail = tail.len() as f64;
        compute_var(tail) * (n_tail - 1.0) / (n_tail * n_tail)
    };

    (1..=n_vals.ilog2() + 1)
        .rev()
        .map(|k| n_vals >> k)
        .fold((n_vals / 2, f64::INFINITY), |(best, min_mse), start| {
            let mse = marginal_se(start);
            if mse < min_mse { (start, mse) } else { (best, min_mse) }
        })
        .0
}
