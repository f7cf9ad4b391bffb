use crate::error::ModelError;
use crate::market::Market;
use crate::model::{BeliefRule, StatHistory};
use rand_chacha::ChaCha12Rng;

/// Simulate `horizon` rounds of `market` starting from `initial_stat`.
///
/// The market's policies must have been solved for `rule`. Agent states are
/// carried from round to round, so consecutive calls continue the same
/// population history.
pub fn simulate<M: Market + ?Sized>(
    market: &mut M,
    rule: &BeliefRule,
    horizon: usize,
    initial_stat: f64,
    rng: &mut ChaCha12Rng,
) -> Result<StatHistory, ModelError> {
    let solved_for = market.solved_for();
    if solved_for != Some(*rule) {
        return Err(ModelError::StalePolicy {
            rule: *rule,
            solved_for,
        });
    }

    let mut history = StatHistory::with_capacity(horizon);
    let mut stat_now = initial_stat;
    for _ in 0..horizon {
        let stat_next = market.step(stat_now, rng)?;
        history.push(stat_next);
        stat_now = stat_next;
    }
    Ok(history)
}
