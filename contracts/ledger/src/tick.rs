//! Tick Math
//!
//! Maps a debt-to-collateral ratio to a discretized tick identifier and
//! back. Tick `t` covers the ratio interval `((t-1)*TICK_SIZE, t*TICK_SIZE]`,
//! so `ratio_to_tick` is a ceiling: bucketing never under-estimates a
//! position's risk. Larger tick means higher debt ratio means riskier.

use tidepool_common::constants::ticks::{MAX_TICK, MIN_TICK, TICK_SIZE};
use tidepool_common::Tick;

/// Smallest tick whose associated ratio is >= `ratio`, clamped to
/// `[MIN_TICK, MAX_TICK]`.
pub fn ratio_to_tick(ratio: u128) -> Tick {
    if ratio == 0 {
        return MIN_TICK;
    }
    // Ceiling division; ratios beyond the top tick clamp rather than fail
    // so over-levered buckets still land somewhere traversable.
    let bucket = (ratio - 1) / TICK_SIZE + 1;
    if bucket > MAX_TICK as u128 {
        return MAX_TICK;
    }
    (bucket as i32).max(MIN_TICK)
}

/// Upper-bound ratio associated with `tick`: `tick * TICK_SIZE`
pub fn tick_to_ratio(tick: Tick) -> u128 {
    tick.clamp(MIN_TICK, MAX_TICK) as u128 * TICK_SIZE
}
