//! Protocol Constants
//!
//! All magic numbers and configuration defaults for the Tidepool ledger.
//! Ratios, indices, and prices share one fixed-point scale so conversions
//! between them never need a rescaling step.

/// Fixed-point precision
pub mod precision {
    /// Scale for ratios, indices, and prices (1e18)
    pub const RATIO_ONE: u128 = 1_000_000_000_000_000_000;

    /// Starting value for both collateral and debt indices (1e18)
    pub const INDEX_ONE: u128 = 1_000_000_000_000_000_000;

    /// Basis points denominator
    pub const BPS_DENOMINATOR: u64 = 10_000;
}

/// Tick discretization of the debt-ratio axis
pub mod ticks {
    use super::precision::RATIO_ONE;

    /// Width of one tick in ratio units (0.05%)
    pub const TICK_SIZE: u128 = RATIO_ONE / 2_000;

    /// Lowest tick id; tick 1 covers ratios in (0, TICK_SIZE]
    pub const MIN_TICK: i32 = 1;

    /// Highest tick id; covers ratios up to 200%
    pub const MAX_TICK: i32 = 4_000;
}

/// Funding accrual configuration
pub mod funding {
    /// Seconds per year used to annualize funding ratios
    pub const SECONDS_PER_YEAR: u64 = 31_536_000;

    /// Cap on a single accrual's charge, as basis points of total raw
    /// collateral. Keeps the index-update denominator positive even when
    /// a misconfigured funding ratio meets a long idle gap.
    pub const MAX_CHARGE_BPS: u64 = 5_000;
}

/// Operation limits
pub mod limits {
    /// Minimum raw debt a position must keep after any operation
    pub const MIN_POSITION_DEBT: u64 = 10_000;

    /// Ticks with less raw debt than this are skipped by sweeps
    pub const DUST_TICK_DEBT: u64 = 1_000;

    /// Cap on `reduce_debt`, as basis points of aggregate raw debt
    pub const MAX_DEBT_REDUCTION_BPS: u64 = 1_000;

    /// Default cap on the share-fraction of one tick's debt a single
    /// redemption pass may consume (80%)
    pub const DEFAULT_MAX_REDEEM_RATIO_BPS: u64 = 8_000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_range_covers_two_hundred_percent() {
        let top = ticks::TICK_SIZE * ticks::MAX_TICK as u128;
        assert_eq!(top, 2 * precision::RATIO_ONE);
    }

    #[test]
    fn max_charge_is_below_full_collateral() {
        assert!(funding::MAX_CHARGE_BPS < precision::BPS_DENOMINATOR);
    }
}
