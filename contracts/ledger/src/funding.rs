//! Funding Accrual Strategies
//!
//! Once per block-time delta the pool computes a funding charge and folds
//! it into the collateral index (the charge never moves tokens; the index
//! rises so the same shares redeem to fewer raw units). The two pool sides
//! charge on different notionals, so the policy is a trait the ledger is
//! constructed with.

use tidepool_common::math::funding_charge;
use tidepool_common::{LedgerResult, PoolId};

/// Pluggable funding policy, one implementation per pool side
pub trait FundingStrategy {
    /// Pool this strategy accrues for (used for config lookups)
    fn pool_id(&self) -> PoolId;

    /// Funding charge in raw collateral units for `elapsed` seconds at the
    /// annualized `funding_ratio` (1e18 scale)
    fn charge(
        &self,
        total_raw_coll: u64,
        total_raw_debt: u64,
        funding_ratio: u128,
        elapsed: u64,
    ) -> LedgerResult<u64>;
}

/// Long-side pool: funding is charged on the full collateral notional
#[derive(Debug, Clone, Copy)]
pub struct LongPoolFunding {
    pub pool_id: PoolId,
}

impl FundingStrategy for LongPoolFunding {
    fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    fn charge(
        &self,
        total_raw_coll: u64,
        _total_raw_debt: u64,
        funding_ratio: u128,
        elapsed: u64,
    ) -> LedgerResult<u64> {
        funding_charge(total_raw_coll, funding_ratio, elapsed)
    }
}

/// Short-side pool: funding is charged on the hedged notional, collateral
/// net of the value already owed back, so shorts do not pay funding on
/// self-backing value.
#[derive(Debug, Clone, Copy)]
pub struct ShortPoolFunding {
    pub pool_id: PoolId,
}

impl FundingStrategy for ShortPoolFunding {
    fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    fn charge(
        &self,
        total_raw_coll: u64,
        total_raw_debt: u64,
        funding_ratio: u128,
        elapsed: u64,
    ) -> LedgerResult<u64> {
        let notional = total_raw_coll.saturating_sub(total_raw_debt);
        funding_charge(notional, funding_ratio, elapsed)
    }
}
