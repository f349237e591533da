//! Collaborator Interfaces
//!
//! The ledger treats token custody, price computation, configuration, and
//! position-token ownership as trusted external services and only ever
//! talks to them through these traits. Prices and ratios are fixed-point
//! at 1e18 scale.

use tidepool_common::{Address, LedgerResult, PoolId, PositionId};

/// Price oracle collaborator; the ledger performs no price computation
pub trait PriceSource {
    /// Price used for user operations and health checks
    fn exchange_price(&self) -> LedgerResult<u128>;
    /// Price used when seizing liquidated collateral
    fn liquidate_price(&self) -> LedgerResult<u128>;
    /// Price used when paying out redemptions
    fn redeem_price(&self) -> LedgerResult<u128>;
}

/// Protocol configuration collaborator
pub trait ConfigSource {
    /// Annualized funding ratio for `pool`, 1e18 scale
    fn funding_ratio(&self, pool: PoolId) -> LedgerResult<u128>;
    /// Fire-and-forget notification that `pool` refreshed its indices
    fn checkpoint(&mut self, pool: PoolId);
    /// Whether new borrowing is currently allowed
    fn is_borrow_allowed(&self) -> bool;
}

/// Custody/fee collaborator. The return value is raw units to subtract
/// from the user-facing delta before share conversion.
pub trait FeeCollector {
    fn deduct_protocol_fees(&mut self, raw_coll_delta: u64) -> LedgerResult<u64>;
}

/// Ownership-token collaborator: position identity lives in an external
/// token; the ledger only reads the current owner for authorization.
pub trait PositionOwnership {
    /// Mint an ownership token for a new position, returning its id
    fn mint(&mut self, owner: Address) -> LedgerResult<PositionId>;
    /// Current owner of `position`
    fn owner_of(&self, position: PositionId) -> LedgerResult<Address>;
}

/// Everything a ledger operation needs from the outside world
pub trait LedgerEnv: PriceSource + ConfigSource + FeeCollector + PositionOwnership {}

impl<T: PriceSource + ConfigSource + FeeCollector + PositionOwnership> LedgerEnv for T {}
