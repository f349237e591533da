//! Tidepool Tick Ledger
//!
//! Collateralized-debt ledger for a two-sided lending pool. Positions are
//! bucketed by debt-to-collateral ratio into discrete ticks; rebalance,
//! liquidation, and redemption each process a whole tick with one update,
//! and individual positions are reconstructed lazily through a
//! ratio-chain tree the next time they are touched.
//!
//! Module map:
//! - [`tick`] - ratio <-> tick discretization
//! - [`bitmap`] - occupied-tick bitmap with descending scans
//! - [`tree`] - arena of tick nodes with path-compressed ratio chains
//! - [`funding`] - pluggable per-side funding strategies
//! - [`collaborators`] - trusted external service interfaces
//! - [`pool`] - the `PoolLedger` state machine and its operations

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

pub mod bitmap;
pub mod collaborators;
pub mod funding;
pub mod pool;
pub mod tick;
pub mod tree;

#[cfg(test)]
mod integration_tests;

pub use bitmap::TickBitmap;
pub use collaborators::{ConfigSource, FeeCollector, LedgerEnv, PositionOwnership, PriceSource};
pub use funding::{FundingStrategy, LongPoolFunding, ShortPoolFunding};
pub use pool::{
    LiquidateOutcome, OperateOutcome, OperateRequest, PoolConfig, PoolLedger, RebalanceOutcome,
    RebalanceTarget, RedeemOutcome,
};
pub use tick::{ratio_to_tick, tick_to_ratio};
pub use tree::{Resolved, TickNode, TickTree};
