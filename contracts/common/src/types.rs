//! Core Types for the Tidepool Ledger
//!
//! Fundamental data structures shared by both pool sides. All persisted
//! records are plain structs with fixed-width fields; borsh provides the
//! compact encoding.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// Type alias for addresses (32-byte hash)
pub type Address = [u8; 32];

/// Type alias for position identifiers
pub type PositionId = u32;

/// Type alias for tick-node handles in the tree arena
pub type NodeId = u32;

/// Type alias for pool identifiers (one per side)
pub type PoolId = u16;

/// Type alias for tick identifiers
pub type Tick = i32;

/// Rounding direction for share/raw conversions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub enum Rounding {
    /// Truncate toward zero
    Down,
    /// Round away from zero
    Up,
}

/// A requested change to one side of a position.
///
/// Replaces the magic minimal-integer sentinel: "withdraw/repay all" is a
/// distinct variant instead of a reserved numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub enum Delta {
    /// Leave this side untouched
    #[default]
    None,
    /// Add the given raw amount
    Add(u64),
    /// Remove the given raw amount
    Remove(u64),
    /// Remove everything, clearing the side exactly
    RemoveAll,
}

impl Delta {
    /// Returns true if this delta removes value from the position
    pub fn is_removal(&self) -> bool {
        matches!(self, Delta::Remove(_) | Delta::RemoveAll)
    }

    /// Returns true if this delta adds value to the position
    pub fn is_addition(&self) -> bool {
        matches!(self, Delta::Add(_))
    }
}

/// Per-position record.
///
/// `coll_shares`/`debt_shares` are the *original* shares at the time the
/// position was last assigned to `node`; the live values are reconstructed
/// by applying the node's ratio chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Position {
    /// Effective end user that owns this position
    pub owner: Address,
    /// Tick the position was last assigned to; None while debt-free
    pub tick: Option<Tick>,
    /// Node the position was assigned to at that time
    pub node: Option<NodeId>,
    /// Collateral shares at last assignment
    pub coll_shares: u64,
    /// Debt shares at last assignment
    pub debt_shares: u64,
}

impl Position {
    /// Creates a fresh, empty position for `owner`
    pub fn new(owner: Address) -> Self {
        Self {
            owner,
            tick: None,
            node: None,
            coll_shares: 0,
            debt_shares: 0,
        }
    }

    /// Returns true when both sides are zero
    pub fn is_empty(&self) -> bool {
        self.coll_shares == 0 && self.debt_shares == 0
    }

    /// Returns true while the position carries debt
    pub fn has_debt(&self) -> bool {
        self.debt_shares > 0
    }
}

/// Global share indices plus the funding clock.
///
/// Raw debt = shares × debt_index / INDEX_ONE.
/// Raw collateral = shares × INDEX_ONE / coll_index, so a rising
/// collateral index shrinks raw value without moving tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct PoolIndices {
    /// Collateral index, non-decreasing under funding and reduce_collateral
    pub coll_index: u128,
    /// Debt index, raised by bad-debt socialization
    pub debt_index: u128,
    /// Timestamp of the last funding accrual (unix seconds)
    pub last_timestamp: u64,
}

impl PoolIndices {
    /// Fresh indices at the fixed starting constant
    pub fn new(now: u64) -> Self {
        Self {
            coll_index: crate::constants::precision::INDEX_ONE,
            debt_index: crate::constants::precision::INDEX_ONE,
            last_timestamp: now,
        }
    }
}

/// Read-only view of a single position's live state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct PositionSnapshot {
    /// Position identifier
    pub position_id: PositionId,
    /// Recorded owner
    pub owner: Address,
    /// Live raw collateral after chain resolution
    pub raw_coll: u64,
    /// Live raw debt after chain resolution
    pub raw_debt: u64,
    /// Debt ratio at the exchange price; None while debt-free
    pub debt_ratio: Option<u128>,
    /// Current tick assignment
    pub tick: Option<Tick>,
}

/// Read-only view of pool-wide totals
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct PoolSnapshot {
    /// Sum of raw collateral across all shares
    pub total_raw_coll: u64,
    /// Sum of raw debt across all shares
    pub total_raw_debt: u64,
    /// Global collateral shares
    pub total_coll_shares: u64,
    /// Global debt shares
    pub total_debt_shares: u64,
    /// Current collateral index
    pub coll_index: u128,
    /// Current debt index
    pub debt_index: u128,
    /// Highest tick currently holding nonzero debt
    pub top_tick: Option<Tick>,
}
