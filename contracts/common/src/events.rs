//! Ledger Events
//!
//! Every mutating operation appends events to its result so collaborators
//! can index pool activity without re-deriving it from state diffs.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::types::{Address, PositionId, Tick};

/// Event discriminants for indexing and filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
#[borsh(use_discriminant = true)]
#[repr(u8)]
pub enum EventType {
    // Position events (0x01 - 0x1F)
    PositionOperated = 0x01,
    PositionRedeemedAgainst = 0x02,

    // Tick events (0x20 - 0x3F)
    TickRebalanced = 0x20,
    TickLiquidated = 0x21,
    TopTickMoved = 0x22,

    // Index events (0x40 - 0x5F)
    FundingAccrued = 0x40,
    BadDebtSocialized = 0x41,
    CollateralReduced = 0x42,
    DebtForgiven = 0x43,
}

/// Main event enum for all ledger events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub enum LedgerEvent {
    /// A position was opened or modified
    PositionOperated {
        position_id: PositionId,
        owner: Address,
        raw_coll_delta: i64,
        raw_debt_delta: i64,
        protocol_fee: u64,
        new_tick: Option<Tick>,
    },

    /// Debt was redeemed out of a tick at the redemption price
    PositionRedeemedAgainst {
        tick: Tick,
        raw_debt_redeemed: u64,
        raw_coll_paid: u64,
        survivor_tick: Option<Tick>,
    },

    /// A tick was partially de-risked toward the rebalance target
    TickRebalanced {
        tick: Tick,
        raw_debt_in: u64,
        raw_coll_out: u64,
        survivor_tick: Option<Tick>,
    },

    /// A tick above the liquidation ratio was seized
    TickLiquidated {
        tick: Tick,
        raw_debt_liquidated: u64,
        raw_coll_seized: u64,
        reserve_used: u64,
        survivor_tick: Option<Tick>,
    },

    /// The highest occupied tick changed
    TopTickMoved {
        old_top: Option<Tick>,
        new_top: Option<Tick>,
    },

    /// Funding was folded into the collateral index
    FundingAccrued {
        charge: u64,
        elapsed: u64,
        new_coll_index: u128,
    },

    /// Uncovered liquidation debt was spread across remaining shares
    BadDebtSocialized {
        raw_bad_debt: u64,
        new_debt_index: u128,
    },

    /// Aggregate collateral was reduced through the index
    CollateralReduced {
        raw_amount: u64,
        new_coll_index: u128,
    },

    /// Aggregate debt was forgiven through the index
    DebtForgiven {
        raw_amount: u64,
        new_debt_index: u128,
    },
}

impl LedgerEvent {
    /// Returns the discriminant for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Self::PositionOperated { .. } => EventType::PositionOperated,
            Self::PositionRedeemedAgainst { .. } => EventType::PositionRedeemedAgainst,
            Self::TickRebalanced { .. } => EventType::TickRebalanced,
            Self::TickLiquidated { .. } => EventType::TickLiquidated,
            Self::TopTickMoved { .. } => EventType::TopTickMoved,
            Self::FundingAccrued { .. } => EventType::FundingAccrued,
            Self::BadDebtSocialized { .. } => EventType::BadDebtSocialized,
            Self::CollateralReduced { .. } => EventType::CollateralReduced,
            Self::DebtForgiven { .. } => EventType::DebtForgiven,
        }
    }
}
