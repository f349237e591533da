//! Position Ledger
//!
//! The `PoolLedger` tracks every position of one pool side, bucketed by
//! debt ratio into ticks. Aggregate operations (redeem, rebalance,
//! liquidate) process a whole tick with one tree retirement; individual
//! positions are reconstructed through the ratio chain the next time they
//! are touched.
//!
//! Ordering contract: every operation refreshes the indices (funding
//! accrual) before any ratio or bound check reads them. Failures are
//! atomic over ledger state: all validation happens against staged values,
//! the tree/bitmap/totals are only written once nothing can fail, and a
//! rejected call rolls its own accrual back so the elapsed funding window
//! is charged by the next successful one instead.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use tidepool_common::constants::precision::{BPS_DENOMINATOR, RATIO_ONE};
use tidepool_common::constants::ticks::{MAX_TICK, MIN_TICK};
use tidepool_common::constants::limits;
use tidepool_common::math::{
    accrue_coll_index, apply_ratio, coll_shares_from_raw, coll_value, debt_ratio,
    debt_shares_from_raw, derisk_debt_amount, mul_div, raw_coll_from_value,
    raw_from_coll_shares, raw_from_debt_shares, socialize_bad_debt,
};
use tidepool_common::{
    Address, BTreeMap, Box, Delta, LedgerError, LedgerEvent, LedgerResult, NodeId, PoolId,
    PoolIndices, PoolSnapshot, Position, PositionId, PositionSnapshot, Rounding, Tick, Vec,
};

use crate::bitmap::TickBitmap;
use crate::collaborators::LedgerEnv;
use crate::funding::FundingStrategy;
use crate::tick::ratio_to_tick;
use crate::tree::TickTree;

// ============================================================================
// Configuration
// ============================================================================

/// Static parameters of one pool side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct PoolConfig {
    /// Pool identifier, used for config lookups and checkpoints
    pub pool_id: PoolId,
    /// The single facade allowed to call mutating operations
    pub authorized_caller: Address,
    /// Lowest debt ratio a position may hold (1e18)
    pub min_debt_ratio: u128,
    /// Highest debt ratio a position may hold (1e18)
    pub max_debt_ratio: u128,
    /// Ticks at/above this ratio are eligible for rebalancing
    pub rebalance_ratio: u128,
    /// Ratio a rebalanced tick is brought down to
    pub rebalance_target_ratio: u128,
    /// Collateral bonus paid to rebalancers (1e18 fraction)
    pub rebalance_bonus: u128,
    /// Ticks at/above this ratio are eligible for liquidation
    pub liquidation_ratio: u128,
    /// Ratio a partially liquidated tick is brought down to
    pub liquidation_target_ratio: u128,
    /// Collateral bonus paid to liquidators (1e18 fraction)
    pub liquidation_bonus: u128,
    /// Share-fraction of one tick's debt a single redemption pass may take
    pub max_redeem_ratio_per_tick: u128,
    /// Minimum raw debt a position must keep
    pub min_position_debt: u64,
    /// Ticks below this raw debt are skipped by sweeps
    pub dust_tick_debt: u64,
}

impl PoolConfig {
    /// Baseline parameters: a 50%-85.7% operating band with the protocol
    /// default limits. Deployments override fields for their market; the
    /// result still goes through [`validate`](Self::validate).
    pub fn new(pool_id: PoolId, authorized_caller: Address) -> Self {
        Self {
            pool_id,
            authorized_caller,
            min_debt_ratio: RATIO_ONE / 2,
            max_debt_ratio: RATIO_ONE * 857 / 1_000,
            rebalance_ratio: RATIO_ONE * 90 / 100,
            rebalance_target_ratio: RATIO_ONE * 80 / 100,
            rebalance_bonus: RATIO_ONE * 5 / 100,
            liquidation_ratio: RATIO_ONE * 95 / 100,
            liquidation_target_ratio: RATIO_ONE * 90 / 100,
            liquidation_bonus: RATIO_ONE * 2 / 100,
            max_redeem_ratio_per_tick: RATIO_ONE * limits::DEFAULT_MAX_REDEEM_RATIO_BPS as u128
                / BPS_DENOMINATOR as u128,
            min_position_debt: limits::MIN_POSITION_DEBT,
            dust_tick_debt: limits::DUST_TICK_DEBT,
        }
    }

    /// Validate ordering of the ratio band:
    /// min < max <= rebalance threshold < liquidation threshold, and each
    /// de-risking target below its own trigger.
    pub fn validate(&self) -> LedgerResult<()> {
        if self.min_debt_ratio >= self.max_debt_ratio {
            return Err(LedgerError::InvalidConfig {
                param: "min_debt_ratio",
                reason: "must be below max_debt_ratio",
            });
        }
        if self.max_debt_ratio > self.rebalance_ratio {
            return Err(LedgerError::InvalidConfig {
                param: "max_debt_ratio",
                reason: "must not exceed rebalance_ratio",
            });
        }
        if self.rebalance_ratio >= self.liquidation_ratio {
            return Err(LedgerError::InvalidConfig {
                param: "rebalance_ratio",
                reason: "must be below liquidation_ratio",
            });
        }
        if self.rebalance_target_ratio >= self.rebalance_ratio {
            return Err(LedgerError::InvalidConfig {
                param: "rebalance_target_ratio",
                reason: "must be below rebalance_ratio",
            });
        }
        if self.liquidation_target_ratio >= self.liquidation_ratio {
            return Err(LedgerError::InvalidConfig {
                param: "liquidation_target_ratio",
                reason: "must be below liquidation_ratio",
            });
        }
        if self.max_redeem_ratio_per_tick == 0 || self.max_redeem_ratio_per_tick > RATIO_ONE {
            return Err(LedgerError::InvalidConfig {
                param: "max_redeem_ratio_per_tick",
                reason: "must be in (0, 1]",
            });
        }
        Ok(())
    }
}

// ============================================================================
// Requests and outcomes
// ============================================================================

/// Request to open or modify a position
#[derive(Debug, Clone)]
pub struct OperateRequest {
    /// Immediate caller; must be the authorized facade
    pub caller: Address,
    /// Effective end user the facade is acting for
    pub user: Address,
    /// Existing position, or None to open a new one
    pub position: Option<PositionId>,
    /// Collateral change
    pub coll_delta: Delta,
    /// Debt change
    pub debt_delta: Delta,
    /// Current time (unix seconds)
    pub now: u64,
}

/// Result of an `operate` call
#[derive(Debug, Clone)]
pub struct OperateOutcome {
    /// Position that was created or modified
    pub position_id: PositionId,
    /// Net raw collateral change applied to the ledger (positive = deposit)
    pub raw_coll_delta: i64,
    /// Net raw debt change applied to the ledger (positive = borrow)
    pub raw_debt_delta: i64,
    /// Protocol fee quoted by the custody collaborator
    pub protocol_fee: u64,
    /// Debt ratio after the operation; None while debt-free
    pub debt_ratio: Option<u128>,
    /// Tick assignment after the operation
    pub tick: Option<Tick>,
    /// Events emitted during the operation
    pub events: Vec<LedgerEvent>,
}

/// Target selector for rebalancing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceTarget {
    /// Rebalance one specific tick
    Tick(Tick),
    /// Walk from the top tick downward until ticks fall below threshold
    Sweep,
}

/// Result of a `redeem` call
#[derive(Debug, Clone)]
pub struct RedeemOutcome {
    /// Raw debt actually redeemed
    pub raw_debt_redeemed: u64,
    /// Raw collateral paid out at the redemption price
    pub raw_coll_paid: u64,
    /// Number of ticks processed
    pub ticks_processed: u32,
    /// Events emitted during the operation
    pub events: Vec<LedgerEvent>,
}

/// Result of a `rebalance` call
#[derive(Debug, Clone)]
pub struct RebalanceOutcome {
    /// Raw debt paid in by the rebalancer
    pub raw_debt_in: u64,
    /// Raw collateral (including bonus) released to the rebalancer
    pub raw_coll_out: u64,
    /// Number of ticks processed
    pub ticks_processed: u32,
    /// Events emitted during the operation
    pub events: Vec<LedgerEvent>,
}

/// Result of a `liquidate` call
#[derive(Debug, Clone)]
pub struct LiquidateOutcome {
    /// Raw debt removed from the ledger
    pub raw_debt_liquidated: u64,
    /// Raw collateral seized from liquidated ticks
    pub raw_coll_seized: u64,
    /// Raw collateral drawn from the caller-supplied reserve
    pub reserve_used: u64,
    /// Uncovered debt socialized through the debt index
    pub raw_bad_debt: u64,
    /// Number of ticks processed
    pub ticks_processed: u32,
    /// Events emitted during the operation
    pub events: Vec<LedgerEvent>,
}

// ============================================================================
// Ledger state
// ============================================================================

/// Live shares of a position after chain resolution
struct LiveShares {
    coll: u64,
    debt: u64,
    /// Chain root, when the position was bucketed
    root: Option<NodeId>,
}

/// State of one pool side
pub struct PoolLedger {
    config: PoolConfig,
    indices: PoolIndices,
    total_coll_shares: u64,
    total_debt_shares: u64,
    tree: TickTree,
    bitmap: TickBitmap,
    top_tick: Option<Tick>,
    positions: BTreeMap<PositionId, Position>,
    funding: Box<dyn FundingStrategy>,
}

impl PoolLedger {
    /// Create an empty ledger for one pool side
    pub fn new(
        config: PoolConfig,
        funding: Box<dyn FundingStrategy>,
        now: u64,
    ) -> LedgerResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            indices: PoolIndices::new(now),
            total_coll_shares: 0,
            total_debt_shares: 0,
            tree: TickTree::new(),
            bitmap: TickBitmap::new(),
            top_tick: None,
            positions: BTreeMap::new(),
            funding,
        })
    }

    // ========================================================================
    // Read-only accessors
    // ========================================================================

    /// Current share indices
    pub fn indices(&self) -> &PoolIndices {
        &self.indices
    }

    /// Highest tick currently holding nonzero debt
    pub fn top_tick(&self) -> Option<Tick> {
        self.top_tick
    }

    /// Aggregate raw collateral across all shares
    pub fn total_raw_coll(&self) -> LedgerResult<u64> {
        raw_from_coll_shares(self.total_coll_shares, self.indices.coll_index, Rounding::Down)
    }

    /// Aggregate raw debt across all shares
    pub fn total_raw_debt(&self) -> LedgerResult<u64> {
        raw_from_debt_shares(self.total_debt_shares, self.indices.debt_index, Rounding::Up)
    }

    /// Pool-wide totals view
    pub fn pool_snapshot(&self) -> LedgerResult<PoolSnapshot> {
        Ok(PoolSnapshot {
            total_raw_coll: self.total_raw_coll()?,
            total_raw_debt: self.total_raw_debt()?,
            total_coll_shares: self.total_coll_shares,
            total_debt_shares: self.total_debt_shares,
            coll_index: self.indices.coll_index,
            debt_index: self.indices.debt_index,
            top_tick: self.top_tick,
        })
    }

    /// Live view of one position at the given exchange price.
    /// Uses the read-only chain resolution; state is not modified.
    pub fn position_snapshot(
        &self,
        position_id: PositionId,
        exchange_price: u128,
    ) -> LedgerResult<PositionSnapshot> {
        let record = self
            .positions
            .get(&position_id)
            .ok_or(LedgerError::PositionNotFound { position_id })?;

        let (coll_shares, debt_shares) = match record.node {
            Some(node) => {
                let resolved = self.tree.peek(node)?;
                (
                    apply_ratio(record.coll_shares, resolved.coll_ratio, Rounding::Down)?,
                    apply_ratio(record.debt_shares, resolved.debt_ratio, Rounding::Down)?,
                )
            }
            None => (record.coll_shares, record.debt_shares),
        };

        let raw_coll = raw_from_coll_shares(coll_shares, self.indices.coll_index, Rounding::Down)?;
        let raw_debt = raw_from_debt_shares(debt_shares, self.indices.debt_index, Rounding::Up)?;
        let ratio = if raw_debt > 0 {
            Some(debt_ratio(raw_debt, raw_coll, exchange_price)?)
        } else {
            None
        };

        Ok(PositionSnapshot {
            position_id,
            owner: record.owner,
            raw_coll,
            raw_debt,
            debt_ratio: ratio,
            tick: record.tick,
        })
    }

    // ========================================================================
    // Guards and index refresh
    // ========================================================================

    fn ensure_facade(&self, caller: Address) -> LedgerResult<()> {
        if caller != self.config.authorized_caller {
            return Err(LedgerError::UnauthorizedCaller {
                expected: self.config.authorized_caller,
                actual: caller,
            });
        }
        Ok(())
    }

    /// Accrue funding into the collateral index. Must run before any ratio
    /// or bound check within an operation.
    fn accrue(
        &mut self,
        env: &mut dyn LedgerEnv,
        now: u64,
        events: &mut Vec<LedgerEvent>,
    ) -> LedgerResult<()> {
        let elapsed = now.saturating_sub(self.indices.last_timestamp);
        if elapsed == 0 {
            return Ok(());
        }

        let total_raw_coll = self.total_raw_coll()?;
        let total_raw_debt = self.total_raw_debt()?;
        let ratio = env.funding_ratio(self.funding.pool_id())?;
        let charge = self
            .funding
            .charge(total_raw_coll, total_raw_debt, ratio, elapsed)?;
        if charge > 0 {
            self.indices.coll_index =
                accrue_coll_index(self.indices.coll_index, total_raw_coll, charge)?;
            events.push(LedgerEvent::FundingAccrued {
                charge,
                elapsed,
                new_coll_index: self.indices.coll_index,
            });
        }
        // The timestamp only advances together with a successful charge,
        // so a failed accrual never swallows the elapsed window
        self.indices.last_timestamp = now;
        env.checkpoint(self.funding.pool_id());
        Ok(())
    }

    /// Run `op` and restore the share indices if it fails. Accrual runs
    /// before an operation's checks, so a rejected call must also shed
    /// its index refresh; the next call re-accrues the same window.
    fn with_index_rollback<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> LedgerResult<T>,
    ) -> LedgerResult<T> {
        let saved = self.indices.clone();
        let result = op(self);
        if result.is_err() {
            self.indices = saved;
        }
        result
    }

    // ========================================================================
    // Bucket plumbing
    // ========================================================================

    /// Resolve a position's live shares without touching bucket totals
    fn live_shares(&mut self, record: &Position) -> LedgerResult<LiveShares> {
        match record.node {
            Some(node) => {
                let resolved = self.tree.resolve(node)?;
                Ok(LiveShares {
                    coll: apply_ratio(record.coll_shares, resolved.coll_ratio, Rounding::Down)?,
                    debt: apply_ratio(record.debt_shares, resolved.debt_ratio, Rounding::Down)?,
                    root: Some(resolved.root),
                })
            }
            None => Ok(LiveShares {
                coll: record.coll_shares,
                debt: record.debt_shares,
                root: None,
            }),
        }
    }

    /// Remove a resolved position from its bucket (commit phase)
    fn detach_from_bucket(
        &mut self,
        live: &LiveShares,
        events: &mut Vec<LedgerEvent>,
    ) -> LedgerResult<()> {
        let root = match live.root {
            Some(root) => root,
            None => return Ok(()),
        };
        // Dead ends are historical records: nothing current to detach from
        if self.tree.node(root)?.retired {
            return Ok(());
        }
        self.tree.remove_shares(root, live.coll, live.debt)?;
        let node = self.tree.node(root)?;
        if node.debt_shares == 0 {
            let tick = node.tick;
            self.bitmap.clear(tick)?;
            if self.top_tick == Some(tick) {
                self.refresh_top(tick, events)?;
            }
        }
        Ok(())
    }

    /// Re-scan for the top tick from `hint` downward and emit on change
    fn refresh_top(&mut self, hint: Tick, events: &mut Vec<LedgerEvent>) -> LedgerResult<()> {
        let new_top = self.bitmap.next_occupied_at_or_below(hint)?;
        if new_top != self.top_tick {
            events.push(LedgerEvent::TopTickMoved {
                old_top: self.top_tick,
                new_top,
            });
            self.top_tick = new_top;
        }
        Ok(())
    }

    /// Raise the top tick if `tick` now holds debt above it
    fn raise_top(&mut self, tick: Tick, events: &mut Vec<LedgerEvent>) {
        if self.top_tick.map_or(true, |t| tick > t) {
            events.push(LedgerEvent::TopTickMoved {
                old_top: self.top_tick,
                new_top: Some(tick),
            });
            self.top_tick = Some(tick);
        }
    }

    /// Bitmap/top upkeep after a tick retirement
    fn sync_after_retire(
        &mut self,
        tick: Tick,
        survivor: Option<NodeId>,
        events: &mut Vec<LedgerEvent>,
    ) -> LedgerResult<()> {
        let current = self
            .tree
            .current_node(tick)
            .ok_or(LedgerError::TickVacant { tick })?;
        if self.tree.node(current)?.debt_shares == 0 {
            self.bitmap.clear(tick)?;
        }
        let mut hint = self.top_tick.unwrap_or(MAX_TICK);
        if let Some(dest) = survivor {
            let node = self.tree.node(dest)?;
            if node.debt_shares > 0 {
                self.bitmap.set(node.tick)?;
                hint = hint.max(node.tick);
            }
        }
        self.refresh_top(hint, events)
    }

    // ========================================================================
    // operate
    // ========================================================================

    /// Open a new position or modify an existing one.
    ///
    /// The custody collaborator's fee quote is deducted from the
    /// user-facing collateral delta before share conversion; token
    /// movement itself is the facade's concern.
    pub fn operate(
        &mut self,
        env: &mut dyn LedgerEnv,
        req: OperateRequest,
    ) -> LedgerResult<OperateOutcome> {
        self.ensure_facade(req.caller)?;
        self.with_index_rollback(|pool| pool.operate_inner(env, req))
    }

    fn operate_inner(
        &mut self,
        env: &mut dyn LedgerEnv,
        req: OperateRequest,
    ) -> LedgerResult<OperateOutcome> {
        let mut events = Vec::new();
        self.accrue(env, req.now, &mut events)?;

        // Load or stage the position; owner-gate withdrawals and borrows
        let record = match req.position {
            Some(id) => {
                let record = self
                    .positions
                    .get(&id)
                    .cloned()
                    .ok_or(LedgerError::PositionNotFound { position_id: id })?;
                if req.coll_delta.is_removal() || req.debt_delta.is_addition() {
                    let owner = env.owner_of(id)?;
                    if owner != req.user {
                        return Err(LedgerError::NotPositionOwner {
                            owner,
                            actual: req.user,
                        });
                    }
                }
                record
            }
            None => Position::new(req.user),
        };

        let live = self.live_shares(&record)?;
        let price = env.exchange_price()?;

        // A position already at the liquidation ratio may only de-risk
        let pre_raw_coll =
            raw_from_coll_shares(live.coll, self.indices.coll_index, Rounding::Down)?;
        let pre_raw_debt = raw_from_debt_shares(live.debt, self.indices.debt_index, Rounding::Up)?;
        if pre_raw_debt > 0 {
            let pre_ratio = debt_ratio(pre_raw_debt, pre_raw_coll, price)?;
            if pre_ratio >= self.config.liquidation_ratio
                && (req.coll_delta.is_removal() || req.debt_delta.is_addition())
            {
                return Err(LedgerError::PositionLiquidatable {
                    ratio: pre_ratio,
                    liquidation_ratio: self.config.liquidation_ratio,
                });
            }
        }

        // Stage the collateral side
        let mut protocol_fee = 0u64;
        let mut raw_coll_delta: i128 = 0;
        let new_coll_shares = match req.coll_delta {
            Delta::None => live.coll,
            Delta::Add(amount) => {
                if amount == 0 {
                    return Err(LedgerError::ZeroAmount);
                }
                protocol_fee = env.deduct_protocol_fees(amount)?;
                let net = amount
                    .checked_sub(protocol_fee)
                    .ok_or(LedgerError::Underflow)?;
                let minted =
                    coll_shares_from_raw(net, self.indices.coll_index, Rounding::Down)?;
                raw_coll_delta = net as i128;
                live.coll.checked_add(minted).ok_or(LedgerError::Overflow)?
            }
            Delta::Remove(amount) => {
                if amount == 0 {
                    return Err(LedgerError::ZeroAmount);
                }
                let burned = coll_shares_from_raw(amount, self.indices.coll_index, Rounding::Up)?;
                if burned > live.coll {
                    return Err(LedgerError::InsufficientCollateral {
                        available: pre_raw_coll,
                        requested: amount,
                    });
                }
                protocol_fee = env.deduct_protocol_fees(amount)?;
                raw_coll_delta = -(amount as i128);
                live.coll - burned
            }
            Delta::RemoveAll => {
                protocol_fee = env.deduct_protocol_fees(pre_raw_coll)?;
                raw_coll_delta = -(pre_raw_coll as i128);
                0
            }
        };

        // Stage the debt side
        let mut raw_debt_delta: i128 = 0;
        let new_debt_shares = match req.debt_delta {
            Delta::None => live.debt,
            Delta::Add(amount) => {
                if amount == 0 {
                    return Err(LedgerError::ZeroAmount);
                }
                if !env.is_borrow_allowed() {
                    return Err(LedgerError::BorrowPaused);
                }
                let minted = debt_shares_from_raw(amount, self.indices.debt_index, Rounding::Up)?;
                raw_debt_delta = amount as i128;
                live.debt.checked_add(minted).ok_or(LedgerError::Overflow)?
            }
            Delta::Remove(amount) => {
                if amount == 0 {
                    return Err(LedgerError::ZeroAmount);
                }
                let burned = debt_shares_from_raw(amount, self.indices.debt_index, Rounding::Up)?;
                if burned > live.debt {
                    return Err(LedgerError::InsufficientDebt {
                        available: pre_raw_debt,
                        requested: amount,
                    });
                }
                raw_debt_delta = -(amount as i128);
                live.debt - burned
            }
            Delta::RemoveAll => {
                raw_debt_delta = -(pre_raw_debt as i128);
                0
            }
        };

        // Bound checks on the staged position
        let new_raw_coll =
            raw_from_coll_shares(new_coll_shares, self.indices.coll_index, Rounding::Down)?;
        let new_raw_debt =
            raw_from_debt_shares(new_debt_shares, self.indices.debt_index, Rounding::Up)?;

        let (new_ratio, new_tick) = if new_debt_shares > 0 {
            if new_raw_debt < self.config.min_position_debt {
                return Err(LedgerError::BelowMinimum {
                    amount: new_raw_debt,
                    minimum: self.config.min_position_debt,
                });
            }
            let ratio = debt_ratio(new_raw_debt, new_raw_coll, price)?;
            if ratio > self.config.max_debt_ratio {
                return Err(LedgerError::DebtRatioTooHigh {
                    ratio,
                    max_ratio: self.config.max_debt_ratio,
                });
            }
            if ratio < self.config.min_debt_ratio {
                return Err(LedgerError::DebtRatioTooLow {
                    ratio,
                    min_ratio: self.config.min_debt_ratio,
                });
            }
            (Some(ratio), Some(ratio_to_tick(ratio)))
        } else {
            (None, None)
        };

        // Commit: detach, move shares, re-bucket, persist
        let position_id = match req.position {
            Some(id) => id,
            None => env.mint(req.user)?,
        };

        self.detach_from_bucket(&live, &mut events)?;

        self.total_coll_shares = self
            .total_coll_shares
            .saturating_sub(live.coll)
            .checked_add(new_coll_shares)
            .ok_or(LedgerError::Overflow)?;
        self.total_debt_shares = self
            .total_debt_shares
            .saturating_sub(live.debt)
            .checked_add(new_debt_shares)
            .ok_or(LedgerError::Overflow)?;

        let node = match new_tick {
            Some(tick) => {
                let node = self.tree.ensure_current(tick);
                self.tree.add_shares(node, new_coll_shares, new_debt_shares)?;
                self.bitmap.set(tick)?;
                self.raise_top(tick, &mut events);
                Some(node)
            }
            None => None,
        };

        let mut record = record;
        record.tick = new_tick;
        record.node = node;
        record.coll_shares = new_coll_shares;
        record.debt_shares = new_debt_shares;
        self.positions.insert(position_id, record);

        let raw_coll_delta =
            i64::try_from(raw_coll_delta).map_err(|_| LedgerError::Overflow)?;
        let raw_debt_delta =
            i64::try_from(raw_debt_delta).map_err(|_| LedgerError::Overflow)?;
        events.push(LedgerEvent::PositionOperated {
            position_id,
            owner: req.user,
            raw_coll_delta,
            raw_debt_delta,
            protocol_fee,
            new_tick,
        });

        Ok(OperateOutcome {
            position_id,
            raw_coll_delta,
            raw_debt_delta,
            protocol_fee,
            debt_ratio: new_ratio,
            tick: new_tick,
            events,
        })
    }

    // ========================================================================
    // redeem
    // ========================================================================

    /// Redeem up to `raw_debt_amount` against the riskiest ticks at the
    /// oracle redemption price.
    pub fn redeem(
        &mut self,
        env: &mut dyn LedgerEnv,
        caller: Address,
        raw_debt_amount: u64,
        allow_no_move: bool,
        now: u64,
    ) -> LedgerResult<RedeemOutcome> {
        self.ensure_facade(caller)?;
        if raw_debt_amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        self.with_index_rollback(|pool| {
            pool.redeem_inner(env, raw_debt_amount, allow_no_move, now)
        })
    }

    fn redeem_inner(
        &mut self,
        env: &mut dyn LedgerEnv,
        raw_debt_amount: u64,
        allow_no_move: bool,
        now: u64,
    ) -> LedgerResult<RedeemOutcome> {
        let mut events = Vec::new();
        self.accrue(env, now, &mut events)?;

        // Redemption is disallowed while the pool is under water
        let total_debt = self.total_raw_debt()?;
        let exchange_price = env.exchange_price()?;
        let total_coll_value =
            coll_value(self.total_raw_coll()?, exchange_price, Rounding::Down)?;
        if total_debt >= total_coll_value {
            return Err(LedgerError::PoolUndercollateralized {
                debt_value: total_debt,
                coll_value: total_coll_value,
            });
        }

        let redeem_price = env.redeem_price()?;
        let mut remaining = raw_debt_amount;
        let mut coll_paid = 0u64;
        let mut ticks_processed = 0u32;
        // Survivor buckets minted during this call; the per-tick cap is
        // per call, so the sweep never takes a second bite from them
        let mut survivors: Vec<NodeId> = Vec::new();
        let mut cursor = match self.top_tick {
            Some(top) => top,
            None => return Err(LedgerError::NothingToProcess),
        };

        while remaining > 0 {
            let tick = match self.bitmap.next_occupied_at_or_below(cursor)? {
                Some(tick) => tick,
                None => break,
            };
            let node_id = self
                .tree
                .current_node(tick)
                .ok_or(LedgerError::TickVacant { tick })?;
            if survivors.contains(&node_id) {
                if tick == MIN_TICK {
                    break;
                }
                cursor = tick - 1;
                continue;
            }
            let (tick_coll_shares, tick_debt_shares) = {
                let node = self.tree.node(node_id)?;
                (node.coll_shares, node.debt_shares)
            };
            let tick_raw_debt =
                raw_from_debt_shares(tick_debt_shares, self.indices.debt_index, Rounding::Down)?;
            let tick_raw_coll =
                raw_from_coll_shares(tick_coll_shares, self.indices.coll_index, Rounding::Down)?;

            // Skip dust and bad-debt ticks; liquidation owns the latter
            let tick_coll_val = coll_value(tick_raw_coll, exchange_price, Rounding::Down)?;
            if tick_raw_debt < self.config.dust_tick_debt || tick_raw_debt > tick_coll_val {
                if tick == MIN_TICK {
                    break;
                }
                cursor = tick - 1;
                continue;
            }

            // Cap at the per-tick redemption fraction
            let cap_shares =
                apply_ratio(tick_debt_shares, self.config.max_redeem_ratio_per_tick, Rounding::Down)?;
            let cap_raw =
                raw_from_debt_shares(cap_shares, self.indices.debt_index, Rounding::Down)?;
            let amount = remaining.min(cap_raw);
            if amount == 0 {
                if tick == MIN_TICK {
                    break;
                }
                cursor = tick - 1;
                continue;
            }

            let coll_out = raw_coll_from_value(amount, redeem_price, Rounding::Down)?
                .min(tick_raw_coll);

            let survived_raw_debt = tick_raw_debt - amount;
            let survived_raw_coll = tick_raw_coll - coll_out;
            let new_tick = if survived_raw_debt > 0 {
                ratio_to_tick(debt_ratio(survived_raw_debt, survived_raw_coll, exchange_price)?)
            } else {
                tick
            };

            // No-op griefing guard: stop before a retirement that would
            // leave the tick assignment unchanged
            if !allow_no_move && survived_raw_debt > 0 && new_tick == tick {
                break;
            }

            let debt_shares_out = debt_shares_from_raw(amount, self.indices.debt_index, Rounding::Up)?
                .min(tick_debt_shares);
            let coll_shares_out =
                coll_shares_from_raw(coll_out, self.indices.coll_index, Rounding::Up)?
                    .min(tick_coll_shares);

            let outcome = self.tree.retire(
                tick,
                tick_coll_shares - coll_shares_out,
                tick_debt_shares - debt_shares_out,
                new_tick,
            )?;
            self.sync_after_retire(tick, outcome.survivor, &mut events)?;
            if let Some(dest) = outcome.survivor {
                survivors.push(dest);
            }

            self.total_debt_shares = self.total_debt_shares.saturating_sub(debt_shares_out);
            self.total_coll_shares = self.total_coll_shares.saturating_sub(coll_shares_out);

            remaining -= amount;
            coll_paid = coll_paid.checked_add(coll_out).ok_or(LedgerError::Overflow)?;
            ticks_processed += 1;
            events.push(LedgerEvent::PositionRedeemedAgainst {
                tick,
                raw_debt_redeemed: amount,
                raw_coll_paid: coll_out,
                survivor_tick: (survived_raw_debt > 0).then_some(new_tick),
            });

            if tick == MIN_TICK {
                break;
            }
            cursor = tick - 1;
        }

        if ticks_processed == 0 {
            return Err(LedgerError::NothingToProcess);
        }

        Ok(RedeemOutcome {
            raw_debt_redeemed: raw_debt_amount - remaining,
            raw_coll_paid: coll_paid,
            ticks_processed,
            events,
        })
    }

    // ========================================================================
    // rebalance
    // ========================================================================

    /// De-risk one tick (or sweep from the top) down to the rebalance
    /// target, paying the rebalancer a collateral bonus.
    pub fn rebalance(
        &mut self,
        env: &mut dyn LedgerEnv,
        caller: Address,
        target: RebalanceTarget,
        max_raw_debt_in: u64,
        now: u64,
    ) -> LedgerResult<RebalanceOutcome> {
        self.ensure_facade(caller)?;
        if max_raw_debt_in == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        self.with_index_rollback(|pool| {
            pool.rebalance_inner(env, target, max_raw_debt_in, now)
        })
    }

    fn rebalance_inner(
        &mut self,
        env: &mut dyn LedgerEnv,
        target: RebalanceTarget,
        max_raw_debt_in: u64,
        now: u64,
    ) -> LedgerResult<RebalanceOutcome> {
        let mut events = Vec::new();
        self.accrue(env, now, &mut events)?;

        let price = env.exchange_price()?;
        let mut budget = max_raw_debt_in;
        let mut coll_out_total = 0u64;
        let mut ticks_processed = 0u32;

        let mut cursor = match target {
            RebalanceTarget::Tick(tick) => tick,
            RebalanceTarget::Sweep => self.top_tick.ok_or(LedgerError::NothingToProcess)?,
        };

        while budget > 0 {
            let tick = match target {
                RebalanceTarget::Tick(tick) => {
                    if ticks_processed > 0 {
                        break;
                    }
                    if self.bitmap.is_set(tick)? {
                        tick
                    } else {
                        return Err(LedgerError::TickVacant { tick });
                    }
                }
                RebalanceTarget::Sweep => match self.bitmap.next_occupied_at_or_below(cursor)? {
                    Some(tick) => tick,
                    None => break,
                },
            };

            let node_id = self
                .tree
                .current_node(tick)
                .ok_or(LedgerError::TickVacant { tick })?;
            let (tick_coll_shares, tick_debt_shares) = {
                let node = self.tree.node(node_id)?;
                (node.coll_shares, node.debt_shares)
            };
            let tick_raw_debt =
                raw_from_debt_shares(tick_debt_shares, self.indices.debt_index, Rounding::Down)?;
            let tick_raw_coll =
                raw_from_coll_shares(tick_coll_shares, self.indices.coll_index, Rounding::Down)?;
            let tick_coll_val = coll_value(tick_raw_coll, price, Rounding::Down)?;

            // Dust and bad-debt ticks are not rebalanced
            if tick_raw_debt < self.config.dust_tick_debt || tick_raw_debt > tick_coll_val {
                match target {
                    RebalanceTarget::Tick(_) => return Err(LedgerError::NothingToProcess),
                    RebalanceTarget::Sweep => {
                        if tick == MIN_TICK {
                            break;
                        }
                        cursor = tick - 1;
                        continue;
                    }
                }
            }

            // Ticks are walked in descending risk order: the first healthy
            // tick ends a sweep
            let tick_ratio = debt_ratio(tick_raw_debt, tick_raw_coll, price)?;
            if tick_ratio < self.config.rebalance_ratio {
                match target {
                    RebalanceTarget::Tick(_) => return Err(LedgerError::NothingToProcess),
                    RebalanceTarget::Sweep => break,
                }
            }

            let needed = derisk_debt_amount(
                tick_raw_debt,
                tick_coll_val,
                self.config.rebalance_target_ratio,
                self.config.rebalance_bonus,
            )?;
            let amount = needed.min(budget);
            if amount == 0 {
                break;
            }

            let coll_out_value = mul_div(
                amount as u128,
                RATIO_ONE + self.config.rebalance_bonus,
                RATIO_ONE,
                Rounding::Down,
            )?;
            let coll_out = raw_coll_from_value(
                coll_out_value.min(u64::MAX as u128) as u64,
                price,
                Rounding::Down,
            )?
            .min(tick_raw_coll);

            let survived_raw_debt = tick_raw_debt - amount;
            let survived_raw_coll = tick_raw_coll - coll_out;
            let new_tick = if survived_raw_debt > 0 {
                ratio_to_tick(debt_ratio(survived_raw_debt, survived_raw_coll, price)?)
            } else {
                tick
            };

            let debt_shares_out =
                debt_shares_from_raw(amount, self.indices.debt_index, Rounding::Up)?
                    .min(tick_debt_shares);
            let coll_shares_out =
                coll_shares_from_raw(coll_out, self.indices.coll_index, Rounding::Up)?
                    .min(tick_coll_shares);

            let outcome = self.tree.retire(
                tick,
                tick_coll_shares - coll_shares_out,
                tick_debt_shares - debt_shares_out,
                new_tick,
            )?;
            self.sync_after_retire(tick, outcome.survivor, &mut events)?;

            self.total_debt_shares = self.total_debt_shares.saturating_sub(debt_shares_out);
            self.total_coll_shares = self.total_coll_shares.saturating_sub(coll_shares_out);

            budget -= amount;
            coll_out_total = coll_out_total
                .checked_add(coll_out)
                .ok_or(LedgerError::Overflow)?;
            ticks_processed += 1;
            events.push(LedgerEvent::TickRebalanced {
                tick,
                raw_debt_in: amount,
                raw_coll_out: coll_out,
                survivor_tick: (survived_raw_debt > 0).then_some(new_tick),
            });

            cursor = tick;
        }

        if ticks_processed == 0 {
            return Err(LedgerError::NothingToProcess);
        }

        Ok(RebalanceOutcome {
            raw_debt_in: max_raw_debt_in - budget,
            raw_coll_out: coll_out_total,
            ticks_processed,
            events,
        })
    }

    // ========================================================================
    // liquidate
    // ========================================================================

    /// Seize ticks at/above the liquidation ratio. The liquidator bonus is
    /// drawn first from the tick's own collateral, then from the supplied
    /// reserve. Debt that neither can cover is socialized through the debt
    /// index.
    pub fn liquidate(
        &mut self,
        env: &mut dyn LedgerEnv,
        caller: Address,
        max_raw_debt_in: u64,
        reserve_raw_coll: u64,
        now: u64,
    ) -> LedgerResult<LiquidateOutcome> {
        self.ensure_facade(caller)?;
        if max_raw_debt_in == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        self.with_index_rollback(|pool| {
            pool.liquidate_inner(env, max_raw_debt_in, reserve_raw_coll, now)
        })
    }

    fn liquidate_inner(
        &mut self,
        env: &mut dyn LedgerEnv,
        max_raw_debt_in: u64,
        reserve_raw_coll: u64,
        now: u64,
    ) -> LedgerResult<LiquidateOutcome> {
        let mut events = Vec::new();
        self.accrue(env, now, &mut events)?;

        let price = env.liquidate_price()?;
        let mut budget = max_raw_debt_in;
        let mut reserve_left = reserve_raw_coll;
        let mut coll_seized = 0u64;
        let mut reserve_used = 0u64;
        let mut bad_debt_total = 0u64;
        let mut ticks_processed = 0u32;
        let mut cursor = self.top_tick.ok_or(LedgerError::NothingToProcess)?;

        while budget > 0 {
            let tick = match self.bitmap.next_occupied_at_or_below(cursor)? {
                Some(tick) => tick,
                None => break,
            };
            let node_id = self
                .tree
                .current_node(tick)
                .ok_or(LedgerError::TickVacant { tick })?;
            let (tick_coll_shares, tick_debt_shares) = {
                let node = self.tree.node(node_id)?;
                (node.coll_shares, node.debt_shares)
            };
            let tick_raw_debt =
                raw_from_debt_shares(tick_debt_shares, self.indices.debt_index, Rounding::Down)?;
            let tick_raw_coll =
                raw_from_coll_shares(tick_coll_shares, self.indices.coll_index, Rounding::Down)?;

            if tick_raw_debt < self.config.dust_tick_debt {
                if tick == MIN_TICK {
                    break;
                }
                cursor = tick - 1;
                continue;
            }

            let tick_coll_val = coll_value(tick_raw_coll, price, Rounding::Down)?;
            let tick_ratio = debt_ratio(tick_raw_debt, tick_raw_coll, price)?;
            if tick_ratio < self.config.liquidation_ratio {
                // Descending order: every tick below is healthier still
                break;
            }

            let underwater = tick_raw_debt > tick_coll_val;
            let needed = if underwater {
                tick_raw_debt
            } else {
                derisk_debt_amount(
                    tick_raw_debt,
                    tick_coll_val,
                    self.config.liquidation_target_ratio,
                    self.config.liquidation_bonus,
                )?
            };
            let amount = needed.min(budget);
            if amount == 0 {
                break;
            }

            let reserve_val = coll_value(reserve_left, price, Rounding::Down)?;
            let covered_val = tick_coll_val
                .checked_add(reserve_val)
                .ok_or(LedgerError::Overflow)?;

            let (coll_out, reserve_draw, bad_debt) = if covered_val < amount {
                // Bad debt: the tick's collateral is fully consumed, the
                // reserve is not charged, and the shortfall is socialized
                (tick_raw_coll, 0u64, amount - tick_coll_val)
            } else {
                let needed_val = mul_div(
                    amount as u128,
                    RATIO_ONE + self.config.liquidation_bonus,
                    RATIO_ONE,
                    Rounding::Down,
                )?
                .min(u64::MAX as u128) as u64;
                if needed_val <= tick_coll_val {
                    let out = raw_coll_from_value(needed_val, price, Rounding::Down)?
                        .min(tick_raw_coll);
                    (out, 0u64, 0u64)
                } else {
                    let short_val = needed_val - tick_coll_val;
                    let draw = raw_coll_from_value(short_val.min(reserve_val), price, Rounding::Down)?
                        .min(reserve_left);
                    (tick_raw_coll, draw, 0u64)
                }
            };

            let survived_raw_debt = tick_raw_debt - amount;
            let survived_raw_coll = tick_raw_coll - coll_out;
            let new_tick = if survived_raw_debt > 0 {
                ratio_to_tick(debt_ratio(survived_raw_debt, survived_raw_coll, price)?)
            } else {
                tick
            };

            let debt_shares_out =
                debt_shares_from_raw(amount, self.indices.debt_index, Rounding::Up)?
                    .min(tick_debt_shares);
            let coll_shares_out =
                coll_shares_from_raw(coll_out, self.indices.coll_index, Rounding::Up)?
                    .min(tick_coll_shares);

            // A shortfall is socialized onto surviving debt shares; with
            // none left it has nowhere to go, so the tick stays put until
            // a call brings enough reserve. Checked before any write.
            if bad_debt > 0 && self.total_debt_shares <= debt_shares_out {
                break;
            }

            let outcome = self.tree.retire(
                tick,
                tick_coll_shares - coll_shares_out,
                tick_debt_shares - debt_shares_out,
                new_tick,
            )?;
            self.sync_after_retire(tick, outcome.survivor, &mut events)?;

            self.total_debt_shares = self.total_debt_shares.saturating_sub(debt_shares_out);
            self.total_coll_shares = self.total_coll_shares.saturating_sub(coll_shares_out);

            if bad_debt > 0 {
                self.indices.debt_index = socialize_bad_debt(
                    self.indices.debt_index,
                    bad_debt,
                    self.total_debt_shares,
                )?;
                bad_debt_total = bad_debt_total
                    .checked_add(bad_debt)
                    .ok_or(LedgerError::Overflow)?;
                events.push(LedgerEvent::BadDebtSocialized {
                    raw_bad_debt: bad_debt,
                    new_debt_index: self.indices.debt_index,
                });
            }

            reserve_left -= reserve_draw;
            reserve_used = reserve_used
                .checked_add(reserve_draw)
                .ok_or(LedgerError::Overflow)?;
            budget -= amount;
            coll_seized = coll_seized
                .checked_add(coll_out)
                .ok_or(LedgerError::Overflow)?;
            ticks_processed += 1;
            events.push(LedgerEvent::TickLiquidated {
                tick,
                raw_debt_liquidated: amount,
                raw_coll_seized: coll_out,
                reserve_used: reserve_draw,
                survivor_tick: (survived_raw_debt > 0).then_some(new_tick),
            });

            cursor = tick;
        }

        if ticks_processed == 0 {
            return Err(LedgerError::NothingToProcess);
        }

        Ok(LiquidateOutcome {
            raw_debt_liquidated: max_raw_debt_in - budget,
            raw_coll_seized: coll_seized,
            reserve_used,
            raw_bad_debt: bad_debt_total,
            ticks_processed,
            events,
        })
    }

    // ========================================================================
    // Index-only adjustments
    // ========================================================================

    /// Remove `raw` collateral value from all shares simultaneously by
    /// raising the collateral index. No position traversal.
    pub fn reduce_collateral(
        &mut self,
        env: &mut dyn LedgerEnv,
        caller: Address,
        raw: u64,
        now: u64,
    ) -> LedgerResult<Vec<LedgerEvent>> {
        self.ensure_facade(caller)?;
        if raw == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        self.with_index_rollback(|pool| pool.reduce_collateral_inner(env, raw, now))
    }

    fn reduce_collateral_inner(
        &mut self,
        env: &mut dyn LedgerEnv,
        raw: u64,
        now: u64,
    ) -> LedgerResult<Vec<LedgerEvent>> {
        let mut events = Vec::new();
        self.accrue(env, now, &mut events)?;

        let total = self.total_raw_coll()?;
        if raw >= total {
            return Err(LedgerError::InsufficientCollateral {
                available: total,
                requested: raw,
            });
        }
        self.indices.coll_index = accrue_coll_index(self.indices.coll_index, total, raw)?;
        events.push(LedgerEvent::CollateralReduced {
            raw_amount: raw,
            new_coll_index: self.indices.coll_index,
        });
        Ok(events)
    }

    /// Forgive `raw` debt across all shares simultaneously by lowering the
    /// debt index. Capped per call; the one sanctioned downward index move.
    pub fn reduce_debt(
        &mut self,
        env: &mut dyn LedgerEnv,
        caller: Address,
        raw: u64,
        now: u64,
    ) -> LedgerResult<Vec<LedgerEvent>> {
        self.ensure_facade(caller)?;
        if raw == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        self.with_index_rollback(|pool| pool.reduce_debt_inner(env, raw, now))
    }

    fn reduce_debt_inner(
        &mut self,
        env: &mut dyn LedgerEnv,
        raw: u64,
        now: u64,
    ) -> LedgerResult<Vec<LedgerEvent>> {
        let mut events = Vec::new();
        self.accrue(env, now, &mut events)?;

        let total = self.total_raw_debt()?;
        let cap = mul_div(
            total as u128,
            limits::MAX_DEBT_REDUCTION_BPS as u128,
            BPS_DENOMINATOR as u128,
            Rounding::Down,
        )?
        .min(u64::MAX as u128) as u64;
        if raw > cap {
            return Err(LedgerError::ReductionExceedsCap { requested: raw, cap });
        }
        self.indices.debt_index = mul_div(
            self.indices.debt_index,
            (total - raw) as u128,
            total as u128,
            Rounding::Up,
        )?;
        events.push(LedgerEvent::DebtForgiven {
            raw_amount: raw,
            new_debt_index: self.indices.debt_index,
        });
        Ok(events)
    }
}
