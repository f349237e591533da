//! Tick Tree (ratio-chain ledger)
//!
//! A forest of lazily-compressed tick nodes held in an arena and addressed
//! by integer handle. Each tick has exactly one *current* node holding the
//! live share totals for everything bucketed there. When a tick is
//! partially drained (rebalance/liquidate/redeem), the current node is
//! retired: it records the fraction of its original shares that survived
//! and points at the node the survivors moved to. A position's live shares
//! are its original shares times the ratio product along the chain to the
//! root; `resolve` computes that product and path-compresses as it goes,
//! union-find style, so repeated lookups are O(1) amortized.
//!
//! Any code path that reads a possibly-retired node's shares must go
//! through `resolve`/`peek`, never the stored share fields.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use tidepool_common::constants::precision::RATIO_ONE;
use tidepool_common::math::{mul_div, ratio_of};
use tidepool_common::{BTreeMap, LedgerError, LedgerResult, NodeId, Rounding, Tick, Vec};

/// One tick-bucket instance.
///
/// While current: `coll_shares`/`debt_shares` are live totals and the
/// ratios are identity. Once retired: the share fields freeze at their
/// pre-retirement values and the ratios hold `survived / original`
/// relative to the parent (cumulative to the root after compression).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct TickNode {
    /// Where the survivors went; None for live roots and dead ends
    pub parent: Option<NodeId>,
    /// Tick this node was created for
    pub tick: Tick,
    /// Collateral survival ratio (1e18; identity while live)
    pub coll_ratio: u128,
    /// Debt survival ratio (1e18; identity while live)
    pub debt_ratio: u128,
    /// Collateral shares (live total, frozen at retirement)
    pub coll_shares: u64,
    /// Debt shares (live total, frozen at retirement)
    pub debt_shares: u64,
    /// True once this node has been retired
    pub retired: bool,
}

/// Result of resolving a node's ratio chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    /// Chain root: a live current node, or a retired dead end
    pub root: NodeId,
    /// Cumulative collateral ratio along the full chain (root included)
    pub coll_ratio: u128,
    /// Cumulative debt ratio along the full chain (root included)
    pub debt_ratio: u128,
}

/// Outcome of retiring a tick's current node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetireOutcome {
    /// The node that was retired
    pub retired: NodeId,
    /// Fresh current node created for the drained tick
    pub fresh: NodeId,
    /// Node the survivors were re-inserted into, if any debt survived
    pub survivor: Option<NodeId>,
}

/// Arena of tick nodes plus the current-node index
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct TickTree {
    nodes: Vec<TickNode>,
    current: BTreeMap<Tick, NodeId>,
}

impl TickTree {
    /// Empty tree
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, tick: Tick) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(TickNode {
            parent: None,
            tick,
            coll_ratio: RATIO_ONE,
            debt_ratio: RATIO_ONE,
            coll_shares: 0,
            debt_shares: 0,
            retired: false,
        });
        id
    }

    /// Borrow a node record
    pub fn node(&self, id: NodeId) -> LedgerResult<&TickNode> {
        self.nodes
            .get(id as usize)
            .ok_or(LedgerError::NodeNotFound { node_id: id })
    }

    fn node_mut(&mut self, id: NodeId) -> LedgerResult<&mut TickNode> {
        self.nodes
            .get_mut(id as usize)
            .ok_or(LedgerError::NodeNotFound { node_id: id })
    }

    /// Current node for `tick`, if one exists
    pub fn current_node(&self, tick: Tick) -> Option<NodeId> {
        self.current.get(&tick).copied()
    }

    /// Current node for `tick`, creating it on first use
    pub fn ensure_current(&mut self, tick: Tick) -> NodeId {
        if let Some(id) = self.current.get(&tick) {
            return *id;
        }
        let id = self.alloc(tick);
        self.current.insert(tick, id);
        id
    }

    /// Add shares to a live node's totals
    pub fn add_shares(&mut self, id: NodeId, coll: u64, debt: u64) -> LedgerResult<()> {
        let node = self.node_mut(id)?;
        node.coll_shares = node.coll_shares.checked_add(coll).ok_or(LedgerError::Overflow)?;
        node.debt_shares = node.debt_shares.checked_add(debt).ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    /// Remove shares from a live node's totals.
    ///
    /// Saturating: ratio-chain rounding can leave a position's resolved
    /// shares a unit above the node total, and the dust must not wedge the
    /// bucket.
    pub fn remove_shares(&mut self, id: NodeId, coll: u64, debt: u64) -> LedgerResult<()> {
        let node = self.node_mut(id)?;
        node.coll_shares = node.coll_shares.saturating_sub(coll);
        node.debt_shares = node.debt_shares.saturating_sub(debt);
        Ok(())
    }

    /// Walk the parent chain accumulating ratio products, path-compressing
    /// every visited node so future resolutions are O(1).
    pub fn resolve(&mut self, id: NodeId) -> LedgerResult<Resolved> {
        let mut chain: Vec<NodeId> = Vec::new();
        let mut cursor = id;
        loop {
            let node = self.node(cursor)?;
            match node.parent {
                Some(parent) => {
                    chain.push(cursor);
                    cursor = parent;
                }
                None => break,
            }
        }
        let root = cursor;

        // Rewrite each visited node to point straight at the root, with its
        // ratio replaced by the product from itself up to (excluding) the
        // root. The root's own ratio is identity unless it is a dead end,
        // and is applied once at the end.
        let mut coll_cum = RATIO_ONE;
        let mut debt_cum = RATIO_ONE;
        for &nid in chain.iter().rev() {
            let (nc, nd) = {
                let node = self.node(nid)?;
                (node.coll_ratio, node.debt_ratio)
            };
            coll_cum = mul_div(nc, coll_cum, RATIO_ONE, Rounding::Down)?;
            debt_cum = mul_div(nd, debt_cum, RATIO_ONE, Rounding::Down)?;
            let node = self.node_mut(nid)?;
            node.parent = Some(root);
            node.coll_ratio = coll_cum;
            node.debt_ratio = debt_cum;
        }

        // The last rewrite handled the starting node, so its stored ratio
        // is now the full product up to (excluding) the root.
        let (start_coll, start_debt) = if chain.is_empty() {
            (RATIO_ONE, RATIO_ONE)
        } else {
            let node = self.node(chain[0])?;
            (node.coll_ratio, node.debt_ratio)
        };

        let root_node = self.node(root)?;
        Ok(Resolved {
            root,
            coll_ratio: mul_div(start_coll, root_node.coll_ratio, RATIO_ONE, Rounding::Down)?,
            debt_ratio: mul_div(start_debt, root_node.debt_ratio, RATIO_ONE, Rounding::Down)?,
        })
    }

    /// Read-only chain resolution for external views
    pub fn peek(&self, id: NodeId) -> LedgerResult<Resolved> {
        let mut coll = RATIO_ONE;
        let mut debt = RATIO_ONE;
        let mut cursor = id;
        loop {
            let node = self.node(cursor)?;
            coll = mul_div(coll, node.coll_ratio, RATIO_ONE, Rounding::Down)?;
            debt = mul_div(debt, node.debt_ratio, RATIO_ONE, Rounding::Down)?;
            match node.parent {
                Some(parent) => cursor = parent,
                None => {
                    return Ok(Resolved {
                        root: cursor,
                        coll_ratio: coll,
                        debt_ratio: debt,
                    })
                }
            }
        }
    }

    /// Retire `tick`'s current node after a partial drain.
    ///
    /// `survived_*` are the share totals that remain after the drain; the
    /// retiring node records `survived / original` and, when debt
    /// survives, the survivors are re-inserted into `new_tick`'s current
    /// node (which may be the fresh node for the same tick). With no
    /// surviving debt the node becomes a parentless dead end and any
    /// surviving collateral stays parked on it, claimed as positions
    /// resolve against it.
    pub fn retire(
        &mut self,
        tick: Tick,
        survived_coll: u64,
        survived_debt: u64,
        new_tick: Tick,
    ) -> LedgerResult<RetireOutcome> {
        let old = self
            .current_node(tick)
            .ok_or(LedgerError::TickVacant { tick })?;

        let (orig_coll, orig_debt) = {
            let node = self.node(old)?;
            (node.coll_shares, node.debt_shares)
        };
        if survived_coll > orig_coll || survived_debt > orig_debt {
            return Err(LedgerError::Underflow);
        }

        let coll_ratio = ratio_of(survived_coll, orig_coll, Rounding::Down)?;
        let debt_ratio = ratio_of(survived_debt, orig_debt, Rounding::Down)?;

        // Fresh current node receives future deposits for this tick
        self.current.remove(&tick);
        let fresh = self.alloc(tick);
        self.current.insert(tick, fresh);

        let survivor = if survived_debt > 0 {
            let dest = self.ensure_current(new_tick);
            self.add_shares(dest, survived_coll, survived_debt)?;
            Some(dest)
        } else {
            None
        };

        let node = self.node_mut(old)?;
        node.retired = true;
        node.coll_ratio = coll_ratio;
        node.debt_ratio = debt_ratio;
        node.parent = survivor;

        Ok(RetireOutcome {
            retired: old,
            fresh,
            survivor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HALF: u128 = RATIO_ONE / 2;

    #[test]
    fn live_node_resolves_to_itself() {
        let mut tree = TickTree::new();
        let id = tree.ensure_current(10);
        tree.add_shares(id, 100, 50).unwrap();

        let r = tree.resolve(id).unwrap();
        assert_eq!(r.root, id);
        assert_eq!(r.coll_ratio, RATIO_ONE);
        assert_eq!(r.debt_ratio, RATIO_ONE);
    }

    #[test]
    fn retire_moves_survivors_and_links_parent() {
        let mut tree = TickTree::new();
        let old = tree.ensure_current(10);
        tree.add_shares(old, 1_000, 800).unwrap();

        // Half of everything survives and moves to tick 8
        let out = tree.retire(10, 500, 400, 8).unwrap();
        assert_eq!(out.retired, old);

        let dest = out.survivor.unwrap();
        assert_eq!(tree.current_node(8), Some(dest));
        assert_eq!(tree.node(dest).unwrap().coll_shares, 500);
        assert_eq!(tree.node(dest).unwrap().debt_shares, 400);

        // Fresh node replaces the old one for tick 10
        let fresh = tree.current_node(10).unwrap();
        assert_ne!(fresh, old);
        assert_eq!(tree.node(fresh).unwrap().debt_shares, 0);

        // A position holding 100/80 in the old node resolves to 50/40
        let r = tree.resolve(old).unwrap();
        assert_eq!(r.root, dest);
        assert_eq!(r.coll_ratio, HALF);
        assert_eq!(r.debt_ratio, HALF);
    }

    #[test]
    fn chain_products_accumulate() {
        let mut tree = TickTree::new();
        let a = tree.ensure_current(10);
        tree.add_shares(a, 1_000, 1_000).unwrap();
        tree.retire(10, 500, 500, 8).unwrap();

        // Second drain on tick 8 halves the survivors again
        let b = tree.current_node(8).unwrap();
        assert_eq!(tree.node(b).unwrap().debt_shares, 500);
        tree.retire(8, 250, 250, 6).unwrap();

        // Original node's chain: 1/2 * 1/2 = 1/4
        let r = tree.peek(a).unwrap();
        assert_eq!(r.coll_ratio, RATIO_ONE / 4);
        assert_eq!(r.debt_ratio, RATIO_ONE / 4);
        assert_eq!(r.root, tree.current_node(6).unwrap());
    }

    #[test]
    fn compression_preserves_values_and_flattens() {
        let mut tree = TickTree::new();
        let a = tree.ensure_current(10);
        tree.add_shares(a, 1_000, 1_000).unwrap();
        tree.retire(10, 500, 500, 8).unwrap();
        tree.retire(8, 250, 250, 6).unwrap();
        tree.retire(6, 125, 125, 4).unwrap();

        let before = tree.peek(a).unwrap();
        let resolved = tree.resolve(a).unwrap();
        assert_eq!(resolved, before);

        // After compression the node points straight at the root
        assert_eq!(tree.node(a).unwrap().parent, Some(resolved.root));
        let again = tree.peek(a).unwrap();
        assert_eq!(again, before);
    }

    #[test]
    fn dead_end_keeps_surviving_collateral() {
        let mut tree = TickTree::new();
        let a = tree.ensure_current(10);
        tree.add_shares(a, 1_000, 800).unwrap();

        // All debt drained, 10% of collateral survives
        let out = tree.retire(10, 100, 0, 10).unwrap();
        assert_eq!(out.survivor, None);

        let node = tree.node(a).unwrap();
        assert!(node.retired);
        assert_eq!(node.parent, None);

        let r = tree.resolve(a).unwrap();
        assert_eq!(r.root, a);
        assert_eq!(r.coll_ratio, RATIO_ONE / 10);
        assert_eq!(r.debt_ratio, 0);
    }

    #[test]
    fn retire_vacant_tick_fails() {
        let mut tree = TickTree::new();
        assert!(matches!(
            tree.retire(10, 0, 0, 10),
            Err(LedgerError::TickVacant { tick: 10 })
        ));
    }

    #[test]
    fn survivors_can_land_in_same_tick() {
        let mut tree = TickTree::new();
        let old = tree.ensure_current(10);
        tree.add_shares(old, 1_000, 800).unwrap();

        let out = tree.retire(10, 900, 700, 10).unwrap();
        // Survivors land in the fresh node for the same tick
        assert_eq!(out.survivor, Some(out.fresh));
        assert_eq!(tree.current_node(10), Some(out.fresh));
        assert_eq!(tree.node(out.fresh).unwrap().debt_shares, 700);
    }
}
