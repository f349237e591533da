//! End-to-end scenarios exercising the full ledger: multiple positions,
//! tick retirements, funding accrual, and the conservation properties that
//! must hold across any mix of operations.

use proptest::prelude::*;

use tidepool_common::constants::funding::SECONDS_PER_YEAR;
use tidepool_common::constants::precision::RATIO_ONE;
use tidepool_common::constants::ticks::{MAX_TICK, MIN_TICK};
use tidepool_common::{Address, Box, Delta, LedgerError, Tick};

use crate::bitmap::TickBitmap;
use crate::collaborators::test_env::TestEnv;
use crate::funding::LongPoolFunding;
use crate::pool::{OperateOutcome, OperateRequest, PoolConfig, PoolLedger, RebalanceTarget};
use crate::tick::{ratio_to_tick, tick_to_ratio};

const FACADE: Address = [0xFA; 32];
const ALICE: Address = [0xA1; 32];
const BOB: Address = [0xB0; 32];
const CAROL: Address = [0xC0; 32];

/// 1 collateral unit is worth 1500 debt units
const PRICE: u128 = 1_500 * RATIO_ONE;

fn config() -> PoolConfig {
    PoolConfig {
        min_position_debt: 1_000,
        dust_tick_debt: 10,
        ..PoolConfig::new(1, FACADE)
    }
}

fn ledger() -> PoolLedger {
    PoolLedger::new(config(), Box::new(LongPoolFunding { pool_id: 1 }), 0).unwrap()
}

fn open(
    pool: &mut PoolLedger,
    env: &mut TestEnv,
    user: Address,
    coll: u64,
    debt: u64,
    now: u64,
) -> OperateOutcome {
    pool.operate(
        env,
        OperateRequest {
            caller: FACADE,
            user,
            position: None,
            coll_delta: Delta::Add(coll),
            debt_delta: Delta::Add(debt),
            now,
        },
    )
    .unwrap()
}

fn close(pool: &mut PoolLedger, env: &mut TestEnv, id: u32, user: Address) -> OperateOutcome {
    pool.operate(
        env,
        OperateRequest {
            caller: FACADE,
            user,
            position: Some(id),
            coll_delta: Delta::RemoveAll,
            debt_delta: Delta::RemoveAll,
            now: 0,
        },
    )
    .unwrap()
}

fn set_prices(env: &mut TestEnv, price: u128) {
    env.exchange_price = price;
    env.liquidate_price = price;
    env.redeem_price = price;
}

/// Sum of live position values, for conservation checks
fn live_totals(pool: &PoolLedger, ids: &[u32], price: u128) -> (u64, u64) {
    let mut coll = 0u64;
    let mut debt = 0u64;
    for &id in ids {
        let snap = pool.position_snapshot(id, price).unwrap();
        coll += snap.raw_coll;
        debt += snap.raw_debt;
    }
    (coll, debt)
}

// ============================================================================
// Band enforcement
// ============================================================================

#[test]
fn debt_ratio_band_is_enforced_at_open() {
    let mut pool = ledger();
    let mut env = TestEnv::at_price(PRICE);

    // 1000 collateral is worth 1.5M: the [50%, 85.7%] band allows debt in
    // [750_000, 1_285_500]
    let err = pool
        .operate(
            &mut env,
            OperateRequest {
                caller: FACADE,
                user: ALICE,
                position: None,
                coll_delta: Delta::Add(1_000),
                debt_delta: Delta::Add(700_000),
                now: 0,
            },
        )
        .unwrap_err();
    assert!(matches!(err, LedgerError::DebtRatioTooLow { .. }));

    let err = pool
        .operate(
            &mut env,
            OperateRequest {
                caller: FACADE,
                user: ALICE,
                position: None,
                coll_delta: Delta::Add(1_000),
                debt_delta: Delta::Add(1_300_000),
                now: 0,
            },
        )
        .unwrap_err();
    assert!(matches!(err, LedgerError::DebtRatioTooHigh { .. }));

    let out = open(&mut pool, &mut env, ALICE, 1_000, 750_000, 0);
    assert_eq!(out.debt_ratio, Some(RATIO_ONE / 2));
}

// ============================================================================
// Funding
// ============================================================================

#[test]
fn one_year_of_funding_shrinks_withdrawals() {
    let mut pool = ledger();
    let mut env = TestEnv::at_price(PRICE);
    env.funding_ratio = RATIO_ONE / 20; // 5% annualized

    let out = open(&mut pool, &mut env, ALICE, 100_000, 100_000_000, 0);

    // A year later the same shares redeem to ~95% of the deposit
    let closed = pool
        .operate(
            &mut env,
            OperateRequest {
                caller: FACADE,
                user: ALICE,
                position: Some(out.position_id),
                coll_delta: Delta::RemoveAll,
                debt_delta: Delta::RemoveAll,
                now: SECONDS_PER_YEAR,
            },
        )
        .unwrap();

    let returned = (-closed.raw_coll_delta) as u64;
    assert!(
        (94_990..=95_000).contains(&returned),
        "returned {returned} raw collateral"
    );
    // Repayment is unaffected by the collateral index
    assert_eq!(closed.raw_debt_delta, -100_000_000);
}

// ============================================================================
// Redemption
// ============================================================================

#[test]
fn redemption_cap_binds_per_call() {
    let mut pool = ledger();
    let mut env = TestEnv::at_price(PRICE);
    open(&mut pool, &mut env, ALICE, 1_000, 1_200_000, 0);

    // The 80% per-tick cap holds for the whole call: even with budget
    // left over, the survivor bucket is not tapped a second time
    let out = pool.redeem(&mut env, FACADE, 1_000_000, true, 0).unwrap();
    assert_eq!(out.raw_debt_redeemed, 960_000);
    assert_eq!(out.ticks_processed, 1);

    // The remainder is available to the next call
    let out = pool.redeem(&mut env, FACADE, 40_000, true, 0).unwrap();
    assert_eq!(out.raw_debt_redeemed, 40_000);
    assert_eq!(out.ticks_processed, 1);
}

#[test]
fn redemption_hits_positions_pro_rata() {
    let mut pool = ledger();
    let mut env = TestEnv::at_price(PRICE);
    // Same ratio, same tick, same bucket: Alice holds 2x Bob's stake
    let a = open(&mut pool, &mut env, ALICE, 1_000, 1_200_000, 0);
    let b = open(&mut pool, &mut env, BOB, 500, 600_000, 0);

    let out = pool.redeem(&mut env, FACADE, 200_000, true, 0).unwrap();
    assert_eq!(out.raw_debt_redeemed, 200_000);

    let alice = pool.position_snapshot(a.position_id, PRICE).unwrap();
    let bob = pool.position_snapshot(b.position_id, PRICE).unwrap();

    // 200k drained from 1.8M: each keeps 8/9 of their debt
    assert!((1_066_664..=1_066_667).contains(&alice.raw_debt));
    assert!((533_332..=533_334).contains(&bob.raw_debt));

    let total = pool.pool_snapshot().unwrap().total_raw_debt;
    let live = alice.raw_debt + bob.raw_debt;
    assert!(total.abs_diff(live) <= 4, "total {total} vs live {live}");
}

// ============================================================================
// Retirement chains
// ============================================================================

#[test]
fn position_survives_multiple_retirements() {
    let mut pool = ledger();
    let mut env = TestEnv::at_price(PRICE);
    let a = open(&mut pool, &mut env, ALICE, 1_000, 1_200_000, 0);

    // First retirement: redemption
    pool.redeem(&mut env, FACADE, 100_000, true, 0).unwrap();

    // Second retirement: rebalance after a price drop
    set_prices(&mut env, 1_300 * RATIO_ONE);
    pool.rebalance(&mut env, FACADE, RebalanceTarget::Sweep, 500_000, 0)
        .unwrap();

    // The untouched position resolves through both retirements and can
    // still be closed cleanly
    let snap = pool.position_snapshot(a.position_id, 1_300 * RATIO_ONE).unwrap();
    assert!(snap.raw_debt < 1_100_000 && snap.raw_debt > 0);
    assert!(snap.raw_coll < 1_000 && snap.raw_coll > 0);

    let closed = close(&mut pool, &mut env, a.position_id, ALICE);
    assert_eq!(closed.tick, None);

    // Only dust may remain in the pool afterwards
    let totals = pool.pool_snapshot().unwrap();
    assert!(totals.total_raw_debt <= 4, "residual debt {}", totals.total_raw_debt);
    assert!(totals.total_raw_coll <= 4, "residual coll {}", totals.total_raw_coll);
}

#[test]
fn conservation_across_mixed_operations() {
    let mut pool = ledger();
    let mut env = TestEnv::at_price(PRICE);
    let a = open(&mut pool, &mut env, ALICE, 1_000, 1_200_000, 0); // 80%
    let b = open(&mut pool, &mut env, BOB, 2_000, 1_500_000, 0); // 50%
    let c = open(&mut pool, &mut env, CAROL, 1_500, 1_170_000, 0); // 52%
    let ids = [a.position_id, b.position_id, c.position_id];

    pool.redeem(&mut env, FACADE, 100_000, true, 0).unwrap();

    set_prices(&mut env, 1_300 * RATIO_ONE);
    pool.rebalance(&mut env, FACADE, RebalanceTarget::Sweep, 500_000, 0)
        .unwrap();

    // Bob repays some debt through the ordinary path
    pool.operate(
        &mut env,
        OperateRequest {
            caller: FACADE,
            user: BOB,
            position: Some(b.position_id),
            coll_delta: Delta::None,
            debt_delta: Delta::Remove(100_000),
            now: 0,
        },
    )
    .unwrap();

    // Live position values must agree with pool totals up to per-position
    // rounding dust
    let totals = pool.pool_snapshot().unwrap();
    let (live_coll, live_debt) = live_totals(&pool, &ids, 1_300 * RATIO_ONE);
    assert!(
        totals.total_raw_debt.abs_diff(live_debt) <= 6,
        "debt {} vs {}",
        totals.total_raw_debt,
        live_debt
    );
    assert!(
        totals.total_raw_coll.abs_diff(live_coll) <= 6,
        "coll {} vs {}",
        totals.total_raw_coll,
        live_coll
    );
}

// ============================================================================
// Liquidation
// ============================================================================

#[test]
fn socialized_debt_lands_on_every_survivor() {
    let mut pool = ledger();
    let mut env = TestEnv::at_price(PRICE);
    let a = open(&mut pool, &mut env, ALICE, 1_000, 1_200_000, 0); // 80%
    let b = open(&mut pool, &mut env, BOB, 2_000, 1_500_000, 0); // 50%
    let c = open(&mut pool, &mut env, CAROL, 1_000, 750_000, 0); // 50%

    // Crash: Alice's 1M of collateral value no longer covers 1.2M of debt
    set_prices(&mut env, 1_000 * RATIO_ONE);
    let out = pool.liquidate(&mut env, FACADE, 2_000_000, 0, 0).unwrap();
    assert_eq!(out.raw_bad_debt, 200_000);
    assert_eq!(pool.position_snapshot(a.position_id, PRICE).unwrap().raw_debt, 0);

    // 200k spread over 2.25M of surviving shares: ~8.9% each
    let bob = pool.position_snapshot(b.position_id, PRICE).unwrap();
    let carol = pool.position_snapshot(c.position_id, PRICE).unwrap();
    assert!((1_633_000..=1_634_000).contains(&bob.raw_debt), "bob {}", bob.raw_debt);
    assert!((816_000..=817_000).contains(&carol.raw_debt), "carol {}", carol.raw_debt);

    let total = pool.pool_snapshot().unwrap().total_raw_debt;
    assert!(total.abs_diff(bob.raw_debt + carol.raw_debt) <= 4);
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// Opening then immediately closing a position never pays out more
    /// collateral than was deposited.
    #[test]
    fn open_close_never_creates_value(
        coll in 100u64..10_000,
        ratio_pct in 55u64..85,
    ) {
        let mut pool = ledger();
        let mut env = TestEnv::at_price(PRICE);
        let debt = coll * 1_500 * ratio_pct / 100;

        let out = open(&mut pool, &mut env, ALICE, coll, debt, 0);
        let closed = close(&mut pool, &mut env, out.position_id, ALICE);

        let returned = (-closed.raw_coll_delta) as u64;
        prop_assert!(returned <= coll);
        prop_assert!(returned + 2 >= coll, "lost more than dust: {returned} of {coll}");
        prop_assert_eq!((-closed.raw_debt_delta) as u64, debt);
    }

    /// A ratio always maps into the tick whose upper bound covers it.
    #[test]
    fn tick_assignment_is_tight(ratio in 1u128..=2_000_000_000_000_000_000) {
        let tick = ratio_to_tick(ratio);
        prop_assert!(tick_to_ratio(tick) >= ratio);
        if tick > MIN_TICK {
            prop_assert!(tick_to_ratio(tick - 1) < ratio);
        }
    }

    /// Bitmap scans agree with a naive linear search.
    #[test]
    fn bitmap_scan_matches_naive(
        ticks in proptest::collection::btree_set(MIN_TICK..=MAX_TICK, 0..40),
        query in MIN_TICK..=MAX_TICK,
    ) {
        let mut bm = TickBitmap::new();
        for &t in &ticks {
            bm.set(t).unwrap();
        }
        let expected: Option<Tick> = ticks.iter().rev().copied().find(|&t| t <= query);
        prop_assert_eq!(bm.next_occupied_at_or_below(query).unwrap(), expected);
    }

    /// Per-tick share totals never go negative no matter how a bucket is
    /// drained and re-filled.
    #[test]
    fn repeated_redemptions_terminate(amounts in proptest::collection::vec(1_000u64..200_000, 1..6)) {
        let mut pool = ledger();
        let mut env = TestEnv::at_price(PRICE);
        open(&mut pool, &mut env, ALICE, 1_000, 1_200_000, 0);

        for amount in amounts {
            // Later passes may find nothing left above dust; both outcomes
            // are acceptable, wedging is not
            match pool.redeem(&mut env, FACADE, amount, true, 0) {
                Ok(out) => prop_assert!(out.raw_debt_redeemed <= amount),
                Err(LedgerError::NothingToProcess) => {}
                Err(e) => prop_assert!(false, "unexpected {:?}", e),
            }
        }

        let totals = pool.pool_snapshot().unwrap();
        prop_assert!(totals.total_raw_debt <= 1_200_000);
    }
}
