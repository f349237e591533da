//! Error Types for the Tidepool Ledger
//!
//! Every detected violation aborts the whole operation; there is no
//! warning tier and nothing is retried internally.

/// Result type alias for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Main error enum for all ledger errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    // ============ Bound Violations ============
    /// Resulting debt ratio above the configured maximum
    DebtRatioTooHigh { ratio: u128, max_ratio: u128 },

    /// Resulting debt ratio below the configured minimum
    DebtRatioTooLow { ratio: u128, min_ratio: u128 },

    /// Position is at or above the liquidation ratio; collateral
    /// withdrawal and further borrowing are blocked
    PositionLiquidatable { ratio: u128, liquidation_ratio: u128 },

    /// Not enough collateral shares to withdraw the requested amount
    InsufficientCollateral { available: u64, requested: u64 },

    /// Not enough debt shares to repay the requested amount
    InsufficientDebt { available: u64, requested: u64 },

    /// Amount below minimum threshold
    BelowMinimum { amount: u64, minimum: u64 },

    /// Zero amount where a non-zero amount is required
    ZeroAmount,

    // ============ Authorization Failures ============
    /// Caller is not the authorized pool facade
    UnauthorizedCaller { expected: [u8; 32], actual: [u8; 32] },

    /// Effective user is not the recorded position owner
    NotPositionOwner { owner: [u8; 32], actual: [u8; 32] },

    /// Borrowing is currently disabled by configuration
    BorrowPaused,

    // ============ Pool-State Failures ============
    /// Aggregate debt value meets or exceeds aggregate collateral value;
    /// redemption is disallowed
    PoolUndercollateralized { debt_value: u64, coll_value: u64 },

    /// Requested index reduction exceeds the per-call cap
    ReductionExceedsCap { requested: u64, cap: u64 },

    /// Sweep found no tick eligible for processing
    NothingToProcess,

    /// Position not found with given id
    PositionNotFound { position_id: u32 },

    /// Tick has no current node with debt
    TickVacant { tick: i32 },

    /// Tick node not found in the arena
    NodeNotFound { node_id: u32 },

    // ============ Arithmetic Impossibilities ============
    /// Arithmetic overflow occurred
    Overflow,

    /// Arithmetic underflow occurred
    Underflow,

    /// Division by zero
    DivisionByZero,

    /// Funding charge would consume the pool's entire collateral even
    /// after clamping; fatal configuration error
    FundingExceedsCollateral { charge: u64, total_raw_coll: u64 },

    /// Ratio maps outside the representable tick range
    TickOutOfRange { tick: i32 },

    /// Invalid configuration parameter
    InvalidConfig { param: &'static str, reason: &'static str },
}

impl LedgerError {
    /// Returns a stable error code for logging/debugging
    pub fn code(&self) -> &'static str {
        match self {
            Self::DebtRatioTooHigh { .. } => "E001_RATIO_TOO_HIGH",
            Self::DebtRatioTooLow { .. } => "E002_RATIO_TOO_LOW",
            Self::PositionLiquidatable { .. } => "E003_LIQUIDATABLE",
            Self::InsufficientCollateral { .. } => "E004_INSUFFICIENT_COLL",
            Self::InsufficientDebt { .. } => "E005_INSUFFICIENT_DEBT",
            Self::BelowMinimum { .. } => "E006_BELOW_MINIMUM",
            Self::ZeroAmount => "E008_ZERO_AMOUNT",
            Self::UnauthorizedCaller { .. } => "E020_UNAUTHORIZED",
            Self::NotPositionOwner { .. } => "E021_NOT_OWNER",
            Self::BorrowPaused => "E022_BORROW_PAUSED",
            Self::PoolUndercollateralized { .. } => "E030_POOL_UNDERCOLL",
            Self::ReductionExceedsCap { .. } => "E031_REDUCTION_CAP",
            Self::NothingToProcess => "E032_NOTHING_TO_PROCESS",
            Self::PositionNotFound { .. } => "E033_POSITION_NOT_FOUND",
            Self::TickVacant { .. } => "E034_TICK_VACANT",
            Self::NodeNotFound { .. } => "E035_NODE_NOT_FOUND",
            Self::Overflow => "E080_OVERFLOW",
            Self::Underflow => "E081_UNDERFLOW",
            Self::DivisionByZero => "E082_DIV_ZERO",
            Self::FundingExceedsCollateral { .. } => "E083_FUNDING_EXCEEDS",
            Self::TickOutOfRange { .. } => "E084_TICK_OUT_OF_RANGE",
            Self::InvalidConfig { .. } => "E090_INVALID_CONFIG",
        }
    }

    /// Returns true if this error is recoverable (caller can fix it)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::DebtRatioTooHigh { .. } => true,  // Add collateral
            Self::DebtRatioTooLow { .. } => true,   // Borrow more or withdraw
            Self::InsufficientCollateral { .. } => true,
            Self::InsufficientDebt { .. } => true,
            Self::BelowMinimum { .. } => true,
            Self::BorrowPaused => true,             // Wait for config change
            Self::NothingToProcess => true,
            _ => false,
        }
    }
}
