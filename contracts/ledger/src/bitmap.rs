//! Tick Bitmap
//!
//! Compact occupancy bitmap over the tick space. A bit is set while the
//! tick's current node holds nonzero debt. The core traversal primitive is
//! `next_occupied_at_or_below`, which every sweep (redeem, rebalance,
//! liquidate) uses to walk ticks in strictly descending order.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use tidepool_common::constants::ticks::{MAX_TICK, MIN_TICK};
use tidepool_common::{LedgerError, LedgerResult, Tick, Vec};

/// Bits per bitmap word
const WORD_BITS: usize = 128;

/// Words covering `[MIN_TICK, MAX_TICK]`
const WORD_COUNT: usize = (MAX_TICK - MIN_TICK) as usize / WORD_BITS + 1;

/// Occupancy bitmap over the tick range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct TickBitmap {
    words: Vec<u128>,
}

impl Default for TickBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl TickBitmap {
    /// Empty bitmap covering the full tick range
    pub fn new() -> Self {
        Self {
            words: [0u128; WORD_COUNT].to_vec(),
        }
    }

    fn position(tick: Tick) -> LedgerResult<(usize, u32)> {
        if !(MIN_TICK..=MAX_TICK).contains(&tick) {
            return Err(LedgerError::TickOutOfRange { tick });
        }
        let idx = (tick - MIN_TICK) as usize;
        Ok((idx / WORD_BITS, (idx % WORD_BITS) as u32))
    }

    /// Mark `tick` occupied (idempotent)
    pub fn set(&mut self, tick: Tick) -> LedgerResult<()> {
        let (word, bit) = Self::position(tick)?;
        self.words[word] |= 1u128 << bit;
        Ok(())
    }

    /// Mark `tick` vacant (idempotent)
    pub fn clear(&mut self, tick: Tick) -> LedgerResult<()> {
        let (word, bit) = Self::position(tick)?;
        self.words[word] &= !(1u128 << bit);
        Ok(())
    }

    /// Returns true if `tick` is occupied
    pub fn is_set(&self, tick: Tick) -> LedgerResult<bool> {
        let (word, bit) = Self::position(tick)?;
        Ok(self.words[word] & (1u128 << bit) != 0)
    }

    /// Highest occupied tick `<= tick`, or None.
    ///
    /// Masks the starting word down to `tick`'s bit, then walks words
    /// strictly downward; a cleared tick is never revisited within a sweep.
    pub fn next_occupied_at_or_below(&self, tick: Tick) -> LedgerResult<Option<Tick>> {
        let (mut word, bit) = Self::position(tick.clamp(MIN_TICK, MAX_TICK))?;

        let mask = if bit == (WORD_BITS as u32 - 1) {
            u128::MAX
        } else {
            (1u128 << (bit + 1)) - 1
        };
        let mut current = self.words[word] & mask;

        loop {
            if current != 0 {
                let highest = WORD_BITS as u32 - 1 - current.leading_zeros();
                let tick = MIN_TICK + (word * WORD_BITS) as i32 + highest as i32;
                return Ok(Some(tick));
            }
            if word == 0 {
                return Ok(None);
            }
            word -= 1;
            current = self.words[word];
        }
    }
}
