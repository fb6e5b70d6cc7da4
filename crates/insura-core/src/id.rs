//! Snowflake id generation and decimal-string id serialization.
//!
//! Layout of a generated id (most significant bit first):
//!
//! ```text
//! | 1 bit unused | 41 bits ms since EPOCH_MS | 10 bits node | 12 bits sequence |
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use time::OffsetDateTime;

/// Custom epoch (2010-11-04T01:42:54.657Z), compatible with the classic snowflake layout.
pub const EPOCH_MS: i64 = 1_288_834_974_657;

const NODE_BITS: u32 = 10;
const STEP_BITS: u32 = 12;
/// Largest valid node id.
pub const MAX_NODE: i64 = (1 << NODE_BITS) - 1;
const STEP_MASK: i64 = (1 << STEP_BITS) - 1;
const TIME_SHIFT: u32 = NODE_BITS + STEP_BITS;

#[derive(Debug, Error)]
pub enum IdError {
    #[error("Snowflake node id {0} out of range 0..=1023")]
    InvalidNode(i64),
}

/// Millisecond time source for id generation.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Wall-clock time read once at construction, advanced by a monotonic
/// `Instant`. Steps of the system clock do not affect it.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor: Instant,
    anchor_ms: i64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
            anchor_ms: (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> i64 {
        self.anchor_ms + self.anchor.elapsed().as_millis() as i64
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_ms: i64,
    step: i64,
}

/// Thread-safe snowflake generator for one node.
///
/// Built once at process start and shared by `Arc`; there is no global node.
pub struct IdGenerator {
    node: i64,
    clock: Box<dyn Clock>,
    state: Mutex<GeneratorState>,
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator")
            .field("node", &self.node)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl IdGenerator {
    pub fn new(node: i64) -> Result<Self, IdError> {
        Self::with_clock(node, MonotonicClock::new())
    }

    pub fn with_clock(node: i64, clock: impl Clock + 'static) -> Result<Self, IdError> {
        if !(0..=MAX_NODE).contains(&node) {
            return Err(IdError::InvalidNode(node));
        }
        Ok(Self {
            node,
            clock: Box::new(clock),
            state: Mutex::new(GeneratorState::default()),
        })
    }

    pub fn node(&self) -> i64 {
        self.node
    }

    /// Generate the next id. Ids from one generator are strictly increasing.
    ///
    /// Never waits: once a millisecond's sequence is used up the next
    /// millisecond is taken early, so the timestamp can run ahead of the
    /// clock during a sustained burst or after the clock stepped back.
    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock();
        let mut now = self.clock.now_ms().max(state.last_ms);

        if now == state.last_ms {
            state.step = (state.step + 1) & STEP_MASK;
            if state.step == 0 {
                now += 1;
            }
        } else {
            state.step = 0;
        }
        state.last_ms = now;

        ((now - EPOCH_MS) << TIME_SHIFT) | (self.node << STEP_BITS) | state.step
    }
}

/// Serde adapter writing `i64` ids as decimal strings and accepting either a
/// string or a number on input.
pub mod as_string {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Str(String),
        Num(i64),
    }

    pub fn serialize<S: Serializer>(id: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Str(s) => s.parse().map_err(D::Error::custom),
            Repr::Num(n) => Ok(n),
        }
    }
}
