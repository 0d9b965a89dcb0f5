//! Correlation tokens for asynchronous transport callbacks.
//!
//! Every transmitted part carries two tokens: one the transport reports back
//! when the part is sent, one when it is delivered. Call sites depend only on
//! [`TokenSource`], so the issuing scheme can be swapped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Identifier matching a transport callback to the part that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(pub u64);

impl std::fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Issues correlation tokens.
pub trait TokenSource: Send + Sync {
    /// Return a fresh token.
    fn issue(&self) -> CorrelationToken;
}

/// Pseudo-random tokens.
///
/// Collisions between in-flight tokens are possible, if unlikely; nothing
/// here detects or retries them.
#[derive(Debug)]
pub struct RandomTokens {
    rng: Mutex<StdRng>,
}

impl RandomTokens {
    /// Seed from OS entropy.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic sequence for a given seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomTokens {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenSource for RandomTokens {
    fn issue(&self) -> CorrelationToken {
        match self.rng.lock() {
            Ok(mut rng) => CorrelationToken(rng.gen()),
            Err(_) => CorrelationToken(rand::thread_rng().gen()),
        }
    }
}

/// Strictly increasing tokens; never collide within one process.
#[derive(Debug)]
pub struct SequentialTokens {
    next: AtomicU64,
}

impl SequentialTokens {
    /// Start counting at 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Start counting at `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for SequentialTokens {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenSource for SequentialTokens {
    fn issue(&self) -> CorrelationToken {
        CorrelationToken(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Which [`TokenSource`] the gateway builds from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScheme {
    /// [`RandomTokens`] seeded from entropy.
    #[default]
    Random,
    /// [`SequentialTokens`] starting at 1.
    Sequential,
}

impl TokenScheme {
    /// Build the configured token source.
    pub fn build(self) -> Box<dyn TokenSource> {
        match self {
            Self::Random => Box::new(RandomTokens::new()),
            Self::Sequential => Box::new(SequentialTokens::new()),
        }
    }
}
