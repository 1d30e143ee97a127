//! Routing policies shared by the relay and the admission service.
//!
//! A [`Selector`] picks one of `n` targets for an identity:
//!
//! - [`RoutingPolicy::Hash`]: `hash(identity) mod n`. Deterministic: the
//!   same identity maps to the same index while `n` is unchanged.
//! - [`RoutingPolicy::RoundRobin`]: a shared atomic counter `mod n`, so
//!   concurrent callers walk the targets in cyclic order.
//! - [`RoutingPolicy::Random`]: uniform random choice. Never the default;
//!   it exists for load-spreading experiments and must be asked for by name.

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How a target is chosen for an identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingPolicy {
    /// Deterministic hash of the identity.
    #[default]
    Hash,
    /// Shared cyclic counter.
    RoundRobin,
    /// Uniform random choice.
    Random,
}

impl RoutingPolicy {
    /// Canonical selector string, as accepted by [`FromStr`].
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingPolicy::Hash => "hash",
            RoutingPolicy::RoundRobin => "round-robin",
            RoutingPolicy::Random => "random",
        }
    }
}

impl fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a policy selector is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown routing policy '{0}' (expected hash, round-robin or random)")]
pub struct UnknownPolicy(pub String);

impl FromStr for RoutingPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hash" | "hashing" => Ok(RoutingPolicy::Hash),
            "round-robin" | "round_robin" | "roundrobin" | "rr" => Ok(RoutingPolicy::RoundRobin),
            "random" => Ok(RoutingPolicy::Random),
            _ => Err(UnknownPolicy(s.to_string())),
        }
    }
}

/// Stable 64-bit hash of an identity.
///
/// `DefaultHasher::new()` uses fixed keys, so the value is the same across
/// calls and processes built from the same toolchain.
pub fn stable_hash(identity: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    identity.hash(&mut hasher);
    hasher.finish()
}

/// Index for `identity` under the hash policy, or `None` when `n == 0`.
pub fn hash_index(identity: &str, n: usize) -> Option<usize> {
    let n = u64::try_from(n).ok().filter(|n| *n > 0)?;
    usize::try_from(stable_hash(identity) % n).ok()
}

/// Picks target indices under any policy.
///
/// One selector is shared by every caller of a component so that the
/// round-robin counter is global to it.
#[derive(Debug, Default)]
pub struct Selector {
    counter: AtomicUsize,
}

impl Selector {
    /// Creates a selector with its counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Chooses an index in `0..n` for `identity`, or `None` if `n == 0`.
    pub fn select(&self, policy: RoutingPolicy, identity: &str, n: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }

        match policy {
            RoutingPolicy::Hash => hash_index(identity, n),
            RoutingPolicy::RoundRobin => Some(self.counter.fetch_add(1, Ordering::Relaxed) % n),
            RoutingPolicy::Random => Some(rand::rng().random_range(0..n)),
        }
    }
}
