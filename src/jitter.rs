//! Jitter for retry delays.
//!
//! - `None`: deterministic delays, for tests.
//! - `Additive`: adds a uniform random amount in `[0, max]` on top of the backoff delay, so
//!   clients that failed together do not retry together. The upstream client uses half of the
//!   backoff base as `max`.
//!
//! RNG: `rand`'s thread-local generator; [`Jitter::apply_with_rng`] accepts a seeded one.

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Use the backoff delay unchanged.
    #[default]
    None,
    /// Add a uniform random amount in `[0, max]`.
    Additive { max: Duration },
}

impl Jitter {
    /// Uniform extra delay of up to `max`.
    pub fn up_to(max: Duration) -> Self {
        Jitter::Additive { max }
    }

    /// Uniform extra delay of up to half of `base`.
    pub fn half_of(base: Duration) -> Self {
        Jitter::Additive { max: base / 2 }
    }

    /// Apply jitter to a delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a caller-provided RNG.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Additive { max } => {
                let max_millis: u64 = max.as_millis().try_into().unwrap_or(u64::MAX);
                if max_millis == 0 {
                    return delay;
                }
                let extra = rng.random_range(0..=max_millis);
                delay.saturating_add(Duration::from_millis(extra))
            }
        }
    }
}
