//! Random number provider abstraction.
//!
//! The server only needs randomness to seed the association group counter,
//! but goes through a provider so tests can pin the seed.

use std::cell::RefCell;
use std::sync::{Arc, Mutex, PoisonError};

use rand::distr::{Distribution, StandardUniform};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Provider trait for random number generation.
pub trait RandomProvider: Clone {
    /// Generate a random value of type T.
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>;
}

/// Production random provider backed by the thread-local RNG.
///
/// # Example
///
/// ```rust
/// use kmsd_core::{RandomProvider, ThreadRngProvider};
///
/// let random = ThreadRngProvider::new();
/// let seed: u32 = random.random();
/// # let _ = seed;
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngProvider;

impl ThreadRngProvider {
    /// Create a new thread-local random provider.
    pub fn new() -> Self {
        Self
    }
}

thread_local! {
    static RNG: RefCell<rand::rngs::ThreadRng> = RefCell::new(rand::rng());
}

impl RandomProvider for ThreadRngProvider {
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>,
    {
        RNG.with(|rng| rng.borrow_mut().random())
    }
}

/// Deterministic provider for reproducible runs.
///
/// Clones share one generator, so a sequence of draws is identical for two
/// providers created with the same seed.
#[derive(Debug, Clone)]
pub struct SeededRandomProvider {
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SeededRandomProvider {
    /// Create a provider seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }
}

impl RandomProvider for SeededRandomProvider {
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>,
    {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random()
    }
}
