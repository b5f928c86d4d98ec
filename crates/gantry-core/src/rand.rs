//! Seedable randomness.
//!
//! Anything random in Gantry (backoff jitter, mostly) draws from thread-local
//! PRNGs that are all seeded from a single global PRNG. Setting `GANTRY_SEED`
//! makes every draw deterministic, which keeps retry timing reproducible in
//! tests.

use std::cell::RefCell;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

static SEED_RNG: Lazy<Mutex<StdRng>> = Lazy::new(|| {
    let seed = std::env::var("GANTRY_SEED")
        .ok()
        .and_then(|s| s.parse::<u64>().ok());

    let rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    Mutex::new(rng)
});

/// Call a function with a thread-local PRNG.
pub(crate) fn with_thread_rng<F, T>(f: F) -> T
where
    F: FnOnce(&mut StdRng) -> T,
{
    thread_local! {
        static THREAD_RNG: RefCell<StdRng> = RefCell::new({
            let seed = SEED_RNG
                .lock()
                .expect("seed rng was poisoned: this is a bug in Gantry")
                .gen();
            StdRng::from_seed(seed)
        });
    }

    THREAD_RNG.with(|rng| f(&mut rng.borrow_mut()))
}
