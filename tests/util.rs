// This is almost certainly not all used in all tests.
#![allow(dead_code)]
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use coalesce::{Acquired, Registry};

/// Long enough that a thread which should not finish early will not.
pub const SETTLE: Duration = Duration::from_millis(50);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MathError {
    DivideByZero,
}

pub fn divide(a: i64, b: i64) -> Result<i64, MathError> {
    if b == 0 {
        Err(MathError::DivideByZero)
    } else {
        Ok(a / b)
    }
}

/// Let `threads` threads acquire `key` at the same moment, before anyone publishes.
///
/// Returns the acquired handles in no particular order.
pub fn acquire_all<K, V, E>(
    registry: &Arc<Registry<K, V, E>>,
    key: K,
    threads: usize,
) -> Vec<Acquired<K, V, E>>
where
    K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let registry = Arc::clone(registry);
            let barrier = Arc::clone(&barrier);
            let key = key.clone();
            thread::spawn(move || {
                barrier.wait();
                registry.acquire(key)
            })
        })
        .collect();

    handles
        .into_iter()
        .map(|handle| handle.join().expect("acquiring never panics"))
        .collect()
}
