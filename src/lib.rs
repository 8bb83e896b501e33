//! ## Quick guide
//!
//! 1. Create a Registry for one kind of computation
//! 2. Acquire the key identifying the work you are about to do
//! 3. As the leader, run the computation and publish its outcome
//! 4. As a follower, wait for the outcome the leader publishes
//!
//! For steps 2 to 4 in one go, see [`Registry::run`] and [`Registry::run_async`].
//!
//! Concurrent requests for the same key are coalesced into one computation while it is in
//! flight. Nothing is cached past that: once published, the key is free again and the next
//! request starts over.
pub mod call;
pub mod registry;

pub use self::call::{Call, Canceller, Wait, WaitError, WaitErrorKind};
pub use self::registry::{Acquired, Leader, Options, Registry, ReleaseError, Role};
