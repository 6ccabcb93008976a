//! # mcroute-tko
//!
//! Cross-thread health state for proxy destinations.
//!
//! Every proxy worker owns its own destination objects, but all destinations
//! that share a destination key report into one [`TkoTracker`]. The tracker
//! decides when the backend is TKO ("total knock-out", temporarily down) and
//! which destination owns that transition. Only the owner logs it, probes
//! the backend and may clear it again.
//!
//! ## Failure kinds
//!
//! - **Hard** failures (connect refused, connect timeout) mean the backend is
//!   unreachable.
//! - **Soft** failures (request timeouts) mean it is slow. The number of
//!   concurrent soft TKOs is capped fleet-wide by [`GlobalTkos`], so a
//!   widespread slowdown cannot take every backend out of rotation.
//!
//! `is_tko()` is a lock-free read; every mutation goes through a short
//! critical section on the tracker.

mod global;
mod map;
mod tracker;

pub use global::{GlobalTkos, TkoCounts};
pub use map::TkoTrackerMap;
pub use tracker::{OwnerId, TkoKind, TkoTracker};
