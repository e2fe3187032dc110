//! Time utilities and abstractions
//!
//! - **[`clock`]**: wall-clock abstraction with a controllable mock
//! - **[`timer`]**: cancellable delayed tasks that chain bounded timer hops
//!
//! Monotonic waits go through `tokio::time`, so tests can pause and advance
//! them; calendar arithmetic (local day, token expiry) goes through
//! [`Clock`].

pub mod clock;
#[cfg(feature = "runtime")]
pub mod timer;

pub use clock::{Clock, MockClock, SystemClock};
#[cfg(feature = "runtime")]
pub use timer::{DelayedTask, HopProgress, TimerHandle};
