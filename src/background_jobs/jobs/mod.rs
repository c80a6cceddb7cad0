//! Concrete job implementations.

mod sleeper;

pub use sleeper::SleeperJob;
