//! Session lifecycle
//!
//! A session owns one transport connection and the media pipeline feeding
//! it. Startup lives in [`startup`], supervision in [`watchdog`], and every
//! way a session can end funnels into one [`Teardown`].

pub mod manager;
#[allow(clippy::module_inception)]
pub mod session;
pub mod startup;
pub mod teardown;
pub mod watchdog;

pub use manager::SessionManager;
pub use session::{CandidateQueue, RemoteUpdate, Session};
pub use startup::{launch, MediaSession};
pub use teardown::{Stage, Teardown, TeardownReason};
