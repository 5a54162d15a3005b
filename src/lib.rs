//! Continuous Subversion-to-Git conversion daemon.
//!
//! The binary runs an endless cycle loop: re-read the repository inventory,
//! fan a supervised conversion worker out for each eligible repository, sleep,
//! repeat. Conversions drive the external `git`, `git svn`, and `svn` binaries;
//! this crate supervises them, enforces concurrency limits, reaps their
//! descendants, and emits structured JSON logs.
//!
//! The library API exists for the binary and its tests; it is not stable.

pub mod concurrency;
pub mod context;
pub mod convert;
pub mod env;
pub mod exec;
pub mod git;
pub mod inventory;
pub mod job;
pub mod lockfiles;
pub mod logging;
pub mod monitor;
pub mod procs;
pub mod secrets;
pub mod signals;
pub mod svn;
