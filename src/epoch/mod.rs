//! Epoch-based protection for paged log memory.
//!
//! Every read or write of page memory happens between `protect` and
//! `unprotect`; boundary shifts are staged as deferred actions that fire only
//! once every thread protecting an older epoch has left.

mod light_epoch;

pub use light_epoch::{get_thread_id, try_get_thread_id, EpochGuard, LightEpoch, UNPROTECTED};
