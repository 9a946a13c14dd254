#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared foundation for the CitraScope daemon: persisted settings, the
//! scheduled-task model, and the angle math used by pointing and cable-wrap
//! tracking.

pub mod angles;
pub mod settings;
pub mod task;
