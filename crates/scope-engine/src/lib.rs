#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Task-orchestration core for the CitraScope daemon: dispatch-API client,
//! safety monitor, work queues, scheduler, processing pipeline, and the
//! hardware adapter contract the pipeline drives.

pub mod api;
pub mod daemon;
pub mod ephemeris;
pub mod fits;
pub mod hardware;
pub mod location;
pub mod managers;
pub mod pipeline;
pub mod processors;
pub mod queue;
pub mod safety;
pub mod scheduler;
pub mod stages;
pub mod timesync;
pub mod track;
