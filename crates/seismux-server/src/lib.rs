//! Configuration and logging shared by the `seismux-server` and
//! `seismux-mock-core` binaries.

pub mod config;
pub mod logging;
