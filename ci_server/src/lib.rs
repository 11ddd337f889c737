//! Sea CI — a minimal CI runner.
//!
//! Git hooks post to the server, which checks out the pushed revision and runs
//! its build script under supervision. Output is captured into a replayable
//! stream that any number of HTTP clients can follow live; running builds can
//! be canceled, which kills the script's whole process group.

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod services;
