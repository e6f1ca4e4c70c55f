//! # Engine Module
//!
//! The concurrent serving core: many writer threads appending to many
//! newsgroup overview files, with exactly one holder per mapped file at
//! any instant.
//!
//! ## Moving Parts
//!
//! ```text
//!  submit(record)                 opener pool <-- open requests
//!       |                              |
//!       v                              v
//!  [ job intake ] --> worker pool --> HandleRegistry <--> GroupLockTable
//!                        |  fan-out        ^
//!                        v                 |
//!                  per-group branch   closer pool <-- close requests
//!                                          ^
//!                                     idle sweeper
//! ```
//!
//! Suspension points are exactly three: waiting on the per-hash FIFO lock
//! while another worker owns the file, waiting on an admission token when
//! the mapped-file budget is exhausted, and the request/reply round trips
//! to the opener/closer pools. Per hash, article numbers are assigned in
//! resource-lock grant order, so `last` increases monotonically with no
//! gaps; across hashes there is no ordering.

mod config;
mod engine;
mod lock;
mod pipeline;
mod registry;

pub use config::EngineConfig;
pub use engine::Engine;
pub use lock::GroupLockTable;
pub use pipeline::{Job, WorkerCtx};
pub use registry::{CloseRequest, HandleRegistry, OpenRequest, RegistryStats};
