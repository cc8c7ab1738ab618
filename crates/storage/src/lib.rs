//! Status storage for testrig.
//!
//! This crate provides the live [`StatusStore`] shared by the scheduler and
//! its workers, and a trait-based sink interface with a JSON file reference
//! implementation for persisting the records.

#![warn(missing_docs)]

pub mod trait_;
pub mod json_sink;
pub mod store;

pub use trait_::{StatusSink, StorageError, Result, MemorySink};
pub use json_sink::JsonStatusSink;
pub use store::StatusStore;
