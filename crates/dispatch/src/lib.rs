//! Command Dispatch
//!
//! Issue logical operations to devices through pluggable executors, with
//! per-device locking, output validation, and retry / ignore rules.

#![warn(missing_docs)]

pub mod r#trait;
pub mod builtin;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lock;
pub mod policy;
pub mod predicate;
pub mod registry;

pub use r#trait::{CommandExecutor, CommandOutput, CommandRequest};
pub use builtin::ShellExecutor;
pub use config::{DeviceSet, DeviceSettings, ExecutorSettings};
pub use dispatcher::CommandDispatcher;
pub use error::{DispatchError, Result};
pub use lock::{DeviceLockGuard, DeviceLocks};
pub use policy::{PolicyDecision, RetryPolicy, RetryPolicySettings, ANY_SESSION};
pub use predicate::{SuccessPredicate, Verdict, DEFAULT_ERROR_MARKERS};
pub use registry::CapabilityRegistry;
