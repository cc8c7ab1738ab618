//! Execution layer - unit lifecycle, dependency resolution, and scheduling.

#![warn(missing_docs)]

pub mod error;
pub mod config;
pub mod control;
pub mod case;
pub mod hooks;
pub mod dependency;
pub mod scheduler;
mod worker;
pub mod engine;

pub use error::{ExecutionError, Result};
pub use config::{EngineConfig, EngineSettings, ExecutionMode, RunConfig};
pub use control::{SuspendState, WorkerControl};
pub use case::{LogRouter, NullLogRouter, TestCase, UnitContext, UnitTemplate};
pub use hooks::{Hook, HookPoint, HookRunner};
pub use dependency::{DependencyResolver, Resolution};
pub use scheduler::{Reservation, WorkerPool};
pub use engine::{EngineHandle, ExecutionEngine};
