//! Status records - the per-run rows of the status store.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::id::{RunId, WorkerId};
use crate::status::{Phase, Stage, UnitStatus};
use crate::Time;

/// Why a unit run did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Dependency clauses could not be satisfied
    Dependency,
    /// A lifecycle hook failed
    Hook,
    /// `pre_test_case` failed
    Precondition,
    /// `procedure` failed
    Procedure,
    /// `post_test_case` failed
    Cleanup,
    /// Killed by the scheduler
    Killed,
    /// Exceeded its timeout
    TimedOut,
    /// The worker panicked
    Panicked,
    /// Run ended before the unit finished
    Aborted,
}

/// A recorded failure. Records accumulate these; nothing erases them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Phase in which the failure happened, if any
    pub phase: Option<Phase>,

    /// Classification
    pub kind: FailureKind,

    /// Human-readable description
    pub message: String,

    /// When it was recorded
    pub at: Time,
}

impl FailureReason {
    /// Create a failure reason stamped with the current time.
    pub fn new(kind: FailureKind, phase: Option<Phase>, message: impl Into<String>) -> Self {
        Self {
            phase,
            kind,
            message: message.into(),
            at: chrono::Utc::now(),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.phase {
            Some(phase) => write!(f, "[{}:{:?}] {}", phase, self.kind, self.message),
            None => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

/// Execution record of one unit run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Run identity
    pub run_id: RunId,

    /// Aliases of the template, used by dependency matching
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Lifecycle stage
    pub stage: Stage,

    /// Current status
    pub status: UnitStatus,

    /// Status of the post phase
    pub post_status: Option<UnitStatus>,

    /// Phase currently executing
    pub phase: Option<Phase>,

    /// Completed main-loop iterations
    #[serde(default)]
    pub iterations: u32,

    /// Owning worker
    pub worker: Option<WorkerId>,

    /// Start time
    pub started_at: Option<Time>,

    /// End time
    pub ended_at: Option<Time>,

    /// Wall-clock duration of the run
    pub duration: Option<Duration>,

    /// Reference to the unit's log stream
    pub log_ref: Option<String>,

    /// Recorded failures, oldest first
    #[serde(default)]
    pub failure_reasons: Vec<FailureReason>,

    /// Last merge
    pub updated_at: Time,
}

impl StatusRecord {
    /// Create an empty record for a run.
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            aliases: Vec::new(),
            stage: Stage::Pending,
            status: UnitStatus::NotRun,
            post_status: None,
            phase: None,
            iterations: 0,
            worker: None,
            started_at: None,
            ended_at: None,
            duration: None,
            log_ref: None,
            failure_reasons: Vec::new(),
            updated_at: chrono::Utc::now(),
        }
    }

    /// Template name of this run.
    pub fn template(&self) -> &str {
        &self.run_id.template
    }

    /// Whether the record has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Merge an update into this record.
    ///
    /// While the record is active a status with a lower precedence than the
    /// stored one is dropped. Once the record is terminal its status only
    /// changes when a failure replaces a non-failure. A dropped status takes
    /// the timing fields of the same update with it, so a settled record
    /// keeps the end time of the write that settled it. Failure reasons
    /// always accumulate. Returns whether the status was accepted.
    pub fn apply(&mut self, update: StatusUpdate) -> bool {
        let accepted = match update.status {
            Some(status) => {
                let allowed = if self.status.is_terminal() {
                    status.is_failure() && !self.status.is_failure()
                } else {
                    status.precedence() >= self.status.precedence()
                };
                if allowed {
                    self.status = status;
                }
                allowed
            }
            None => true,
        };

        if accepted {
            if let Some(ended_at) = update.ended_at {
                self.ended_at = Some(ended_at);
            }
            if let Some(duration) = update.duration {
                self.duration = Some(duration);
            }
        }

        if let Some(stage) = update.stage {
            self.stage = stage;
        }
        if let Some(post) = update.post_status {
            let keep = self
                .post_status
                .map(|current| current.precedence() > post.precedence())
                .unwrap_or(false);
            if !keep {
                self.post_status = Some(post);
            }
        }
        if let Some(phase) = update.phase {
            self.phase = phase;
        }
        if let Some(iterations) = update.iterations {
            self.iterations = iterations;
        }
        if let Some(worker) = update.worker {
            self.worker = Some(worker);
        }
        if let Some(started_at) = update.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(log_ref) = update.log_ref {
            self.log_ref = Some(log_ref);
        }
        if let Some(aliases) = update.aliases {
            self.aliases = aliases;
        }
        self.failure_reasons.extend(update.failures);
        self.updated_at = chrono::Utc::now();

        accepted
    }
}

/// A partial update merged into a [`StatusRecord`].
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    /// New stage
    pub stage: Option<Stage>,
    /// New status (subject to precedence)
    pub status: Option<UnitStatus>,
    /// New post-phase status
    pub post_status: Option<UnitStatus>,
    /// New current phase (`Some(None)` clears it)
    pub phase: Option<Option<Phase>>,
    /// Completed iterations
    pub iterations: Option<u32>,
    /// Owning worker
    pub worker: Option<WorkerId>,
    /// Start time
    pub started_at: Option<Time>,
    /// End time
    pub ended_at: Option<Time>,
    /// Duration
    pub duration: Option<Duration>,
    /// Log reference
    pub log_ref: Option<String>,
    /// Template aliases
    pub aliases: Option<Vec<String>>,
    /// Failures to append
    pub failures: Vec<FailureReason>,
}

impl StatusUpdate {
    /// Create an empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stage.
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Set the status.
    pub fn status(mut self, status: UnitStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the post-phase status.
    pub fn post_status(mut self, status: UnitStatus) -> Self {
        self.post_status = Some(status);
        self
    }

    /// Set the current phase.
    pub fn phase(mut self, phase: Option<Phase>) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Set completed iterations.
    pub fn iterations(mut self, iterations: u32) -> Self {
        self.iterations = Some(iterations);
        self
    }

    /// Set the owning worker.
    pub fn worker(mut self, worker: WorkerId) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Set the start time.
    pub fn started_at(mut self, at: Time) -> Self {
        self.started_at = Some(at);
        self
    }

    /// Set the end time.
    pub fn ended_at(mut self, at: Time) -> Self {
        self.ended_at = Some(at);
        self
    }

    /// Set the duration.
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Set the log reference.
    pub fn log_ref(mut self, log_ref: impl Into<String>) -> Self {
        self.log_ref = Some(log_ref.into());
        self
    }

    /// Set the aliases.
    pub fn aliases(mut self, aliases: Vec<String>) -> Self {
        self.aliases = Some(aliases);
        self
    }

    /// Append a failure reason.
    pub fn failure(mut self, reason: FailureReason) -> Self {
        self.failures.push(reason);
        self
    }

    /// Mark the record done with the given status, ending now.
    pub fn finished(status: UnitStatus, started: Option<Time>) -> Self {
        let now = chrono::Utc::now();
        let mut update = Self::new()
            .stage(Stage::Done)
            .status(status)
            .phase(None)
            .ended_at(now);
        if let Some(started) = started {
            update = update.duration((now - started).to_std().unwrap_or_default());
        }
        update
    }
}
