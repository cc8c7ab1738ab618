//! Capability registry: operation name → ordered candidate executors.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{DispatchError, Result};
use crate::CommandExecutor;

/// Maps each operation to the executors able to perform it.
///
/// Built once at configuration time; resolution is a table lookup. The first
/// registered candidate for an operation wins.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    candidates: HashMap<String, Vec<Arc<dyn CommandExecutor>>>,
    executors: Vec<Arc<dyn CommandExecutor>>,
}

impl CapabilityRegistry {
    /// Create a registry from executors, using the operations each advertises.
    pub fn new(executors: Vec<Arc<dyn CommandExecutor>>) -> Self {
        let mut registry = Self::default();
        for executor in executors {
            registry.register(executor);
        }
        registry
    }

    /// Register an executor for every operation it advertises.
    pub fn register(&mut self, executor: Arc<dyn CommandExecutor>) {
        for operation in executor.operations() {
            self.register_for(operation, executor.clone());
        }
        self.track(executor);
    }

    /// Register an executor for one operation, after existing candidates.
    pub fn register_for(&mut self, operation: impl Into<String>, executor: Arc<dyn CommandExecutor>) {
        let operation = operation.into();
        let list = self.candidates.entry(operation).or_default();
        if !list.iter().any(|e| e.name() == executor.name()) {
            list.push(executor.clone());
        }
        self.track(executor);
    }

    fn track(&mut self, executor: Arc<dyn CommandExecutor>) {
        if !self.executors.iter().any(|e| e.name() == executor.name()) {
            self.executors.push(executor);
        }
    }

    /// Resolve the executor for an operation.
    pub fn resolve(&self, operation: &str) -> Result<Arc<dyn CommandExecutor>> {
        self.candidates
            .get(operation)
            .and_then(|list| list.first())
            .cloned()
            .ok_or_else(|| DispatchError::NoExecutor {
                operation: operation.to_string(),
                registered: self.executor_names(),
            })
    }

    /// Every candidate for an operation, in preference order.
    pub fn candidates(&self, operation: &str) -> Vec<Arc<dyn CommandExecutor>> {
        self.candidates.get(operation).cloned().unwrap_or_default()
    }

    /// Names of every registered executor, in registration order.
    pub fn executor_names(&self) -> Vec<String> {
        self.executors.iter().map(|e| e.name().to_string()).collect()
    }

    /// Every operation with at least one candidate, sorted.
    pub fn operations(&self) -> Vec<String> {
        let mut ops: Vec<_> = self.candidates.keys().cloned().collect();
        ops.sort();
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommandOutput, CommandRequest};
    use async_trait::async_trait;

    struct Named(&'static str, Vec<&'static str>);

    #[async_trait]
    impl CommandExecutor for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn operations(&self) -> Vec<String> {
            self.1.iter().map(|s| s.to_string()).collect()
        }

        async fn execute(&self, _request: &CommandRequest) -> anyhow::Result<CommandOutput> {
            Ok(CommandOutput::from_text(0, self.0, ""))
        }
    }

    #[test]
    fn test_first_candidate_wins() {
        let registry = CapabilityRegistry::new(vec![
            Arc::new(Named("rest", vec!["show_version", "get_interfaces"])),
            Arc::new(Named("cli", vec!["show_version", "configure"])),
        ]);

        assert_eq!(registry.resolve("show_version").unwrap().name(), "rest");
        assert_eq!(registry.resolve("configure").unwrap().name(), "cli");
        assert_eq!(registry.candidates("show_version").len(), 2);
        assert_eq!(
            registry.operations(),
            vec!["configure", "get_interfaces", "show_version"]
        );
    }

    #[test]
    fn test_missing_operation_names_everything() {
        let registry = CapabilityRegistry::new(vec![
            Arc::new(Named("rest", vec!["a"])),
            Arc::new(Named("cli", vec!["b"])),
        ]);

        let err = registry.resolve("reboot").err().unwrap();
        let message = err.to_string();
        assert!(message.contains("reboot"));
        assert!(message.contains("rest, cli"));
        match err {
            DispatchError::NoExecutor { registered, .. } => assert_eq!(registered, vec!["rest", "cli"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_register_for_extra_operation() {
        let mut registry = CapabilityRegistry::default();
        registry.register_for("reboot", Arc::new(Named("cli", vec![])));
        assert_eq!(registry.resolve("reboot").unwrap().name(), "cli");
        assert_eq!(registry.executor_names(), vec!["cli"]);
    }
}
