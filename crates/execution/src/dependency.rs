//! Dependency resolution for units.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use testrig_core::{StatusRecord, UnitSpec, UnitStatus};

/// Result of dependency resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Every clause is satisfied
    Proceed,
    /// Peers still on their way; poll again
    Wait {
        /// Peers not yet at their required status
        pending: Vec<String>,
    },
    /// The clauses can never be satisfied
    Fail(String),
}

/// Decides whether a unit may start given a snapshot of peer statuses.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    /// Create a new resolver.
    pub fn new() -> Self {
        Self
    }

    /// Resolve `unit`'s clauses against `peers`.
    ///
    /// Only the most recent run of each peer counts and the unit never
    /// matches itself.
    pub fn resolve(&self, unit: &UnitSpec, peers: &[StatusRecord]) -> Resolution {
        if unit.depends_on.is_empty() {
            return Resolution::Proceed;
        }

        let mut latest: HashMap<&str, &StatusRecord> = HashMap::new();
        for record in peers.iter().filter(|r| r.template() != unit.name) {
            let entry = latest.entry(record.template()).or_insert(record);
            if record.run_id.run_number > entry.run_id.run_number {
                *entry = record;
            }
        }

        // peer name -> (required status, current status)
        let mut matched: BTreeMap<&str, Vec<(UnitStatus, UnitStatus)>> = BTreeMap::new();
        for clause in &unit.depends_on {
            let matcher = match clause.matcher() {
                Ok(m) => m,
                Err(e) => return Resolution::Fail(e.to_string()),
            };
            for (&name, record) in &latest {
                let hit = matcher.is_match(name) || record.aliases.iter().any(|a| matcher.is_match(a));
                if hit {
                    matched.entry(name).or_default().push((clause.required, record.status));
                }
            }
        }

        let required = unit.depends_on.iter().filter(|c| !c.optional).count();
        if matched.len() < required {
            let found: BTreeSet<_> = matched.keys().collect();
            return Resolution::Fail(format!(
                "found {} peer(s) {:?} for {} required clause(s) [{}]",
                matched.len(),
                found,
                required,
                unit.depends_on
                    .iter()
                    .filter(|c| !c.optional)
                    .map(|c| format!("{}={}", c.target, c.required))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }

        let mut pending = Vec::new();
        for (name, checks) in &matched {
            for &(required, current) in checks {
                if current == required {
                    continue;
                }
                if current.is_terminal() {
                    return Resolution::Fail(format!("'{name}' ended {current}, {required} required"));
                }
                pending.push(name.to_string());
            }
        }

        if pending.is_empty() {
            Resolution::Proceed
        } else {
            pending.dedup();
            Resolution::Wait { pending }
        }
    }
}
