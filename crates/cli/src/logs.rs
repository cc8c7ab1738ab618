//! One log file per unit run.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use testrig_core::RunId;
use testrig_execution::LogRouter;
use tracing::warn;

/// Writes each run's command transcript to `<root>/<name>_<n>.log`.
#[derive(Debug, Clone)]
pub struct DirLogRouter {
    root: PathBuf,
}

impl DirLogRouter {
    /// Create the router, creating `root` if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Log file of a run. Characters outside `[A-Za-z0-9._-]` are
    /// percent-encoded.
    pub fn path(&self, run_id: &RunId) -> PathBuf {
        let mut name = String::with_capacity(run_id.template.len());
        for c in run_id.template.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                name.push(c);
            } else {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    name.push_str(&format!("%{b:02X}"));
                }
            }
        }
        self.root.join(format!("{}_{}.log", name, run_id.run_number))
    }

    /// Append text to a run's log. Write errors are logged and dropped.
    pub fn append(&self, run_id: &RunId, text: &str) {
        let path = self.path(run_id);
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{text}"));
        if let Err(e) = written {
            warn!(run = %run_id, path = %path.display(), error = %e, "failed to write unit log");
        }
    }
}

impl LogRouter for DirLogRouter {
    fn switch_to(&self, run_id: &RunId) -> Option<String> {
        let path = self.path(run_id);
        self.append(run_id, &format!("=== {run_id} ==="));
        Some(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_switch_creates_log() {
        let dir = tempdir().unwrap();
        let router = DirLogRouter::new(dir.path().join("logs")).unwrap();
        let run = RunId::new("bgp/up", 2);

        let log_ref = router.switch_to(&run).unwrap();
        assert!(log_ref.ends_with("bgp%2Fup_2.log"));

        router.append(&run, "hello");
        let text = fs::read_to_string(router.path(&run)).unwrap();
        assert_eq!(text, "=== bgp/up#2 ===\nhello\n");
    }

    #[test]
    fn test_similar_names_get_separate_logs() {
        let dir = tempdir().unwrap();
        let router = DirLogRouter::new(dir.path()).unwrap();
        let slash = router.path(&RunId::first("bgp/up"));
        let underscore = router.path(&RunId::first("bgp_up"));
        assert_ne!(slash, underscore);
        assert!(underscore.ends_with("bgp_up_1.log"));
    }
}
