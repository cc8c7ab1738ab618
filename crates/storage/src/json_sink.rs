//! JSON file sink implementation.
//!
//! Stores one JSON document per unit run under `records/` and keeps a small
//! per-record meta marker (version + updated_at) under `meta/records/`.

use std::path::{Path, PathBuf};
use testrig_core::{RunId, StatusRecord};
use super::{StatusSink, StorageError, Result};
use tokio::fs;

/// File-based JSON status sink.
pub struct JsonStatusSink {
    root: PathBuf,
}

impl JsonStatusSink {
    /// Create the sink, creating `records/` and `meta/records/` below `root`.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("records")).await?;
        fs::create_dir_all(root.join("meta").join("records")).await?;

        Ok(Self { root })
    }

    /// Open an existing sink directory without creating anything.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !fs::try_exists(root.join("records")).await? {
            return Err(StorageError::NotFound(format!(
                "no status records under {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Root directory of the sink.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, run_id: &RunId) -> PathBuf {
        self.root.join("records").join(format!("{}.json", file_stem(run_id)))
    }

    fn meta_path(&self, run_id: &RunId) -> PathBuf {
        self.root
            .join("meta")
            .join("records")
            .join(format!("{}.meta.json", file_stem(run_id)))
    }

    /// Read and increment the per-record version, return the new version.
    async fn bump_version(&self, run_id: &RunId) -> Result<u64> {
        let path = self.meta_path(run_id);
        let mut version = 0u64;
        if let Ok(s) = fs::read_to_string(&path).await {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&s) {
                if let Some(v) = json.get("version").and_then(|v| v.as_u64()) {
                    version = v;
                }
            }
        }
        version += 1;
        let meta = serde_json::json!({"version": version, "updated_at": chrono::Utc::now()});
        fs::write(&path, serde_json::to_string_pretty(&meta)?.as_bytes()).await?;
        Ok(version)
    }

    /// Version counter of a record, 0 if never written.
    pub async fn version(&self, run_id: &RunId) -> Result<u64> {
        match fs::read_to_string(self.meta_path(run_id)).await {
            Ok(s) => {
                let json: serde_json::Value = serde_json::from_str(&s)?;
                Ok(json.get("version").and_then(|v| v.as_u64()).unwrap_or(0))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

/// File names keep the run id readable. Path separators are
/// percent-encoded, and so is `%` itself, so distinct templates never share
/// a file.
fn file_stem(run_id: &RunId) -> String {
    let mut stem = String::with_capacity(run_id.template.len() + 8);
    for c in run_id.template.chars() {
        match c {
            '%' | '/' | '\\' | ':' => stem.push_str(&format!("%{:02X}", c as u32)),
            c => stem.push(c),
        }
    }
    format!("{}#{}", stem, run_id.run_number)
}

#[async_trait::async_trait]
impl StatusSink for JsonStatusSink {
    async fn upsert(&self, record: &StatusRecord) -> Result<()> {
        let path = self.record_path(&record.run_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&tmp, json.as_bytes()).await?;
        fs::rename(&tmp, &path).await?;

        let version = self.bump_version(&record.run_id).await?;
        tracing::trace!(run = %record.run_id, version, "status record persisted");
        Ok(())
    }

    async fn load(&self, run_id: &RunId) -> Result<Option<StatusRecord>> {
        read_json(&self.record_path(run_id)).await
    }

    async fn list(&self) -> Result<Vec<StatusRecord>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(self.root.join("records")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = read_json::<StatusRecord>(&path).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(records)
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(s) => Ok(Some(serde_json::from_str(&s)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testrig_core::{StatusUpdate, UnitStatus};

    #[tokio::test]
    async fn test_upsert_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonStatusSink::new(dir.path()).await.unwrap();

        let mut record = StatusRecord::new(RunId::first("link_flap"));
        sink.upsert(&record).await.unwrap();
        record.apply(StatusUpdate::finished(UnitStatus::Pass, None));
        sink.upsert(&record).await.unwrap();

        let loaded = sink.load(&record.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, UnitStatus::Pass);
        assert_eq!(sink.version(&record.run_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonStatusSink::new(dir.path()).await.unwrap();
        assert!(sink.load(&RunId::first("nope")).await.unwrap().is_none());
        assert_eq!(sink.version(&RunId::first("nope")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonStatusSink::new(dir.path()).await.unwrap();
        for run in [2, 1] {
            sink.upsert(&StatusRecord::new(RunId::new("soak", run))).await.unwrap();
        }
        sink.upsert(&StatusRecord::new(RunId::first("a/b"))).await.unwrap();

        let records = sink.list().await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.run_id.to_string()).collect();
        assert_eq!(ids, vec!["a/b#1", "soak#1", "soak#2"]);
    }

    #[test]
    fn test_file_stem_escapes_separators() {
        assert_eq!(file_stem(&RunId::new("a/b", 2)), "a%2Fb#2");
        assert_eq!(file_stem(&RunId::first("a_b")), "a_b#1");
        assert_eq!(file_stem(&RunId::first("a%2Fb")), "a%252Fb#1");
        assert_eq!(file_stem(&RunId::first("c:\\d")), "c%3A%5Cd#1");
    }

    #[tokio::test]
    async fn test_similar_templates_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonStatusSink::new(dir.path()).await.unwrap();
        for template in ["a/b", "a_b", "a%2Fb"] {
            let mut record = StatusRecord::new(RunId::first(template));
            record.apply(StatusUpdate::finished(UnitStatus::Pass, None));
            sink.upsert(&record).await.unwrap();
        }

        let records = sink.list().await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.run_id.to_string()).collect();
        assert_eq!(ids, vec!["a%2Fb#1", "a/b#1", "a_b#1"]);
        assert_eq!(sink.version(&RunId::first("a/b")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_open_requires_existing_layout() {
        let dir = tempfile::tempdir().unwrap();
        assert!(JsonStatusSink::open(dir.path()).await.is_err());
        JsonStatusSink::new(dir.path()).await.unwrap();
        assert!(JsonStatusSink::open(dir.path()).await.is_ok());
    }
}
