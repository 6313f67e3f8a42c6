//! Run telemetry and artifacts
//!
//! Layout under the artifact root:
//!
//! ```text
//! <root>/<run_id>/trace.jsonl
//! <root>/<run_id>/metadata.json
//! <root>/<run_id>/diffs/step-N.diff
//! <root>/<run_id>/test-reports/step-N.xml
//! ```

use chrono::Utc;
use fs2::FileExt;
use serde_json::{json, Value};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;

const TRACE_FILE: &str = "trace.jsonl";
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(25);

pub trait TelemetrySink {
    fn log_event(&mut self, name: &str, fields: Value) -> anyhow::Result<()>;
    fn save_artifact(&mut self, rel_path: &str, bytes: &[u8]) -> anyhow::Result<()>;
}

/// Discards everything. Used by `apply`/`check` and tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn log_event(&mut self, _name: &str, _fields: Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn save_artifact(&mut self, _rel_path: &str, _bytes: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

struct TraceLock {
    file: fs::File,
}

impl Drop for TraceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    run_id: String,
    run_dir: PathBuf,
}

impl ArtifactStore {
    pub fn create(artifact_root: &Path, run_id: &str) -> anyhow::Result<Self> {
        let run_dir = artifact_root.join(run_id);
        fs::create_dir_all(&run_dir)?;
        Ok(Self {
            run_id: run_id.to_string(),
            run_dir,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn lock(&self) -> anyhow::Result<TraceLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.run_dir.join(".lock"))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) if err.kind() != ErrorKind::WouldBlock => return Err(err.into()),
                Err(_) if start.elapsed() >= LOCK_TIMEOUT => {
                    return Err(anyhow::anyhow!(
                        "Timed out waiting for trace lock ({}s)",
                        LOCK_TIMEOUT.as_secs()
                    ))
                }
                Err(_) => std::thread::sleep(LOCK_RETRY),
            }
        }
        Ok(TraceLock { file })
    }
}

impl TelemetrySink for ArtifactStore {
    fn log_event(&mut self, name: &str, fields: Value) -> anyhow::Result<()> {
        info!(event = name, "{}", fields);
        let row = json!({
            "ts": Utc::now().to_rfc3339(),
            "run_id": self.run_id,
            "event": name,
            "fields": fields,
        });
        let _lock = self.lock()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_dir.join(TRACE_FILE))?;
        writeln!(file, "{}", serde_json::to_string(&row)?)?;
        Ok(())
    }

    fn save_artifact(&mut self, rel_path: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let rel = Path::new(rel_path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(anyhow::anyhow!("Invalid artifact path: {}", rel_path));
        }
        let path = self.run_dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _lock = self.lock()?;
        write_atomic(&path, bytes)
    }
}

/// Write to a temp file first, then rename over the target.
fn write_atomic(path: &Path, content: &[u8]) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(windows)]
    {
        if path.exists() {
            fs::remove_file(path)?;
        }
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}
