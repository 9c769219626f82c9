use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One line of `<state_dir>/<stack>.actions.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    pub id: Uuid,
    pub action_type: String,
    pub component: String,
    pub status: String,
    pub stack_name: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

/// Append-only action log for one stack.
/// Write failures are reported on stderr and never propagate.
#[derive(Debug, Clone)]
pub struct ActionLog {
    path: PathBuf,
    stack_name: String,
}

impl ActionLog {
    pub fn new(state_dir: &Path, stack_name: &str) -> Self {
        Self {
            path: state_dir.join(format!("{}.actions.jsonl", stack_name)),
            stack_name: stack_name.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &ActionRecord) {
        let res = (|| -> std::io::Result<()> {
            if let Some(dir) = self.path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            let line = serde_json::to_string(record)?;
            writeln!(file, "{}", line)
        })();
        if let Err(e) = res {
            eprintln!("⚠️ [action_log] cannot write {}: {}", self.path.display(), e);
        }
    }

    pub fn log_event(&self, action_type: &str, status: &str, error_message: Option<&str>) -> Uuid {
        self.log_event_with_metadata(action_type, status, error_message, None)
    }

    pub fn log_event_with_metadata(
        &self,
        action_type: &str,
        status: &str,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.append(&ActionRecord {
            id,
            action_type: action_type.to_string(),
            component: "orchestrator".to_string(),
            status: status.to_string(),
            stack_name: self.stack_name.clone(),
            error_message: error_message.map(str::to_string),
            duration_ms: None,
            metadata,
            at: Utc::now(),
        });
        tracing::debug!("📝 [action_log] {} - {} ({})", action_type, status, id);
        id
    }

    /// Completion line sharing the id of the `log_event` that opened the action.
    pub fn log_event_complete(
        &self,
        id: Uuid,
        action_type: &str,
        status: &str,
        duration_ms: u64,
        error_message: Option<&str>,
    ) {
        self.log_event_complete_with_metadata(id, action_type, status, duration_ms, error_message, None)
    }

    pub fn log_event_complete_with_metadata(
        &self,
        id: Uuid,
        action_type: &str,
        status: &str,
        duration_ms: u64,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) {
        self.append(&ActionRecord {
            id,
            action_type: action_type.to_string(),
            component: "orchestrator".to_string(),
            status: status.to_string(),
            stack_name: self.stack_name.clone(),
            error_message: error_message.map(str::to_string),
            duration_ms: Some(duration_ms),
            metadata,
            at: Utc::now(),
        });
    }

    /// Quick log for one-off events (like state transitions).
    pub fn log_quick(&self, action_type: &str, details: Option<serde_json::Value>) {
        self.log_event_with_metadata(action_type, "success", None, details);
    }

    pub fn read_all(&self) -> std::io::Result<Vec<ActionRecord>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(raw
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}
