//! File-backed checkpoint store.
//!
//! Layout under the data directory:
//! - `workflows/<request_id>.json`: latest workflow state, one document per
//!   request, written atomically (temp file + rename).
//! - `decisions.jsonl`: append-only decision history.
//! - `communication.jsonl`: append-only communication log, keyed by
//!   message_id.
//!
//! Writers serialize through advisory file locks (fs2). The state upsert is
//! a compare-and-swap on the monotonic `version` field.

use crate::checkpoint::{CheckpointStore, CommunicationEntry, Direction, WorkflowSummary};
use crate::domain::types::{MessageId, RequestId};
use crate::domain::{Decision, EngineError, WorkflowState};
use async_trait::async_trait;
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Dedup and sequence cache for the communication log, so appends do not
/// re-read the whole file. Rebuilt whenever the file length disagrees with
/// what this process last wrote (another process appended in between).
#[derive(Default)]
struct CommIndex {
    seen: HashSet<(MessageId, Direction)>,
    last_seq: u64,
    synced_len: u64,
}

pub struct FileCheckpointStore {
    workflows_dir: PathBuf,
    decisions_path: PathBuf,
    communication_path: PathBuf,
    comm_index: Mutex<CommIndex>,
}

impl FileCheckpointStore {
    pub fn new(data_dir: &Path) -> Result<Self, EngineError> {
        let workflows_dir = data_dir.join("workflows");
        std::fs::create_dir_all(&workflows_dir).map_err(EngineError::store)?;
        Ok(Self {
            workflows_dir,
            decisions_path: data_dir.join("decisions.jsonl"),
            communication_path: data_dir.join("communication.jsonl"),
            comm_index: Mutex::new(CommIndex::default()),
        })
    }

    fn state_path(&self, request_id: RequestId) -> PathBuf {
        self.workflows_dir.join(format!("{}.json", request_id))
    }

    fn lock_path(&self, request_id: RequestId) -> PathBuf {
        self.workflows_dir.join(format!("{}.lock", request_id))
    }

    fn read_state(path: &Path) -> Result<Option<WorkflowState>, EngineError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::store(e)),
        };
        let state = serde_json::from_str(&content).map_err(EngineError::store)?;
        Ok(Some(state))
    }

    fn write_state_atomic(path: &Path, state: &WorkflowState) -> Result<(), EngineError> {
        let content = serde_json::to_string_pretty(state).map_err(EngineError::store)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content).map_err(EngineError::store)?;
        std::fs::rename(&tmp_path, path).map_err(EngineError::store)?;
        Ok(())
    }

    fn open_locked_append(path: &Path) -> Result<File, EngineError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(EngineError::store)?;
        file.lock_exclusive().map_err(EngineError::store)?;
        Ok(file)
    }

    fn append_line<T: serde::Serialize>(file: &mut File, record: &T) -> Result<(), EngineError> {
        let line = serde_json::to_string(record).map_err(EngineError::store)?;
        writeln!(file, "{}", line).map_err(EngineError::store)?;
        file.flush().map_err(EngineError::store)?;
        file.sync_all().map_err(EngineError::store)?;
        Ok(())
    }

    fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, EngineError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::store(e)),
        };
        file.lock_shared().map_err(EngineError::store)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(EngineError::store)?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(EngineError::store)?;
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save_state(&self, state: &WorkflowState) -> Result<(), EngineError> {
        let request_id = state.request_id();
        let lock_file = File::create(self.lock_path(request_id)).map_err(EngineError::store)?;
        lock_file.lock_exclusive().map_err(EngineError::store)?;

        let path = self.state_path(request_id);
        let current = Self::read_state(&path)?;
        let expected = current.as_ref().map(|s| s.version + 1).unwrap_or(1);
        if state.version != expected {
            return Err(EngineError::ConcurrencyConflict {
                message: format!(
                    "stale write for {}: presented version {}, expected {}",
                    request_id, state.version, expected
                ),
            });
        }

        Self::write_state_atomic(&path, state)
        // lock released when lock_file drops
    }

    async fn load_state(
        &self,
        request_id: RequestId,
    ) -> Result<Option<WorkflowState>, EngineError> {
        Self::read_state(&self.state_path(request_id))
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>, EngineError> {
        let mut summaries = Vec::new();
        let entries = std::fs::read_dir(&self.workflows_dir).map_err(EngineError::store)?;
        for entry in entries {
            let entry = entry.map_err(EngineError::store)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(state) = Self::read_state(&path)? {
                summaries.push(WorkflowSummary::from(&state));
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn list_resumable(&self) -> Result<Vec<RequestId>, EngineError> {
        let summaries = self.list_workflows().await?;
        Ok(summaries
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.request_id)
            .collect())
    }

    async fn save_decision(&self, decision: &Decision) -> Result<(), EngineError> {
        let mut file = Self::open_locked_append(&self.decisions_path)?;
        Self::append_line(&mut file, decision)
    }

    async fn decisions_for(&self, request_id: RequestId) -> Result<Vec<Decision>, EngineError> {
        let all: Vec<Decision> = Self::read_jsonl(&self.decisions_path)?;
        Ok(all
            .into_iter()
            .filter(|d| d.request_id == request_id)
            .collect())
    }

    async fn append_communication(
        &self,
        mut entry: CommunicationEntry,
    ) -> Result<bool, EngineError> {
        let mut file = Self::open_locked_append(&self.communication_path)?;
        let mut index = self.comm_index.lock().await;

        // The file lock is held, so the length check and any rescan see a
        // quiescent log. A rescan only happens when another writer grew the
        // file since this process last synced.
        let len = file.metadata().map_err(EngineError::store)?.len();
        if len != index.synced_len {
            index.seen.clear();
            index.last_seq = 0;
            let reader = BufReader::new(file.try_clone().map_err(EngineError::store)?);
            for line in reader.lines() {
                let line = line.map_err(EngineError::store)?;
                if line.trim().is_empty() {
                    continue;
                }
                let existing: CommunicationEntry =
                    serde_json::from_str(&line).map_err(EngineError::store)?;
                index.seen.insert((existing.message_id, existing.direction));
                index.last_seq = index.last_seq.max(existing.seq);
            }
            index.synced_len = len;
        }

        let key = (entry.message_id, entry.direction);
        if index.seen.contains(&key) {
            return Ok(false);
        }

        entry.seq = index.last_seq + 1;
        Self::append_line(&mut file, &entry)?;
        index.seen.insert(key);
        index.last_seq = entry.seq;
        index.synced_len = file.metadata().map_err(EngineError::store)?.len();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Direction;
    use crate::domain::types::TriggerKind;
    use crate::domain::types::WorkflowStatus;
    use crate::domain::{Decision, WorkflowRequest, WorkflowState};
    use crate::protocol::{AgentMessage, BearerToken, MessageKind, MessagePriority};
    use tempfile::tempdir;

    fn fresh_state() -> WorkflowState {
        let request = WorkflowRequest::new(TriggerKind::Scheduled, serde_json::json!({}));
        WorkflowState::new(request)
    }

    fn message() -> AgentMessage {
        AgentMessage::outbound(
            crate::domain::types::ConversationId::new(),
            RequestId::new(),
            "conductor".into(),
            "kiln-optimizer".into(),
            MessageKind::RequestProposal,
            MessagePriority::Normal,
            serde_json::json!({}),
            BearerToken::new("secret"),
        )
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        let state = fresh_state();
        store.save_state(&state).await.unwrap();

        let loaded = store
            .load_state(state.request_id())
            .await
            .unwrap()
            .expect("state exists");
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        assert!(store.load_state(RequestId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_version_is_a_concurrency_conflict() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        let mut state = fresh_state();
        store.save_state(&state).await.unwrap();

        // A second writer presenting the same version must lose.
        let err = store.save_state(&state).await.unwrap_err();
        assert!(matches!(err, EngineError::ConcurrencyConflict { .. }));

        state.version = 2;
        store.save_state(&state).await.unwrap();
    }

    #[tokio::test]
    async fn version_gap_is_rejected() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        let mut state = fresh_state();
        store.save_state(&state).await.unwrap();

        state.version = 5;
        let err = store.save_state(&state).await.unwrap_err();
        assert!(matches!(err, EngineError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn resumable_excludes_terminal_workflows() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();

        let running = fresh_state();
        store.save_state(&running).await.unwrap();

        let mut done = fresh_state();
        store.save_state(&done).await.unwrap();
        done.status = WorkflowStatus::Completed;
        done.version = 2;
        store.save_state(&done).await.unwrap();

        let resumable = store.list_resumable().await.unwrap();
        assert_eq!(resumable, vec![running.request_id()]);
    }

    #[tokio::test]
    async fn decision_history_is_per_request() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();

        let a = Decision::none_required(RequestId::new());
        let b = Decision::none_required(RequestId::new());
        store.save_decision(&a).await.unwrap();
        store.save_decision(&b).await.unwrap();

        let for_a = store.decisions_for(a.request_id).await.unwrap();
        assert_eq!(for_a, vec![a]);
    }

    #[tokio::test]
    async fn communication_log_dedups_by_message_id() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();

        let msg = message();
        let first = CommunicationEntry::from_message(&msg, Direction::Sent);
        let duplicate = CommunicationEntry::from_message(&msg, Direction::Sent);

        assert!(store.append_communication(first).await.unwrap());
        assert!(!store.append_communication(duplicate).await.unwrap());

        // Same message observed in the other direction is a distinct record.
        let received = CommunicationEntry::from_message(&msg, Direction::Received);
        assert!(store.append_communication(received).await.unwrap());
    }

    #[tokio::test]
    async fn communication_dedup_holds_across_store_instances() {
        let dir = tempdir().unwrap();
        let a = FileCheckpointStore::new(dir.path()).unwrap();
        let b = FileCheckpointStore::new(dir.path()).unwrap();

        let msg = message();
        assert!(a
            .append_communication(CommunicationEntry::from_message(&msg, Direction::Sent))
            .await
            .unwrap());

        // b's cache predates a's append; the length check forces a rescan.
        assert!(!b
            .append_communication(CommunicationEntry::from_message(&msg, Direction::Sent))
            .await
            .unwrap());

        let second = message();
        assert!(b
            .append_communication(CommunicationEntry::from_message(&second, Direction::Sent))
            .await
            .unwrap());
        let entries: Vec<CommunicationEntry> =
            FileCheckpointStore::read_jsonl(&a.communication_path).unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn communication_sequence_is_monotonic() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();

        for _ in 0..3 {
            let entry = CommunicationEntry::from_message(&message(), Direction::Sent);
            store.append_communication(entry).await.unwrap();
        }

        let entries: Vec<CommunicationEntry> =
            FileCheckpointStore::read_jsonl(&store.communication_path).unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
