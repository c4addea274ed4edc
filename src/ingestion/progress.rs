//! In-memory registry of upload sessions.
//!
//! Each session has a single writer (the request handling it, later the
//! conversion worker) while polling clients read snapshots concurrently.
//! All access goes through one lock, so a reader never sees a half-applied
//! update and pruning never interleaves with one.

use super::fingerprint::Fingerprint;
use super::models::{ConversionStatus, UploadSession, UploadStatus};
use crate::server::metrics;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Upload session {0} is already in progress")]
    Conflict(String),

    #[error("Upload session {0} not found")]
    NotFound(String),
}

/// Error details recorded on a failed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub code: String,
    pub message: String,
}

/// Partial mutation of a session; `None` fields are left as they are.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<UploadStatus>,
    pub bytes_received: Option<u64>,
    pub error: Option<SessionError>,
    pub fingerprint: Option<Fingerprint>,
    pub conversion: Option<ConversionStatus>,
    pub conversion_error: Option<String>,
}

impl SessionUpdate {
    pub fn status(status: UploadStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn bytes_received(bytes: u64) -> Self {
        Self {
            bytes_received: Some(bytes),
            ..Default::default()
        }
    }

    pub fn failed(code: &str, message: impl Into<String>) -> Self {
        Self {
            status: Some(UploadStatus::Failed),
            error: Some(SessionError {
                code: code.to_string(),
                message: message.into(),
            }),
            ..Default::default()
        }
    }

    pub fn conversion(status: ConversionStatus) -> Self {
        Self {
            conversion: Some(status),
            ..Default::default()
        }
    }

    pub fn conversion_failed(message: impl Into<String>) -> Self {
        Self {
            conversion: Some(ConversionStatus::Failed),
            conversion_error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: UploadStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_bytes_received(mut self, bytes: u64) -> Self {
        self.bytes_received = Some(bytes);
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn with_conversion(mut self, status: ConversionStatus) -> Self {
        self.conversion = Some(status);
        self
    }

    fn apply(self, session: &mut UploadSession) {
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(bytes) = self.bytes_received {
            session.bytes_received = bytes;
        }
        if let Some(error) = self.error {
            session.error_code = Some(error.code);
            session.error = Some(error.message);
        }
        if let Some(fingerprint) = self.fingerprint {
            session.fingerprint = Some(fingerprint);
        }
        if let Some(conversion) = self.conversion {
            session.conversion = Some(conversion);
        }
        if let Some(message) = self.conversion_error {
            session.conversion_error = Some(message);
        }
        session.updated_at = chrono::Utc::now().timestamp_millis();
    }
}

pub struct ProgressTracker {
    sessions: RwLock<HashMap<String, UploadSession>>,
    retention: Duration,
}

impl ProgressTracker {
    pub fn new(retention: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Register a new session in RECEIVING state.
    ///
    /// Rejected while a non-terminal session with the same id exists; a
    /// terminal one is replaced.
    pub fn create(
        &self,
        session_id: &str,
        filename: &str,
        declared_size: Option<u64>,
    ) -> Result<UploadSession, TrackerError> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = sessions.get(session_id) {
            if !existing.is_terminal() {
                return Err(TrackerError::Conflict(session_id.to_string()));
            }
        }
        let session = UploadSession::new(session_id, filename, declared_size);
        sessions.insert(session_id.to_string(), session.clone());
        metrics::set_tracked_sessions(sessions.len());
        Ok(session)
    }

    pub fn update(&self, session_id: &str, update: SessionUpdate) -> Result<(), TrackerError> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| TrackerError::NotFound(session_id.to_string()))?;
        update.apply(session);
        Ok(())
    }

    /// Apply an update when the caller has nothing left to do on failure.
    ///
    /// The session may already be gone (pruned, or never created because the
    /// request was rejected early); that is logged and otherwise ignored.
    pub fn report(&self, session_id: &str, update: SessionUpdate) {
        if let Err(e) = self.update(session_id, update) {
            debug!("Dropping session update: {}", e);
        }
    }

    /// Snapshot of a session.
    pub fn get(&self, session_id: &str) -> Result<UploadSession, TrackerError> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
            .ok_or_else(|| TrackerError::NotFound(session_id.to_string()))
    }

    /// All sessions, newest first.
    pub fn list(&self) -> Vec<UploadSession> {
        let mut all: Vec<UploadSession> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop terminal sessions last touched more than the retention window
    /// before `now_ms`. Returns how many were removed.
    pub fn prune(&self, now_ms: i64) -> usize {
        let cutoff = now_ms - self.retention.as_millis() as i64;
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, s| !(s.is_terminal() && s.updated_at <= cutoff));
        metrics::set_tracked_sessions(sessions.len());
        before - sessions.len()
    }
}
