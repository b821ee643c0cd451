//! Bounded execution sessions.
//!
//! A counting semaphore caps concurrent sessions; `create_session` waits up
//! to a short timeout for a slot and then fails with a capacity error rather
//! than queueing indefinitely. Sessions are exclusively owned by their
//! requesting caller; idle ones are swept by `cleanup`, which releases the
//! slot and clears buffered output.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The concurrency ceiling was hit and no slot freed up within the
    /// timeout. User-actionable: terminate idle sessions or raise the cap.
    #[error("session capacity {capacity} exhausted (waited {waited_secs}s for a free slot)")]
    CapacityExceeded { capacity: usize, waited_secs: u64 },

    #[error("session not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Terminated,
}

/// Tracked execution context bound to one user and, optionally, one
/// environment.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_environment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(skip)]
    pub output_buffer: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub capacity: usize,
    pub active: usize,
    pub peak: usize,
    pub total_created: u64,
    pub available_slots: usize,
    /// Sessions currently bound to each environment, for load-aware placement.
    pub environment_load: HashMap<String, usize>,
}

struct SessionSlot {
    session: Session,
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionSlot>,
    environment_load: HashMap<String, usize>,
    peak: usize,
    total_created: u64,
}

pub struct SessionManager {
    capacity: usize,
    acquire_timeout: Duration,
    semaphore: Arc<Semaphore>,
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new(capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            capacity,
            acquire_timeout,
            semaphore: Arc::new(Semaphore::new(capacity)),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Create a session for `user`, optionally bound to an environment.
    ///
    /// Blocks up to the acquire timeout for a concurrency slot, then fails
    /// with [`SessionError::CapacityExceeded`] — explicit backpressure, never
    /// an unbounded queue.
    pub async fn create_session(
        &self,
        user: &str,
        environment: Option<&str>,
    ) -> Result<Session, SessionError> {
        let permit = match tokio::time::timeout(
            self.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            // Elapsed, or the semaphore was closed (never happens here).
            _ => {
                tracing::warn!(
                    user,
                    capacity = self.capacity,
                    "Session slot acquisition timed out"
                );
                return Err(SessionError::CapacityExceeded {
                    capacity: self.capacity,
                    waited_secs: self.acquire_timeout.as_secs(),
                });
            }
        };

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            user: user.to_string(),
            bound_environment: environment.map(str::to_string),
            created_at: now,
            last_activity_at: now,
            status: SessionStatus::Active,
            output_buffer: Vec::new(),
        };

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(env) = &session.bound_environment {
            *inner.environment_load.entry(env.clone()).or_insert(0) += 1;
        }
        inner.total_created += 1;
        inner.sessions.insert(
            session.id.clone(),
            SessionSlot {
                session: session.clone(),
                _permit: permit,
            },
        );
        inner.peak = inner.peak.max(inner.sessions.len());
        tracing::debug!(session = %session.id, user, "Session created");
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sessions.get(id).map(|s| s.session.clone())
    }

    /// Terminate a session, releasing its slot and clearing buffered output.
    pub fn terminate(&self, id: &str) -> Result<Session, SessionError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let slot = inner
            .sessions
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let mut session = slot.session;
        session.status = SessionStatus::Terminated;
        session.output_buffer.clear();
        if let Some(env) = &session.bound_environment {
            if let Some(load) = inner.environment_load.get_mut(env) {
                *load = load.saturating_sub(1);
                if *load == 0 {
                    inner.environment_load.remove(env);
                }
            }
        }
        tracing::debug!(session = %id, "Session terminated");
        Ok(session)
        // slot._permit drops here, freeing the slot
    }

    pub fn update_activity(&self, id: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let slot = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        slot.session.last_activity_at = Utc::now();
        Ok(())
    }

    /// Append a line of execution output to the session's buffer.
    pub fn append_output(&self, id: &str, line: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let slot = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        slot.session.output_buffer.push(line.to_string());
        slot.session.last_activity_at = Utc::now();
        Ok(())
    }

    /// Drain and return the session's buffered output.
    pub fn take_output(&self, id: &str) -> Result<Vec<String>, SessionError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let slot = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        Ok(std::mem::take(&mut slot.session.output_buffer))
    }

    /// Sweep sessions idle for longer than `max_age`, reclaiming their slots.
    /// Returns the ids of swept sessions.
    pub fn cleanup(&self, max_age: Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let stale: Vec<String> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .sessions
                .values()
                .filter(|s| s.session.last_activity_at < cutoff)
                .map(|s| s.session.id.clone())
                .collect()
        };
        for id in &stale {
            tracing::info!(session = %id, "Sweeping idle session");
            let _ = self.terminate(id);
        }
        stale
    }

    pub fn metrics(&self) -> SessionMetrics {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        SessionMetrics {
            capacity: self.capacity,
            active: inner.sessions.len(),
            peak: inner.peak,
            total_created: inner.total_created,
            available_slots: self.semaphore.available_permits(),
            environment_load: inner.environment_load.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get() {
        let mgr = SessionManager::new(4, Duration::from_millis(100));
        let session = mgr.create_session("alice", Some("phi-cuda")).await.unwrap();
        let fetched = mgr.get_session(&session.id).unwrap();
        assert_eq!(fetched.user, "alice");
        assert_eq!(fetched.bound_environment.as_deref(), Some("phi-cuda"));
        assert_eq!(fetched.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_capacity_backpressure() {
        let mgr = Arc::new(SessionManager::new(1, Duration::from_millis(200)));
        let first = mgr.create_session("alice", None).await.unwrap();

        // Second caller must fail with a capacity error within the timeout,
        // never silently exceed the cap.
        let err = mgr.create_session("bob", None).await.unwrap_err();
        assert!(matches!(err, SessionError::CapacityExceeded { capacity: 1, .. }));
        assert_eq!(mgr.metrics().active, 1);

        // A freed slot lets a waiter in.
        let mgr2 = mgr.clone();
        let waiter = tokio::spawn(async move { mgr2.create_session("bob", None).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        mgr.terminate(&first.id).unwrap();
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.user, "bob");
    }

    #[tokio::test]
    async fn test_terminate_releases_slot_and_load() {
        let mgr = SessionManager::new(1, Duration::from_millis(100));
        let session = mgr.create_session("alice", Some("llama-cpu")).await.unwrap();
        assert_eq!(mgr.metrics().environment_load.get("llama-cpu"), Some(&1));

        let terminated = mgr.terminate(&session.id).unwrap();
        assert_eq!(terminated.status, SessionStatus::Terminated);
        assert!(terminated.output_buffer.is_empty());
        assert!(mgr.metrics().environment_load.is_empty());

        // Slot is reusable immediately.
        mgr.create_session("bob", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_output_buffer_roundtrip() {
        let mgr = SessionManager::new(2, Duration::from_millis(100));
        let session = mgr.create_session("alice", None).await.unwrap();
        mgr.append_output(&session.id, "hello").unwrap();
        mgr.append_output(&session.id, "world").unwrap();
        assert_eq!(mgr.take_output(&session.id).unwrap(), vec!["hello", "world"]);
        assert!(mgr.take_output(&session.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_idle() {
        let mgr = SessionManager::new(2, Duration::from_millis(100));
        let idle = mgr.create_session("alice", None).await.unwrap();
        let busy = mgr.create_session("bob", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        mgr.update_activity(&busy.id).unwrap();

        let swept = mgr.cleanup(Duration::from_millis(40));
        assert_eq!(swept, vec![idle.id.clone()]);
        assert!(mgr.get_session(&idle.id).is_none());
        assert!(mgr.get_session(&busy.id).is_some());
    }

    #[tokio::test]
    async fn test_unknown_session_errors() {
        let mgr = SessionManager::new(1, Duration::from_millis(100));
        assert!(matches!(
            mgr.terminate("nope"),
            Err(SessionError::NotFound(_))
        ));
        assert!(mgr.get_session("nope").is_none());
    }

    #[tokio::test]
    async fn test_metrics_counters() {
        let mgr = SessionManager::new(2, Duration::from_millis(100));
        let a = mgr.create_session("alice", None).await.unwrap();
        let _b = mgr.create_session("bob", None).await.unwrap();
        mgr.terminate(&a.id).unwrap();

        let metrics = mgr.metrics();
        assert_eq!(metrics.active, 1);
        assert_eq!(metrics.peak, 2);
        assert_eq!(metrics.total_created, 2);
        assert_eq!(metrics.available_slots, 1);
    }
}
