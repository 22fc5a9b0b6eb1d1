//! Session registry: one liveness state machine per connection, each owned
//! by its own sequential worker thread.
//!
//! The registry only guards the id → handle map. A machine is touched by
//! exactly one worker, and frames and resets for a session travel through
//! the same channel, so a reset is ordered strictly between frame updates.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use vigil_core::{FrameOutcome, FramePipeline, LivenessConfig, LivenessStateMachine, PipelineError};

/// Frames queued per session. The client waits for each reply, so one slot
/// of slack is enough.
const SESSION_QUEUE_DEPTH: usize = 2;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("session limit reached ({0})")]
    Capacity(usize),
    #[error("failed to spawn session worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("session worker exited")]
    ChannelClosed,
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

enum SessionRequest {
    Frame {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<FrameOutcome, PipelineError>>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to one session's worker.
#[derive(Clone)]
pub struct SessionHandle {
    created_at: Instant,
    tx: mpsc::Sender<SessionRequest>,
}

impl SessionHandle {
    /// Run one frame through this session's pipeline and liveness machine.
    pub async fn submit_frame(&self, bytes: Vec<u8>) -> Result<FrameOutcome, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Frame {
                bytes,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| SessionError::ChannelClosed)??)
    }

    /// Clear this session's liveness evidence.
    pub async fn reset(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Reset { reply: reply_tx })
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)
    }
}

/// Owns every active session and is the only writer of the id → session map.
pub struct SessionRegistry {
    pipeline: FramePipeline,
    liveness: LivenessConfig,
    max_sessions: usize,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(pipeline: FramePipeline, liveness: LivenessConfig, max_sessions: usize) -> Self {
        Self {
            pipeline,
            liveness,
            max_sessions,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a fresh session. Connecting an id that already exists is a no-op.
    pub fn on_connect(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(session_id) {
            tracing::debug!(session_id, "session already registered");
            return Ok(());
        }
        if sessions.len() >= self.max_sessions {
            tracing::warn!(session_id, max = self.max_sessions, "session limit reached");
            return Err(SessionError::Capacity(self.max_sessions));
        }

        let handle = spawn_worker(session_id, self.pipeline.clone(), self.liveness.clone())?;
        sessions.insert(session_id.to_string(), handle);
        tracing::info!(session_id, active = sessions.len(), "session opened");
        Ok(())
    }

    /// Discard a session. The worker exits once in-flight requests drain.
    pub fn on_disconnect(&self, session_id: &str) {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        match removed {
            Some(handle) => tracing::info!(
                session_id,
                age_secs = handle.created_at.elapsed().as_secs(),
                "session closed"
            ),
            None => tracing::debug!(session_id, "disconnect for unknown session"),
        }
    }

    pub fn get(&self, session_id: &str) -> Result<SessionHandle, SessionError> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn spawn_worker(
    session_id: &str,
    pipeline: FramePipeline,
    liveness: LivenessConfig,
) -> Result<SessionHandle, SessionError> {
    let (tx, mut rx) = mpsc::channel::<SessionRequest>(SESSION_QUEUE_DEPTH);
    let thread_id = session_id.to_string();

    std::thread::Builder::new()
        .name(format!("vigil-session-{}", short_id(session_id)))
        .spawn(move || {
            let mut machine = LivenessStateMachine::new(liveness);
            let mut last_update: Option<Instant> = None;
            tracing::debug!(session_id = %thread_id, "session worker started");

            while let Some(req) = rx.blocking_recv() {
                match req {
                    SessionRequest::Frame { bytes, reply } => {
                        let now = Instant::now();
                        let elapsed = last_update.map(|t| now - t).unwrap_or_default();
                        let result = pipeline.process_frame(&mut machine, &bytes, elapsed);
                        match &result {
                            Ok(FrameOutcome::Processed { .. }) => last_update = Some(now),
                            Ok(_) => {}
                            Err(e) => tracing::warn!(
                                session_id = %thread_id,
                                error = %e,
                                "frame skipped"
                            ),
                        }
                        let _ = reply.send(result);
                    }
                    SessionRequest::Reset { reply } => {
                        machine.reset();
                        last_update = None;
                        tracing::info!(session_id = %thread_id, "liveness reset");
                        let _ = reply.send(());
                    }
                }
            }
            tracing::debug!(session_id = %thread_id, "session worker exiting");
        })
        .map_err(SessionError::Spawn)?;

    Ok(SessionHandle {
        created_at: Instant::now(),
        tx,
    })
}

fn short_id(session_id: &str) -> &str {
    session_id
        .char_indices()
        .nth(8)
        .map_or(session_id, |(i, _)| &session_id[..i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{live_face, seed_pipeline};
    use std::sync::Arc;
    use vigil_core::LivenessState;

    fn registry(max: usize) -> (Arc<SessionRegistry>, Arc<crate::testing::FaceScript>) {
        let (pipeline, script) = seed_pipeline();
        let config = LivenessConfig {
            warmup_frames: 4,
            ..Default::default()
        };
        (Arc::new(SessionRegistry::new(pipeline, config, max)), script)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (reg, _) = registry(4);
        reg.on_connect("a").unwrap();
        reg.on_connect("a").unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_removes_and_ignores_unknown() {
        let (reg, _) = registry(4);
        reg.on_connect("a").unwrap();
        reg.on_disconnect("a");
        reg.on_disconnect("a");
        reg.on_disconnect("never");
        assert!(matches!(reg.get("a"), Err(SessionError::UnknownSession(_))));
        assert_eq!(reg.len(), 0);
    }

    #[tokio::test]
    async fn test_capacity_enforced() {
        let (reg, _) = registry(1);
        reg.on_connect("a").unwrap();
        assert!(matches!(reg.on_connect("b"), Err(SessionError::Capacity(1))));
        reg.on_disconnect("a");
        reg.on_connect("b").unwrap();
    }

    #[tokio::test]
    async fn test_frames_reach_live_and_reset_clears() {
        let (reg, script) = registry(4);
        reg.on_connect("a").unwrap();
        let handle = reg.get("a").unwrap();

        let mut last = None;
        for i in 0..8u8 {
            script.push("a", vec![live_face(i)]);
            last = Some(handle.submit_frame(vec![i, b'a']).await.unwrap());
        }
        match last.unwrap() {
            FrameOutcome::Processed { liveness, .. } => {
                assert_eq!(liveness.state, LivenessState::Live)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        handle.reset().await.unwrap();
        script.push("a", vec![live_face(9)]);
        match handle.submit_frame(vec![9, b'a']).await.unwrap() {
            FrameOutcome::Processed { liveness, .. } => {
                assert_eq!(liveness.state, LivenessState::Analyzing)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inflight_handle_survives_disconnect() {
        let (reg, _) = registry(4);
        reg.on_connect("a").unwrap();
        let handle = reg.get("a").unwrap();
        reg.on_disconnect("a");
        // Our clone keeps the channel open; the worker still answers
        assert!(handle.reset().await.is_ok());
        drop(handle);
        assert!(reg.get("a").is_err());
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
