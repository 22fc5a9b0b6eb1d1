//! Transport-independent service facade: the real-time session contract
//! (connect / disconnect / image / reset) and the batch contract
//! (enroll / check) over one shared gallery.

use std::time::Duration;
use thiserror::Error;
use vigil_core::{FrameOutcome, FramePipeline, GalleryEntry, LivenessConfig, PipelineError};

use crate::session::{SessionError, SessionRegistry};
use crate::store::{GalleryStore, StoreError};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("gallery store error: {0}")]
    Store(#[from] StoreError),
    #[error("frame processing exceeded {0:?}")]
    Timeout(Duration),
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

pub struct VigilService {
    pipeline: FramePipeline,
    sessions: SessionRegistry,
    store: GalleryStore,
    frame_timeout: Duration,
    warmup_frames: usize,
    match_tolerance: f32,
    /// Serializes store and gallery appends so both keep the same order.
    enroll_lock: tokio::sync::Mutex<()>,
}

impl VigilService {
    pub fn new(
        pipeline: FramePipeline,
        store: GalleryStore,
        liveness: LivenessConfig,
        max_sessions: usize,
        frame_timeout: Duration,
        match_tolerance: f32,
    ) -> Self {
        let warmup_frames = liveness.warmup_frames;
        Self {
            sessions: SessionRegistry::new(pipeline.clone(), liveness, max_sessions),
            pipeline,
            store,
            frame_timeout,
            warmup_frames,
            match_tolerance,
            enroll_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Mint a session id and register it.
    pub fn open_session(&self) -> Result<String, ServiceError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.connect(&id)?;
        Ok(id)
    }

    pub fn connect(&self, session_id: &str) -> Result<(), ServiceError> {
        Ok(self.sessions.on_connect(session_id)?)
    }

    pub fn disconnect(&self, session_id: &str) {
        self.sessions.on_disconnect(session_id);
    }

    /// Process one streamed frame for `session_id`.
    ///
    /// Frames for unknown sessions are dropped and logged.
    pub async fn image(&self, session_id: &str, bytes: Vec<u8>) -> Result<FrameOutcome, ServiceError> {
        let handle = self.sessions.get(session_id).map_err(|e| {
            tracing::warn!(session_id, "frame for unregistered session dropped");
            e
        })?;

        match tokio::time::timeout(self.frame_timeout, handle.submit_frame(bytes)).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!(session_id, timeout = ?self.frame_timeout, "frame timed out");
                Err(ServiceError::Timeout(self.frame_timeout))
            }
        }
    }

    pub async fn reset_liveness(&self, session_id: &str) -> Result<(), ServiceError> {
        let handle = self.sessions.get(session_id).map_err(|e| {
            tracing::warn!(session_id, "reset for unregistered session dropped");
            e
        })?;
        // Queued behind any in-flight frame, so it shares the frame bound
        match tokio::time::timeout(self.frame_timeout, handle.reset()).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!(session_id, timeout = ?self.frame_timeout, "reset timed out");
                Err(ServiceError::Timeout(self.frame_timeout))
            }
        }
    }

    /// Enroll `name` from a still image with exactly one face.
    ///
    /// The entry is persisted before it becomes visible to matchers, and
    /// concurrent enrollments land in the same order in both.
    pub async fn enroll(&self, name: &str, bytes: Vec<u8>) -> Result<GalleryEntry, ServiceError> {
        let pipeline = self.pipeline.clone();
        let owned_name = name.to_string();
        let entry = tokio::task::spawn_blocking(move || {
            pipeline.enrollment_candidate(&owned_name, &bytes)
        })
        .await??;

        let _order = self.enroll_lock.lock().await;
        self.store.insert(&entry).await.map_err(|e| {
            tracing::error!(error = %e, "enroll: store insert failed");
            e
        })?;
        self.pipeline
            .gallery()
            .insert(entry.clone())
            .map_err(PipelineError::from)?;

        tracing::info!(name, entry_id = %entry.id, "enrolled successfully");
        Ok(entry)
    }

    /// One-shot identity check of a still image; no liveness claim.
    pub async fn check(&self, bytes: Vec<u8>) -> Result<FrameOutcome, ServiceError> {
        let pipeline = self.pipeline.clone();
        Ok(tokio::task::spawn_blocking(move || pipeline.check(&bytes)).await??)
    }

    /// `identities_persisted` is null when the store cannot be read.
    pub async fn status(&self) -> serde_json::Value {
        let persisted = match self.store.count_all().await {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!(error = %e, "status: store count failed");
                None
            }
        };
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities_enrolled": self.pipeline.gallery().len(),
            "identities_persisted": persisted,
            "embedding_dim": self.pipeline.gallery().dim(),
            "active_sessions": self.sessions.len(),
            "match_tolerance": self.match_tolerance,
            "warmup_frames": self.warmup_frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face_at, live_face, pipeline_with, still_face, SeedDecoder, DIM};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Instant;
    use vigil_core::{
        Embedding, EmbedderError, EmbeddingSource, EuclideanMatcher, FaceObservation, Frame,
        Gallery, GalleryError, LivenessState,
    };

    /// Embedder that hangs far past any frame deadline.
    struct StallingSource(Duration);

    impl EmbeddingSource for StallingSource {
        fn extract(&self, _frame: &Frame) -> Result<Vec<FaceObservation>, EmbedderError> {
            std::thread::sleep(self.0);
            Ok(vec![still_face()])
        }
    }

    async fn service() -> (Arc<VigilService>, Arc<crate::testing::FaceScript>) {
        let store = GalleryStore::open(Path::new(":memory:"), DIM).await.unwrap();
        let (pipeline, script) = pipeline_with(Arc::new(Gallery::new(DIM)));
        let liveness = LivenessConfig {
            warmup_frames: 4,
            ..Default::default()
        };
        let svc = VigilService::new(
            pipeline,
            store,
            liveness,
            8,
            Duration::from_secs(5),
            vigil_core::DEFAULT_TOLERANCE,
        );
        (Arc::new(svc), script)
    }

    #[tokio::test]
    async fn test_image_before_enrollment_reports_nothing_enrolled() {
        let (svc, _) = service().await;
        let id = svc.open_session().unwrap();
        let outcome = svc.image(&id, vec![1, 0]).await.unwrap();
        assert_eq!(outcome, FrameOutcome::NothingEnrolled);
        assert_eq!(svc.check(vec![1, 0]).await.unwrap(), FrameOutcome::NothingEnrolled);
    }

    #[tokio::test]
    async fn test_enroll_persists_and_matches() {
        let (svc, script) = service().await;
        script.push("\0", vec![still_face()]);
        let entry = svc.enroll("A", vec![0, 0]).await.unwrap();
        assert_eq!(entry.name, "A");
        assert_eq!(svc.store.count_all().await.unwrap(), 1);

        script.push("\0", vec![face_at(8.0, vec![0.9, 0.1, 0.0])]);
        match svc.check(vec![3, 0]).await.unwrap() {
            FrameOutcome::Checked { faces } => {
                assert_eq!(faces[0].name, "A");
                assert!(faces[0].is_match);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let status = svc.status().await;
        assert_eq!(status["identities_enrolled"], 1);
        assert_eq!(status["identities_persisted"], 1);
    }

    #[tokio::test]
    async fn test_ambiguous_enrollment_not_persisted() {
        let (svc, script) = service().await;
        script.push("\0", vec![still_face(), face_at(30.0, vec![0.0, 1.0, 0.0])]);
        let err = svc.enroll("A", vec![0, 0]).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Pipeline(PipelineError::Gallery(GalleryError::AmbiguousFace(2)))
        ));
        assert_eq!(svc.store.count_all().await.unwrap(), 0);
        assert!(svc.pipeline.gallery().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session_dropped() {
        let (svc, _) = service().await;
        let err = svc.image("ghost", vec![1, 0]).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Session(SessionError::UnknownSession(_))
        ));
        assert!(svc.reset_liveness("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_rejects_later_frames() {
        let (svc, _) = service().await;
        let id = svc.open_session().unwrap();
        svc.disconnect(&id);
        assert!(svc.image(&id, vec![1, 0]).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sessions_are_isolated() {
        let (svc, script) = service().await;
        script.push("\0", vec![still_face()]);
        svc.enroll("A", vec![0, 0]).await.unwrap();

        svc.connect("live").unwrap();
        svc.connect("photo").unwrap();

        let live = {
            let svc = svc.clone();
            let script = script.clone();
            tokio::spawn(async move {
                let mut last = None;
                for i in 0..12u8 {
                    script.push("live", vec![live_face(i)]);
                    last = Some(svc.image("live", vec![i, b'l']).await.unwrap());
                }
                last
            })
        };
        let photo = {
            let svc = svc.clone();
            let script = script.clone();
            tokio::spawn(async move {
                let mut last = None;
                for _ in 0..12u8 {
                    script.push("photo", vec![still_face()]);
                    last = Some(svc.image("photo", vec![0, b'p']).await.unwrap());
                }
                last
            })
        };

        let state = |outcome: Option<FrameOutcome>| match outcome {
            Some(FrameOutcome::Processed { liveness, .. }) => liveness.state,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(state(live.await.unwrap()), LivenessState::Live);
        assert_eq!(state(photo.await.unwrap()), LivenessState::Spoof);
    }

    #[tokio::test]
    async fn test_reset_liveness_acknowledged() {
        let (svc, script) = service().await;
        script.push("\0", vec![still_face()]);
        svc.enroll("A", vec![0, 0]).await.unwrap();

        let id = svc.open_session().unwrap();
        for _ in 0..6 {
            script.push("\0", vec![still_face()]);
            svc.image(&id, vec![0, 0]).await.unwrap();
        }
        svc.reset_liveness(&id).await.unwrap();

        script.push("\0", vec![still_face()]);
        match svc.image(&id, vec![0, 0]).await.unwrap() {
            FrameOutcome::Processed { liveness, .. } => {
                assert_eq!(liveness.state, LivenessState::Analyzing);
                assert_eq!(liveness.confidence, 0.0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_status_reports_unreadable_store_as_null() {
        let (svc, _) = service().await;
        svc.store.drop_schema().await;
        let status = svc.status().await;
        assert!(status["identities_persisted"].is_null());
        assert_eq!(status["identities_enrolled"], 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enrollments_keep_store_and_gallery_order() {
        let (svc, script) = service().await;
        const N: usize = 16;
        for i in 0..N {
            script.push("\0", vec![face_at(8.0, vec![i as f32, 0.0, 0.0])]);
        }

        let tasks: Vec<_> = (0..N)
            .map(|i| {
                let svc = svc.clone();
                tokio::spawn(async move { svc.enroll(&format!("user{i}"), vec![0, 0]).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let persisted: Vec<_> = svc
            .store
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        let in_memory: Vec<_> = svc.pipeline.gallery().snapshot().iter().map(|e| e.id).collect();
        assert_eq!(persisted.len(), N);
        assert_eq!(persisted, in_memory);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hung_embedder_bounds_image_and_reset() {
        let gallery = Gallery::new(DIM);
        gallery
            .insert(GalleryEntry::new("A", Embedding::new(vec![1.0, 0.0, 0.0])))
            .unwrap();
        let pipeline = FramePipeline::new(
            Arc::new(gallery),
            EuclideanMatcher::default(),
            Arc::new(SeedDecoder),
            Arc::new(StallingSource(Duration::from_secs(3))),
        );
        let store = GalleryStore::open(Path::new(":memory:"), DIM).await.unwrap();
        let timeout = Duration::from_millis(100);
        let svc = VigilService::new(
            pipeline,
            store,
            LivenessConfig::default(),
            8,
            timeout,
            vigil_core::DEFAULT_TOLERANCE,
        );
        let id = svc.open_session().unwrap();

        let start = Instant::now();
        let err = svc.image(&id, vec![0, 0]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout(_)));

        // The worker is still stuck on the frame; reset must not wait for it
        let err = svc.reset_liveness(&id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
