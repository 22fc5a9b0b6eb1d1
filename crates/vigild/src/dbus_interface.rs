use std::sync::Arc;
use vigil_core::{GalleryError, PipelineError};
use zbus::interface;

use crate::service::{ServiceError, VigilService};

/// D-Bus interface for the Vigil daemon.
///
/// Bus name: org.freedesktop.Vigil1
/// Object path: /org/freedesktop/Vigil1
pub struct VigilInterface {
    pub service: Arc<VigilService>,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

/// User-facing error kinds that are reported in the JSON body instead of
/// failing the call.
fn soft_error_kind(e: &ServiceError) -> Option<&'static str> {
    match e {
        ServiceError::Pipeline(PipelineError::Gallery(GalleryError::NoFace)) => Some("NoFaceError"),
        ServiceError::Pipeline(PipelineError::Gallery(GalleryError::AmbiguousFace(_))) => {
            Some("AmbiguousFaceError")
        }
        _ => None,
    }
}

#[interface(name = "org.freedesktop.Vigil1")]
impl VigilInterface {
    /// Open a streaming session. Returns the new session id.
    async fn open_session(&self) -> zbus::fdo::Result<String> {
        self.service.open_session().map_err(|e| {
            tracing::warn!(error = %e, "open_session refused");
            failed(e)
        })
    }

    /// Close a streaming session and discard its liveness state.
    async fn close_session(&self, session_id: &str) -> zbus::fdo::Result<()> {
        self.service.disconnect(session_id);
        Ok(())
    }

    /// Submit one encoded frame. Returns the per-face results and the
    /// session's liveness verdict as JSON.
    async fn submit_frame(&self, session_id: &str, frame: Vec<u8>) -> zbus::fdo::Result<String> {
        let outcome = self
            .service
            .image(session_id, frame)
            .await
            .map_err(failed)?;
        to_json(&outcome)
    }

    /// Clear the liveness evidence of a session.
    async fn reset_liveness(&self, session_id: &str) -> zbus::fdo::Result<bool> {
        self.service
            .reset_liveness(session_id)
            .await
            .map_err(failed)?;
        Ok(true)
    }

    /// Enroll an identity from a still image containing exactly one face.
    async fn enroll(&self, name: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(name, bytes = image.len(), "enroll requested");
        match self.service.enroll(name, image).await {
            Ok(entry) => Ok(serde_json::json!({
                "success": true,
                "id": entry.id.to_string(),
                "name": entry.name,
            })
            .to_string()),
            Err(e) => match soft_error_kind(&e) {
                Some(kind) => {
                    tracing::info!(name, error = %e, "enroll rejected");
                    Ok(serde_json::json!({ "error": kind, "message": e.to_string() }).to_string())
                }
                None => {
                    tracing::error!(name, error = %e, "enroll failed");
                    Err(failed(e))
                }
            },
        }
    }

    /// Match every face in a still image against the gallery.
    async fn check(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        match self.service.check(image).await {
            Ok(outcome) => to_json(&outcome),
            Err(e) => match soft_error_kind(&e) {
                Some(kind) => {
                    Ok(serde_json::json!({ "error": kind, "message": e.to_string() }).to_string())
                }
                None => Err(failed(e)),
            },
        }
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.service.status().await.to_string())
    }
}
