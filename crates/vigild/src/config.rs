use std::path::PathBuf;
use std::time::Duration;
use vigil_core::LivenessConfig;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite gallery database.
    pub db_path: PathBuf,
    /// Command line of the sidecar face detector/embedder.
    pub embedder_cmd: String,
    /// Deadline for one embedder reply before the sidecar is restarted.
    pub embedder_timeout_ms: u64,
    /// Fixed dimensionality of embeddings produced by the embedder.
    pub embedding_dim: usize,
    /// Euclidean distance below which a face matches an enrolled identity.
    pub match_tolerance: f32,
    /// Per-session liveness tuning.
    pub liveness: LivenessConfig,
    /// Upper bound on one frame's round-trip through a session worker.
    pub frame_timeout_secs: u64,
    /// Maximum number of concurrently open sessions.
    pub max_sessions: usize,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `VIGIL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("vigil");

        let db_path = std::env::var("VIGIL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("gallery.db"));

        let defaults = LivenessConfig::default();
        let liveness = LivenessConfig {
            warmup_frames: env_usize("VIGIL_WARMUP_FRAMES", defaults.warmup_frames),
            smoothing: env_f32("VIGIL_LIVENESS_SMOOTHING", defaults.smoothing),
            live_threshold: env_f32("VIGIL_LIVE_THRESHOLD", defaults.live_threshold),
            spoof_threshold: env_f32("VIGIL_SPOOF_THRESHOLD", defaults.spoof_threshold),
            min_displacement: env_f32(
                "VIGIL_LIVENESS_MIN_DISPLACEMENT",
                defaults.min_displacement,
            ),
            min_patch_delta: env_f32("VIGIL_LIVENESS_MIN_PATCH_DELTA", defaults.min_patch_delta),
            motion_noise_floor: env_f32(
                "VIGIL_LIVENESS_MOTION_NOISE_FLOOR",
                defaults.motion_noise_floor,
            ),
            patch_noise_floor: env_f32(
                "VIGIL_LIVENESS_PATCH_NOISE_FLOOR",
                defaults.patch_noise_floor,
            ),
            ..defaults
        };

        Self {
            db_path,
            embedder_cmd: std::env::var("VIGIL_EMBEDDER_CMD")
                .unwrap_or_else(|_| "vigil-embedder".to_string()),
            embedder_timeout_ms: env_u64("VIGIL_EMBEDDER_TIMEOUT_MS", 2000),
            embedding_dim: env_usize("VIGIL_EMBEDDING_DIM", 128),
            match_tolerance: env_f32("VIGIL_MATCH_TOLERANCE", vigil_core::DEFAULT_TOLERANCE),
            liveness,
            frame_timeout_secs: env_u64("VIGIL_FRAME_TIMEOUT_SECS", 5),
            max_sessions: env_usize("VIGIL_MAX_SESSIONS", 64),
            session_bus: std::env::var("VIGIL_SESSION_BUS").is_ok(),
        }
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_timeout_secs)
    }

    pub fn embedder_timeout(&self) -> Duration {
        Duration::from_millis(self.embedder_timeout_ms)
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
