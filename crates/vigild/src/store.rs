use chrono::{DateTime, Utc};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;
use vigil_core::{Embedding, GalleryEntry};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed — key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid embedding dimension: {got} (expected {expected})")]
    InvalidEmbeddingDim { expected: usize, got: usize },
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("invalid stored entry id: {0}")]
    InvalidId(String),
    #[error("invalid stored timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed gallery persistence with AES-256-GCM encrypted embeddings.
///
/// A per-installation 32-byte key is generated at first use and stored at
/// `{db_dir}/.key` (mode 0600). Entries are returned in enrollment order so
/// the in-memory gallery keeps its first-seen tie-breaking after a restart.
#[derive(Clone)]
pub struct GalleryStore {
    conn: Connection,
    enc_key: [u8; 32],
    dim: usize,
}

impl GalleryStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path, dim: usize) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/vigil"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS gallery (
                     seq INTEGER PRIMARY KEY AUTOINCREMENT,
                     id TEXT NOT NULL UNIQUE,
                     name TEXT NOT NULL,
                     embedding BLOB NOT NULL,
                     enrolled_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key, dim })
    }

    /// Persist one enrolled entry.
    pub async fn insert(&self, entry: &GalleryEntry) -> Result<(), StoreError> {
        self.validate(entry.embedding.values())?;
        let blob = self.encrypt_embedding(entry.embedding.values())?;

        let id = entry.id.to_string();
        let name = entry.name.clone();
        let enrolled_at = entry.enrolled_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO gallery (id, name, embedding, enrolled_at) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, name, blob, enrolled_at],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    /// Load every entry in enrollment order.
    pub async fn load_all(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        // Fetch raw rows from SQLite; decrypt outside the blocking closure
        let rows: Vec<(String, String, Vec<u8>, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT id, name, embedding, enrolled_at FROM gallery ORDER BY seq")?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (id, name, blob, enrolled_at) in rows {
            let id = Uuid::parse_str(&id).map_err(|_| StoreError::InvalidId(id.clone()))?;
            let enrolled_at = DateTime::parse_from_rfc3339(&enrolled_at)
                .map_err(|_| StoreError::InvalidTimestamp(enrolled_at.clone()))?
                .with_timezone(&Utc);
            let values = self.decrypt_embedding(&blob)?;
            entries.push(GalleryEntry {
                id,
                name,
                embedding: Embedding::new(values),
                enrolled_at,
            });
        }
        Ok(entries)
    }

    /// Count enrolled entries.
    pub async fn count_all(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM gallery", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    fn validate(&self, values: &[f32]) -> Result<(), StoreError> {
        if values.len() != self.dim {
            return Err(StoreError::InvalidEmbeddingDim {
                expected: self.dim,
                got: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(StoreError::InvalidEmbeddingValue);
        }
        Ok(())
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encrypt embedding values with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_embedding(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        let plaintext = embedding_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_embedding(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        let values = bytes_to_embedding(&plaintext)?;
        self.validate(&values)?;
        Ok(values)
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            ))
        })?;
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
impl GalleryStore {
    /// Drop the gallery table so every later query fails.
    pub(crate) async fn drop_schema(&self) {
        self.conn
            .call(|conn| Ok(conn.execute_batch("DROP TABLE gallery")?))
            .await
            .unwrap();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
