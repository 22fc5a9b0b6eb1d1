//! Sidecar face detector/embedder speaking a line-oriented protocol.
//!
//! Request (stdin):  `u32 LE width | u32 LE height | width*height*3 RGB8 bytes`
//! Response (stdout): one JSON line
//! `{"faces":[{"bbox":[x,y,w,h],"landmarks":[[x,y],..5]?,"embedding":[..]}]}`

use serde::Deserialize;
use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use vigil_core::{BoundingBox, Embedding, EmbedderError, EmbeddingSource, FaceObservation, Frame};

#[derive(Deserialize)]
struct WireReply {
    faces: Vec<WireFace>,
}

#[derive(Deserialize)]
struct WireFace {
    bbox: [f32; 4],
    #[serde(default)]
    landmarks: Option<[[f32; 2]; 5]>,
    embedding: Vec<f32>,
}

/// One running child plus the pump threads that own its pipes.
///
/// Pipe I/O happens off the caller's thread so a wedged child can only ever
/// cost the caller its reply deadline.
struct Sidecar {
    child: Child,
    requests: Sender<Vec<u8>>,
    replies: Receiver<io::Result<String>>,
}

impl Sidecar {
    fn start(program: &str, args: &[String]) -> Result<Self, EmbedderError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let mut stdin = child.stdin.take().ok_or(EmbedderError::Unavailable)?;
        let mut stdout = BufReader::new(child.stdout.take().ok_or(EmbedderError::Unavailable)?);

        let (requests, request_rx) = mpsc::channel::<Vec<u8>>();
        std::thread::Builder::new()
            .name("vigil-embedder-in".to_string())
            .spawn(move || {
                for buf in request_rx {
                    if stdin.write_all(&buf).and_then(|()| stdin.flush()).is_err() {
                        break;
                    }
                }
            })?;

        let (reply_tx, replies) = mpsc::channel();
        std::thread::Builder::new()
            .name("vigil-embedder-out".to_string())
            .spawn(move || loop {
                let mut line = String::new();
                match stdout.read_line(&mut line) {
                    // EOF: dropping the sender reports the sidecar as gone
                    Ok(0) => break,
                    Ok(_) => {
                        if reply_tx.send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = reply_tx.send(Err(e));
                        break;
                    }
                }
            })?;

        tracing::info!(program, pid = child.id(), "embedder sidecar started");
        Ok(Self {
            child,
            requests,
            replies,
        })
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// [`EmbeddingSource`] backed by a long-lived child process.
///
/// Requests are serialized through one pipe pair. A child that misses the
/// reply deadline or closes its output is killed and replaced on the next
/// request.
pub struct CommandEmbedder {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    sidecar: Mutex<Option<Sidecar>>,
}

impl CommandEmbedder {
    /// Spawn `cmdline` (whitespace-separated program and arguments); each
    /// request must be answered within `timeout`.
    pub fn spawn(cmdline: &str, timeout: Duration) -> Result<Self, EmbedderError> {
        let mut parts = cmdline.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| EmbedderError::Protocol("empty embedder command".to_string()))?;
        let args: Vec<String> = parts.collect();

        let sidecar = Sidecar::start(&program, &args)?;
        Ok(Self {
            program,
            args,
            timeout,
            sidecar: Mutex::new(Some(sidecar)),
        })
    }
}

impl EmbeddingSource for CommandEmbedder {
    fn extract(&self, frame: &Frame) -> Result<Vec<FaceObservation>, EmbedderError> {
        let mut slot = self.sidecar.lock().unwrap_or_else(PoisonError::into_inner);
        let sidecar = match slot.take() {
            Some(sidecar) => sidecar,
            None => {
                tracing::warn!(program = %self.program, "restarting embedder sidecar");
                Sidecar::start(&self.program, &self.args)?
            }
        };

        if sidecar.requests.send(encode_request(frame)).is_err() {
            tracing::error!("embedder sidecar stopped accepting requests");
            return Err(EmbedderError::Unavailable);
        }

        // Any early return drops (and kills) the sidecar
        match sidecar.replies.recv_timeout(self.timeout) {
            Ok(Ok(line)) => {
                *slot = Some(sidecar);
                parse_reply(&line)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(RecvTimeoutError::Timeout) => {
                tracing::error!(timeout = ?self.timeout, "embedder sidecar timed out, killing it");
                Err(EmbedderError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::error!("embedder sidecar closed its output");
                Err(EmbedderError::Unavailable)
            }
        }
    }
}

fn encode_request(frame: &Frame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + frame.rgb.len());
    buf.extend_from_slice(&frame.width.to_le_bytes());
    buf.extend_from_slice(&frame.height.to_le_bytes());
    buf.extend_from_slice(&frame.rgb);
    buf
}

fn parse_reply(line: &str) -> Result<Vec<FaceObservation>, EmbedderError> {
    let reply: WireReply = serde_json::from_str(line.trim())
        .map_err(|e| EmbedderError::Protocol(e.to_string()))?;

    Ok(reply
        .faces
        .into_iter()
        .map(|f| FaceObservation {
            bbox: BoundingBox::new(f.bbox[0], f.bbox[1], f.bbox[2], f.bbox[3]),
            landmarks: f.landmarks.map(|lm| lm.map(|[x, y]| (x, y))),
            embedding: Embedding::new(f.embedding),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[test]
    fn test_encode_request_layout() {
        let frame = Frame::new(2, 1, vec![1, 2, 3, 4, 5, 6]);
        let buf = encode_request(&frame);
        assert_eq!(&buf[0..4], &2u32.to_le_bytes());
        assert_eq!(&buf[4..8], &1u32.to_le_bytes());
        assert_eq!(&buf[8..], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_parse_reply_with_and_without_landmarks() {
        let line = r#"{"faces":[
            {"bbox":[1,2,30,40],"embedding":[0.1,0.2]},
            {"bbox":[5,6,7,8],"landmarks":[[1,1],[2,2],[3,3],[4,4],[5,5]],"embedding":[0.3,0.4]}
        ]}"#
        .replace('\n', "");
        let faces = parse_reply(&line).unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].bbox, BoundingBox::new(1.0, 2.0, 30.0, 40.0));
        assert!(faces[0].landmarks.is_none());
        assert_eq!(faces[1].landmarks.unwrap()[1], (2.0, 2.0));
        assert_eq!(faces[1].embedding.values(), &[0.3, 0.4]);
    }

    #[test]
    fn test_parse_reply_empty_and_malformed() {
        assert!(parse_reply("{\"faces\":[]}\n").unwrap().is_empty());
        assert!(matches!(
            parse_reply("garbage"),
            Err(EmbedderError::Protocol(_))
        ));
    }

    #[test]
    fn test_spawn_rejects_empty_and_missing_command() {
        assert!(matches!(
            CommandEmbedder::spawn("   ", TIMEOUT),
            Err(EmbedderError::Protocol(_))
        ));
        assert!(matches!(
            CommandEmbedder::spawn("/nonexistent/vigil-embedder-test", TIMEOUT),
            Err(EmbedderError::Io(_))
        ));
    }

    #[test]
    fn test_sidecar_closing_output_is_unavailable() {
        // `true` exits immediately without answering
        let Ok(embedder) = CommandEmbedder::spawn("true", TIMEOUT) else {
            return;
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        let frame = Frame::new(1, 1, vec![0, 0, 0]);
        assert!(embedder.extract(&frame).is_err());
    }

    #[test]
    fn test_silent_sidecar_times_out_and_is_replaced() {
        // `sleep` never reads its input nor answers
        let timeout = Duration::from_millis(200);
        let Ok(embedder) = CommandEmbedder::spawn("sleep 1000", timeout) else {
            return;
        };
        // Larger than a pipe buffer, so a blocking write would hang here
        let frame = Frame::new(640, 480, vec![0; 640 * 480 * 3]);

        let start = Instant::now();
        assert!(matches!(
            embedder.extract(&frame),
            Err(EmbedderError::Timeout(t)) if t == timeout
        ));
        assert!(start.elapsed() < Duration::from_secs(2));

        // The replacement child is just as silent; the call stays bounded
        let start = Instant::now();
        assert!(embedder.extract(&frame).is_err());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_echo_sidecar_answers_and_stays_up() {
        // `cat` echoes the request; a header of ASCII spaces makes it a valid reply
        let Ok(embedder) = CommandEmbedder::spawn("cat", TIMEOUT) else {
            return;
        };
        let blank = u32::from_le_bytes(*b"    ");
        let frame = Frame::new(blank, blank, b"{\"faces\":[]}\n".to_vec());
        assert!(embedder.extract(&frame).unwrap().is_empty());
        assert!(embedder.extract(&frame).unwrap().is_empty());
    }
}
