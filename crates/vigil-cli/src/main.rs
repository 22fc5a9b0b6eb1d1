//! `vigil` — command-line client for the vigild daemon.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[zbus::proxy(
    interface = "org.freedesktop.Vigil1",
    default_service = "org.freedesktop.Vigil1",
    default_path = "/org/freedesktop/Vigil1"
)]
trait Vigil {
    fn open_session(&self) -> zbus::Result<String>;
    fn close_session(&self, session_id: &str) -> zbus::Result<()>;
    fn submit_frame(&self, session_id: &str, frame: &[u8]) -> zbus::Result<String>;
    fn reset_liveness(&self, session_id: &str) -> zbus::Result<bool>;
    fn enroll(&self, name: &str, image: &[u8]) -> zbus::Result<String>;
    fn check(&self, image: &[u8]) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "vigil", version, about = "Face identity and liveness client")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus.
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enroll an identity from an image containing exactly one face.
    Enroll {
        #[arg(long)]
        name: String,
        image: PathBuf,
    },
    /// Match every face in a still image (no liveness verdict).
    Check { image: PathBuf },
    /// Stream frames through a fresh session and print each verdict.
    Stream {
        /// Frame images, submitted in the order given.
        #[arg(required = true)]
        frames: Vec<PathBuf>,
        /// Reset liveness after this many frames.
        #[arg(long)]
        reset_after: Option<usize>,
    },
    /// Reset the liveness evidence of an open session.
    Reset { session_id: String },
    /// Show daemon status.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let conn = if cli.session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = VigilProxy::new(&conn)
        .await
        .context("vigild is not reachable")?;

    match cli.command {
        Command::Enroll { name, image } => {
            let bytes = read_image(&image)?;
            print_json(&proxy.enroll(&name, &bytes).await?)?;
        }
        Command::Check { image } => {
            let bytes = read_image(&image)?;
            print_json(&proxy.check(&bytes).await?)?;
        }
        Command::Stream {
            frames,
            reset_after,
        } => stream(&proxy, &frames, reset_after).await?,
        Command::Reset { session_id } => {
            proxy.reset_liveness(&session_id).await?;
            println!("liveness reset for {session_id}");
        }
        Command::Status => print_json(&proxy.status().await?)?,
    }

    Ok(())
}

async fn stream(proxy: &VigilProxy<'_>, frames: &[PathBuf], reset_after: Option<usize>) -> Result<()> {
    let session_id = proxy.open_session().await?;
    tracing::debug!(session_id = %session_id, "session opened");

    // Close the session even if a frame fails
    let result = async {
        for (i, path) in frames.iter().enumerate() {
            if reset_after == Some(i) {
                proxy.reset_liveness(&session_id).await?;
                println!("-- liveness reset --");
            }
            let bytes = read_image(path)?;
            let reply = proxy.submit_frame(&session_id, &bytes).await?;
            println!("{}: {}", path.display(), summarize(&reply)?);
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    proxy.close_session(&session_id).await?;
    result
}

/// One-line summary of a frame reply.
fn summarize(reply: &str) -> Result<String> {
    let v: serde_json::Value = serde_json::from_str(reply)?;
    if v["status"] != "processed" {
        return Ok(v["status"].as_str().unwrap_or("unknown").replace('_', " "));
    }
    let names: Vec<String> = v["per_face_results"]
        .as_array()
        .map(|faces| {
            faces
                .iter()
                .map(|f| f["name"].as_str().unwrap_or("?").to_string())
                .collect()
        })
        .unwrap_or_default();
    let liveness = &v["liveness"];
    Ok(format!(
        "[{}] {} {:.0}% ({})",
        names.join(", "),
        liveness["state"].as_str().unwrap_or("?"),
        liveness["confidence"].as_f64().unwrap_or(0.0) * 100.0,
        liveness["message"].as_str().unwrap_or(""),
    ))
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let v: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&v)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_processed() {
        let reply = r#"{"status":"processed","per_face_results":[{"name":"A","is_match":true,"bounding_box":{"x":0,"y":0,"width":1,"height":1},"distance":0.2}],"liveness":{"state":"LIVE","confidence":0.83,"message":"verified live"}}"#;
        assert_eq!(summarize(reply).unwrap(), "[A] LIVE 83% (verified live)");
    }

    #[test]
    fn test_summarize_nothing_enrolled() {
        assert_eq!(
            summarize(r#"{"status":"nothing_enrolled"}"#).unwrap(),
            "nothing enrolled"
        );
    }

    #[test]
    fn test_cli_parses_stream() {
        let cli = Cli::try_parse_from(["vigil", "stream", "a.jpg", "b.jpg", "--reset-after", "1"]).unwrap();
        match cli.command {
            Command::Stream { frames, reset_after } => {
                assert_eq!(frames.len(), 2);
                assert_eq!(reset_after, Some(1));
            }
            _ => panic!("expected stream"),
        }
    }
}
