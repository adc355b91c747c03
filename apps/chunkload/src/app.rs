//! Drives one upload run from the command line.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chunkload_transfer::{ByteSource, FileSource, HttpTransport, UploadEvent, Uploader};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;

/// Uploads `paths` and waits for every file to finish.
///
/// Fails when any file could not be uploaded.
pub async fn run(config: Config, paths: Vec<PathBuf>) -> anyhow::Result<()> {
    let transport = Arc::new(HttpTransport::new()?);
    let mut uploader = Uploader::new(config.upload, transport)?;
    let mut events = uploader
        .take_events()
        .context("upload events already taken")?;

    let mut summary = Summary::default();
    for path in &paths {
        let source = FileSource::open(path)
            .await
            .with_context(|| format!("cannot open {}", path.display()))?;
        let name = source.name().to_string();
        let file = uploader.add_file(Arc::new(source)).await?;
        summary.names.insert(file, name);
    }

    uploader.start().await?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if summary.record(&event) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, stopping uploads");
                uploader.stop().await?;
                summary.interrupted = true;
                break;
            }
        }
    }

    let stats = uploader.stats().await?;
    info!(
        uploaded = summary.uploaded,
        failed = summary.failed,
        bytes = stats.processed,
        "upload finished"
    );
    uploader.destroy().await?;

    if summary.interrupted {
        anyhow::bail!("interrupted");
    }
    if summary.gave_up {
        anyhow::bail!("server unreachable, gave up reconnecting");
    }
    if summary.failed > 0 {
        anyhow::bail!("{} of {} files failed", summary.failed, paths.len());
    }
    Ok(())
}

/// Tally of one run, fed from the event stream.
#[derive(Debug, Default)]
struct Summary {
    names: HashMap<Uuid, String>,
    uploaded: usize,
    failed: usize,
    gave_up: bool,
    interrupted: bool,
}

impl Summary {
    fn name(&self, file: &Uuid) -> &str {
        self.names.get(file).map(String::as_str).unwrap_or("?")
    }

    /// Logs `event`; returns true once the run is over.
    fn record(&mut self, event: &UploadEvent) -> bool {
        match event {
            UploadEvent::FileStarted { file } => {
                info!(name = %self.name(file), "uploading");
            }
            UploadEvent::FileProgress { file, percent, .. } => {
                debug!(name = %self.name(file), percent, "file progress");
            }
            UploadEvent::FileUploaded { file, status, .. } => {
                self.uploaded += 1;
                info!(name = %self.name(file), status, "uploaded");
            }
            UploadEvent::FileFailed {
                file,
                status,
                response,
            } => {
                self.failed += 1;
                error!(name = %self.name(file), status, response = %response, "upload failed");
            }
            UploadEvent::Progress(stats) => {
                debug!(
                    percent = stats.percent,
                    processed = stats.processed,
                    total = stats.total,
                    rate = stats.processed_per_sec,
                    "progress"
                );
            }
            UploadEvent::ServerDisconnected => warn!("server unavailable, waiting to reconnect"),
            UploadEvent::ServerReconnected => info!("server reachable again"),
            UploadEvent::TooManyReconnects => {
                self.gave_up = true;
                error!("too many reconnect attempts");
                return true;
            }
            UploadEvent::Done | UploadEvent::Destroyed => return true,
            _ => {}
        }
        false
    }
}
