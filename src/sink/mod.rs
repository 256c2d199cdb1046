//! Artifact submission sinks.
//!
//! The transport behind an upload is deliberately opaque: the core only
//! depends on [`Sink::submit`] and its three-way verdict. Retryable
//! failures get a bounded exponential backoff; after the budget is spent
//! the artifact is dropped and the event logged — profiling never stalls
//! on a slow receiver.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

/// Verdict of one submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Ok,
    /// Transient receiver-side problem; worth another attempt.
    Retry,
    /// The artifact will never be accepted; drop it.
    Fatal,
}

/// An artifact receiver. Implementations are synchronous; the session runs
/// them on the blocking pool.
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;
    fn submit(&self, artifact: &[u8], metadata: &Value) -> SubmitStatus;
}

/// Submission attempts per artifact, including the first.
pub const MAX_SUBMIT_ATTEMPTS: u32 = 3;

const RETRY_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Submit with bounded retries. Returns true when the artifact was
/// accepted.
pub async fn submit_with_retry(sink: Arc<dyn Sink>, artifact: Arc<Vec<u8>>, metadata: Value) -> bool {
    let mut backoff = RETRY_BACKOFF_INITIAL;

    for attempt in 1..=MAX_SUBMIT_ATTEMPTS {
        let sink_ref = Arc::clone(&sink);
        let artifact_ref = Arc::clone(&artifact);
        let metadata_ref = metadata.clone();
        let status = tokio::task::spawn_blocking(move || {
            sink_ref.submit(&artifact_ref, &metadata_ref)
        })
        .await
        .unwrap_or(SubmitStatus::Fatal);

        match status {
            SubmitStatus::Ok => {
                log::info!("artifact submitted to {}", sink.name());
                return true;
            }
            SubmitStatus::Fatal => {
                log::error!("{} rejected the artifact permanently, dropping it", sink.name());
                return false;
            }
            SubmitStatus::Retry if attempt < MAX_SUBMIT_ATTEMPTS => {
                log::warn!(
                    "{} asked for a retry (attempt {attempt}/{MAX_SUBMIT_ATTEMPTS}), backing off {backoff:?}",
                    sink.name()
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            SubmitStatus::Retry => {
                log::error!(
                    "{} still failing after {MAX_SUBMIT_ATTEMPTS} attempts, dropping the artifact",
                    sink.name()
                );
                return false;
            }
        }
    }
    false
}

/// Spool sink: moves finished artifacts into a directory for an external
/// shipper to pick up.
pub struct SpoolSink {
    dir: PathBuf,
}

impl SpoolSink {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        SpoolSink { dir }
    }
}

impl Sink for SpoolSink {
    fn name(&self) -> &'static str {
        "spool"
    }

    fn submit(&self, artifact: &[u8], metadata: &Value) -> SubmitStatus {
        let stamp = metadata
            .get("end_time")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .replace(':', "-");
        let path = self.dir.join(format!("profile_{stamp}.col"));

        let write = || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
            std::io::Write::write_all(&mut tmp, artifact)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        };
        match write() {
            Ok(()) => SubmitStatus::Ok,
            Err(e) => {
                log::warn!("spooling artifact to {} failed: {e}", path.display());
                SubmitStatus::Retry
            }
        }
    }
}
