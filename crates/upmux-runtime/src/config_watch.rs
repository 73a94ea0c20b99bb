//! Polling watcher for the config file.
//!
//! Yields whenever the file's modification time or length changes. The
//! first observation is the baseline and is not yielded.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_stream::stream;
use futures_util::Stream;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default polling period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// What identifies one version of the file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFingerprint {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

async fn fingerprint(path: &Path) -> Option<FileFingerprint> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some(FileFingerprint {
        modified: meta.modified().ok(),
        len: meta.len(),
    })
}

pub struct ConfigFileWatcher {
    path: PathBuf,
    interval: Duration,
    cancel_token: CancellationToken,
}

impl ConfigFileWatcher {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration, cancel_token: CancellationToken) -> Self {
        Self {
            path: path.into(),
            interval: poll_interval,
            cancel_token,
        }
    }

    /// Stream of fingerprints, one per observed change.
    ///
    /// A file that disappears is not a change; the next version written
    /// is. Completes when the cancellation token fires.
    pub fn changes(self) -> impl Stream<Item = FileFingerprint> {
        let Self {
            path,
            interval: period,
            cancel_token,
        } = self;

        stream! {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last = fingerprint(&path).await;
            debug!(path = %path.display(), "Watching config file");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(current) = fingerprint(&path).await else {
                            continue;
                        };
                        if last != Some(current) {
                            debug!(path = %path.display(), len = current.len, "Config file changed");
                            last = Some(current);
                            yield current;
                        }
                    }
                    _ = cancel_token.cancelled() => {
                        debug!(path = %path.display(), "Config watcher cancelled");
                        break;
                    }
                }
            }
        }
    }
}
