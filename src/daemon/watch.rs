//! Folder watching: re-run discovery when a services folder changes.

use super::services::Supervisor;
use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEBOUNCE: Duration = Duration::from_millis(250);

/// Watch `folders` (non-recursively) and call [`Supervisor::rescan`] after
/// each burst of changes. The task ends when `shutdown` is cancelled.
pub fn spawn_watcher(
    folders: &[PathBuf],
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        },
        notify::Config::default(),
    )
    .context("failed to create watcher")?;

    for folder in folders {
        watcher
            .watch(folder, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", folder.display()))?;
        info!("Watching {} for service changes", folder.display());
    }

    Ok(tokio::spawn(async move {
        // the watcher stops delivering events once dropped
        let _watcher = watcher;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => {
                    match event {
                        None => break,
                        Some(Err(e)) => warn!("watcher error: {}", e),
                        Some(Ok(event)) => debug!("watcher event: {:?}", event.kind),
                    }
                }
            }

            // debounce: wait until the folder has been quiet for a while
            while let Ok(Some(_)) = tokio::time::timeout(DEBOUNCE, rx.recv()).await {}

            if let Err(e) = supervisor.rescan().await {
                warn!("Rescanning services failed: {}", e);
            }
        }
        debug!("service watcher ended");
    }))
}
