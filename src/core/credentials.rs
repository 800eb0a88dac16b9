use anyhow::{Context, Result};
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

const DEBOUNCE: Duration = Duration::from_millis(200);

/// Watches credential files and reports the ones that changed on disk.
///
/// Editors and `aws configure` tend to write a file in several steps, so
/// events are debounced before being forwarded.
pub struct CredentialsWatcher {
    _watcher: RecommendedWatcher,
}

impl CredentialsWatcher {
    pub fn start(watch_paths: Vec<PathBuf>) -> Result<(Self, mpsc::UnboundedReceiver<PathBuf>)> {
        let (async_tx, async_rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut dir_to_files: HashMap<PathBuf, Vec<PathBuf>> = HashMap::new();
        for path in &watch_paths {
            if let (Some(parent), Some(_)) = (path.parent(), path.file_name()) {
                dir_to_files
                    .entry(parent.to_path_buf())
                    .or_default()
                    .push(path.clone());
            }
        }

        let dir_to_files_clone = dir_to_files.clone();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "Credentials watch error");
                        return;
                    }
                };
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    return;
                }
                for path in &event.paths {
                    let Some(parent) = path.parent() else {
                        continue;
                    };
                    let Some(files) = dir_to_files_clone.get(parent) else {
                        continue;
                    };
                    for expected in files {
                        if expected.file_name() == path.file_name() {
                            let _ = notify_tx.send(expected.clone());
                        }
                    }
                }
            },
            Config::default(),
        )?;

        for parent_dir in dir_to_files.keys() {
            if parent_dir.exists() {
                watcher
                    .watch(parent_dir, RecursiveMode::NonRecursive)
                    .with_context(|| {
                        format!("Failed to watch directory: {}", parent_dir.display())
                    })?;
                tracing::info!(?parent_dir, "Watching credentials directory");
            } else {
                tracing::warn!(
                    ?parent_dir,
                    "Credentials directory does not exist, skipping watch"
                );
            }
        }

        tokio::spawn(async move {
            while let Some(first) = notify_rx.recv().await {
                tokio::time::sleep(DEBOUNCE).await;

                let mut changed: HashSet<PathBuf> = HashSet::new();
                changed.insert(first);
                while let Ok(path) = notify_rx.try_recv() {
                    changed.insert(path);
                }

                for path in changed {
                    tracing::info!(?path, "Credentials file changed on disk");
                    if async_tx.send(path).is_err() {
                        return;
                    }
                }
            }
        });

        Ok((Self { _watcher: watcher }, async_rx))
    }
}
