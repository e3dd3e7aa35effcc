use crate::error::{Result, RuleError};
use crate::repository::{has_extension, ModelRepository};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// 规则目录监听器：文件变化时重新加载或卸载模型
pub struct ModelWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ModelWatcher {
    pub fn spawn(dir: &Path, extension: &str, repository: Arc<ModelRepository>) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(64);

        let mut watcher = notify::recommended_watcher(move |res| {
            // called on the notify thread
            if tx.blocking_send(res).is_err() {
                debug!("Rule watcher channel closed");
            }
        })
        .map_err(|e| RuleError::Watch(e.to_string()))?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| RuleError::Watch(e.to_string()))?;

        debug!(dir = %dir.display(), "File watcher started");

        let extension = extension.to_string();
        let task = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(event) => handle_event(&repository, &extension, event).await,
                    Err(e) => error!("Watch error: {}", e),
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

async fn handle_event(repository: &ModelRepository, extension: &str, event: Event) {
    let paths: Vec<PathBuf> = event
        .paths
        .into_iter()
        .filter(|p| has_extension(p, extension))
        .collect();

    for path in paths {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => {
                // renames report the old path as a modification
                if !path.exists() {
                    repository.unload_file(&path).await;
                    continue;
                }
                debug!(path = %path.display(), "Rule file changed");
                if let Err(e) = repository.load_file(&path).await {
                    warn!(path = %path.display(), error = %e, "Failed to reload rule file");
                }
            }
            EventKind::Remove(_) => {
                debug!(path = %path.display(), "Rule file removed");
                repository.unload_file(&path).await;
            }
            _ => {}
        }
    }
}
