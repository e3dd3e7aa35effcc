use crate::error::{Result, RuleError};
use crate::model::{Rule, RuleModel};
use crate::parser::parse_rules;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// 模型生命周期监听器
///
/// `model_unloaded` runs before a replacement model becomes visible.
/// Listeners must not call back into the repository's load/unload methods.
#[async_trait]
pub trait ModelListener: Send + Sync {
    async fn model_loaded(&self, _model: &Arc<RuleModel>) {}

    async fn model_unloaded(&self, _model: &Arc<RuleModel>) {}
}

/// 规则模型仓库，按模型名称（文件名）索引
pub struct ModelRepository {
    models: RwLock<HashMap<String, Arc<RuleModel>>>,
    listeners: RwLock<Vec<Arc<dyn ModelListener>>>,
    // serializes load/unload so notifications stay ordered per model
    lifecycle: Mutex<()>,
}

impl ModelRepository {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            lifecycle: Mutex::new(()),
        }
    }

    pub async fn add_listener(&self, listener: Arc<dyn ModelListener>) {
        self.listeners.write().await.push(listener);
    }

    /// 解析并加载模型文本；同名模型会被替换
    pub async fn load_str(&self, name: &str, text: &str, source: Option<PathBuf>) -> Result<Arc<RuleModel>> {
        let model = parse_rules(name, source, text)?;
        self.install(model.clone()).await;
        Ok(model)
    }

    /// 从文件加载模型，模型名称为文件名
    pub async fn load_file(&self, path: &Path) -> Result<Arc<RuleModel>> {
        let name = model_name(path)?;
        let text = tokio::fs::read_to_string(path).await?;
        self.load_str(&name, &text, Some(path.to_path_buf())).await
    }

    /// 加载目录下所有指定扩展名的规则文件（不递归）
    pub async fn load_dir(&self, dir: &Path, extension: &str) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file() && has_extension(&path, extension) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            match self.load_file(&path).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to load rule file"),
            }
        }

        info!(dir = %dir.display(), loaded = loaded, "Rule directory loaded");
        Ok(loaded)
    }

    async fn install(&self, model: Arc<RuleModel>) {
        let _guard = self.lifecycle.lock().await;
        let name = model.name().to_string();

        let previous = self.models.read().await.get(&name).cloned();
        if let Some(previous) = &previous {
            previous.retire();
            self.notify_unloaded(previous).await;
        }

        self.models.write().await.insert(name.clone(), model.clone());
        self.notify_loaded(&model).await;

        info!(
            model = %name,
            model_id = %model.id(),
            rules = model.rules().len(),
            variables = model.variables().len(),
            reloaded = previous.is_some(),
            "Rule model loaded"
        );
    }

    /// 卸载模型
    pub async fn unload(&self, name: &str) -> Option<Arc<RuleModel>> {
        let _guard = self.lifecycle.lock().await;

        let model = self.models.write().await.remove(name)?;
        model.retire();
        self.notify_unloaded(&model).await;

        info!(model = %name, model_id = %model.id(), "Rule model unloaded");
        Some(model)
    }

    pub async fn unload_file(&self, path: &Path) -> Option<Arc<RuleModel>> {
        let name = model_name(path).ok()?;
        self.unload(&name).await
    }

    pub async fn get(&self, name: &str) -> Option<Arc<RuleModel>> {
        self.models.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<RuleModel>> {
        self.models.read().await.values().cloned().collect()
    }

    /// 所有已加载模型中的规则
    pub async fn rules(&self) -> Vec<Arc<Rule>> {
        self.models
            .read()
            .await
            .values()
            .flat_map(|m| m.rules().iter().cloned())
            .collect()
    }

    pub async fn find_rule(&self, model: &str, rule: &str) -> Option<Arc<Rule>> {
        self.get(model).await?.rule(rule).cloned()
    }

    async fn notify_loaded(&self, model: &Arc<RuleModel>) {
        for listener in self.listeners.read().await.iter() {
            listener.model_loaded(model).await;
        }
    }

    async fn notify_unloaded(&self, model: &Arc<RuleModel>) {
        debug!(model = %model.name(), model_id = %model.id(), "Notifying model unload");
        for listener in self.listeners.read().await.iter() {
            listener.model_unloaded(model).await;
        }
    }
}

impl Default for ModelRepository {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(extension.trim_start_matches('.'))
}

fn model_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| RuleError::NotFound(format!("invalid rule file path: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelId;
    use std::fs;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        events: std::sync::Mutex<Vec<(&'static str, ModelId)>>,
    }

    #[async_trait]
    impl ModelListener for Recorder {
        async fn model_loaded(&self, model: &Arc<RuleModel>) {
            self.events.lock().unwrap().push(("loaded", model.id()));
        }

        async fn model_unloaded(&self, model: &Arc<RuleModel>) {
            self.events.lock().unwrap().push(("unloaded", model.id()));
        }
    }

    const TEXT: &str = "var counter\nrule r\nwhen\nSystem started\nthen\ncounter = 1;\nend\n";

    #[tokio::test]
    async fn test_reload_notifies_unload_before_load() {
        let repo = ModelRepository::new();
        let recorder = Arc::new(Recorder::default());
        repo.add_listener(recorder.clone()).await;

        let first = repo.load_str("a.rules", TEXT, None).await.unwrap();
        let second = repo.load_str("a.rules", TEXT, None).await.unwrap();

        assert!(first.is_retired());
        assert!(!second.is_retired());
        assert_eq!(repo.get("a.rules").await.unwrap().id(), second.id());

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                ("loaded", first.id()),
                ("unloaded", first.id()),
                ("loaded", second.id()),
            ]
        );
    }

    #[tokio::test]
    async fn test_parse_error_keeps_previous_model() {
        let repo = ModelRepository::new();
        let good = repo.load_str("a.rules", TEXT, None).await.unwrap();

        let result = repo.load_str("a.rules", "rule broken", None).await;
        assert!(matches!(result, Err(RuleError::Parse { .. })));
        assert!(!good.is_retired());
        assert_eq!(repo.get("a.rules").await.unwrap().id(), good.id());
    }

    #[tokio::test]
    async fn test_unload() {
        let repo = ModelRepository::new();
        let model = repo.load_str("a.rules", TEXT, None).await.unwrap();

        let removed = repo.unload("a.rules").await.unwrap();
        assert_eq!(removed.id(), model.id());
        assert!(model.is_retired());
        assert!(repo.get("a.rules").await.is_none());
        assert!(repo.unload("a.rules").await.is_none());
    }

    #[tokio::test]
    async fn test_load_dir_skips_bad_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("one.rules"), TEXT).unwrap();
        fs::write(dir.path().join("two.rules"), TEXT).unwrap();
        fs::write(dir.path().join("broken.rules"), "var").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let repo = ModelRepository::new();
        let loaded = repo.load_dir(dir.path(), "rules").await.unwrap();

        assert_eq!(loaded, 2);
        assert!(repo.get("one.rules").await.is_some());
        assert!(repo.get("two.rules").await.is_some());
        assert!(repo.get("broken.rules").await.is_none());
        assert_eq!(repo.rules().await.len(), 2);
        assert!(repo.find_rule("one.rules", "r").await.is_some());
        assert!(repo.find_rule("one.rules", "missing").await.is_none());
    }

    #[tokio::test]
    async fn test_load_file_uses_file_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lights.rules");
        fs::write(&path, TEXT).unwrap();

        let repo = ModelRepository::new();
        let model = repo.load_file(&path).await.unwrap();

        assert_eq!(model.name(), "lights.rules");
        assert_eq!(model.source(), Some(path.as_path()));

        repo.unload_file(&path).await.unwrap();
        assert!(repo.list().await.is_empty());
    }

    #[test]
    fn test_has_extension() {
        assert!(has_extension(Path::new("a/b.rules"), "rules"));
        assert!(has_extension(Path::new("b.rules"), ".rules"));
        assert!(!has_extension(Path::new("b.rules.bak"), "rules"));
    }
}
