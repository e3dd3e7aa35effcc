use crate::error::{Result, RuleError};
use crate::execution::{ExecutionStatus, RuleExecution};
use crate::model::{Rule, RuleModel};
use crate::registry::EvaluationContextRegistry;
use crate::repository::{ModelListener, ModelRepository};
use async_trait::async_trait;
use chrono::Utc;
use flux_script::{ScriptEngine, ScriptError, ScriptOutcome, ScriptVariable};
use flux_types::{ItemEvent, ItemEventKind};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

const HISTORY_LIMIT: usize = 1000;

/// 规则引擎
///
/// Runs rule bodies against the shared context of their model. Only
/// variables a rule actually changed are written back. Value mutation is
/// not serialized: two rules of the same model that both assign a variable
/// race, and the later write wins.
pub struct RuleEngine {
    repository: Arc<ModelRepository>,

    registry: Arc<EvaluationContextRegistry>,

    /// Rhai 脚本引擎
    script_engine: Arc<ScriptEngine>,

    /// 单条规则执行超时
    timeout: Duration,

    /// 执行历史
    executions: Arc<RwLock<VecDeque<RuleExecution>>>,
}

impl RuleEngine {
    pub fn new(
        repository: Arc<ModelRepository>,
        registry: Arc<EvaluationContextRegistry>,
        script_engine: Arc<ScriptEngine>,
        timeout: Duration,
    ) -> Self {
        Self {
            repository,
            registry,
            script_engine,
            timeout,
            executions: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    pub fn repository(&self) -> &Arc<ModelRepository> {
        &self.repository
    }

    pub fn registry(&self) -> &Arc<EvaluationContextRegistry> {
        &self.registry
    }

    /// 按模型名和规则名触发
    pub async fn fire_by_name(&self, model: &str, rule: &str, event: Option<ItemEvent>) -> Result<RuleExecution> {
        let rule = self
            .repository
            .find_rule(model, rule)
            .await
            .ok_or_else(|| RuleError::NotFound(format!("rule '{}' in model '{}'", rule, model)))?;
        self.fire(&rule, event).await
    }

    /// 执行规则
    pub async fn fire(&self, rule: &Arc<Rule>, event: Option<ItemEvent>) -> Result<RuleExecution> {
        let context = self.registry.get_context(rule)?;
        let model = rule
            .model()
            .ok_or_else(|| RuleError::DetachedRule(rule.name().to_string()))?;

        let mut execution = RuleExecution {
            id: uuid::Uuid::new_v4().to_string(),
            model: model.name().to_string(),
            rule_name: rule.name().to_string(),
            trigger: event.as_ref().map(describe_event),
            started_at: Utc::now(),
            finished_at: None,
            status: ExecutionStatus::Running,
            error: None,
        };

        // 准备脚本变量：触发事件 + 模型变量当前值
        let mut variables = Vec::with_capacity(model.variables().len() + 1);
        let event_value = match &event {
            Some(event) => serde_json::to_value(event)
                .map_err(|e| RuleError::Internal(format!("failed to serialize trigger event: {}", e)))?,
            None => Value::Null,
        };
        variables.push(ScriptVariable::constant("event", event_value));

        // 执行前的取值，回写时只比较本次执行的改动
        let mut seeded = HashMap::with_capacity(model.variables().len());
        for var in model.variables() {
            let value = context.get_value(&var.name).unwrap_or(Value::Null);
            if var.writable {
                seeded.insert(var.name.clone(), value.clone());
            }
            variables.push(ScriptVariable {
                name: var.name.clone(),
                value,
                constant: !var.writable,
            });
        }

        let result = self.run_script(&model, rule, variables).await;
        execution.finished_at = Some(Utc::now());

        let outcome = match result {
            Ok(outcome) => {
                execution.status = ExecutionStatus::Success;
                outcome
            }
            Err(e) => {
                execution.status = match e {
                    RuleError::Timeout(..) => ExecutionStatus::Timeout,
                    _ => ExecutionStatus::Failed,
                };
                execution.error = Some(e.to_string());
                error!(model = %model.name(), rule = %rule.name(), error = %e, "Rule execution failed");
                self.record(execution).await;
                return Err(e);
            }
        };

        // 只回写本条规则改动过的变量
        for (name, value) in outcome.variables {
            if seeded.get(&name) != Some(&value) {
                context.set_value(&name, value)?;
            }
        }

        debug!(model = %model.name(), rule = %rule.name(), "Rule executed successfully");
        self.record(execution.clone()).await;
        Ok(execution)
    }

    async fn run_script(
        &self,
        model: &RuleModel,
        rule: &Rule,
        variables: Vec<ScriptVariable>,
    ) -> Result<ScriptOutcome> {
        let script_id = script_id(model, rule);
        let script = rule.script().to_string();
        let engine = self.script_engine.clone();

        let task = tokio::task::spawn_blocking(move || {
            match engine.eval_cached(&script_id, variables.clone()) {
                Err(ScriptError::NotFound(_)) => {
                    engine.compile_script(&script_id, &script)?;
                    engine.eval_cached(&script_id, variables)
                }
                other => other,
            }
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result.map_err(|source| RuleError::Script {
                rule: rule.name().to_string(),
                source,
            }),
            Ok(Err(join_error)) => Err(RuleError::Internal(join_error.to_string())),
            Err(_) => {
                warn!(model = %model.name(), rule = %rule.name(), "Rule execution timeout");
                Err(RuleError::Timeout(rule.name().to_string(), self.timeout))
            }
        }
    }

    async fn record(&self, execution: RuleExecution) {
        let mut executions = self.executions.write().await;
        executions.push_back(execution);
        while executions.len() > HISTORY_LIMIT {
            executions.pop_front();
        }
    }

    /// 获取执行历史（按时间倒序）
    pub async fn get_execution_history(&self, rule_name: Option<&str>, limit: usize) -> Vec<RuleExecution> {
        let executions = self.executions.read().await;
        executions
            .iter()
            .rev()
            .filter(|e| rule_name.map_or(true, |name| e.rule_name == name))
            .take(limit)
            .cloned()
            .collect()
    }
}

fn describe_event(event: &ItemEvent) -> String {
    let action = match event.kind {
        ItemEventKind::Changed => "changed",
        ItemEventKind::Updated => "received update",
        ItemEventKind::Command => "received command",
    };
    format!("{} {}", event.item, action)
}

fn script_id(model: &RuleModel, rule: &Rule) -> String {
    format!("{}/{}", model.id(), rule.name())
}

/// 模型加载时预编译规则脚本，卸载时清理缓存
#[async_trait]
impl ModelListener for RuleEngine {
    async fn model_loaded(&self, model: &Arc<RuleModel>) {
        for rule in model.rules() {
            if let Err(e) = self.script_engine.compile_script(&script_id(model, rule), rule.script()) {
                warn!(model = %model.name(), rule = %rule.name(), error = %e, "Rule script does not compile");
            }
        }
        info!(model = %model.name(), rules = model.rules().len(), "Rule scripts compiled");
    }

    async fn model_unloaded(&self, model: &Arc<RuleModel>) {
        for rule in model.rules() {
            self.script_engine.remove_script(&script_id(model, rule));
        }
    }
}
