use flux_types::{ItemEvent, ItemEventKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// 规则模型标识，每次加载（包括重新加载）都会生成新的标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelId(Uuid);

impl ModelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ModelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 模型级变量声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// 变量名称
    pub name: String,

    /// 声明类型（仅作记录）
    pub type_name: Option<String>,

    /// `var` 为 true，`val` 为 false
    pub writable: bool,

    /// 字面量初始值
    pub initial: Option<Value>,
}

impl Variable {
    /// `var name`
    pub fn var(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: None,
            writable: true,
            initial: None,
        }
    }

    /// `val name = value`
    pub fn val(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            type_name: None,
            writable: false,
            initial: Some(value),
        }
    }

    pub fn with_initial(mut self, value: Value) -> Self {
        self.initial = Some(value);
        self
    }

    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }
}

/// 触发器类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleTrigger {
    /// 系统启动
    SystemStarted,

    /// 系统关闭
    SystemShutdown,

    /// 物品状态变化
    ItemChanged { item: String },

    /// 物品收到状态更新
    ItemUpdated { item: String },

    /// 物品收到命令
    ItemCommand { item: String },

    /// 定时触发
    Cron {
        /// Cron 表达式（含秒）
        expression: String,
    },
}

impl RuleTrigger {
    /// 判断物品事件是否匹配该触发器
    pub fn matches(&self, event: &ItemEvent) -> bool {
        match self {
            RuleTrigger::ItemChanged { item } => {
                event.kind == ItemEventKind::Changed && *item == event.item
            }
            RuleTrigger::ItemUpdated { item } => {
                event.kind == ItemEventKind::Updated && *item == event.item
            }
            RuleTrigger::ItemCommand { item } => {
                event.kind == ItemEventKind::Command && *item == event.item
            }
            _ => false,
        }
    }
}

/// 尚未绑定到模型的规则定义（解析器输出）
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDefinition {
    pub name: String,
    pub triggers: Vec<RuleTrigger>,
    pub script: String,
}

impl RuleDefinition {
    pub fn new(name: impl Into<String>, triggers: Vec<RuleTrigger>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triggers,
            script: script.into(),
        }
    }
}

/// 规则。规则本身没有执行上下文，执行时借用所属模型的上下文。
#[derive(Debug)]
pub struct Rule {
    name: String,
    triggers: Vec<RuleTrigger>,
    script: String,
    owner: Weak<RuleModel>,
}

impl Rule {
    /// A rule that belongs to no model. Looking up its context fails.
    pub fn detached(definition: RuleDefinition) -> Self {
        Self {
            name: definition.name,
            triggers: definition.triggers,
            script: definition.script,
            owner: Weak::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn triggers(&self) -> &[RuleTrigger] {
        &self.triggers
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    /// 所属模型；模型已释放或规则未绑定时返回 None
    pub fn model(&self) -> Option<Arc<RuleModel>> {
        self.owner.upgrade()
    }

    pub fn has_trigger(&self, trigger: &RuleTrigger) -> bool {
        self.triggers.contains(trigger)
    }

    pub fn matches_event(&self, event: &ItemEvent) -> bool {
        self.triggers.iter().any(|t| t.matches(event))
    }
}

/// 规则模型：一个规则文件解析后的结果
#[derive(Debug)]
pub struct RuleModel {
    id: ModelId,
    name: String,
    source: Option<PathBuf>,
    variables: Vec<Variable>,
    rules: Vec<Arc<Rule>>,
    retired: AtomicBool,
}

impl RuleModel {
    /// Build a model and bind every rule to it.
    pub fn build(
        name: impl Into<String>,
        source: Option<PathBuf>,
        variables: Vec<Variable>,
        definitions: Vec<RuleDefinition>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|owner| Self {
            id: ModelId::new(),
            name,
            source,
            variables,
            rules: definitions
                .into_iter()
                .map(|d| {
                    Arc::new(Rule {
                        name: d.name,
                        triggers: d.triggers,
                        script: d.script,
                        owner: owner.clone(),
                    })
                })
                .collect(),
            retired: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// 标记模型已卸载
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}
