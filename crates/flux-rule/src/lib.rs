pub mod context;
pub mod engine;
pub mod error;
pub mod execution;
pub mod functions;
pub mod items;
pub mod model;
pub mod parser;
pub mod registry;
pub mod repository;
pub mod trigger;
pub mod watcher;

pub use context::{same_context, ContextFactory, DefaultContextFactory, EvaluationContext, VariableContext};
pub use engine::RuleEngine;
pub use error::{Result, RuleError};
pub use execution::{ExecutionStatus, RuleExecution};
pub use functions::register_builtin_functions;
pub use items::ItemStateStore;
pub use model::{ModelId, Rule, RuleDefinition, RuleModel, RuleTrigger, Variable};
pub use parser::parse_rules;
pub use registry::EvaluationContextRegistry;
pub use repository::{ModelListener, ModelRepository};
pub use trigger::TriggerManager;
pub use watcher::ModelWatcher;
