use crate::context::{ContextFactory, EvaluationContext};
use crate::error::{Result, RuleError};
use crate::model::{ModelId, Rule, RuleModel};
use crate::repository::ModelListener;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// 规则模型到执行上下文的注册表
///
/// Each loaded model owns exactly one context, created on first use and
/// shared by all of its rules until the model is unloaded or reloaded.
pub struct EvaluationContextRegistry {
    factory: Arc<dyn ContextFactory>,
    contexts: DashMap<ModelId, Arc<dyn EvaluationContext>>,
}

impl EvaluationContextRegistry {
    pub fn new(factory: Arc<dyn ContextFactory>) -> Self {
        Self {
            factory,
            contexts: DashMap::new(),
        }
    }

    /// 获取规则所属模型的共享上下文，首次访问时创建
    pub fn get_context(&self, rule: &Rule) -> Result<Arc<dyn EvaluationContext>> {
        let model = rule
            .model()
            .ok_or_else(|| RuleError::DetachedRule(rule.name().to_string()))?;

        if let Some(ctx) = self.contexts.get(&model.id()) {
            return Ok(ctx.value().clone());
        }

        // check-then-create under the shard lock: the first caller wins
        match self.contexts.entry(model.id()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                // retired models must not get a fresh entry after teardown
                if model.is_retired() {
                    return Err(RuleError::DetachedRule(rule.name().to_string()));
                }
                let ctx = self.create_context(&model);
                entry.insert(ctx.clone());
                debug!(
                    model = %model.name(),
                    model_id = %model.id(),
                    variables = model.variables().len(),
                    "Evaluation context created"
                );
                Ok(ctx)
            }
        }
    }

    fn create_context(&self, model: &RuleModel) -> Arc<dyn EvaluationContext> {
        let ctx = self.factory.create();
        for var in model.variables() {
            ctx.new_value(&var.name, var.initial.clone().unwrap_or(Value::Null));
        }
        ctx
    }

    /// 丢弃模型的上下文；返回是否存在
    pub fn invalidate(&self, id: ModelId) -> bool {
        let removed = self.contexts.remove(&id).is_some();
        if removed {
            debug!(model_id = %id, "Evaluation context dropped");
        }
        removed
    }

    pub fn contains(&self, id: ModelId) -> bool {
        self.contexts.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

#[async_trait]
impl ModelListener for EvaluationContextRegistry {
    async fn model_unloaded(&self, model: &Arc<RuleModel>) {
        self.invalidate(model.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{same_context, DefaultContextFactory, VariableContext};
    use crate::model::{RuleDefinition, RuleTrigger, Variable};
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    fn registry() -> EvaluationContextRegistry {
        EvaluationContextRegistry::new(Arc::new(DefaultContextFactory))
    }

    fn model(variables: Vec<Variable>) -> Arc<RuleModel> {
        RuleModel::build(
            "greetings.rules",
            None,
            variables,
            vec![
                RuleDefinition::new("A", vec![RuleTrigger::SystemStarted], "counter"),
                RuleDefinition::new("B", vec![RuleTrigger::SystemStarted], "counter += 1;"),
            ],
        )
    }

    #[test]
    fn test_same_context_for_rules_of_one_model() {
        let registry = registry();
        let model = model(vec![Variable::var("counter")]);

        let a = registry.get_context(&model.rules()[0]).unwrap();
        let b = registry.get_context(&model.rules()[1]).unwrap();

        assert!(same_context(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_fresh_context_has_exactly_declared_keys() {
        let registry = registry();
        let model = model(vec![Variable::var("v1"), Variable::var("v2")]);

        let ctx = registry.get_context(&model.rules()[0]).unwrap();

        let names: HashSet<String> = ctx.names().into_iter().collect();
        assert_eq!(names, HashSet::from(["v1".to_string(), "v2".to_string()]));
        assert_eq!(ctx.get_value("v1"), Some(Value::Null));
        assert_eq!(ctx.get_value("v2"), Some(Value::Null));
    }

    #[test]
    fn test_initial_values_seeded() {
        let registry = registry();
        let model = model(vec![
            Variable::var("threshold").with_initial(json!(10)),
            Variable::val("greeting", json!("hello")),
        ]);

        let ctx = registry.get_context(&model.rules()[0]).unwrap();
        assert_eq!(ctx.get_value("threshold"), Some(json!(10)));
        assert_eq!(ctx.get_value("greeting"), Some(json!("hello")));
    }

    #[test]
    fn test_existing_context_not_reseeded() {
        let registry = registry();
        let model = model(vec![Variable::var("counter")]);

        let ctx = registry.get_context(&model.rules()[1]).unwrap();
        ctx.set_value("counter", json!(1)).unwrap();

        let again = registry.get_context(&model.rules()[0]).unwrap();
        assert_eq!(again.get_value("counter"), Some(json!(1)));
    }

    #[test]
    fn test_detached_rule() {
        let registry = registry();
        let rule = Rule::detached(RuleDefinition::new("lonely", vec![RuleTrigger::SystemStarted], ""));

        let err = registry.get_context(&rule).unwrap_err();
        assert!(matches!(err, RuleError::DetachedRule(name) if name == "lonely"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_retired_model_gets_no_context() {
        let registry = registry();
        let model = model(vec![Variable::var("counter")]);
        model.retire();

        assert!(matches!(
            registry.get_context(&model.rules()[0]),
            Err(RuleError::DetachedRule(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_invalidate_creates_new_context() {
        let registry = registry();
        let model = model(vec![Variable::var("counter")]);

        let first = registry.get_context(&model.rules()[0]).unwrap();
        first.set_value("counter", json!(5)).unwrap();

        assert!(registry.invalidate(model.id()));
        assert!(!registry.invalidate(model.id()));

        let second = registry.get_context(&model.rules()[0]).unwrap();
        assert!(!same_context(&first, &second));
        assert_eq!(second.get_value("counter"), Some(Value::Null));
    }

    #[test]
    fn test_concurrent_first_access_creates_one_context() {
        const CALLERS: usize = 16;

        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let factory = move || -> Arc<dyn EvaluationContext> {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(VariableContext::new())
        };

        let registry = Arc::new(EvaluationContextRegistry::new(Arc::new(factory)));
        let model = model(vec![Variable::var("counter")]);
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|i| {
                let registry = registry.clone();
                let rule = model.rules()[i % 2].clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.get_context(&rule).unwrap()
                })
            })
            .collect();

        let contexts: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(contexts.iter().all(|c| same_context(c, &contexts[0])));
    }

    #[tokio::test]
    async fn test_unload_notification_drops_context() {
        let registry = registry();
        let model = model(vec![Variable::var("counter")]);

        registry.get_context(&model.rules()[0]).unwrap();
        assert!(registry.contains(model.id()));

        registry.model_unloaded(&model).await;
        assert!(!registry.contains(model.id()));
    }
}
