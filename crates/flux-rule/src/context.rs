use crate::error::{Result, RuleError};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// 规则执行上下文：变量名到值的可变映射
///
/// Contexts are shared between every rule of a model, so all mutation goes
/// through `&self`.
pub trait EvaluationContext: Send + Sync + fmt::Debug {
    /// Declare a variable, overwriting any previous value.
    fn new_value(&self, name: &str, value: Value);

    /// Assign a declared variable.
    fn set_value(&self, name: &str, value: Value) -> Result<()>;

    /// `None` when the variable was never declared; a declared but unset
    /// variable yields `Some(Value::Null)`.
    fn get_value(&self, name: &str) -> Option<Value>;

    fn names(&self) -> Vec<String>;

    fn snapshot(&self) -> HashMap<String, Value>;
}

/// Reference identity of two contexts, ignoring trait object metadata.
pub fn same_context(a: &Arc<dyn EvaluationContext>, b: &Arc<dyn EvaluationContext>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// 默认上下文实现
#[derive(Debug, Default)]
pub struct VariableContext {
    values: RwLock<HashMap<String, Value>>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvaluationContext for VariableContext {
    fn new_value(&self, name: &str, value: Value) {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.insert(name.to_string(), value);
    }

    fn set_value(&self, name: &str, value: Value) -> Result<()> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        match values.get_mut(name) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuleError::UndeclaredVariable(name.to_string())),
        }
    }

    fn get_value(&self, name: &str) -> Option<Value> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values.get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values.keys().cloned().collect()
    }

    fn snapshot(&self) -> HashMap<String, Value> {
        self.values.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// 上下文工厂
pub trait ContextFactory: Send + Sync {
    fn create(&self) -> Arc<dyn EvaluationContext>;
}

impl<F> ContextFactory for F
where
    F: Fn() -> Arc<dyn EvaluationContext> + Send + Sync,
{
    fn create(&self) -> Arc<dyn EvaluationContext> {
        self()
    }
}

/// Produces empty [`VariableContext`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultContextFactory;

impl ContextFactory for DefaultContextFactory {
    fn create(&self) -> Arc<dyn EvaluationContext> {
        Arc::new(VariableContext::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_declared_values() {
        let ctx = VariableContext::new();
        ctx.new_value("counter", Value::Null);

        assert_eq!(ctx.get_value("counter"), Some(Value::Null));
        assert_eq!(ctx.get_value("missing"), None);

        ctx.set_value("counter", json!(1)).unwrap();
        assert_eq!(ctx.get_value("counter"), Some(json!(1)));
    }

    #[test]
    fn test_set_undeclared_fails() {
        let ctx = VariableContext::new();
        let err = ctx.set_value("ghost", json!(true)).unwrap_err();
        assert!(matches!(err, RuleError::UndeclaredVariable(name) if name == "ghost"));
        assert!(ctx.names().is_empty());
    }

    #[test]
    fn test_closure_factory() {
        let factory = || -> Arc<dyn EvaluationContext> {
            let ctx = VariableContext::new();
            ctx.new_value("preset", json!("yes"));
            Arc::new(ctx)
        };

        let ctx = factory.create();
        assert_eq!(ctx.get_value("preset"), Some(json!("yes")));
    }

    #[test]
    fn test_same_context() {
        let a = DefaultContextFactory.create();
        let b = DefaultContextFactory.create();
        assert!(same_context(&a, &a.clone()));
        assert!(!same_context(&a, &b));
    }
}
