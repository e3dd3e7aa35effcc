use rhai::{Dynamic, Engine, Scope, AST};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("compile error: {0}")]
    Compile(String),

    #[error("evaluation error: {0}")]
    Eval(String),

    #[error("conversion error for '{name}': {message}")]
    Conversion { name: String, message: String },

    #[error("script not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, ScriptError>;

/// 脚本执行限制
#[derive(Debug, Clone, Copy)]
pub struct ScriptLimits {
    /// 单次执行允许的最大操作数
    pub max_operations: u64,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: 100_000,
        }
    }
}

/// Variable pushed into the script scope before evaluation.
#[derive(Debug, Clone)]
pub struct ScriptVariable {
    pub name: String,
    pub value: Value,
    pub constant: bool,
}

impl ScriptVariable {
    pub fn mutable(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            constant: false,
        }
    }

    pub fn constant(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            constant: true,
        }
    }
}

/// Result of a script run: the returned value plus the final value of
/// every non-constant variable that was pushed in.
#[derive(Debug, Clone, Default)]
pub struct ScriptOutcome {
    pub value: Value,
    pub variables: HashMap<String, Value>,
}

pub struct ScriptEngine {
    engine: Engine,
    // Cache compiled scripts: script_id -> AST
    script_cache: RwLock<HashMap<String, AST>>,
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new(ScriptLimits::default())
    }
}

impl ScriptEngine {
    pub fn new(limits: ScriptLimits) -> Self {
        let mut engine = Engine::new();

        // Safety: Limit max operations
        engine.set_max_operations(limits.max_operations);

        // Register time function
        engine.register_fn("now_ms", || chrono::Utc::now().timestamp_millis());

        // Redirect print() to tracing::info!
        engine.on_print(|x| {
            tracing::info!("SCRIPT: {}", x);
        });

        Self {
            engine,
            script_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Access the underlying engine to register additional functions.
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Syntax check only.
    pub fn compile(&self, script: &str) -> Result<()> {
        self.engine
            .compile(script)
            .map(|_| ())
            .map_err(|e| ScriptError::Compile(e.to_string()))
    }

    pub fn compile_script(&self, script_id: &str, script: &str) -> Result<()> {
        let ast = self
            .engine
            .compile(script)
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
        let mut cache = self.script_cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.insert(script_id.to_string(), ast);
        Ok(())
    }

    /// Evaluate a previously compiled script against the given variables.
    pub fn eval_cached(&self, script_id: &str, variables: Vec<ScriptVariable>) -> Result<ScriptOutcome> {
        let ast = {
            let cache = self.script_cache.read().unwrap_or_else(PoisonError::into_inner);
            cache
                .get(script_id)
                .cloned()
                .ok_or_else(|| ScriptError::NotFound(script_id.to_string()))?
        };
        self.eval_ast(&ast, variables)
    }

    /// Compile and evaluate a script against the given variables.
    pub fn eval_with_variables(&self, script: &str, variables: Vec<ScriptVariable>) -> Result<ScriptOutcome> {
        let ast = self
            .engine
            .compile(script)
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
        self.eval_ast(&ast, variables)
    }

    fn eval_ast(&self, ast: &AST, variables: Vec<ScriptVariable>) -> Result<ScriptOutcome> {
        let mut scope = Scope::new();
        let mut writable = Vec::new();

        for var in variables {
            let value = to_dynamic(&var.name, &var.value)?;
            if var.constant {
                scope.push_constant_dynamic(var.name, value);
            } else {
                writable.push(var.name.clone());
                scope.push_dynamic(var.name, value);
            }
        }

        let result: Dynamic = self
            .engine
            .eval_ast_with_scope(&mut scope, ast)
            .map_err(|e| ScriptError::Eval(e.to_string()))?;

        let mut outcome = ScriptOutcome {
            value: from_dynamic("<result>", &result)?,
            variables: HashMap::with_capacity(writable.len()),
        };
        for name in writable {
            if let Some(value) = scope.get_value::<Dynamic>(&name) {
                let value = from_dynamic(&name, &value)?;
                outcome.variables.insert(name, value);
            }
        }

        Ok(outcome)
    }

    pub fn get_script_ids(&self) -> Vec<String> {
        let cache = self.script_cache.read().unwrap_or_else(PoisonError::into_inner);
        cache.keys().cloned().collect()
    }

    pub fn remove_script(&self, id: &str) {
        let mut cache = self.script_cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.remove(id);
    }
}

fn to_dynamic(name: &str, value: &Value) -> Result<Dynamic> {
    rhai::serde::to_dynamic(value).map_err(|e| ScriptError::Conversion {
        name: name.to_string(),
        message: e.to_string(),
    })
}

fn from_dynamic(name: &str, value: &Dynamic) -> Result<Value> {
    rhai::serde::from_dynamic(value).map_err(|e| ScriptError::Conversion {
        name: name.to_string(),
        message: e.to_string(),
    })
}
