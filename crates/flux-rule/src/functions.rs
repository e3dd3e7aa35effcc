use crate::items::ItemStateStore;
use flux_script::ScriptEngine;
use rhai::Dynamic;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 注册所有内置函数
pub fn register_builtin_functions(engine: &mut ScriptEngine, items: Arc<ItemStateStore>) {
    let rhai_engine = engine.engine_mut();
    register_item_functions(rhai_engine, items);
    register_log_functions(rhai_engine);
}

/// 注册物品操作函数
fn register_item_functions(engine: &mut rhai::Engine, items: Arc<ItemStateStore>) {
    // post_update(item, state)
    let store = items.clone();
    engine.register_fn("post_update", move |item: &str, state: Dynamic| {
        if let Some(state) = to_value(item, &state) {
            store.post_update(item, state);
        }
    });

    // send_command(item, command)
    let store = items.clone();
    engine.register_fn("send_command", move |item: &str, command: Dynamic| {
        if let Some(command) = to_value(item, &command) {
            store.send_command(item, command);
        }
    });

    // item_state(item)
    let store = items;
    engine.register_fn("item_state", move |item: &str| -> Dynamic {
        store
            .state(item)
            .and_then(|state| rhai::serde::to_dynamic(&state).ok())
            .unwrap_or(Dynamic::UNIT)
    });
}

/// 注册日志函数
fn register_log_functions(engine: &mut rhai::Engine) {
    engine.register_fn("log_info", |message: &str| {
        info!(target: "flux_rule::script", "{}", message);
    });

    engine.register_fn("log_warn", |message: &str| {
        warn!(target: "flux_rule::script", "{}", message);
    });

    engine.register_fn("log_error", |message: &str| {
        error!(target: "flux_rule::script", "{}", message);
    });
}

fn to_value(item: &str, value: &Dynamic) -> Option<Value> {
    match rhai::serde::from_dynamic(value) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(item = %item, error = %e, "Unsupported item state");
            None
        }
    }
}
