use flux_core::EventBus;
use flux_rule::{
    register_builtin_functions, same_context, DefaultContextFactory, EvaluationContextRegistry,
    ItemStateStore, ModelRepository, RuleEngine, RuleError, TriggerManager,
};
use flux_script::ScriptEngine;
use flux_types::ItemEvent;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const GREETINGS: &str = r#"
var counter

rule "Read counter"
when
    Item Greeter received command
then
    if counter != () {
        post_update("LastCount", counter);
    }
end

rule "Increment counter"
when
    Item Button changed
then
    if counter == () { counter = 0; }
    counter = counter + 1;
end
"#;

struct Runtime {
    repository: Arc<ModelRepository>,
    registry: Arc<EvaluationContextRegistry>,
    engine: Arc<RuleEngine>,
    triggers: Arc<TriggerManager>,
    items: Arc<ItemStateStore>,
}

async fn runtime() -> Runtime {
    let bus = Arc::new(EventBus::new(64));
    let items = Arc::new(ItemStateStore::new(bus.clone()));
    let repository = Arc::new(ModelRepository::new());
    let registry = Arc::new(EvaluationContextRegistry::new(Arc::new(DefaultContextFactory)));

    let mut script_engine = ScriptEngine::default();
    register_builtin_functions(&mut script_engine, items.clone());

    let engine = Arc::new(RuleEngine::new(
        repository.clone(),
        registry.clone(),
        Arc::new(script_engine),
        Duration::from_secs(5),
    ));
    let triggers = Arc::new(TriggerManager::new(engine.clone(), bus));

    repository.add_listener(registry.clone()).await;
    repository.add_listener(engine.clone()).await;
    repository.add_listener(triggers.clone()).await;

    Runtime {
        repository,
        registry,
        engine,
        triggers,
        items,
    }
}

#[tokio::test]
async fn rules_of_one_model_share_state() {
    let rt = runtime().await;
    rt.repository.load_str("greetings.rules", GREETINGS, None).await.unwrap();

    let model = rt.repository.get("greetings.rules").await.unwrap();
    let rule_a = model.rule("Read counter").unwrap();
    let rule_b = model.rule("Increment counter").unwrap();

    let ctx_a = rt.registry.get_context(rule_a).unwrap();
    let ctx_b = rt.registry.get_context(rule_b).unwrap();
    assert!(same_context(&ctx_a, &ctx_b));

    ctx_b.set_value("counter", json!(1)).unwrap();
    assert_eq!(ctx_a.get_value("counter"), Some(json!(1)));
}

#[tokio::test]
async fn rule_execution_shares_variables_across_rules() {
    let rt = runtime().await;
    rt.repository.load_str("greetings.rules", GREETINGS, None).await.unwrap();

    let fired = rt
        .triggers
        .handle_item_event(&ItemEvent::changed("Button", json!("OFF"), json!("ON")))
        .await;
    assert_eq!(fired, 1);

    let fired = rt
        .triggers
        .handle_item_event(&ItemEvent::command("Greeter", json!("HELLO")))
        .await;
    assert_eq!(fired, 1);

    assert_eq!(rt.items.state("LastCount"), Some(json!(1)));
}

#[tokio::test]
async fn fresh_context_contains_exactly_declared_variables() {
    let rt = runtime().await;
    let text = "var v1\nvar v2\nrule r\nwhen\nSystem started\nthen\nend\n";
    let model = rt.repository.load_str("vars.rules", text, None).await.unwrap();

    let ctx = rt.registry.get_context(&model.rules()[0]).unwrap();
    let names: HashSet<String> = ctx.names().into_iter().collect();

    assert_eq!(names, HashSet::from(["v1".to_string(), "v2".to_string()]));
    assert_eq!(ctx.get_value("v1"), Some(Value::Null));
    assert_eq!(ctx.get_value("v2"), Some(Value::Null));
}

#[tokio::test]
async fn reload_produces_fresh_context_with_new_variables() {
    let rt = runtime().await;
    let dir = tempdir().unwrap();
    let path = dir.path().join("greetings.rules");

    fs::write(&path, GREETINGS).unwrap();
    let first = rt.repository.load_file(&path).await.unwrap();
    let old_ctx = rt.registry.get_context(&first.rules()[0]).unwrap();
    old_ctx.set_value("counter", json!(7)).unwrap();
    let old_rule = first.rules()[0].clone();

    let reloaded_text = GREETINGS.replace("var counter", "var counter\nvar greeting = \"hi\"");
    fs::write(&path, reloaded_text).unwrap();
    let second = rt.repository.load_file(&path).await.unwrap();

    assert!(!rt.registry.contains(first.id()));
    assert_eq!(rt.registry.len(), 0);

    let new_ctx = rt.registry.get_context(&second.rules()[0]).unwrap();
    assert!(!same_context(&old_ctx, &new_ctx));
    assert_eq!(new_ctx.get_value("counter"), Some(Value::Null));
    assert_eq!(new_ctx.get_value("greeting"), Some(json!("hi")));

    // rules of the replaced model no longer resolve a context
    assert!(matches!(
        rt.registry.get_context(&old_rule),
        Err(RuleError::DetachedRule(_))
    ));
    assert_eq!(rt.registry.len(), 1);
}

#[tokio::test]
async fn repeated_reloads_do_not_grow_registry() {
    let rt = runtime().await;

    for _ in 0..20 {
        let model = rt.repository.load_str("greetings.rules", GREETINGS, None).await.unwrap();
        rt.engine
            .fire_by_name("greetings.rules", "Increment counter", None)
            .await
            .unwrap();
        assert!(rt.registry.contains(model.id()));
        assert_eq!(rt.registry.len(), 1);
    }

    rt.repository.unload("greetings.rules").await.unwrap();
    assert!(rt.registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_access_observes_one_context() {
    let rt = runtime().await;
    let model = rt.repository.load_str("greetings.rules", GREETINGS, None).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..32 {
        let registry = rt.registry.clone();
        let rule = model.rules()[i % 2].clone();
        handles.push(tokio::spawn(async move { registry.get_context(&rule).unwrap() }));
    }

    let mut contexts = Vec::new();
    for handle in handles {
        contexts.push(handle.await.unwrap());
    }

    assert!(contexts.iter().all(|c| same_context(c, &contexts[0])));
    assert_eq!(rt.registry.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rules_fired_by_one_event_do_not_lose_updates() {
    let rt = runtime().await;
    let text = r#"
var counter = 0

rule "Watch button"
when
    Item Button changed
then
    let i = 0;
    while i < 5000 { i += 1; }
    log_info("button seen, counter is " + counter);
end

rule "Count presses"
when
    Item Button changed
then
    counter = counter + 1;
end
"#;
    let model = rt.repository.load_str("presses.rules", text, None).await.unwrap();

    for round in 1..=5 {
        let fired = rt
            .triggers
            .handle_item_event(&ItemEvent::changed("Button", json!("OFF"), json!("ON")))
            .await;
        assert_eq!(fired, 2);

        let ctx = rt.registry.get_context(&model.rules()[0]).unwrap();
        assert_eq!(ctx.get_value("counter"), Some(json!(round)));
    }
}
