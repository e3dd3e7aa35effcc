use anyhow::Result;
use clap::Parser;
use flux_config::ConfigLoader;
use flux_core::EventBus;
use flux_rule::{
    register_builtin_functions, DefaultContextFactory, EvaluationContextRegistry, ItemStateStore,
    ModelRepository, ModelWatcher, RuleEngine, TriggerManager,
};
use flux_script::{ScriptEngine, ScriptLimits};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "flux-rules.toml")]
    config: PathBuf,

    /// Override the rules directory from the config file
    #[arg(short, long)]
    rules_dir: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ConfigLoader::new(&args.config).load_validated()?;
    if let Some(dir) = args.rules_dir {
        config.rules.dir = dir;
    }

    if args.print_config {
        println!("{}", ConfigLoader::to_toml(&config)?);
        return Ok(());
    }

    flux_logging::init_logging(&config.logging.level, config.logging.json)?;
    tracing::info!(config = %args.config.display(), "Starting FLUX rule runtime");
    flux_core::init();

    let bus = Arc::new(EventBus::new(config.bus.capacity));
    let items = Arc::new(ItemStateStore::new(bus.clone()));

    let mut script_engine = ScriptEngine::new(ScriptLimits {
        max_operations: config.script.max_operations,
    });
    register_builtin_functions(&mut script_engine, items);

    let repository = Arc::new(ModelRepository::new());
    let registry = Arc::new(EvaluationContextRegistry::new(Arc::new(DefaultContextFactory)));
    let engine = Arc::new(RuleEngine::new(
        repository.clone(),
        registry.clone(),
        Arc::new(script_engine),
        Duration::from_secs(config.script.timeout_seconds),
    ));
    let triggers = Arc::new(TriggerManager::new(engine.clone(), bus.clone()));

    repository.add_listener(registry).await;
    repository.add_listener(engine).await;
    repository.add_listener(triggers.clone()).await;

    if config.rules.dir.is_dir() {
        repository.load_dir(&config.rules.dir, &config.rules.extension).await?;
    } else {
        tracing::warn!(dir = %config.rules.dir.display(), "Rules directory does not exist");
    }

    let watcher = if config.rules.watch && config.rules.dir.is_dir() {
        Some(ModelWatcher::spawn(
            &config.rules.dir,
            &config.rules.extension,
            repository.clone(),
        )?)
    } else {
        None
    };

    triggers.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    triggers.stop().await?;
    if let Some(watcher) = watcher {
        watcher.stop();
    }

    tracing::info!("FLUX rule runtime stopped");
    Ok(())
}
