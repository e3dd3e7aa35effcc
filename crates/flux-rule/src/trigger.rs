use crate::engine::RuleEngine;
use crate::error::{Result, RuleError};
use crate::model::{ModelId, Rule, RuleModel, RuleTrigger};
use crate::repository::{ModelListener, ModelRepository};
use async_trait::async_trait;
use dashmap::DashMap;
use flux_core::SharedEventBus;
use flux_types::ItemEvent;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 触发器管理器
pub struct TriggerManager {
    engine: Arc<RuleEngine>,
    bus: SharedEventBus,
    scheduler: Arc<RwLock<Option<JobScheduler>>>,
    /// 每个模型注册的定时任务
    jobs: DashMap<ModelId, Vec<Uuid>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl TriggerManager {
    pub fn new(engine: Arc<RuleEngine>, bus: SharedEventBus) -> Self {
        Self {
            engine,
            bus,
            scheduler: Arc::new(RwLock::new(None)),
            jobs: DashMap::new(),
            event_loop: Mutex::new(None),
        }
    }

    fn repository(&self) -> &Arc<ModelRepository> {
        self.engine.repository()
    }

    /// 启动触发器系统并执行 `System started` 规则
    pub async fn start(&self) -> Result<()> {
        let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
        scheduler.start().await.map_err(scheduler_error)?;
        *self.scheduler.write().await = Some(scheduler);

        // models loaded before start
        for model in self.repository().list().await {
            self.register_model(&model).await?;
        }

        let mut rx = self.bus.subscribe();
        let engine = self.engine.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        dispatch_event(&engine, &event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Item event loop lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Item event loop finished");
        });
        *self.event_loop.lock().await = Some(handle);

        info!("Trigger manager started");

        let fired = self.fire_system(&RuleTrigger::SystemStarted).await;
        debug!(fired = fired, "System started rules fired");
        Ok(())
    }

    /// 执行 `System shuts down` 规则并停止触发器系统
    pub async fn stop(&self) -> Result<()> {
        let fired = self.fire_system(&RuleTrigger::SystemShutdown).await;
        debug!(fired = fired, "System shutdown rules fired");

        if let Some(handle) = self.event_loop.lock().await.take() {
            handle.abort();
        }

        if let Some(mut scheduler) = self.scheduler.write().await.take() {
            scheduler.shutdown().await.map_err(scheduler_error)?;
        }
        self.jobs.clear();

        info!("Trigger manager stopped");
        Ok(())
    }

    /// 处理物品事件，返回触发的规则数量
    pub async fn handle_item_event(&self, event: &ItemEvent) -> usize {
        dispatch_event(&self.engine, event).await
    }

    async fn fire_system(&self, trigger: &RuleTrigger) -> usize {
        let rules: Vec<Arc<Rule>> = self
            .repository()
            .rules()
            .await
            .into_iter()
            .filter(|r| r.has_trigger(trigger))
            .collect();
        fire_all(&self.engine, rules, None).await
    }

    /// 注册模型的定时触发器
    async fn register_model(&self, model: &Arc<RuleModel>) -> Result<()> {
        if self.jobs.contains_key(&model.id()) {
            return Ok(());
        }

        let scheduler_lock = self.scheduler.read().await;
        let Some(scheduler) = scheduler_lock.as_ref() else {
            // start() picks the model up later
            return Ok(());
        };

        let mut job_ids = Vec::new();
        for rule in model.rules() {
            for trigger in rule.triggers() {
                if let RuleTrigger::Cron { expression } = trigger {
                    let job = self.cron_job(rule, expression)?;
                    let id = scheduler.add(job).await.map_err(scheduler_error)?;
                    info!(
                        model = %model.name(),
                        rule = %rule.name(),
                        cron = %expression,
                        "Schedule trigger registered"
                    );
                    job_ids.push(id);
                }
            }
        }

        if !job_ids.is_empty() {
            self.jobs.insert(model.id(), job_ids);
        }
        Ok(())
    }

    fn cron_job(&self, rule: &Arc<Rule>, expression: &str) -> Result<Job> {
        let rule = rule.clone();
        let engine = self.engine.clone();

        Job::new_async(expression, move |_uuid, _lock| {
            let rule = rule.clone();
            let engine = engine.clone();

            Box::pin(async move {
                info!(rule = %rule.name(), "Executing scheduled rule");
                if let Err(e) = engine.fire(&rule, None).await {
                    error!(rule = %rule.name(), error = %e, "Failed to execute scheduled rule");
                }
            })
        })
        .map_err(scheduler_error)
    }

    async fn unregister_model(&self, model: &RuleModel) {
        let Some((_, job_ids)) = self.jobs.remove(&model.id()) else {
            return;
        };

        let scheduler_lock = self.scheduler.read().await;
        if let Some(scheduler) = scheduler_lock.as_ref() {
            for id in job_ids {
                if let Err(e) = scheduler.remove(&id).await {
                    warn!(model = %model.name(), error = %e, "Failed to remove schedule trigger");
                }
            }
        }
    }

    pub fn scheduled_job_count(&self) -> usize {
        self.jobs.iter().map(|entry| entry.value().len()).sum()
    }
}

#[async_trait]
impl ModelListener for TriggerManager {
    async fn model_loaded(&self, model: &Arc<RuleModel>) {
        if let Err(e) = self.register_model(model).await {
            error!(model = %model.name(), error = %e, "Failed to register schedule triggers");
        }
    }

    async fn model_unloaded(&self, model: &Arc<RuleModel>) {
        self.unregister_model(model).await;
    }
}

async fn dispatch_event(engine: &Arc<RuleEngine>, event: &ItemEvent) -> usize {
    let rules: Vec<Arc<Rule>> = engine
        .repository()
        .rules()
        .await
        .into_iter()
        .filter(|r| r.matches_event(event))
        .collect();

    if !rules.is_empty() {
        debug!(item = %event.item, kind = ?event.kind, rules = rules.len(), "Triggering rules by item event");
    }
    fire_all(engine, rules, Some(event.clone())).await
}

/// 并行执行规则，等待全部完成
async fn fire_all(engine: &Arc<RuleEngine>, rules: Vec<Arc<Rule>>, event: Option<ItemEvent>) -> usize {
    let count = rules.len();
    let mut set = JoinSet::new();

    for rule in rules {
        let engine = engine.clone();
        let event = event.clone();
        set.spawn(async move {
            if let Err(e) = engine.fire(&rule, event).await {
                error!(rule = %rule.name(), error = %e, "Failed to execute rule");
            }
        });
    }

    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Rule task panicked");
        }
    }
    count
}

fn scheduler_error(e: tokio_cron_scheduler::JobSchedulerError) -> RuleError {
    RuleError::Scheduler(e.to_string())
}
