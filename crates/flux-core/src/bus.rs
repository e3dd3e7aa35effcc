use crate::error::Result;
use flux_types::ItemEvent;
use std::sync::Arc;
use tokio::sync::broadcast;

/// 物品事件总线
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ItemEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ItemEvent> {
        self.sender.subscribe()
    }

    /// 发布事件，返回接收者数量；没有订阅者时返回错误
    pub fn publish(&self, event: ItemEvent) -> Result<usize> {
        Ok(self.sender.send(event)?)
    }

    /// 发布事件，没有订阅者时仅记录日志
    pub fn post(&self, event: ItemEvent) {
        let item = event.item.clone();
        if self.sender.send(event).is_err() {
            tracing::debug!(item = %item, "No subscribers for item event");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub type SharedEventBus = Arc<EventBus>;
