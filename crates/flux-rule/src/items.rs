use dashmap::DashMap;
use flux_core::SharedEventBus;
use flux_types::ItemEvent;
use serde_json::Value;
use tracing::debug;

/// 物品状态存储，状态更新时向总线发布事件
pub struct ItemStateStore {
    states: DashMap<String, Value>,
    bus: SharedEventBus,
}

impl ItemStateStore {
    pub fn new(bus: SharedEventBus) -> Self {
        Self {
            states: DashMap::new(),
            bus,
        }
    }

    /// Record a new state. Publishes an update event, followed by a change
    /// event when the state differs from the previous one.
    pub fn post_update(&self, item: &str, state: Value) {
        let previous = self.states.insert(item.to_string(), state.clone());
        debug!(item = %item, state = %state, "Item state updated");

        self.bus.post(ItemEvent::updated(item, state.clone()));
        if previous.as_ref() != Some(&state) {
            self.bus
                .post(ItemEvent::changed(item, previous.unwrap_or(Value::Null), state));
        }
    }

    pub fn send_command(&self, item: &str, command: Value) {
        debug!(item = %item, command = %command, "Item command sent");
        self.bus.post(ItemEvent::command(item, command));
    }

    pub fn state(&self, item: &str) -> Option<Value> {
        self.states.get(item).map(|entry| entry.value().clone())
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.bus
    }
}
