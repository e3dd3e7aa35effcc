pub mod bus;
pub mod error;

pub use bus::{EventBus, SharedEventBus};
pub use error::{FluxError, Result};

pub fn init() {
    tracing::info!("Core library initialized");
}
