pub mod event;

pub use event::{ItemEvent, ItemEventKind};
