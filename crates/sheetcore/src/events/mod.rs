mod base;

pub use base::{EntityId, EventSink, EventStatus, NodeEmitter, StatusEvent};
