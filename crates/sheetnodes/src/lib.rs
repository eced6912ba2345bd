//! Standard node library
//!
//! Built-in handlers for every node type, plus local adapters for the file
//! store and AI gateway they call.

mod ai;
mod control;
mod debug;
mod generate;
mod http;
mod input;
mod stores;
mod time;
mod transform;

pub use ai::{AiAnalysisHandler, HttpAiGateway};
pub use control::{ConditionalHandler, LoopHandler, MergeHandler};
pub use debug::LogHandler;
pub use generate::{render_csv, SpreadsheetGeneratorHandler};
pub use http::HttpIntegrationHandler;
pub use input::FileInputHandler;
pub use stores::{LocalFileStore, MemoryFileStore};
pub use time::DelayHandler;
pub use transform::{Condition, DataTransformHandler, Operation, Operator};

use sheetcore::services::{AiGateway, FileStore};
use sheetruntime::HandlerRegistry;
use std::sync::Arc;

/// External services the built-in handlers depend on
#[derive(Clone)]
pub struct Services {
    pub files: Arc<dyn FileStore>,
    pub ai: Option<Arc<dyn AiGateway>>,
}

impl Services {
    pub fn new(files: Arc<dyn FileStore>) -> Self {
        Self { files, ai: None }
    }

    pub fn with_ai(mut self, gateway: Arc<dyn AiGateway>) -> Self {
        self.ai = Some(gateway);
        self
    }

    /// In-memory files, no AI provider
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryFileStore::new()))
    }
}

/// Register all standard handlers with a registry
pub fn register_all(registry: &mut HandlerRegistry, services: &Services) {
    registry.register(Arc::new(FileInputHandler::new(Arc::clone(&services.files))));
    registry.register(Arc::new(DataTransformHandler));
    registry.register(Arc::new(AiAnalysisHandler::new(services.ai.clone())));
    registry.register(Arc::new(SpreadsheetGeneratorHandler::new(Arc::clone(
        &services.files,
    ))));
    registry.register(Arc::new(HttpIntegrationHandler::new()));
    registry.register(Arc::new(LoopHandler));
    registry.register(Arc::new(MergeHandler));
    registry.register(Arc::new(ConditionalHandler));
    registry.register(Arc::new(LogHandler));
    registry.register(Arc::new(DelayHandler));
}

/// Registry holding every standard handler
pub fn standard_registry(services: &Services) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    register_all(&mut registry, services);
    registry
}
