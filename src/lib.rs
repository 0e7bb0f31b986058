pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod query;
pub mod store;

pub use config::{load_config, AppConfig, EngineConfig};
pub use engine::Engine;
pub use error::{ErrorCode, LineageError, LineageResult, OperationResult};
pub use model::*;
