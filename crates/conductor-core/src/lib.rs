pub mod config;
pub mod error;
pub mod event;
pub mod feedback;
pub mod schema;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ConductorError, HandlerError, Result};
pub use event::EventBus;
pub use types::*;
