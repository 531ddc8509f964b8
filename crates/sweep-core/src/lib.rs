pub mod arbiter;
pub mod builtin;
pub mod config;
pub mod dispatcher;
pub mod document_store;
pub mod error;
pub mod event_bus;
pub mod handler;
pub mod run_log;
pub mod run_state;
pub mod secrets;
pub mod service;
pub mod storage_paths;
pub mod tasks;
pub mod work_items;

pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_PORT: u16 = 39741;

pub use arbiter::*;
pub use builtin::*;
pub use config::*;
pub use dispatcher::*;
pub use document_store::*;
pub use error::*;
pub use event_bus::*;
pub use handler::*;
pub use run_log::*;
pub use run_state::*;
pub use secrets::*;
pub use service::*;
pub use storage_paths::*;
pub use tasks::*;
pub use work_items::*;
