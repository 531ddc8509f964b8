mod config;
mod event;
mod run;
mod selection;

pub use config::*;
pub use event::*;
pub use run::*;
pub use selection::*;
