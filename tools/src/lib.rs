pub mod cli;
pub mod config;
pub mod output;

pub use cli::{init_tracing, SourceArgs};
pub use config::ToolConfig;
pub use output::output_stems;
