pub mod config;
pub mod error;
pub mod generation;
pub mod materialize;
pub mod pipeline;
pub mod providers;
pub mod resolver;
pub mod upload;
mod util;

#[cfg(test)]
mod test_support;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use pipeline::{PipelineOutput, StylePipeline};
