mod config;
mod executor;
mod outputs;

pub use config::{PipelineConfig, StageSpec};
pub use executor::{Pipeline, PipelineRun, StageReport};
pub use outputs::{NamedOutputSet, SOURCE_OUTPUT};
