//! Screenshot-to-code pipeline: routing, vision survey, asset extraction and
//! generation, code synthesis and the render/compare healing loop.

pub mod builder;
pub mod config;
pub mod extractor;
pub mod fanout;
pub mod fidelity;
pub mod healing;
pub mod imaging;
pub mod photographer;
pub mod pipeline;
pub mod providers;
pub mod router;
pub mod services;
pub mod stages;
pub mod surveyor;
mod util;

pub use builder::{build, BuildBrief, BuildOutcome, PatchContext};
pub use config::PipelineConfig;
pub use fidelity::{compare, FidelityReport, Hotspot};
pub use healing::{HealingLoop, HealingOutcome, HealingStop};
pub use pipeline::Pipeline;
pub use providers::build_services;
pub use router::Router;
pub use services::Services;
pub use surveyor::{SurveyOutcome, Surveyor};
