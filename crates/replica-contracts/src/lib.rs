//! Wire types and deterministic policies shared by the replica pipeline.

pub mod assets;
pub mod error;
pub mod events;
pub mod input;
pub mod manifest;
pub mod models;
pub mod result;
pub mod runs;
pub mod strategy;

pub use assets::{merge_asset_maps, AssetMap};
pub use error::PipelineError;
pub use events::{EventPayload, EventWriter};
pub use input::{PipelineInput, ReferenceFile};
pub use manifest::{Bounds, Canvas, UiNode, VisualManifest};
pub use result::{OutputFile, PipelineResult, StepTimings};
pub use strategy::{AssetRequest, ExecutionPlan, RouteMode, RoutingStrategy};
