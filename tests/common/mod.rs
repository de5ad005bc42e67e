#![allow(dead_code)]

mod fixtures;
pub use fixtures::*;

pub use gaizhuang::composite::ReferenceSelection;
pub use gaizhuang::detection::PartClass;
pub use gaizhuang::manifest::resolve_url;
pub use gaizhuang::pipeline::{PipelineState, Stage};
pub use gaizhuang::{PipelineError, PipelineOutcome, PipelineRequest};
