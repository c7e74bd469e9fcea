//! Turning feature types and request parameters into executable queries.

pub mod augment;
pub mod filter;
pub mod functions;

pub use augment::{
    effective_fields, plan_model, plan_raw, FeatureQuery, ModelPlan, PlanError, QueryPlan, RawPlan,
};
pub use functions::{FunctionCache, FunctionTable};
