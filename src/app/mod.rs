pub mod features;
pub mod wfs_service;

pub use features::{FeatureGeometry, FeatureRecord, FeatureSource, FeatureStream};
pub use wfs_service::{ServiceError, WfsService};
