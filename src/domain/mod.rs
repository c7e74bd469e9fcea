pub mod catalog;
pub mod crs;
pub mod model;
pub mod query;
