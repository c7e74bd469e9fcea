pub mod app;
pub mod domain;
pub mod error;
pub mod geo;
pub mod infra;
pub mod storage;
pub mod transport;

// Convenience re-exports (keeps call-sites clean)
pub use app::wfs_service::WfsService;
pub use domain::catalog::{Catalog, FeatureType, InMemoryCatalog, PgCatalog, Service};
pub use domain::crs::Crs;
pub use domain::model::{ModelRegistry, SharedModelRegistry};
pub use error::{ExceptionCode, WfsException};
pub use infra::Settings;
pub use storage::cursor::{PgExecutor, SqlExecutor};
