pub mod geojson;
pub mod params;
pub mod router;
pub mod types;
pub mod xml;
pub mod handlers {
    pub mod common;
    pub mod health;
    pub mod related;
    pub mod wfs;
}

pub use router::{create_router, ApiDoc};
pub use types::AppState;
