pub mod routes;
pub mod validate;

use std::sync::Arc;

use crate::config::Config;
use crate::service::Service;

/// Process-wide application state, constructed once in `main` and shared
/// with every handler through axum's `State` extractor (spec §9: no
/// module-level singletons).
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Service>,
    pub config: Arc<Config>,
    pub archive_root: Option<std::path::PathBuf>,
}

pub fn create_app(state: AppState) -> axum::Router {
    routes::build_router(state)
}
