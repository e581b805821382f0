// src/server/state.rs

//! Shared state handed to every request handler (C10).

use crate::cache::Cache;
use crate::config::ConfigHandle;
use crate::geo::GeoResolver;
use crate::store::Store;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub cache: Cache,
    pub geo: Arc<GeoResolver>,
    pub config: Arc<ConfigHandle>,
}
