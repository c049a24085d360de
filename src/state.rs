//! Shared application state.

use crate::catalog::Catalog;
use crate::registry::SessionRegistry;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub registry: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            catalog: registry.catalog(),
            registry,
        }
    }
}
