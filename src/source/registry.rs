//! Lookup table of registered sources.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::SourceGateway;

/// Registry of sources keyed by source id.
///
/// Built once at startup and then shared read-only; new source kinds
/// register a gateway value here rather than extending any type hierarchy.
#[derive(Default)]
pub struct SourceRegistry {
    sources: HashMap<String, Arc<dyn SourceGateway>>,
    /// Registration order, used for fair worker rotation.
    order: Vec<String>,
}

impl SourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a source under its descriptor id.
    ///
    /// Re-registering an id replaces the previous gateway.
    pub fn register(&mut self, gateway: Arc<dyn SourceGateway>) {
        let id = gateway.descriptor().id.clone();
        if self.sources.insert(id.clone(), gateway).is_some() {
            warn!(source = %id, "replacing previously registered source");
        } else {
            debug!(source = %id, "registered source");
            self.order.push(id);
        }
    }

    /// Looks up a source by id.
    #[must_use]
    pub fn get(&self, source_id: &str) -> Option<Arc<dyn SourceGateway>> {
        self.sources.get(source_id).cloned()
    }

    /// Returns the registered source ids in registration order.
    #[must_use]
    pub fn source_ids(&self) -> &[String] {
        &self.order
    }

    /// Returns the number of registered sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns true if no sources are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.order)
            .finish()
    }
}
