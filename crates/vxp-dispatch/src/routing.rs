// SPDX-License-Identifier: MIT OR Apache-2.0
//! Routing table: one routing key per extension, frozen at registration.

use crate::backend::ExtensionRuntime;
use std::collections::HashMap;
use std::sync::Arc;
use vxp_error::{ErrorKind, ProxyError};

/// Process-lifetime map from routing key to extension runtime.
///
/// Built once during consumer registration and read-only afterwards.
/// Invariant: bijective between configured descriptors and their keys; a
/// duplicate key aborts startup before any consumer is registered.
#[derive(Debug, Default)]
pub struct RoutingTable {
    by_key: HashMap<String, Arc<ExtensionRuntime>>,
    // Registration order (the configuration document's order).
    ordered: Vec<Arc<ExtensionRuntime>>,
}

impl RoutingTable {
    /// Build the table, rejecting duplicate routing keys.
    pub fn build(runtimes: Vec<ExtensionRuntime>) -> Result<Self, ProxyError> {
        let mut table = Self::default();
        for runtime in runtimes {
            let runtime = Arc::new(runtime);
            let key = runtime.descriptor().routing_key.clone();
            if let Some(existing) = table.by_key.get(&key) {
                return Err(ProxyError::new(
                    ErrorKind::ConfigDuplicateKey,
                    format!(
                        "duplicate routing_key '{key}' for extensions '{}' and '{}'",
                        existing.descriptor().name,
                        runtime.descriptor().name
                    ),
                ));
            }
            table.by_key.insert(key, Arc::clone(&runtime));
            table.ordered.push(runtime);
        }
        Ok(table)
    }

    /// Look up the extension serving a routing key.
    pub fn get(&self, routing_key: &str) -> Option<&Arc<ExtensionRuntime>> {
        self.by_key.get(routing_key)
    }

    /// Registered extensions, in configuration order.
    pub fn in_order(&self) -> impl Iterator<Item = &Arc<ExtensionRuntime>> {
        self.ordered.iter()
    }

    /// Number of registered extensions.
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
