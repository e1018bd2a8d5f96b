//! Inbound command handler registry
//!
//! Application code registers a handler per `(package type, command)` pair
//! at startup; the node looks handlers up when a request-kind package
//! arrives. Registration is explicit and static — there is no runtime
//! discovery of handler modules.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use super::connection::Connection;
use super::package::{Package, PackageType};

/// Handler invoked with the connection the request arrived on and the
/// decoded envelope. A handler answering a tagged request is expected to
/// eventually call `send_response` with the request tag in the body.
pub type CommandHandler = Arc<dyn Fn(&Arc<Connection>, &Package) + Send + Sync>;

/// Mapping from `(package type, command)` to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<(PackageType, String), CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, package_type: PackageType, command: &str, handler: CommandHandler) {
        let replaced = self
            .handlers
            .write()
            .insert((package_type, command.to_string()), handler);
        if replaced.is_some() {
            warn!(?package_type, command, "replacing an existing command handler");
        }
    }

    pub fn get(&self, package_type: PackageType, command: &str) -> Option<CommandHandler> {
        self.handlers
            .read()
            .get(&(package_type, command.to_string()))
            .map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::connection::ConnectionDirection;
    use parking_lot::Mutex;

    #[test]
    fn test_register_and_dispatch_by_type_and_command() {
        let registry = HandlerRegistry::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        registry.register(
            PackageType::Request,
            "get_joint",
            Arc::new(move |_conn, package| {
                seen_clone.lock().push(package.command.clone());
            }),
        );

        assert!(registry.get(PackageType::Request, "get_witnesses").is_none());
        assert!(registry.get(PackageType::Ping, "get_joint").is_none());

        let handler = registry.get(PackageType::Request, "get_joint").unwrap();
        let (conn, _rx) = Connection::new("a:1", ConnectionDirection::Inbound);
        let package = Package::from_parts(
            PackageType::Request,
            "get_joint",
            &serde_json::json!({"unit": "U1"}),
        )
        .unwrap();
        (*handler)(&conn, &package);

        assert_eq!(seen.lock().as_slice(), ["get_joint"]);
    }

    #[test]
    fn test_reregistering_replaces_handler() {
        let registry = HandlerRegistry::new();
        registry.register(PackageType::Request, "subscribe", Arc::new(|_, _| {}));
        registry.register(PackageType::Request, "subscribe", Arc::new(|_, _| {}));
        assert_eq!(registry.len(), 1);
    }
}
