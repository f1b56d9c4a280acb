//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Ordered, copy-on-write protocol registry
//!
//! Registration order defines peek-match priority: the accept pipeline
//! offers every new connection to the protocols in insertion order and the
//! first acceptance wins. Mutation builds a new sequence and publishes it
//! atomically, so pipelines iterating a snapshot never observe a partial
//! update and no lock is held during iteration.

use crate::Protocol;
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex, PoisonError};

/// Ordered registry of named protocols
///
/// Names are matched case-insensitively and are unique: adding a protocol
/// under an existing name replaces it in place, keeping its priority slot.
pub struct ProtocolRegistry {
    /// Published snapshot read by accept pipelines
    protocols: ArcSwap<Vec<Arc<dyn Protocol>>>,
    /// Serializes mutations; readers never take it
    write_lock: Mutex<()>,
}

impl ProtocolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            protocols: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Add a protocol, replacing any existing protocol with the same
    /// (case-insensitive) name in place
    pub fn add(&self, protocol: Arc<dyn Protocol>) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.protocols.load_full();
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());

        match next
            .iter()
            .position(|p| p.name().eq_ignore_ascii_case(protocol.name()))
        {
            Some(index) => next[index] = protocol,
            None => next.push(protocol),
        }

        self.protocols.store(Arc::new(next));
    }

    /// Remove a protocol by name; existing connections keep their reference
    pub fn remove(&self, name: &str) -> Option<Arc<dyn Protocol>> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.protocols.load_full();
        let index = current
            .iter()
            .position(|p| p.name().eq_ignore_ascii_case(name))?;

        let mut next = current.as_ref().clone();
        let removed = next.remove(index);
        self.protocols.store(Arc::new(next));
        Some(removed)
    }

    /// Find a protocol by case-insensitive name, first hit
    pub fn find(&self, name: &str) -> Option<Arc<dyn Protocol>> {
        self.protocols
            .load()
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Get a stable snapshot of the registration order
    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn Protocol>>> {
        self.protocols.load_full()
    }

    /// Number of registered protocols
    pub fn len(&self) -> usize {
        self.protocols.load().len()
    }

    /// Check whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.protocols.load().is_empty()
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.protocols.load();
        let names: Vec<&str> = snapshot.iter().map(|p| p.name()).collect();
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Connection, Handover, HandshakeResult};
    use async_trait::async_trait;

    struct NamedProtocol {
        name: &'static str,
    }

    #[async_trait]
    impl Protocol for NamedProtocol {
        fn name(&self) -> &str {
            self.name
        }

        async fn attempt_handshake(
            &self,
            _connection: &Arc<Connection>,
            _peeked: &[u8],
        ) -> HandshakeResult {
            HandshakeResult::Rejected
        }

        async fn handle_connection(&self, _connection: Arc<Connection>, _handover: Handover) {}
    }

    fn protocol(name: &'static str) -> Arc<dyn Protocol> {
        Arc::new(NamedProtocol { name })
    }

    #[test]
    fn test_add_and_find_case_insensitive() {
        let registry = ProtocolRegistry::new();
        registry.add(protocol("Echo"));

        assert!(registry.find("echo").is_some());
        assert!(registry.find("ECHO").is_some());
        assert!(registry.find("chat").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_replace_keeps_priority_slot() {
        let registry = ProtocolRegistry::new();
        registry.add(protocol("first"));
        registry.add(protocol("second"));
        registry.add(protocol("third"));

        // Replace the middle entry under a differently-cased name.
        let replacement = protocol("SECOND");
        registry.add(replacement.clone());

        let snapshot = registry.snapshot();
        let names: Vec<&str> = snapshot.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["first", "SECOND", "third"]);
        assert!(Arc::ptr_eq(&snapshot[1], &replacement));

        let found = registry.find("second").expect("replacement is findable");
        assert!(Arc::ptr_eq(&found, &replacement));
    }

    #[test]
    fn test_remove() {
        let registry = ProtocolRegistry::new();
        registry.add(protocol("a"));
        registry.add(protocol("b"));

        let removed = registry.remove("A").expect("removal by any case");
        assert_eq!(removed.name(), "a");
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("a").is_none());
    }

    #[test]
    fn test_snapshot_is_stable_across_mutation() {
        let registry = ProtocolRegistry::new();
        registry.add(protocol("a"));

        let snapshot = registry.snapshot();
        registry.add(protocol("b"));

        // The earlier snapshot is untouched by the mutation.
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 2);
    }
}
