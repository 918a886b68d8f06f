//! Session Registry (spec §4.9): process-wide lookup of live endpoint
//! sessions keyed by the ordered pair `(active_id, passive_id)`, protected
//! by a single mutex — grounded in spec.md §4.9 directly, there being no
//! close teacher precedent (the teacher runs exactly one session at a time
//! and never needed a registry). `insert` over an existing key returns
//! `Duplicate` rather than overwriting, which is the whole point: it's what
//! prevents a second handshake from hijacking an already-registered
//! session.

use std::collections::HashMap;
use std::sync::Mutex;

use duallink_endpoint::EndpointHandle;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a session for ({0}, {1}) is already registered")]
    Duplicate(i64, i64),
}

/// Process-wide registry of live [`EndpointHandle`]s, one per ordered
/// `(active_id, passive_id)` pair (spec §3: "at most one session per
/// ordered pair in a given role").
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<(i64, i64), EndpointHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session` under `(active_id, passive_id)`. Fails with
    /// `Duplicate` if that key is already occupied — the caller should
    /// close the just-established session and reject the visit rather than
    /// overwrite an existing one.
    pub fn insert(
        &self,
        active_id: i64,
        passive_id: i64,
        session: EndpointHandle,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.lock().expect("registry mutex poisoned");
        if sessions.contains_key(&(active_id, passive_id)) {
            return Err(RegistryError::Duplicate(active_id, passive_id));
        }
        sessions.insert((active_id, passive_id), session);
        Ok(())
    }

    /// Removes and returns the session for `(active_id, passive_id)`, if any.
    pub fn remove(&self, active_id: i64, passive_id: i64) -> Option<EndpointHandle> {
        self.sessions.lock().expect("registry mutex poisoned").remove(&(active_id, passive_id))
    }

    /// Runs `f` with a clone of the session handle for `(active_id, passive_id)`,
    /// if present. The mutex is released before `f` runs — `EndpointHandle`
    /// is cheap to clone (spec §5: many producers share one writer task).
    pub fn with<R>(&self, active_id: i64, passive_id: i64, f: impl FnOnce(&EndpointHandle) -> R) -> Option<R> {
        let handle = self.sessions.lock().expect("registry mutex poisoned").get(&(active_id, passive_id)).cloned();
        handle.map(|h| f(&h))
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("registry mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duallink_core::AeadKeyPair;
    use duallink_endpoint::{connect, handshake_active, handshake_passive, EndpointListener};

    /// Drives both sides of a real handshake so the active side's
    /// `handshake_active` actually receives its `Ack` instead of blocking
    /// until `HANDSHAKE_TIMEOUT` — the passive socket has to be handshaken
    /// too, not just left open, or the active future never resolves.
    async fn dummy_handle() -> EndpointHandle {
        let listener = EndpointListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let keys_active =
            AeadKeyPair { sealing_key: [1u8; 32], sealing_nonce: 0, opening_key: [2u8; 32], opening_nonce: 0 };
        let keys_passive = AeadKeyPair {
            sealing_key: keys_active.opening_key,
            sealing_nonce: keys_active.opening_nonce,
            opening_key: keys_active.sealing_key,
            opening_nonce: keys_active.sealing_nonce,
        };
        let credentials = duallink_core::VisitCredentials(vec![0u8; 16]);

        let accept_fut = listener.accept();
        let connect_fut = connect(&addr);
        let (accepted, connected) = tokio::join!(accept_fut, connect_fut);
        let (passive_reader, passive_writer) = accepted.unwrap();
        let (active_reader, active_writer) = connected.unwrap();

        let active_fut =
            handshake_active(active_reader, active_writer, 1, 2, credentials.clone(), keys_active);
        let passive_fut =
            handshake_passive(passive_reader, passive_writer, 2, 1, &credentials, keys_passive);
        let (active_session, passive_session) = tokio::join!(active_fut, passive_fut);
        passive_session.unwrap();
        active_session.unwrap().handle
    }

    #[tokio::test]
    async fn insert_over_existing_key_is_rejected() {
        let registry = SessionRegistry::new();
        let a = dummy_handle().await;
        let b = dummy_handle().await;

        registry.insert(1, 2, a).unwrap();
        let err = registry.insert(1, 2, b).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(1, 2)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_then_insert_succeeds() {
        let registry = SessionRegistry::new();
        let a = dummy_handle().await;
        let b = dummy_handle().await;

        registry.insert(1, 2, a).unwrap();
        assert!(registry.remove(1, 2).is_some());
        registry.insert(1, 2, b).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn with_runs_closure_against_registered_session() {
        let registry = SessionRegistry::new();
        let a = dummy_handle().await;
        registry.insert(7, 8, a).unwrap();

        let local_id = registry.with(7, 8, |h| h.local_id);
        assert_eq!(local_id, Some(1));
        assert_eq!(registry.with(9, 9, |h| h.local_id), None);
    }
}
