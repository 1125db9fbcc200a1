//! The process-wide client registry.
//!
//! Maps each connected ClientId to its session state and pairs clients two
//! to a session: the first unpaired client waits, the next one joins it,
//! and the relay forwards between the two slots of a pair. Entries live
//! only as long as the underlying connection; a reconnecting client rejoins
//! its existing pair, and a second connection from the same ClientId
//! displaces the first.
//!
//! Reads (forwarding) take the lock shared; registration and removal take
//! it exclusively.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use veilnet_core::handshake::HelloRecord;
use veilnet_core::session::SessionHandle;
use veilnet_core::{EndpointId, SessionId};
use veilnet_crypto::random::random_16;
use veilnet_proto::payload::PeerBlock;

/// A registered, handshake-complete client
#[derive(Clone)]
pub struct ClientEntry {
    /// Stable client identifier
    pub client_id: EndpointId,
    /// The pair session this client belongs to
    pub session_id: SessionId,
    /// Remote socket address as observed from the transport
    pub addr: SocketAddr,
    /// Whether the client advertised DIRECT_P2P
    pub supports_direct: bool,
    /// Advertised direct-path listener port (0 when absent)
    pub direct_port: u16,
    /// Direct-path certificate DER from RESPONSE
    pub certificate: Vec<u8>,
    /// Long-term PQ signature over the certificate
    pub certificate_sig: Vec<u8>,
    /// Identity and ephemeral keys presented in HELLO
    pub hello: HelloRecord,
    /// Writer handle for forwarding and displacement
    pub handle: SessionHandle,
    /// Connection generation, so a displaced connection cannot remove its
    /// successor's entry
    pub generation: u64,
}

impl ClientEntry {
    /// The peer block advertising this client to its counterpart
    #[must_use]
    pub fn peer_block(&self) -> PeerBlock {
        let mut block = PeerBlock {
            port: if self.direct_port != 0 {
                self.direct_port
            } else {
                self.addr.port()
            },
            supports_direct: self.supports_direct,
            certificate: self.certificate.clone(),
            certificate_sig: self.certificate_sig.clone(),
            pq_public: self.hello.pq_public.to_vec(),
            ed_public: self.hello.ed_public.to_vec(),
            kem_public: self.hello.kem_public.to_vec(),
            ecdh_public: self.hello.ecdh_public.to_vec(),
            ..PeerBlock::default()
        };
        block.set_ip(self.addr.ip());
        block
    }
}

#[derive(Default)]
struct Inner {
    clients: HashMap<EndpointId, ClientEntry>,
    /// session id -> up to two member client ids
    pairs: HashMap<SessionId, Vec<EndpointId>>,
    generation: u64,
}

/// Registry of connected clients and their pairings
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered clients
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock").clients.len()
    }

    /// Whether no clients are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve a pair slot for a connecting client and return the pair's
    /// session id. Rejoining clients keep their session; otherwise the
    /// oldest half-empty pair is joined, else a fresh pair is created.
    pub fn reserve(&self, client_id: EndpointId) -> SessionId {
        let mut inner = self.inner.write().expect("registry lock");

        if let Some((session_id, _)) = inner
            .pairs
            .iter()
            .find(|(_, members)| members.contains(&client_id))
        {
            return *session_id;
        }

        if let Some((session_id, _)) = inner
            .pairs
            .iter()
            .find(|(_, members)| members.len() < 2)
        {
            let session_id = *session_id;
            inner
                .pairs
                .get_mut(&session_id)
                .expect("pair exists")
                .push(client_id);
            return session_id;
        }

        let session_id = random_16().expect("csprng available");
        inner.pairs.insert(session_id, vec![client_id]);
        session_id
    }

    /// Drop an unregistered reservation after a failed handshake.
    pub fn release(&self, client_id: &EndpointId) {
        let mut inner = self.inner.write().expect("registry lock");
        if inner.clients.contains_key(client_id) {
            return;
        }
        for members in inner.pairs.values_mut() {
            members.retain(|id| id != client_id);
        }
        inner.pairs.retain(|_, members| !members.is_empty());
    }

    /// Register a handshake-complete client, assigning its generation.
    /// Returns the displaced predecessor's handle if one was connected.
    pub fn register(&self, mut entry: ClientEntry) -> (u64, Option<SessionHandle>) {
        let mut inner = self.inner.write().expect("registry lock");
        inner.generation += 1;
        entry.generation = inner.generation;
        let generation = entry.generation;

        let displaced = inner
            .clients
            .insert(entry.client_id, entry)
            .map(|old| old.handle);
        (generation, displaced)
    }

    /// Remove a client, but only if the generation still matches (a
    /// displaced connection must not remove its successor).
    pub fn remove(&self, client_id: &EndpointId, generation: u64) {
        let mut inner = self.inner.write().expect("registry lock");

        let matches = inner
            .clients
            .get(client_id)
            .is_some_and(|entry| entry.generation == generation);
        if !matches {
            return;
        }

        inner.clients.remove(client_id);
        for members in inner.pairs.values_mut() {
            members.retain(|id| id != client_id);
        }
        inner.pairs.retain(|_, members| !members.is_empty());
    }

    /// The entry for a registered client
    #[must_use]
    pub fn get(&self, client_id: &EndpointId) -> Option<ClientEntry> {
        self.inner
            .read()
            .expect("registry lock")
            .clients
            .get(client_id)
            .cloned()
    }

    /// Refresh a client's advertised material after an intra-session rekey,
    /// preserving its generation. No-op if the generation no longer matches.
    pub fn update_advertisement(
        &self,
        client_id: &EndpointId,
        generation: u64,
        hello: HelloRecord,
        certificate: Vec<u8>,
        certificate_sig: Vec<u8>,
        direct_port: u16,
    ) {
        let mut inner = self.inner.write().expect("registry lock");
        if let Some(entry) = inner.clients.get_mut(client_id) {
            if entry.generation != generation {
                return;
            }
            entry.hello = hello;
            entry.certificate = certificate;
            entry.certificate_sig = certificate_sig;
            entry.direct_port = direct_port;
        }
    }

    /// The registered counterpart of `client_id` within its pair
    #[must_use]
    pub fn counterpart(&self, client_id: &EndpointId) -> Option<ClientEntry> {
        let inner = self.inner.read().expect("registry lock");

        let members = inner
            .pairs
            .values()
            .find(|members| members.contains(client_id))?;
        let other = members.iter().find(|id| *id != client_id)?;
        inner.clients.get(other).cloned()
    }

    /// The counterpart's peer block, or an empty block if none is
    /// registered yet
    #[must_use]
    pub fn counterpart_block(&self, client_id: &EndpointId) -> PeerBlock {
        self.counterpart(client_id)
            .map(|entry| entry.peer_block())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_order() {
        let registry = Registry::new();

        let a = registry.reserve([1u8; 32]);
        let b = registry.reserve([2u8; 32]);
        assert_eq!(a, b, "first two clients share a pair");

        let c = registry.reserve([3u8; 32]);
        assert_ne!(a, c, "third client starts a new pair");
    }

    #[test]
    fn test_rejoin_keeps_session() {
        let registry = Registry::new();

        let a = registry.reserve([1u8; 32]);
        let again = registry.reserve([1u8; 32]);
        assert_eq!(a, again);
    }

    #[test]
    fn test_release_unpairs() {
        let registry = Registry::new();

        let a = registry.reserve([1u8; 32]);
        registry.release(&[1u8; 32]);

        let b = registry.reserve([2u8; 32]);
        let c = registry.reserve([3u8; 32]);
        assert_eq!(b, c);
        let _ = a;
    }
}
