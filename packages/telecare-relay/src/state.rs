//! Server state management.
//!
//! The relay keeps three ephemeral maps, all concurrent (DashMap):
//! the presence registry (user id → live connection), its reverse index
//! (connection id → user id), and the caller↔callee links of in-flight
//! calls. Nothing here is ever persisted; the maps are rebuilt from
//! connect/disconnect traffic alone.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::protocol::ServerMessage;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// Human-readable region label (e.g. "US East", "EU West")
    pub region: String,
    /// City or location description (e.g. "New York", "Frankfurt")
    pub location: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            region: "US East".to_string(),
            location: "New York".to_string(),
        }
    }
}

/// A connected client's sender channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// A user's live presence: the connection currently owning their identity.
#[derive(Clone)]
pub struct PresenceEntry {
    pub connection_id: String,
    pub sender: ClientSender,
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    /// User id → live connection. At most one entry per user;
    /// a register from a new connection overwrites the old one.
    presence: Arc<DashMap<String, PresenceEntry>>,

    /// Connection id → user id reverse index, used on disconnect.
    connections: Arc<DashMap<String, String>>,

    /// Connection id → peer connection id for calls the relay has
    /// forwarded an offer for. Both directions are stored so either
    /// side's disconnect can reach the survivor.
    call_links: Arc<DashMap<String, String>>,

    /// Server configuration.
    pub config: RelayConfig,
}

impl RelayState {
    /// Create a new relay state with the given configuration.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            presence: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            call_links: Arc::new(DashMap::new()),
            config,
        }
    }

    // ── Presence Registry ─────────────────────────────────────────────────

    /// Register a connection for a user. Last-connect-wins: any prior
    /// mapping for the same user is dropped. Broadcasts the updated
    /// online list to every client.
    pub fn register(&self, user_id: &str, connection_id: &str, sender: ClientSender) {
        let entry = PresenceEntry {
            connection_id: connection_id.to_string(),
            sender,
        };

        if let Some(old) = self.presence.insert(user_id.to_string(), entry) {
            self.connections.remove(&old.connection_id);
            tracing::info!(
                user_id = user_id,
                old_connection = old.connection_id.as_str(),
                "Replaced stale presence mapping"
            );
        }
        self.connections
            .insert(connection_id.to_string(), user_id.to_string());

        tracing::info!(
            user_id = user_id,
            connection_id = connection_id,
            "Client registered"
        );
        self.broadcast_online_users();
    }

    /// Look up the live connection for a user.
    pub fn lookup(&self, user_id: &str) -> Option<String> {
        self.presence.get(user_id).map(|e| e.connection_id.clone())
    }

    /// Remove a connection when its WebSocket closes.
    ///
    /// If the connection was party to a forwarded call, the surviving
    /// peer receives a synthesized `CallEnded`; its client's own state
    /// machine decides the outcome from there. Broadcasts presence.
    pub fn remove_connection(&self, connection_id: &str) {
        if let Some(peer) = self.unlink_call(connection_id) {
            tracing::info!(
                connection_id = connection_id,
                peer = peer.as_str(),
                "Connection dropped mid-call, notifying peer"
            );
            self.send_to_connection(
                &peer,
                ServerMessage::CallEnded {
                    from_connection_id: connection_id.to_string(),
                },
            );
        }

        let Some((_, user_id)) = self.connections.remove(connection_id) else {
            return;
        };

        // Only clear presence if this connection still owns the user;
        // a newer register may have already replaced it.
        let owns = self
            .presence
            .get(&user_id)
            .map(|e| e.connection_id == connection_id)
            .unwrap_or(false);
        if owns {
            self.presence.remove(&user_id);
        }

        tracing::info!(
            user_id = user_id.as_str(),
            connection_id = connection_id,
            "Client unregistered"
        );
        self.broadcast_online_users();
    }

    /// Send a message to a connection. Returns false if the connection is
    /// gone; the message is silently dropped, never queued or retried.
    pub fn send_to_connection(&self, connection_id: &str, message: ServerMessage) -> bool {
        let Some(user_id) = self.connections.get(connection_id) else {
            return false;
        };
        if let Some(entry) = self.presence.get(user_id.value()) {
            if entry.connection_id == connection_id {
                return entry.sender.send(message).is_ok();
            }
        }
        false
    }

    /// Check if a user currently has a live connection.
    pub fn is_online(&self, user_id: &str) -> bool {
        self.presence.contains_key(user_id)
    }

    /// Get the ids of all users with a live connection.
    pub fn online_user_ids(&self) -> Vec<String> {
        self.presence.iter().map(|e| e.key().clone()).collect()
    }

    /// Get the number of currently connected clients.
    pub fn online_count(&self) -> usize {
        self.presence.len()
    }

    /// Best-effort presence broadcast to every connected client.
    pub fn broadcast_online_users(&self) {
        let user_ids = self.online_user_ids();
        for entry in self.presence.iter() {
            let _ = entry.sender.send(ServerMessage::OnlineUsers {
                user_ids: user_ids.clone(),
            });
        }
    }

    // ── Call Links ────────────────────────────────────────────────────────

    /// Record that a call offer was forwarded between two connections.
    /// Either side's disconnect will then notify the other. A connection
    /// already linked keeps its existing link untouched; returns whether
    /// the new link was recorded.
    pub fn link_call(&self, caller_connection: &str, callee_connection: &str) -> bool {
        if self.call_links.contains_key(caller_connection)
            || self.call_links.contains_key(callee_connection)
        {
            return false;
        }
        self.call_links
            .insert(caller_connection.to_string(), callee_connection.to_string());
        self.call_links
            .insert(callee_connection.to_string(), caller_connection.to_string());
        true
    }

    /// Drop the call link owned by a connection (both directions).
    /// Returns the peer connection id if a link existed.
    pub fn unlink_call(&self, connection_id: &str) -> Option<String> {
        let (_, peer) = self.call_links.remove(connection_id)?;
        self.call_links.remove(&peer);
        Some(peer)
    }

    /// Drop the link between two specific connections. A link to some
    /// other peer is left untouched, so a busy party rejecting a
    /// latecomer cannot sever its live call.
    pub fn unlink_call_pair(&self, connection_id: &str, peer_connection_id: &str) -> bool {
        let removed = self
            .call_links
            .remove_if(connection_id, |_, peer| peer.as_str() == peer_connection_id)
            .is_some();
        if removed {
            self.call_links
                .remove_if(peer_connection_id, |_, peer| peer.as_str() == connection_id);
        }
        removed
    }

    /// Get the number of in-flight call links (pairs).
    pub fn active_call_count(&self) -> usize {
        self.call_links.len() / 2
    }
}
