//! In-process relay server.
//!
//! `MemoryHub` speaks the same protocol a relay server does: it checks
//! credentials, relays frames between the connections of one document,
//! acknowledges updates and retains them so late joiners can catch up. It
//! also exposes fault injection (dropped connections, withheld acks, refused
//! connects, stalled handshakes) so reconnection paths can be exercised
//! without a network.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{Channel, CollabMessage, Connector, TransportError};

#[derive(Default)]
struct Room {
    /// Every update ever relayed, in arrival order.
    retained: Vec<Vec<u8>>,
    members: HashSet<u64>,
}

struct Connection {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    document: Option<SmolStr>,
    replica: u64,
}

#[derive(Default)]
struct HubState {
    /// Accepted tokens; `None` accepts any non-empty token.
    tokens: Option<HashSet<SmolStr>>,
    rooms: HashMap<SmolStr, Room>,
    connections: HashMap<u64, Connection>,
    next_connection: u64,
    withhold_acks: bool,
    refuse_connections: bool,
    stall_handshakes: bool,
}

/// Shared in-memory relay. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Hub accepting any non-empty token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub accepting only the given tokens.
    pub fn with_tokens<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<SmolStr>,
    {
        let hub = Self::default();
        hub.lock().tokens = Some(tokens.into_iter().map(Into::into).collect());
        hub
    }

    /// Connector handing out channels to this hub.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { hub: self.clone() }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // A panic while holding the lock can only come from a test assertion.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn allow_token(&self, token: impl Into<SmolStr>) {
        self.lock()
            .tokens
            .get_or_insert_with(HashSet::new)
            .insert(token.into());
    }

    pub fn revoke_token(&self, token: &str) {
        if let Some(tokens) = self.lock().tokens.as_mut() {
            tokens.remove(token);
        }
    }

    /// Stop acknowledging updates (they are still relayed and retained).
    pub fn set_withhold_acks(&self, withhold: bool) {
        self.lock().withhold_acks = withhold;
    }

    /// Make new connection attempts fail.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Leave `Auth` frames unanswered, so handshakes hang until the client
    /// gives up.
    pub fn set_stall_handshakes(&self, stall: bool) {
        self.lock().stall_handshakes = stall;
    }

    /// Drop every live connection to `document`, as a network partition would.
    pub fn drop_connections(&self, document: &str) -> usize {
        let mut state = self.lock();
        let ids: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, c)| c.document.as_deref() == Some(document))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            state.disconnect(*id);
        }
        debug!(document, dropped = ids.len(), "hub dropped connections");
        ids.len()
    }

    /// Deliver raw bytes to every connection of `document`.
    pub fn inject_raw(&self, document: &str, frame: Vec<u8>) {
        let state = self.lock();
        if let Some(room) = state.rooms.get(document) {
            for id in &room.members {
                state.deliver(*id, frame.clone());
            }
        }
    }

    /// Number of updates retained for `document`.
    pub fn retained(&self, document: &str) -> usize {
        self.lock()
            .rooms
            .get(document)
            .map(|room| room.retained.len())
            .unwrap_or(0)
    }

    /// Number of authenticated connections to `document`.
    pub fn connection_count(&self, document: &str) -> usize {
        self.lock()
            .rooms
            .get(document)
            .map(|room| room.members.len())
            .unwrap_or(0)
    }

    fn open(&self) -> Result<(u64, mpsc::UnboundedReceiver<Vec<u8>>), TransportError> {
        let mut state = self.lock();
        if state.refuse_connections {
            return Err(TransportError::Refused("hub is refusing connections".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.next_connection += 1;
        let id = state.next_connection;
        state.connections.insert(
            id,
            Connection {
                tx,
                document: None,
                replica: 0,
            },
        );
        Ok((id, rx))
    }

    fn receive(&self, id: u64, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connections.contains_key(&id) {
            return Err(TransportError::Closed);
        }
        match CollabMessage::from_bytes(frame) {
            Ok(message) => state.handle(id, message),
            Err(e) => warn!(connection = id, error = %e, "hub received malformed frame"),
        }
        Ok(())
    }

    fn disconnect(&self, id: u64) {
        self.lock().disconnect(id);
    }
}

impl HubState {
    fn deliver(&self, id: u64, frame: Vec<u8>) {
        if let Some(connection) = self.connections.get(&id) {
            let _ = connection.tx.send(frame);
        }
    }

    fn send(&self, id: u64, message: &CollabMessage) {
        match message.to_bytes() {
            Ok(frame) => self.deliver(id, frame),
            Err(e) => warn!(error = %e, "hub failed to encode frame"),
        }
    }

    /// Send to every member of `document` except `from`.
    fn broadcast(&self, document: &SmolStr, from: u64, message: &CollabMessage) {
        let Some(room) = self.rooms.get(document) else {
            return;
        };
        let Ok(frame) = message.to_bytes() else {
            return;
        };
        for id in room.members.iter().filter(|id| **id != from) {
            self.deliver(*id, frame.clone());
        }
    }

    fn token_ok(&self, token: &str) -> bool {
        match &self.tokens {
            Some(tokens) => tokens.contains(token),
            None => !token.is_empty(),
        }
    }

    fn handle(&mut self, id: u64, message: CollabMessage) {
        trace!(connection = id, kind = message.kind(), "hub frame");
        let document = self.connections.get(&id).and_then(|c| c.document.clone());

        let Some(document) = document else {
            if self.stall_handshakes && matches!(message, CollabMessage::Auth { .. }) {
                debug!(connection = id, "hub stalled handshake");
                return;
            }
            if let CollabMessage::Auth {
                document,
                token,
                replica,
                display_name,
                color,
            } = message
            {
                self.authenticate(id, document, token, replica, display_name, color);
            } else {
                warn!(connection = id, kind = message.kind(), "frame before auth dropped");
            }
            return;
        };

        match message {
            CollabMessage::Update { seq, data } => {
                let relay = CollabMessage::Update {
                    seq,
                    data: data.clone(),
                };
                self.broadcast(&document, id, &relay);
                self.rooms.entry(document).or_default().retained.push(data);
                if !self.withhold_acks {
                    self.send(id, &CollabMessage::Ack { seq });
                }
            }
            CollabMessage::SyncRequest { replica, version } => {
                if let Some(room) = self.rooms.get(&document) {
                    for data in &room.retained {
                        self.send(
                            id,
                            &CollabMessage::SyncResponse {
                                to: replica,
                                data: data.clone(),
                            },
                        );
                    }
                }
                self.broadcast(&document, id, &CollabMessage::SyncRequest { replica, version });
            }
            CollabMessage::SyncResponse { to, data } => {
                let target = self.rooms.get(&document).and_then(|room| {
                    room.members.iter().copied().find(|member| {
                        self.connections
                            .get(member)
                            .is_some_and(|c| c.replica == to)
                    })
                });
                if let Some(target) = target {
                    self.send(target, &CollabMessage::SyncResponse { to, data });
                }
            }
            message @ (CollabMessage::Presence { .. } | CollabMessage::Leave { .. }) => {
                self.broadcast(&document, id, &message);
            }
            other => debug!(connection = id, kind = other.kind(), "hub ignored frame"),
        }
    }

    fn authenticate(
        &mut self,
        id: u64,
        document: SmolStr,
        token: SmolStr,
        replica: u64,
        display_name: SmolStr,
        color: u32,
    ) {
        if !self.token_ok(&token) {
            debug!(connection = id, %document, "hub rejected token");
            self.send(
                id,
                &CollabMessage::AuthRejected {
                    reason: "invalid token".into(),
                },
            );
            self.connections.remove(&id);
            return;
        }
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.document = Some(document.clone());
            connection.replica = replica;
        }
        self.rooms.entry(document.clone()).or_default().members.insert(id);
        self.send(id, &CollabMessage::AuthOk);
        self.broadcast(
            &document,
            id,
            &CollabMessage::Join {
                replica,
                display_name,
                color,
            },
        );
        debug!(connection = id, %document, replica, "hub accepted connection");
    }

    fn disconnect(&mut self, id: u64) {
        let Some(connection) = self.connections.remove(&id) else {
            return;
        };
        let Some(document) = connection.document else {
            return;
        };
        if let Some(room) = self.rooms.get_mut(&document) {
            room.members.remove(&id);
        }
        self.broadcast(
            &document,
            id,
            &CollabMessage::Leave {
                replica: connection.replica,
            },
        );
    }
}

/// [`Connector`] for a [`MemoryHub`]. The URL is ignored.
#[derive(Clone)]
pub struct MemoryConnector {
    hub: MemoryHub,
}

impl Connector for MemoryConnector {
    type Channel = MemoryChannel;

    async fn connect(&self, _url: &str) -> Result<MemoryChannel, TransportError> {
        let (id, rx) = self.hub.open()?;
        Ok(MemoryChannel {
            hub: self.hub.clone(),
            id,
            rx,
        })
    }
}

/// One client connection to a [`MemoryHub`].
pub struct MemoryChannel {
    hub: MemoryHub,
    id: u64,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Channel for MemoryChannel {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.hub.receive(self.id, &frame)
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.hub.disconnect(self.id);
        self.rx.close();
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.hub.disconnect(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn authed(hub: &MemoryHub, replica: u64) -> MemoryChannel {
        let mut channel = hub.connector().connect("mem://").await.unwrap();
        let auth = CollabMessage::Auth {
            document: "doc".into(),
            token: "t".into(),
            replica,
            display_name: format!("r{replica}").into(),
            color: 0,
        };
        channel.send(auth.to_bytes().unwrap()).await.unwrap();
        let reply = channel.recv().await.unwrap().unwrap();
        assert_eq!(CollabMessage::from_bytes(&reply).unwrap(), CollabMessage::AuthOk);
        channel
    }

    async fn next(channel: &mut MemoryChannel) -> CollabMessage {
        let frame = channel.recv().await.unwrap().unwrap();
        CollabMessage::from_bytes(&frame).unwrap()
    }

    #[tokio::test]
    async fn relays_acks_and_retains() {
        let hub = MemoryHub::new();
        let mut a = authed(&hub, 1).await;
        let mut b = authed(&hub, 2).await;
        assert_eq!(
            next(&mut a).await,
            CollabMessage::Join {
                replica: 2,
                display_name: "r2".into(),
                color: 0
            }
        );

        let update = CollabMessage::Update {
            seq: 1,
            data: vec![9],
        };
        a.send(update.to_bytes().unwrap()).await.unwrap();
        assert_eq!(next(&mut a).await, CollabMessage::Ack { seq: 1 });
        assert_eq!(next(&mut b).await, update);
        assert_eq!(hub.retained("doc"), 1);
    }

    #[tokio::test]
    async fn rejects_unknown_tokens() {
        let hub = MemoryHub::with_tokens(["good"]);
        let mut channel = hub.connector().connect("mem://").await.unwrap();
        let auth = CollabMessage::Auth {
            document: "doc".into(),
            token: "bad".into(),
            replica: 1,
            display_name: "x".into(),
            color: 0,
        };
        channel.send(auth.to_bytes().unwrap()).await.unwrap();
        assert!(matches!(
            next(&mut channel).await,
            CollabMessage::AuthRejected { .. }
        ));
        // Connection is gone after rejection.
        assert!(channel.recv().await.is_none());
        assert_eq!(hub.connection_count("doc"), 0);
    }

    #[tokio::test]
    async fn dropping_connections_announces_leave() {
        let hub = MemoryHub::new();
        let mut a = authed(&hub, 1).await;
        let b = authed(&hub, 2).await;
        let _join = next(&mut a).await;

        drop(b);
        assert_eq!(next(&mut a).await, CollabMessage::Leave { replica: 2 });

        assert_eq!(hub.drop_connections("doc"), 1);
        assert!(a.recv().await.is_none());
    }

    #[tokio::test]
    async fn sync_request_replays_retained_updates() {
        let hub = MemoryHub::new();
        let a = {
            let mut a = authed(&hub, 1).await;
            for seq in 1..=2 {
                let update = CollabMessage::Update {
                    seq,
                    data: vec![seq as u8],
                };
                a.send(update.to_bytes().unwrap()).await.unwrap();
                let _ack = next(&mut a).await;
            }
            a
        };
        drop(a);

        let mut late = authed(&hub, 3).await;
        let request = CollabMessage::SyncRequest {
            replica: 3,
            version: vec![],
        };
        late.send(request.to_bytes().unwrap()).await.unwrap();
        assert_eq!(
            next(&mut late).await,
            CollabMessage::SyncResponse { to: 3, data: vec![1] }
        );
        assert_eq!(
            next(&mut late).await,
            CollabMessage::SyncResponse { to: 3, data: vec![2] }
        );
    }
}
