//! A replicated document tied to a live collaboration session.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use smol_str::SmolStr;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, trace, warn};
use zettel_common::transport::{
    Collaborator, CollabSession, ConnectionStatus, Connector, PresenceTracker, SessionConfig,
    SessionError, SessionEvent, SessionParams,
};
use zettel_editor_core::Selection;

use crate::binding::{RichTextBinding, collect_doc_links};
use crate::comments::Comments;
use crate::observe::{Observers, Subscription};
use crate::registry::SessionLease;
use crate::store::{ChangeOrigin, DocChange, ReplicatedDoc, random_peer_id};
use crate::CrdtError;

/// Where the last persisted snapshot of a document comes from.
pub trait SnapshotSource {
    /// Load the snapshot, or `None` for a document with no persisted state.
    fn load_snapshot(
        &self,
        document: &str,
    ) -> impl Future<
        Output = Result<Option<Vec<u8>>, Box<dyn std::error::Error + Send + Sync + 'static>>,
    >;
}

/// No persisted state: every document starts empty.
impl SnapshotSource for () {
    async fn load_snapshot(
        &self,
        _document: &str,
    ) -> Result<Option<Vec<u8>>, Box<dyn std::error::Error + Send + Sync + 'static>> {
        Ok(None)
    }
}

/// Typed notifications from a [`DocumentSession`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionNotice {
    Status(ConnectionStatus),
    DocumentChanged { origin: ChangeOrigin },
    CommentsChanged,
    /// The set of referenced documents changed; ids in document order.
    LinksChanged { targets: Vec<SmolStr> },
    PresenceChanged,
    AuthRejected { reason: SmolStr },
}

struct Shared {
    session: CollabSession,
    notices: Observers<SessionNotice>,
    presence: RefCell<PresenceTracker>,
    links: RefCell<Vec<SmolStr>>,
    closed: Cell<bool>,
}

impl Shared {
    fn on_doc_change(&self, store: &ReplicatedDoc, change: &DocChange) {
        if change.origin == ChangeOrigin::Local && !change.update.is_empty() {
            if let Err(e) = self.session.send(change.update.clone()) {
                debug!(error = %e, "local update not forwarded");
            }
        }
        if let Err(e) = self.session.update_version(store.encoded_version()) {
            debug!(error = %e, "version not published");
        }

        if change.text {
            self.notices.emit(&SessionNotice::DocumentChanged {
                origin: change.origin,
            });
        }
        if change.comments {
            self.notices.emit(&SessionNotice::CommentsChanged);
        }
        if change.text {
            let targets: Vec<SmolStr> = collect_doc_links(store)
                .into_iter()
                .map(|attrs| attrs.id)
                .collect();
            let changed = *self.links.borrow() != targets;
            if changed {
                *self.links.borrow_mut() = targets.clone();
                self.notices
                    .emit(&SessionNotice::LinksChanged { targets });
            }
        }
    }
}

/// Store, binding, comments and presence wired to a [`CollabSession`].
///
/// Local edits made through [`binding`](Self::binding) or
/// [`comments`](Self::comments) are forwarded automatically. Remote events
/// are applied by [`step`](Self::step), [`run`](Self::run) or
/// [`drain`](Self::drain) on the task owning the session.
pub struct DocumentSession {
    shared: Rc<Shared>,
    store: Rc<ReplicatedDoc>,
    binding: RichTextBinding,
    comments: Comments,
    events: RefCell<UnboundedReceiver<SessionEvent>>,
    lease: RefCell<Option<SessionLease>>,
    _changes: Subscription,
}

impl DocumentSession {
    /// Hydrate the document from `source` and connect.
    ///
    /// A zero `params.replica` gets a random replica id.
    pub async fn open<C: Connector>(
        connector: C,
        mut params: SessionParams,
        config: SessionConfig,
        source: &impl SnapshotSource,
    ) -> Result<Self, CrdtError> {
        if params.replica == 0 {
            params.replica = random_peer_id();
        }
        let snapshot = source
            .load_snapshot(&params.document)
            .await
            .map_err(CrdtError::Snapshot)?;
        let store = match snapshot {
            Some(bytes) => ReplicatedDoc::from_snapshot(&bytes, params.replica)?,
            None => ReplicatedDoc::with_peer(params.replica)?,
        };
        Ok(Self::start(connector, params, config, Rc::new(store)))
    }

    /// Connect an existing document. The replica id is the document's peer id.
    pub fn start<C: Connector>(
        connector: C,
        mut params: SessionParams,
        config: SessionConfig,
        store: Rc<ReplicatedDoc>,
    ) -> Self {
        params.replica = store.peer_id();
        let document = params.document.clone();
        let (session, events) = CollabSession::connect(connector, params, config);
        if let Err(e) = session.update_version(store.encoded_version()) {
            debug!(error = %e, "initial version not published");
        }

        let shared = Rc::new(Shared {
            session,
            notices: Observers::new(),
            presence: RefCell::new(PresenceTracker::new()),
            links: RefCell::new(
                collect_doc_links(&store)
                    .into_iter()
                    .map(|attrs| attrs.id)
                    .collect(),
            ),
            closed: Cell::new(false),
        });

        let changes = {
            let shared = shared.clone();
            let weak_store = Rc::downgrade(&store);
            store.subscribe(move |change| {
                if let Some(store) = weak_store.upgrade() {
                    shared.on_doc_change(&store, change);
                }
            })
        };

        info!(%document, replica = store.peer_id(), "document session opened");
        Self {
            binding: RichTextBinding::new(store.clone()),
            comments: Comments::new(store.clone()),
            store,
            shared,
            events: RefCell::new(events),
            lease: RefCell::new(None),
            _changes: changes,
        }
    }

    pub(crate) fn attach_lease(&self, lease: SessionLease) {
        *self.lease.borrow_mut() = Some(lease);
    }

    pub fn document(&self) -> &SmolStr {
        self.shared.session.document()
    }

    pub fn replica(&self) -> u64 {
        self.store.peer_id()
    }

    pub fn store(&self) -> &Rc<ReplicatedDoc> {
        &self.store
    }

    pub fn binding(&self) -> &RichTextBinding {
        &self.binding
    }

    pub fn comments(&self) -> &Comments {
        &self.comments
    }

    pub fn session(&self) -> &CollabSession {
        &self.shared.session
    }

    pub fn status(&self) -> ConnectionStatus {
        if self.shared.closed.get() {
            return ConnectionStatus::Closed;
        }
        self.shared.session.status()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.get()
    }

    /// Remote collaborators currently present.
    pub fn collaborators(&self) -> Vec<Collaborator> {
        let mut list: Vec<Collaborator> =
            self.shared.presence.borrow().collaborators().cloned().collect();
        list.sort_by_key(|c| c.replica);
        list
    }

    /// Subscribe to session notices. Dropping the handle unsubscribes.
    pub fn subscribe(&self, callback: impl Fn(&SessionNotice) + 'static) -> Subscription {
        self.shared.notices.subscribe(callback)
    }

    /// Broadcast the local cursor.
    pub fn set_cursor(&self, position: usize, selection: Option<Selection>) -> Result<(), CrdtError> {
        self.ensure_open()?;
        self.shared.session.send_presence(
            position,
            selection.map(|s| (s.anchor, s.head)),
        )?;
        Ok(())
    }

    /// Retry after [`SessionNotice::AuthRejected`] with a fresh credential.
    pub fn reauthenticate(&self, token: impl Into<SmolStr>) -> Result<(), CrdtError> {
        self.ensure_open()?;
        self.shared.session.reauthenticate(token)?;
        Ok(())
    }

    pub async fn wait_for_status(
        &self,
        expected: ConnectionStatus,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        self.shared.session.wait_for_status(expected, timeout).await
    }

    fn ensure_open(&self) -> Result<(), CrdtError> {
        if self.shared.closed.get() {
            return Err(CrdtError::SessionClosed);
        }
        Ok(())
    }

    /// Wait for the next transport event and apply it.
    ///
    /// Returns false once the session is closed or the driver is gone.
    /// Cancel-safe: dropping the future loses no event.
    pub async fn step(&self) -> bool {
        if self.shared.closed.get() {
            return false;
        }
        let event = std::future::poll_fn(|cx| self.events.borrow_mut().poll_recv(cx)).await;
        match event {
            Some(event) => {
                self.handle_event(event);
                !self.shared.closed.get()
            }
            None => false,
        }
    }

    /// Apply transport events until the session ends.
    pub async fn run(&self) {
        while self.step().await {}
    }

    /// Apply every event already queued, without waiting. Returns how many.
    pub fn drain(&self) -> usize {
        let mut applied = 0;
        loop {
            if self.shared.closed.get() {
                return applied;
            }
            let next = self.events.borrow_mut().try_recv();
            match next {
                Ok(event) => {
                    self.handle_event(event);
                    applied += 1;
                }
                Err(_) => return applied,
            }
        }
    }

    /// Apply one transport event. Ignored after [`close`](Self::close).
    pub fn handle_event(&self, event: SessionEvent) {
        if self.shared.closed.get() {
            trace!("event after close ignored");
            return;
        }
        let notices = &self.shared.notices;
        match event {
            SessionEvent::Status(status) => {
                if matches!(
                    status,
                    ConnectionStatus::Disconnected | ConnectionStatus::Closed
                ) {
                    let cleared = self.shared.presence.borrow_mut().clear();
                    if cleared {
                        notices.emit(&SessionNotice::PresenceChanged);
                    }
                }
                notices.emit(&SessionNotice::Status(status));
            }
            SessionEvent::RemoteUpdate { data } => {
                if let Err(e) = self.store.apply_remote(&data) {
                    warn!(error = %e, bytes = data.len(), "skipping undecodable remote update");
                }
            }
            SessionEvent::SyncRequested { replica, version } => {
                match self.store.updates_since(&version) {
                    Ok(data) => {
                        debug!(to = replica, bytes = data.len(), "answering sync request");
                        if let Err(e) = self.shared.session.respond_sync(replica, data) {
                            debug!(error = %e, to = replica, "sync response not sent");
                        }
                    }
                    Err(e) => warn!(error = %e, from = replica, "bad sync request"),
                }
            }
            SessionEvent::PeerJoined {
                replica,
                display_name,
                color,
            } => {
                self.shared
                    .presence
                    .borrow_mut()
                    .add_collaborator(replica, display_name, color);
                notices.emit(&SessionNotice::PresenceChanged);
            }
            SessionEvent::PeerLeft { replica } => {
                let removed = self
                    .shared
                    .presence
                    .borrow_mut()
                    .remove_collaborator(replica)
                    .is_some();
                if removed {
                    notices.emit(&SessionNotice::PresenceChanged);
                }
            }
            SessionEvent::Presence {
                replica,
                display_name,
                color,
                position,
                selection,
            } => {
                let changed = self.shared.presence.borrow_mut().update_cursor(
                    replica,
                    &display_name,
                    color,
                    position,
                    selection,
                );
                if changed {
                    notices.emit(&SessionNotice::PresenceChanged);
                }
            }
            SessionEvent::AuthRejected { reason } => {
                warn!(%reason, "authentication rejected");
                notices.emit(&SessionNotice::AuthRejected { reason });
            }
        }
    }

    /// Close the session. Remote application stops immediately; the channel
    /// is released before this returns.
    pub async fn close(&self) {
        if self.shared.closed.replace(true) {
            return;
        }
        self.lease.borrow_mut().take();
        let cleared = self.shared.presence.borrow_mut().clear();

        self.shared.session.close().await;
        info!(document = %self.document(), "document session closed");

        if cleared {
            self.shared.notices.emit(&SessionNotice::PresenceChanged);
        }
        self.shared
            .notices
            .emit(&SessionNotice::Status(ConnectionStatus::Closed));
    }
}
