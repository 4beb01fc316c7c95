//! At most one live session per document.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::{Rc, Weak};

use smol_str::SmolStr;
use tracing::debug;
use zettel_common::transport::{Connector, SessionConfig, SessionParams};

use crate::CrdtError;
use crate::session::{DocumentSession, SnapshotSource};

type OpenSet = RefCell<HashSet<SmolStr>>;

/// Tracks which documents have a live session on this client.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    open: Rc<OpenSet>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, document: &str) -> bool {
        self.open.borrow().contains(document)
    }

    pub fn len(&self) -> usize {
        self.open.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim `document`. The claim is released when the lease drops.
    pub fn reserve(&self, document: &str) -> Result<SessionLease, CrdtError> {
        if !self.open.borrow_mut().insert(SmolStr::new(document)) {
            return Err(CrdtError::AlreadyOpen(document.into()));
        }
        Ok(SessionLease {
            document: document.into(),
            open: Rc::downgrade(&self.open),
        })
    }

    /// Open a session, failing with [`CrdtError::AlreadyOpen`] if this
    /// registry already holds one for the document.
    ///
    /// The claim ends when the session is closed or dropped.
    pub async fn open<C: Connector>(
        &self,
        connector: C,
        params: SessionParams,
        config: SessionConfig,
        source: &impl SnapshotSource,
    ) -> Result<DocumentSession, CrdtError> {
        let lease = self.reserve(&params.document)?;
        let session = DocumentSession::open(connector, params, config, source).await?;
        session.attach_lease(lease);
        Ok(session)
    }
}

/// A claim on a document id held by its live session.
#[derive(Debug)]
pub struct SessionLease {
    document: SmolStr,
    open: Weak<OpenSet>,
}

impl SessionLease {
    pub fn document(&self) -> &SmolStr {
        &self.document
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(open) = self.open.upgrade() {
            open.borrow_mut().remove(&self.document);
            debug!(document = %self.document, "session lease released");
        }
    }
}
