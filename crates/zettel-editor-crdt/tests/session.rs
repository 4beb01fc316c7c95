use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use zettel_common::transport::{
    Backoff, CollabSession, ConnectionStatus, MemoryHub, SessionConfig, SessionParams,
};
use zettel_editor_core::{DocLinkAttrs, Selection};
use zettel_editor_crdt::{
    Author, CrdtError, DocumentSession, ReplicatedDoc, SessionNotice, SessionRegistry,
    SnapshotSource,
};

const WAIT: Duration = Duration::from_secs(3);

fn params(replica: u64, document: &str) -> SessionParams {
    SessionParams {
        url: "mem://relay".into(),
        document: document.into(),
        token: "t".into(),
        replica,
        display_name: format!("user-{replica}").into(),
        color: 0,
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_millis(500),
        backoff: Backoff::new(Duration::from_millis(10), 2.0, Duration::from_millis(40)),
    }
}

async fn open(hub: &MemoryHub, replica: u64) -> DocumentSession {
    let session = DocumentSession::open(hub.connector(), params(replica, "doc"), fast_config(), &())
        .await
        .unwrap();
    session
        .wait_for_status(ConnectionStatus::Connected, WAIT)
        .await
        .unwrap();
    session
}

/// Apply events on every session until `done` holds.
async fn pump_until(sessions: &[&DocumentSession], done: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !done() {
            for session in sessions {
                session.drain();
            }
            if done() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never reached");
}

fn record(session: &DocumentSession) -> (Rc<RefCell<Vec<SessionNotice>>>, zettel_editor_crdt::Subscription) {
    let seen: Rc<RefCell<Vec<SessionNotice>>> = Rc::default();
    let sub = {
        let seen = seen.clone();
        session.subscribe(move |notice| seen.borrow_mut().push(notice.clone()))
    };
    (seen, sub)
}

#[tokio::test]
async fn edits_flow_between_sessions() {
    let hub = MemoryHub::new();
    let a = open(&hub, 1).await;
    let b = open(&hub, 2).await;

    a.binding().insert_text(0, "Hello").unwrap();
    pump_until(&[&a, &b], || b.store().text() == "Hello").await;

    b.binding().insert_text(5, " World").unwrap();
    pump_until(&[&a, &b], || a.store().text() == "Hello World").await;
    assert_eq!(a.store().version(), b.store().version());
}

#[tokio::test]
async fn late_joiner_catches_up() {
    let hub = MemoryHub::new();
    let a = open(&hub, 1).await;
    a.binding().insert_text(0, "written before b").unwrap();
    let (thread, _) = a
        .comments()
        .add_comment("note", &Author::new("Ada", "#f00"), Some(0..7))
        .unwrap();

    let b = open(&hub, 2).await;
    pump_until(&[&a, &b], || b.store().text() == "written before b").await;
    pump_until(&[&a, &b], || b.comments().thread(&thread).is_some()).await;
    assert_eq!(b.comments().anchor_ranges(&thread), vec![0..7]);
}

struct FixedSnapshot(Vec<u8>);

impl SnapshotSource for FixedSnapshot {
    async fn load_snapshot(
        &self,
        _document: &str,
    ) -> Result<Option<Vec<u8>>, Box<dyn std::error::Error + Send + Sync + 'static>> {
        Ok(Some(self.0.clone()))
    }
}

#[tokio::test]
async fn open_hydrates_from_snapshot() {
    let persisted = {
        let doc = ReplicatedDoc::with_peer(43).unwrap();
        doc.apply_local(vec![zettel_editor_crdt::DocOp::Insert {
            pos: 0,
            text: "persisted".into(),
        }])
        .unwrap();
        doc.snapshot().unwrap()
    };

    let hub = MemoryHub::new();
    let session = DocumentSession::open(
        hub.connector(),
        params(5, "doc"),
        fast_config(),
        &FixedSnapshot(persisted),
    )
    .await
    .unwrap();
    assert_eq!(session.store().text(), "persisted");
    assert_eq!(session.replica(), 5);
}

#[tokio::test]
async fn presence_is_tracked_and_cleared() {
    let hub = MemoryHub::new();
    let a = open(&hub, 1).await;
    let b = open(&hub, 2).await;
    let (notices, _sub) = record(&b);

    a.set_cursor(3, Some(Selection::new(1, 3))).unwrap();
    pump_until(&[&a, &b], || {
        b.collaborators()
            .iter()
            .any(|c| c.replica == 1 && c.cursor.as_ref().is_some_and(|cur| cur.position == 3))
    })
    .await;
    assert!(notices.borrow().contains(&SessionNotice::PresenceChanged));

    a.close().await;
    pump_until(&[&b], || b.collaborators().is_empty()).await;
}

#[tokio::test]
async fn notices_report_document_comment_and_link_changes() {
    let hub = MemoryHub::new();
    let a = open(&hub, 1).await;
    let b = open(&hub, 2).await;
    let (notices, _sub) = record(&b);

    a.binding().insert_text(0, "see ").unwrap();
    a.binding()
        .insert_doc_link(4, &DocLinkAttrs::new("n-7", "Seven"))
        .unwrap();
    a.comments()
        .add_comment("hm", &Author::new("Ada", "#f00"), Some(0..3))
        .unwrap();

    pump_until(&[&a, &b], || {
        notices.borrow().contains(&SessionNotice::LinksChanged {
            targets: vec!["n-7".into()],
        }) && notices.borrow().contains(&SessionNotice::CommentsChanged)
    })
    .await;
    assert!(notices.borrow().iter().any(|n| matches!(
        n,
        SessionNotice::DocumentChanged {
            origin: zettel_editor_crdt::ChangeOrigin::Remote
        }
    )));
}

#[tokio::test]
async fn malformed_remote_update_is_skipped() {
    let hub = MemoryHub::new();
    let a = open(&hub, 1).await;
    let b = open(&hub, 2).await;

    let (rogue, _events) = CollabSession::connect(hub.connector(), params(66, "doc"), fast_config());
    rogue
        .wait_for_status(ConnectionStatus::Connected, WAIT)
        .await
        .unwrap();
    rogue.send(vec![0xde, 0xad, 0xbe, 0xef]).unwrap();

    a.binding().insert_text(0, "still fine").unwrap();
    pump_until(&[&a, &b], || b.store().text() == "still fine").await;
    assert_eq!(b.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn reconnect_resends_without_duplicating() {
    let hub = MemoryHub::new();
    let a = open(&hub, 1).await;
    let b = open(&hub, 2).await;

    hub.set_withhold_acks(true);
    a.binding().insert_text(0, "U1").unwrap();
    pump_until(&[&a, &b], || b.store().text() == "U1").await;
    assert_eq!(a.session().unacked(), 1);

    hub.set_withhold_acks(false);
    hub.drop_connections("doc");
    a.wait_for_status(ConnectionStatus::Connected, WAIT)
        .await
        .unwrap();
    pump_until(&[&a, &b], || a.session().unacked() == 0).await;

    a.binding().insert_text(2, " U2").unwrap();
    pump_until(&[&a, &b], || b.store().text() == "U1 U2").await;
    pump_until(&[&a, &b], || a.session().unacked() == 0).await;
    assert_eq!(a.store().text(), b.store().text());
}

#[tokio::test]
async fn close_stops_remote_application() {
    let hub = MemoryHub::new();
    let a = open(&hub, 1).await;
    let b = open(&hub, 2).await;

    b.close().await;
    assert!(b.is_closed());
    assert_eq!(b.status(), ConnectionStatus::Closed);

    a.binding().insert_text(0, "after close").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(b.drain(), 0);
    assert_eq!(b.store().text(), "");
    assert!(matches!(b.set_cursor(0, None), Err(CrdtError::SessionClosed)));

    // Local edits still land even though the connection is gone.
    b.binding().insert_text(0, "offline").unwrap();
    assert_eq!(b.store().text(), "offline");
    tokio::time::sleep(Duration::from_millis(20)).await;
    a.drain();
    assert_eq!(a.store().text(), "after close");
}

#[tokio::test]
async fn registry_allows_one_session_per_document() {
    let hub = MemoryHub::new();
    let registry = SessionRegistry::new();

    let first = registry
        .open(hub.connector(), params(1, "doc"), fast_config(), &())
        .await
        .unwrap();
    let err = registry
        .open(hub.connector(), params(2, "doc"), fast_config(), &())
        .await
        .err()
        .expect("second open must fail");
    assert!(matches!(err, CrdtError::AlreadyOpen(id) if id == "doc"));

    let other = registry
        .open(hub.connector(), params(3, "other"), fast_config(), &())
        .await
        .unwrap();
    assert_eq!(registry.len(), 2);

    first.close().await;
    assert!(!registry.is_open("doc"));
    drop(other);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn auth_rejection_is_reported_then_recovers() {
    let hub = MemoryHub::with_tokens(["good"]);
    let session = DocumentSession::open(hub.connector(), params(1, "doc"), fast_config(), &())
        .await
        .unwrap();
    let (notices, _sub) = record(&session);

    pump_until(&[&session], || {
        notices
            .borrow()
            .iter()
            .any(|n| matches!(n, SessionNotice::AuthRejected { .. }))
    })
    .await;
    assert_eq!(session.status(), ConnectionStatus::Disconnected);

    session.reauthenticate("good").unwrap();
    session
        .wait_for_status(ConnectionStatus::Connected, WAIT)
        .await
        .unwrap();
}
