use std::rc::Rc;

use zettel_editor_core::{DocLinkAttrs, render_html};
use zettel_editor_crdt::{Author, Comments, CrdtError, DocOp, ReplicatedDoc, RichTextBinding};

fn replica(peer: u64) -> Rc<ReplicatedDoc> {
    Rc::new(ReplicatedDoc::with_peer(peer).unwrap())
}

fn insert(pos: usize, text: &str) -> Vec<DocOp> {
    vec![DocOp::Insert {
        pos,
        text: text.into(),
    }]
}

#[test]
fn concurrent_inserts_at_same_position_converge() {
    let a = replica(1);
    let b = replica(2);

    let hello = a.apply_local(insert(0, "Hello")).unwrap();
    let world = b.apply_local(insert(0, "World")).unwrap();

    a.apply_remote(&world).unwrap();
    b.apply_remote(&hello).unwrap();

    assert_eq!(a.text().as_bytes(), b.text().as_bytes());
    assert!(a.text() == "HelloWorld" || a.text() == "WorldHello");
    assert_eq!(a.version(), b.version());
}

#[test]
fn any_receipt_order_with_duplicates_converges() {
    let a = replica(1);
    let b = replica(2);

    let u1 = a.apply_local(insert(0, "alpha ")).unwrap();
    b.apply_remote(&u1).unwrap();
    // u2 depends on u1.
    let u2 = b.apply_local(insert(6, "beta ")).unwrap();
    let u3 = a.apply_local(insert(0, "gamma ")).unwrap();

    let orders: [&[&Vec<u8>]; 4] = [
        &[&u1, &u2, &u3],
        &[&u3, &u2, &u1],
        &[&u2, &u1, &u1, &u3, &u2],
        &[&u3, &u3, &u1, &u2],
    ];

    let mut results = Vec::new();
    for (i, order) in orders.iter().enumerate() {
        let target = replica(10 + i as u64);
        for update in order.iter() {
            target.apply_remote(update).unwrap();
        }
        results.push((target.text(), target.version()));
    }

    let (first_text, first_version) = &results[0];
    assert_eq!(first_text.len(), "alpha beta gamma ".len());
    for (text, version) in &results[1..] {
        assert_eq!(text, first_text);
        assert_eq!(version, first_version);
    }
}

#[test]
fn resent_update_applies_once() {
    let a = replica(1);
    let u1 = a.apply_local(insert(0, "one ")).unwrap();
    let u2 = a.apply_local(insert(4, "two")).unwrap();

    let once = replica(2);
    once.apply_remote(&u1).unwrap();
    once.apply_remote(&u2).unwrap();

    let resent = replica(3);
    resent.apply_remote(&u1).unwrap();
    assert!(!resent.apply_remote(&u1).unwrap());
    resent.apply_remote(&u2).unwrap();

    assert_eq!(resent.text(), once.text());
    assert_eq!(resent.text(), "one two");
}

#[test]
fn rendered_documents_match_after_sync() {
    let a = replica(1);
    let b = replica(2);
    let ba = RichTextBinding::new(a.clone());
    let bb = RichTextBinding::new(b.clone());

    let u1 = ba.insert_text(0, "shared line").unwrap();
    b.apply_remote(&u1).unwrap();

    let u2 = ba
        .toggle_mark(0..6, &zettel_editor_core::Mark::Bold)
        .unwrap();
    let u3 = bb
        .insert_doc_link(11, &DocLinkAttrs::new("n1", "Target"))
        .unwrap();
    a.apply_remote(&u3).unwrap();
    b.apply_remote(&u2).unwrap();

    assert_eq!(render_html(&ba.render()), render_html(&bb.render()));
    assert_eq!(ba.doc_links(), bb.doc_links());
}

#[test]
fn concurrent_delete_removes_reference_whole() {
    let a = replica(1);
    let b = replica(2);
    let ba = RichTextBinding::new(a.clone());
    let bb = RichTextBinding::new(b.clone());

    let base = ba.insert_text(0, "ab").unwrap();
    b.apply_remote(&base).unwrap();
    let link = ba.insert_doc_link(1, &DocLinkAttrs::new("x", "X")).unwrap();
    b.apply_remote(&link).unwrap();

    // One side deletes the reference while the other types after it.
    let delete = ba.delete(0..2).unwrap();
    let typed = bb.insert_text(2, "!").unwrap();
    a.apply_remote(&typed).unwrap();
    b.apply_remote(&delete).unwrap();

    assert_eq!(a.text(), b.text());
    assert!(!a.text().contains('\u{FFFC}'));
    assert!(ba.doc_links().is_empty());
    assert!(bb.doc_links().is_empty());
}

#[test]
fn concurrent_replies_both_survive() {
    let a = replica(1);
    let b = replica(2);
    let ca = Comments::new(a.clone());
    let cb = Comments::new(b.clone());
    let ada = Author::new("Ada", "#f00");
    let bob = Author::new("Bob", "#00f");

    let (thread, created) = ca.add_comment("question", &ada, None).unwrap();
    b.apply_remote(&created).unwrap();

    let (_, ra) = ca.add_reply(&thread, "from ada", &ada).unwrap();
    let (_, rb) = cb.add_reply(&thread, "from bob", &bob).unwrap();
    a.apply_remote(&rb).unwrap();
    b.apply_remote(&ra).unwrap();

    let ta = ca.thread(&thread).unwrap();
    let tb = cb.thread(&thread).unwrap();
    assert_eq!(ta, tb);
    let mut texts: Vec<&str> = ta.replies.iter().map(|r| r.text.as_str()).collect();
    texts.sort();
    assert_eq!(texts, ["from ada", "from bob"]);
}

#[test]
fn concurrent_resolve_and_text_edit_keep_field_level_changes() {
    let a = replica(1);
    let b = replica(2);
    let ca = Comments::new(a.clone());
    let ada = Author::new("Ada", "#f00");

    let base = a.apply_local(insert(0, "anchored text")).unwrap();
    b.apply_remote(&base).unwrap();
    let (thread, created) = ca.add_comment("c", &ada, Some(0..8)).unwrap();
    b.apply_remote(&created).unwrap();

    let resolved = ca.set_resolved(&thread, true).unwrap();
    let cb = Comments::new(b.clone());
    let (_, reply) = cb.add_reply(&thread, "late reply", &ada).unwrap();

    a.apply_remote(&reply).unwrap();
    b.apply_remote(&resolved).unwrap();

    for comments in [&ca, &cb] {
        let t = comments.thread(&thread).unwrap();
        assert!(t.resolved);
        assert_eq!(t.replies.len(), 1);
        assert!(comments.anchor_ranges(&thread).is_empty());
    }
}

#[test]
fn concurrent_delete_leaves_inert_marks() {
    let a = replica(1);
    let b = replica(2);
    let ca = Comments::new(a.clone());
    let cb = Comments::new(b.clone());
    let ada = Author::new("Ada", "#f00");

    let base = a.apply_local(insert(0, "hello world")).unwrap();
    b.apply_remote(&base).unwrap();
    let (thread, created) = ca.add_comment("c", &ada, None).unwrap();
    b.apply_remote(&created).unwrap();

    // A deletes the thread while B anchors it.
    let deleted = ca.delete_comment(&thread).unwrap();
    let anchored = cb.anchor(&thread, 6..11).unwrap();
    a.apply_remote(&anchored).unwrap();
    b.apply_remote(&deleted).unwrap();

    for store in [&a, &b] {
        let binding = RichTextBinding::new(store.clone());
        assert!(Comments::new(store.clone()).thread(&thread).is_none());
        assert!(
            binding.render().blocks[0]
                .inlines
                .iter()
                .all(|inline| inline.style().comments.is_empty())
        );
    }
}

#[test]
fn read_only_blocks_comment_anchoring_on_shared_store() {
    let a = replica(1);
    let b = replica(2);
    let binding = RichTextBinding::new(b.clone());
    let comments = Comments::new(b.clone());
    let ada = Author::new("Ada", "#f00");

    let base = a.apply_local(insert(0, "hello world")).unwrap();
    b.apply_remote(&base).unwrap();
    let (anchored, created) = Comments::new(a.clone())
        .add_comment("earlier", &ada, Some(0..5))
        .unwrap();
    b.apply_remote(&created).unwrap();

    binding.set_read_only(true);
    let version = b.version();

    let err = comments.add_comment("x", &ada, Some(0..5)).unwrap_err();
    assert!(matches!(err, CrdtError::ReadOnly));
    assert!(matches!(
        comments.anchor(&anchored, 6..11),
        Err(CrdtError::ReadOnly)
    ));
    assert!(matches!(
        comments.set_resolved(&anchored, true),
        Err(CrdtError::ReadOnly)
    ));
    assert!(matches!(
        comments.delete_comment(&anchored),
        Err(CrdtError::ReadOnly)
    ));
    assert_eq!(b.version(), version);
    assert_eq!(comments.anchor_ranges(&anchored), vec![0..5]);
    assert_eq!(comments.threads().len(), 1);

    // Unanchored threads and replies do not touch the text.
    let (_, reply) = comments.add_reply(&anchored, "still allowed", &ada).unwrap();
    assert!(!reply.is_empty());

    // Remote anchoring keeps flowing in.
    let moved = Comments::new(a.clone()).anchor(&anchored, 6..11).unwrap();
    b.apply_remote(&moved).unwrap();
    assert_eq!(comments.anchor_ranges(&anchored), vec![6..11]);

    binding.set_read_only(false);
    assert!(comments.add_comment("now", &ada, Some(0..5)).is_ok());
}
