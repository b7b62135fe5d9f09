mod common;

use parley::errors::ChatError;
use parley::store::{ConversationKey, MessageKind};

use common::store_with_directory;

#[tokio::test]
async fn same_pair_resolves_to_one_conversation() {
    let t = store_with_directory().await;

    let first = t
        .store
        .get_or_create_conversation("cust-1", "biz-1")
        .await
        .unwrap();
    let second = t
        .store
        .get_or_create_conversation("cust-1", "biz-1")
        .await
        .unwrap();

    assert_eq!(first.key, second.key);
    assert_eq!(first.created_at, second.created_at);
    assert_eq!(
        first.key,
        ConversationKey::for_pair("biz-1", "cust-1").as_str()
    );
}

#[tokio::test]
async fn pairing_validation_rejects_bad_endpoints() {
    let t = store_with_directory().await;

    // Same account on both sides.
    assert!(matches!(
        t.store.get_or_create_conversation("cust-1", "cust-1").await,
        Err(ChatError::InvalidParticipants(_))
    ));
    // Unknown id.
    assert!(matches!(
        t.store.get_or_create_conversation("cust-1", "ghost").await,
        Err(ChatError::InvalidParticipants(_))
    ));
    // Two customers.
    assert!(matches!(
        t.store.get_or_create_conversation("cust-1", "cust-2").await,
        Err(ChatError::InvalidParticipants(_))
    ));
}

#[tokio::test]
async fn append_updates_preview_and_receiver_counter() {
    let t = store_with_directory().await;
    let conv = t
        .store
        .get_or_create_conversation("cust-1", "biz-1")
        .await
        .unwrap();
    let key = ConversationKey::parse(&conv.key).unwrap();

    let msg = t
        .store
        .append_message(&key, "cust-1", "biz-1", "  hello there  ", MessageKind::Text)
        .await
        .unwrap();
    assert_eq!(msg.body, "hello there");
    assert!(!msg.read);

    let conv = t.store.conversation(&key).await.unwrap().unwrap();
    assert_eq!(conv.last_message.as_deref(), Some("hello there"));
    assert_eq!(conv.business_unread, 1);
    assert_eq!(conv.customer_unread, 0);
}

#[tokio::test]
async fn append_rejects_invalid_bodies_and_outsiders() {
    let t = store_with_directory().await;
    let conv = t
        .store
        .get_or_create_conversation("cust-1", "biz-1")
        .await
        .unwrap();
    let key = ConversationKey::parse(&conv.key).unwrap();

    assert!(matches!(
        t.store
            .append_message(&key, "cust-1", "biz-1", "   ", MessageKind::Text)
            .await,
        Err(ChatError::Validation(_))
    ));
    let oversized = "x".repeat(1001);
    assert!(matches!(
        t.store
            .append_message(&key, "cust-1", "biz-1", &oversized, MessageKind::Text)
            .await,
        Err(ChatError::Validation(_))
    ));
    // cust-2 is not a participant of this conversation.
    assert!(matches!(
        t.store
            .append_message(&key, "cust-2", "biz-1", "hi", MessageKind::Text)
            .await,
        Err(ChatError::Validation(_))
    ));

    // Nothing above changed any state.
    let conv = t.store.conversation(&key).await.unwrap().unwrap();
    assert_eq!(conv.business_unread, 0);
    assert!(conv.last_message.is_none());
}

#[tokio::test]
async fn mark_read_flips_exactly_once() {
    let t = store_with_directory().await;
    let conv = t
        .store
        .get_or_create_conversation("cust-1", "biz-1")
        .await
        .unwrap();
    let key = ConversationKey::parse(&conv.key).unwrap();

    let mut ids = Vec::new();
    for body in ["one", "two", "three"] {
        let msg = t
            .store
            .append_message(&key, "cust-1", "biz-1", body, MessageKind::Text)
            .await
            .unwrap();
        ids.push(msg.id);
    }

    let flipped = t
        .store
        .mark_read(&ids[..2], &key, "biz-1")
        .await
        .unwrap();
    assert_eq!(flipped.len(), 2);

    let conv = t.store.conversation(&key).await.unwrap().unwrap();
    assert_eq!(conv.business_unread, 1);

    // Re-marking the same ids is a no-op and cannot drive the counter below
    // the true unread count.
    let again = t
        .store
        .mark_read(&ids[..2], &key, "biz-1")
        .await
        .unwrap();
    assert!(again.is_empty());
    let conv = t.store.conversation(&key).await.unwrap().unwrap();
    assert_eq!(conv.business_unread, 1);

    // Messages addressed to the peer are untouched by the wrong reader.
    let wrong_reader = t
        .store
        .mark_read(&ids[2..], &key, "cust-1")
        .await
        .unwrap();
    assert!(wrong_reader.is_empty());
}

#[tokio::test]
async fn mark_conversation_read_zeroes_the_counter() {
    let t = store_with_directory().await;
    let conv = t
        .store
        .get_or_create_conversation("cust-1", "biz-1")
        .await
        .unwrap();
    let key = ConversationKey::parse(&conv.key).unwrap();

    for body in ["a", "b", "c", "d"] {
        t.store
            .append_message(&key, "cust-1", "biz-1", body, MessageKind::Text)
            .await
            .unwrap();
    }

    let flipped = t
        .store
        .mark_conversation_read(&key, "biz-1")
        .await
        .unwrap();
    assert_eq!(flipped.len(), 4);

    let conv = t.store.conversation(&key).await.unwrap().unwrap();
    assert_eq!(conv.business_unread, 0);
    assert_eq!(t.store.unread_count_for("biz-1").await.unwrap(), 0);
}

#[tokio::test]
async fn only_the_sender_may_delete_a_message() {
    let t = store_with_directory().await;
    let conv = t
        .store
        .get_or_create_conversation("cust-1", "biz-1")
        .await
        .unwrap();
    let key = ConversationKey::parse(&conv.key).unwrap();

    let msg = t
        .store
        .append_message(&key, "cust-1", "biz-1", "mine", MessageKind::Text)
        .await
        .unwrap();

    assert!(matches!(
        t.store.delete_message(msg.id, "biz-1").await,
        Err(ChatError::Forbidden(_))
    ));

    // Rejection left the message and the counter alone.
    let (messages, page) = t.store.list_messages(&key, 1, 50).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(messages[0].id, msg.id);
    let conv = t.store.conversation(&key).await.unwrap().unwrap();
    assert_eq!(conv.business_unread, 1);
}

#[tokio::test]
async fn deleting_an_unread_message_adjusts_the_counter() {
    let t = store_with_directory().await;
    let conv = t
        .store
        .get_or_create_conversation("cust-1", "biz-1")
        .await
        .unwrap();
    let key = ConversationKey::parse(&conv.key).unwrap();

    let msg = t
        .store
        .append_message(&key, "cust-1", "biz-1", "oops", MessageKind::Text)
        .await
        .unwrap();

    let deletion = t.store.delete_message(msg.id, "cust-1").await.unwrap();
    assert!(deletion.was_unread);

    let conv = t.store.conversation(&key).await.unwrap().unwrap();
    assert_eq!(conv.business_unread, 0);

    let (messages, page) = t.store.list_messages(&key, 1, 50).await.unwrap();
    assert!(messages.is_empty());
    assert_eq!(page.total, 0);

    // A second delete of the same id is NotFound, not a double decrement.
    assert!(matches!(
        t.store.delete_message(msg.id, "cust-1").await,
        Err(ChatError::NotFound(_))
    ));
}

#[tokio::test]
async fn conversation_delete_is_per_side_until_both() {
    let t = store_with_directory().await;
    let conv = t
        .store
        .get_or_create_conversation("cust-1", "biz-1")
        .await
        .unwrap();
    let key = ConversationKey::parse(&conv.key).unwrap();
    t.store
        .append_message(&key, "cust-1", "biz-1", "hello", MessageKind::Text)
        .await
        .unwrap();

    t.store.delete_conversation(&key, "cust-1").await.unwrap();

    // Hidden for the deleting side, still listed for the peer.
    assert!(t
        .store
        .conversations_for("cust-1")
        .await
        .unwrap()
        .is_empty());
    assert_eq!(t.store.conversations_for("biz-1").await.unwrap().len(), 1);

    // The second side's delete removes the row and its messages.
    t.store.delete_conversation(&key, "biz-1").await.unwrap();
    assert!(t.store.conversation(&key).await.unwrap().is_none());
    assert!(t.store.conversations_for("biz-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn new_message_resurfaces_a_deleted_side() {
    let t = store_with_directory().await;
    let conv = t
        .store
        .get_or_create_conversation("cust-1", "biz-1")
        .await
        .unwrap();
    let key = ConversationKey::parse(&conv.key).unwrap();

    t.store.delete_conversation(&key, "cust-1").await.unwrap();
    assert!(t
        .store
        .conversations_for("cust-1")
        .await
        .unwrap()
        .is_empty());

    t.store
        .append_message(&key, "biz-1", "cust-1", "are you there?", MessageKind::Text)
        .await
        .unwrap();

    let listed = t.store.conversations_for("cust-1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].unread, 1);
}

#[tokio::test]
async fn unread_count_sums_across_conversations() {
    let t = store_with_directory().await;

    for (cust, n) in [("cust-1", 2), ("cust-2", 3)] {
        let conv = t
            .store
            .get_or_create_conversation(cust, "biz-1")
            .await
            .unwrap();
        let key = ConversationKey::parse(&conv.key).unwrap();
        for i in 0..n {
            t.store
                .append_message(&key, cust, "biz-1", &format!("msg {i}"), MessageKind::Text)
                .await
                .unwrap();
        }
    }

    assert_eq!(t.store.unread_count_for("biz-1").await.unwrap(), 5);
    assert_eq!(t.store.unread_count_for("cust-1").await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_appends_lose_nothing() {
    let t = store_with_directory().await;
    let conv = t
        .store
        .get_or_create_conversation("cust-1", "biz-1")
        .await
        .unwrap();
    let key = ConversationKey::parse(&conv.key).unwrap();

    let mut handles = Vec::new();
    for task in 0..4 {
        let store = t.store.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..5 {
                store
                    .append_message(
                        &key,
                        "cust-1",
                        "biz-1",
                        &format!("task {task} msg {i}"),
                        MessageKind::Text,
                    )
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let conv = t.store.conversation(&key).await.unwrap().unwrap();
    assert_eq!(conv.business_unread, 20);

    let (messages, page) = t.store.list_messages(&key, 1, 50).await.unwrap();
    assert_eq!(page.total, 20);
    // Store-assigned ids are the creation order.
    for pair in messages.windows(2) {
        assert!(pair[0].id < pair[1].id);
    }
}

#[tokio::test]
async fn message_pages_walk_in_creation_order() {
    let t = store_with_directory().await;
    let conv = t
        .store
        .get_or_create_conversation("cust-1", "biz-1")
        .await
        .unwrap();
    let key = ConversationKey::parse(&conv.key).unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        let msg = t
            .store
            .append_message(&key, "cust-1", "biz-1", &format!("m{i}"), MessageKind::Text)
            .await
            .unwrap();
        ids.push(msg.id);
    }

    let (page2, info) = t.store.list_messages(&key, 2, 2).await.unwrap();
    assert_eq!(info.total, 5);
    assert_eq!(info.total_pages, 3);
    assert!(info.has_next && info.has_prev);
    assert_eq!(
        page2.iter().map(|m| m.id).collect::<Vec<_>>(),
        &ids[2..4]
    );

    // Out-of-range pages clamp instead of erroring.
    let (last, info) = t.store.list_messages(&key, 99, 2).await.unwrap();
    assert_eq!(info.page, 3);
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].id, ids[4]);
}
