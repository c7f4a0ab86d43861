//! Conversation and message writes shared by the directory and the thread.

use serde_json::{Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use hiiapp_types::error::StoreError;
use hiiapp_types::models::{CHATS, Identity, USERS, conversation_key, messages_collection};
use hiiapp_types::store::{DocPath, Direction, Document, Fields, FilterOp, Query, Write};

use crate::backend::DataStore;

/// Upper bound appended to a prefix for a string range query.
const PREFIX_END: char = '\u{f8ff}';

/// Find a profile by address: exact match first, then prefix match.
pub async fn find_identity_by_email<S: DataStore>(
    store: &S,
    address: &str,
) -> Result<Option<Identity>, StoreError> {
    let address = address.trim().to_lowercase();

    let exact = Query::collection(USERS)
        .filter("email", FilterOp::Eq, address.clone())
        .limit(1);
    let mut hits = store.query(&exact).await?;

    if hits.is_empty() {
        debug!("No exact match for {}, trying prefix", address);
        let prefix = Query::collection(USERS)
            .filter("email", FilterOp::Gte, address.clone())
            .filter("email", FilterOp::Lte, format!("{}{}", address, PREFIX_END))
            .order_by("email", Direction::Asc)
            .limit(1);
        hits = store.query(&prefix).await?;
    }

    hits.first().map(Document::decode).transpose()
}

/// Id of an existing conversation between the two identities.
///
/// Looks up the deterministic key first, then scans `me`'s conversations,
/// which also finds conversations created under other ids.
pub async fn find_existing<S: DataStore>(
    store: &S,
    me: &str,
    counterpart: &str,
) -> Result<Option<String>, StoreError> {
    let key = conversation_key(me, counterpart);
    if store.get(&DocPath::new(CHATS, &key)).await?.is_some() {
        return Ok(Some(key));
    }

    let mine = Query::collection(CHATS).filter("users", FilterOp::ArrayContains, me);
    let existing = store.query(&mine).await?.into_iter().find(|doc| {
        doc.get("users")
            .and_then(Value::as_array)
            .is_some_and(|users| users.iter().any(|u| u.as_str() == Some(counterpart)))
    });
    Ok(existing.map(|doc| doc.id))
}

/// Create the conversation or return the one that already exists.
/// Concurrent creators race on the same key, and the loser adopts it.
pub async fn create_conversation<S: DataStore>(
    store: &S,
    me: &str,
    counterpart: &str,
) -> Result<String, StoreError> {
    if let Some(id) = find_existing(store, me, counterpart).await? {
        debug!("Conversation already exists: {}", id);
        return Ok(id);
    }

    let key = conversation_key(me, counterpart);
    let create = Write::Create {
        path: DocPath::new(CHATS, &key),
        fields: Fields::new()
            .set("users", json!([me, counterpart]))
            .set("lastMessage", Value::Null)
            .server_timestamp("createdAt")
            .server_timestamp("lastMessageTime")
            .server_timestamp("updatedAt"),
    };

    match store.commit(vec![create]).await {
        Ok(()) => {
            info!("Created conversation {} between {} and {}", key, me, counterpart);
            Ok(key)
        }
        Err(StoreError::AlreadyExists(_)) => Ok(key),
        Err(e) => Err(e),
    }
}

/// Write a message and the conversation summary in one batch. Returns the
/// new message id.
pub async fn send_message<S: DataStore>(
    store: &S,
    conversation_id: &str,
    sender_id: &str,
    text: &str,
) -> Result<String, StoreError> {
    let message_id = Uuid::new_v4().simple().to_string();
    let writes = vec![
        Write::Create {
            path: DocPath::new(messages_collection(conversation_id), &message_id),
            fields: Fields::new()
                .set("senderId", sender_id)
                .set("text", text)
                .server_timestamp("timestamp")
                .set("read", false),
        },
        Write::Update {
            path: DocPath::new(CHATS, conversation_id),
            fields: Fields::new()
                .set("lastMessage", text)
                .server_timestamp("lastMessageTime")
                .server_timestamp("updatedAt"),
        },
    ];

    store.commit(writes).await?;
    debug!("Message {} sent in {}", message_id, conversation_id);
    Ok(message_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use hiiapp_db::Database;
    use hiiapp_gateway::LocalStore;
    use hiiapp_gateway::dispatcher::Dispatcher;
    use hiiapp_types::models::{Conversation, Message};

    fn store() -> LocalStore {
        LocalStore::new(Arc::new(Database::open_in_memory().unwrap()), Dispatcher::new())
    }

    async fn profile(store: &LocalStore, id: &str, email: &str) {
        DataStore::set_merge(store, &DocPath::new(USERS, id), Fields::new().set("email", email))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn search_prefers_exact_then_prefix() {
        let store = store();
        profile(&store, "u1", "yann@example.com").await;
        profile(&store, "u2", "y@example.com").await;

        let exact = find_identity_by_email(&store, "Y@Example.com").await.unwrap().unwrap();
        assert_eq!(exact.id, "u2");

        let prefix = find_identity_by_email(&store, "yan").await.unwrap().unwrap();
        assert_eq!(prefix.id, "u1");

        assert!(find_identity_by_email(&store, "nobody@").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn creation_is_idempotent_in_both_directions() {
        let store = store();
        let first = create_conversation(&store, "u1", "u2").await.unwrap();
        let second = create_conversation(&store, "u2", "u1").await.unwrap();
        assert_eq!(first, second);

        let all = DataStore::query(&store, &Query::collection(CHATS)).await.unwrap();
        assert_eq!(all.len(), 1);
        let chat: Conversation = all[0].decode().unwrap();
        assert_eq!(chat.users, vec!["u1", "u2"]);
        assert!(chat.last_message.is_none());
        assert!(chat.last_message_time.is_some());
    }

    #[tokio::test]
    async fn scan_finds_conversations_under_other_ids() {
        let store = store();
        DataStore::commit(
            &store,
            vec![Write::Create {
                path: DocPath::new(CHATS, "legacy"),
                fields: Fields::new().set("users", json!(["u2", "u1"])),
            }],
        )
        .await
        .unwrap();

        assert_eq!(find_existing(&store, "u1", "u2").await.unwrap().as_deref(), Some("legacy"));
        assert_eq!(create_conversation(&store, "u1", "u2").await.unwrap(), "legacy");
    }

    #[tokio::test]
    async fn send_updates_summary_atomically() {
        let store = store();
        let id = create_conversation(&store, "u1", "u2").await.unwrap();
        send_message(&store, &id, "u1", "hi").await.unwrap();

        let chat: Conversation = DataStore::get(&store, &DocPath::new(CHATS, &id))
            .await
            .unwrap()
            .unwrap()
            .decode()
            .unwrap();
        let messages = DataStore::query(&store, &Query::collection(messages_collection(&id)))
            .await
            .unwrap();
        let message: Message = messages[0].decode().unwrap();

        assert_eq!(chat.last_message.as_deref(), Some("hi"));
        assert_eq!(chat.last_message_time, Some(message.timestamp));
        assert_eq!(message.sender_id, "u1");
        assert!(!message.read);
    }

    #[tokio::test]
    async fn send_to_missing_conversation_writes_nothing() {
        let store = store();
        assert!(send_message(&store, "missing", "u1", "hi").await.is_err());
        let messages = DataStore::query(&store, &Query::collection(messages_collection("missing")))
            .await
            .unwrap();
        assert!(messages.is_empty());
    }
}
