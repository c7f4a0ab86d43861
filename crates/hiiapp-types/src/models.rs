use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Collection holding one profile document per identity.
pub const USERS: &str = "users";

/// Collection holding one document per two-party conversation.
pub const CHATS: &str = "chats";

/// Message sub-collection of a conversation.
pub fn messages_collection(conversation_id: &str) -> String {
    format!("{}/{}/messages", CHATS, conversation_id)
}

/// Profile mirrored into the `users` collection on every sign-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, rename = "photoURL")]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default, with = "chrono::serde::ts_microseconds_option")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_microseconds_option")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn display_name_or_unknown(&self) -> &str {
        self.display_name.as_deref().unwrap_or("Unknown User")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub users: Vec<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default, with = "chrono::serde::ts_microseconds_option")]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_microseconds_option")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_microseconds_option")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn contains(&self, user_id: &str) -> bool {
        self.users.iter().any(|u| u == user_id)
    }

    /// The participant that is not `me`, if the record has one.
    pub fn counterpart(&self, me: &str) -> Option<&str> {
        self.users.iter().map(String::as_str).find(|u| *u != me)
    }
}

/// Messages are immutable once committed. `read` is written as false and
/// never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

/// Deterministic conversation id for an unordered pair of identities.
///
/// Both participants derive the same key regardless of who starts the
/// conversation, which turns creation into an idempotent keyed insert.
pub fn conversation_key(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(lo.as_bytes());
    hasher.update([0u8]);
    hasher.update(hi.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}
