use thiserror::Error;

use hiiapp_types::error::{AuthError, StoreError};

/// Failures surfaced by the client components. `Display` is the message
/// shown to the user; the underlying cause is kept as the source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("{}", .0.user_message())]
    Auth(#[from] AuthError),

    #[error("Not signed in")]
    NotSignedIn,
    #[error("Failed to update user profile")]
    ProfileFailed(#[source] StoreError),

    // -- Directory --
    #[error("User not found")]
    UserNotFound,
    #[error("Cannot chat with yourself")]
    SelfConversation,
    #[error("Failed to search user")]
    SearchFailed(#[source] StoreError),
    #[error("Failed to create chat")]
    CreateFailed(#[source] StoreError),
    #[error("Failed to load chats")]
    LoadChatsFailed(#[source] StoreError),

    // -- Thread --
    #[error("Chat not available")]
    ConversationUnavailable,
    #[error("Chat not found")]
    ConversationNotFound,
    #[error("Chat participant not found")]
    ParticipantNotFound,
    #[error("Failed to load chat details")]
    DetailsFailed(#[source] StoreError),
    #[error("Failed to load messages")]
    MessagesFailed(#[source] StoreError),
    #[error("Failed to send message")]
    SendFailed(#[source] StoreError),
}

impl ClientError {
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}
