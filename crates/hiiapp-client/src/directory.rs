use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use hiiapp_types::models::{CHATS, Conversation, Identity};
use hiiapp_types::store::{Direction, FilterOp, Query};
use hiiapp_types::subscription::Subscription;

use crate::backend::DataStore;
use crate::chat;
use crate::error::ClientError;

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub id: String,
    pub counterpart_id: Option<String>,
    /// "Chat with {counterpart id}".
    pub title: String,
    /// Last message text, or "No messages yet".
    pub preview: String,
    /// Upper-cased first letter of the last message, or `C`.
    pub avatar: char,
    pub last_message_time: Option<DateTime<Utc>>,
}

impl ConversationSummary {
    pub fn new(conversation: &Conversation, me: &str) -> Self {
        let counterpart_id = conversation.counterpart(me).map(str::to_string);
        let last_message = conversation.last_message.as_deref().filter(|m| !m.is_empty());
        Self {
            id: conversation.id.clone(),
            title: format!("Chat with {}", counterpart_id.as_deref().unwrap_or_default()),
            counterpart_id,
            preview: last_message.unwrap_or("No messages yet").to_string(),
            avatar: last_message
                .and_then(|m| m.chars().next())
                .and_then(|c| c.to_uppercase().next())
                .unwrap_or('C'),
            last_message_time: conversation.last_message_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryView {
    /// True until the first snapshot or failure.
    pub loading: bool,
    /// Most recent activity first.
    pub conversations: Vec<ConversationSummary>,
    pub error: Option<String>,
}

impl Default for DirectoryView {
    fn default() -> Self {
        Self {
            loading: true,
            conversations: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    /// A conversation with this identity does not exist yet.
    Found(Identity),
    /// Id of the conversation that already exists with the match.
    Existing(String),
}

/// The signed-in identity's conversations, kept current by a subscription
/// that lives as long as the directory.
pub struct ConversationDirectory<S: DataStore> {
    store: S,
    me: String,
    view: watch::Sender<DirectoryView>,
    listener: JoinHandle<()>,
}

impl<S: DataStore> ConversationDirectory<S> {
    pub fn open(store: S, me: impl Into<String>) -> Self {
        let me = me.into();
        let (view, _) = watch::channel(DirectoryView::default());

        info!("Setting up conversation listener for {}", me);
        let query = Query::collection(CHATS)
            .filter("users", FilterOp::ArrayContains, me.clone())
            .order_by("lastMessageTime", Direction::Desc);
        let subscription = store.subscribe(query);
        let listener = tokio::spawn(run_listener(subscription, view.clone(), me.clone()));

        Self {
            store,
            me,
            view,
            listener,
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn view(&self) -> DirectoryView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<DirectoryView> {
        self.view.subscribe()
    }

    pub fn changes(&self) -> Subscription<DirectoryView> {
        Subscription::from_watch(self.view.subscribe())
    }

    /// Look up a counterpart by address. Blank input is ignored.
    pub async fn search(&self, address: &str) -> Result<Option<SearchOutcome>, ClientError> {
        if address.trim().is_empty() {
            return Ok(None);
        }
        debug!("Searching for user with email {}", address);

        let identity = chat::find_identity_by_email(&self.store, address)
            .await
            .map_err(|e| {
                error!("Error searching user: {}", e);
                ClientError::SearchFailed(e)
            })?
            .ok_or(ClientError::UserNotFound)?;

        if identity.id == self.me {
            return Err(ClientError::SelfConversation);
        }

        let existing = chat::find_existing(&self.store, &self.me, &identity.id)
            .await
            .map_err(ClientError::SearchFailed)?;
        Ok(Some(match existing {
            Some(id) => SearchOutcome::Existing(id),
            None => SearchOutcome::Found(identity),
        }))
    }

    /// Create the conversation with `counterpart`, or return the existing one.
    pub async fn start_conversation(&self, counterpart: &str) -> Result<String, ClientError> {
        if counterpart == self.me {
            return Err(ClientError::SelfConversation);
        }
        chat::create_conversation(&self.store, &self.me, counterpart)
            .await
            .map_err(|e| {
                error!("Error creating chat: {}", e);
                ClientError::CreateFailed(e)
            })
    }
}

impl<S: DataStore> Drop for ConversationDirectory<S> {
    fn drop(&mut self) {
        debug!("Cleaning up conversation listener for {}", self.me);
        self.listener.abort();
    }
}

async fn run_listener(
    mut subscription: Subscription<crate::backend::SnapshotItem>,
    view: watch::Sender<DirectoryView>,
    me: String,
) {
    while let Some(item) = subscription.next().await {
        let conversations = item.and_then(|snapshot| snapshot.decode_all::<Conversation>());
        match conversations {
            Ok(conversations) => {
                debug!("Conversations updated: {}", conversations.len());
                let summaries = conversations
                    .iter()
                    .map(|c| ConversationSummary::new(c, &me))
                    .collect();
                view.send_modify(|v| {
                    v.loading = false;
                    v.conversations = summaries;
                });
            }
            Err(e) => {
                error!("Error fetching chats: {}", e);
                let message = ClientError::LoadChatsFailed(e).to_string();
                view.send_modify(|v| {
                    v.loading = false;
                    v.error = Some(message);
                });
                break;
            }
        }
    }
}
