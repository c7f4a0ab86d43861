use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use hiiapp_types::models::{CHATS, Conversation, Identity, Message, USERS, messages_collection};
use hiiapp_types::store::{DocPath, Direction, Query};
use hiiapp_types::subscription::Subscription;

use crate::backend::{DataStore, SnapshotItem};
use crate::chat;
use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadStatus {
    Loading,
    Ready,
    /// Terminal for this thread.
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageView {
    pub id: String,
    pub sender_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// `HH:MM` in local time.
    pub time_label: String,
    pub is_own: bool,
}

impl MessageView {
    fn new(message: Message, me: &str) -> Self {
        Self {
            is_own: message.sender_id == me,
            time_label: time_label(message.timestamp),
            id: message.id,
            sender_id: message.sender_id,
            text: message.text,
            timestamp: message.timestamp,
        }
    }
}

pub fn time_label(timestamp: DateTime<Utc>) -> String {
    timestamp.with_timezone(&Local).format("%H:%M").to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadView {
    pub status: ThreadStatus,
    /// Counterpart display name, "Unknown User" when the profile has none.
    pub counterpart_name: Option<String>,
    /// Oldest first.
    pub messages: Vec<MessageView>,
    /// Last failed send. Does not change `status`.
    pub send_error: Option<String>,
    details_loaded: bool,
    messages_loaded: bool,
}

impl ThreadView {
    fn loading() -> Self {
        Self {
            status: ThreadStatus::Loading,
            counterpart_name: None,
            messages: Vec::new(),
            send_error: None,
            details_loaded: false,
            messages_loaded: false,
        }
    }

    fn fail(&mut self, err: &ClientError) {
        if !self.is_failed() {
            self.status = ThreadStatus::Error(err.to_string());
        }
    }

    fn settle(&mut self) {
        if self.status == ThreadStatus::Loading && self.details_loaded && self.messages_loaded {
            self.status = ThreadStatus::Ready;
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, ThreadStatus::Error(_))
    }
}

/// One open conversation: its counterpart, its live message list and the
/// draft being composed. Dropping the thread unmounts it.
pub struct ConversationThread<S: DataStore> {
    store: S,
    conversation_id: String,
    me: String,
    view: watch::Sender<ThreadView>,
    mounted: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
    draft: Mutex<String>,
}

impl<S: DataStore> ConversationThread<S> {
    pub fn open(store: S, conversation_id: impl Into<String>, me: impl Into<String>) -> Self {
        let conversation_id = conversation_id.into();
        let me = me.into();
        let (view, _) = watch::channel(ThreadView::loading());
        let mounted = Arc::new(AtomicBool::new(true));

        let mut thread = Self {
            store,
            conversation_id,
            me,
            view,
            mounted,
            listener: None,
            draft: Mutex::new(String::new()),
        };

        if thread.conversation_id.is_empty() || thread.me.is_empty() {
            debug!("Missing conversation id or identity");
            thread.view.send_modify(|v| v.fail(&ClientError::ConversationUnavailable));
            return thread;
        }

        info!("Opening conversation {}", thread.conversation_id);

        // The detail fetch is never cancelled; its result is dropped once
        // the thread is unmounted.
        tokio::spawn(load_details(
            thread.store.clone(),
            thread.conversation_id.clone(),
            thread.me.clone(),
            thread.view.clone(),
            thread.mounted.clone(),
        ));

        let query = Query::collection(messages_collection(&thread.conversation_id))
            .order_by("timestamp", Direction::Asc);
        let subscription = thread.store.subscribe(query);
        thread.listener = Some(tokio::spawn(run_listener(
            subscription,
            thread.view.clone(),
            thread.mounted.clone(),
            thread.me.clone(),
        )));

        thread
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn view(&self) -> ThreadView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ThreadView> {
        self.view.subscribe()
    }

    pub fn changes(&self) -> Subscription<ThreadView> {
        Subscription::from_watch(self.view.subscribe())
    }

    /// Send `text` as a new message. Whitespace-only input is ignored and
    /// returns `Ok(None)`; otherwise the new message id is returned.
    pub async fn send(&self, text: &str) -> Result<Option<String>, ClientError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        if self.view.borrow().is_failed() {
            return Err(ClientError::ConversationUnavailable);
        }

        debug!("Sending message in {} from {}", self.conversation_id, self.me);
        match chat::send_message(&self.store, &self.conversation_id, &self.me, text).await {
            Ok(id) => {
                self.view.send_if_modified(|v| v.send_error.take().is_some());
                Ok(Some(id))
            }
            Err(e) => {
                error!("Error sending message: {}", e);
                let err = ClientError::SendFailed(e);
                let message = err.to_string();
                self.view.send_modify(|v| v.send_error = Some(message));
                Err(err)
            }
        }
    }

    pub fn draft(&self) -> String {
        self.draft.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        if let Ok(mut draft) = self.draft.lock() {
            *draft = text.into();
        }
    }

    /// Send the draft. It is cleared only when the send succeeds.
    pub async fn send_draft(&self) -> Result<Option<String>, ClientError> {
        let text = self.draft();
        let sent = self.send(&text).await?;
        if sent.is_some() {
            self.set_draft(String::new());
        }
        Ok(sent)
    }
}

impl<S: DataStore> Drop for ConversationThread<S> {
    fn drop(&mut self) {
        debug!("Closing conversation {}", self.conversation_id);
        self.mounted.store(false, Ordering::Release);
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

async fn fetch_counterpart_name<S: DataStore>(
    store: &S,
    conversation_id: &str,
    me: &str,
) -> Result<String, ClientError> {
    let conversation: Conversation = store
        .get(&DocPath::new(CHATS, conversation_id))
        .await
        .map_err(ClientError::DetailsFailed)?
        .ok_or(ClientError::ConversationNotFound)?
        .decode()
        .map_err(ClientError::DetailsFailed)?;

    let counterpart = conversation
        .counterpart(me)
        .ok_or(ClientError::ParticipantNotFound)?;

    let identity: Identity = store
        .get(&DocPath::new(USERS, counterpart))
        .await
        .map_err(ClientError::DetailsFailed)?
        .ok_or(ClientError::UserNotFound)?
        .decode()
        .map_err(ClientError::DetailsFailed)?;

    Ok(identity.display_name_or_unknown().to_string())
}

async fn load_details<S: DataStore>(
    store: S,
    conversation_id: String,
    me: String,
    view: watch::Sender<ThreadView>,
    mounted: Arc<AtomicBool>,
) {
    let result = fetch_counterpart_name(&store, &conversation_id, &me).await;
    if !mounted.load(Ordering::Acquire) {
        return;
    }
    match result {
        Ok(name) => view.send_modify(|v| {
            if v.is_failed() {
                return;
            }
            v.counterpart_name = Some(name);
            v.details_loaded = true;
            v.settle();
        }),
        Err(e) => {
            error!("Error fetching details of {}: {}", conversation_id, e);
            view.send_modify(|v| v.fail(&e));
        }
    }
}

async fn run_listener(
    mut subscription: Subscription<SnapshotItem>,
    view: watch::Sender<ThreadView>,
    mounted: Arc<AtomicBool>,
    me: String,
) {
    while let Some(item) = subscription.next().await {
        if !mounted.load(Ordering::Acquire) {
            break;
        }
        match item.and_then(|snapshot| snapshot.decode_all::<Message>()) {
            Ok(messages) => {
                debug!("Received messages update: {} messages", messages.len());
                let messages = messages.into_iter().map(|m| MessageView::new(m, &me)).collect();
                view.send_modify(|v| {
                    if v.is_failed() {
                        return;
                    }
                    v.messages = messages;
                    v.messages_loaded = true;
                    v.settle();
                });
            }
            Err(e) => {
                error!("Error listening to messages: {}", e);
                view.send_modify(|v| v.fail(&ClientError::MessagesFailed(e)));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Semaphore;

    use hiiapp_db::Database;
    use hiiapp_gateway::LocalStore;
    use hiiapp_gateway::dispatcher::Dispatcher;
    use hiiapp_types::error::StoreError;
    use hiiapp_types::store::{Document, Fields, Write};

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    /// Holds every `get` until the gate has permits.
    #[derive(Clone)]
    struct Gated {
        store: LocalStore,
        gate: Arc<Semaphore>,
    }

    impl DataStore for Gated {
        async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            DataStore::get(&self.store, path).await
        }

        async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
            DataStore::query(&self.store, query).await
        }

        async fn set_merge(&self, path: &DocPath, fields: Fields) -> Result<(), StoreError> {
            DataStore::set_merge(&self.store, path, fields).await
        }

        async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
            DataStore::commit(&self.store, writes).await
        }

        fn subscribe(&self, query: Query) -> Subscription<SnapshotItem> {
            DataStore::subscribe(&self.store, query)
        }
    }

    #[tokio::test]
    async fn unmount_discards_pending_details() {
        let store = LocalStore::new(Arc::new(Database::open_in_memory().unwrap()), Dispatcher::new());
        store
            .set_merge(&DocPath::new(USERS, "u2"), Fields::new().set("displayName", "Yuki"))
            .await
            .unwrap();
        let id = chat::create_conversation(&store, "u1", "u2").await.unwrap();

        let gate = Arc::new(Semaphore::new(0));
        let thread = ConversationThread::open(
            Gated {
                store: store.clone(),
                gate: gate.clone(),
            },
            &id,
            "u1",
        );
        assert_eq!(store.dispatcher().listener_count(), 1);

        // Messages arrive while the detail fetch is still held
        let mut rx = thread.watch();
        tokio::time::timeout(WAIT, rx.wait_for(|v| v.messages_loaded))
            .await
            .unwrap()
            .unwrap();
        rx.borrow_and_update();
        drop(thread);

        tokio::time::timeout(WAIT, async {
            while store.dispatcher().listener_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // The fetch completes and its sender goes away without publishing
        gate.add_permits(2);
        let changed = tokio::time::timeout(WAIT, rx.changed()).await.unwrap();
        assert!(changed.is_err());
        let view = rx.borrow();
        assert_eq!(view.status, ThreadStatus::Loading);
        assert_eq!(view.counterpart_name, None);
    }

    #[test]
    fn ready_needs_both_halves() {
        let mut view = ThreadView::loading();
        view.details_loaded = true;
        view.settle();
        assert_eq!(view.status, ThreadStatus::Loading);
        view.messages_loaded = true;
        view.settle();
        assert_eq!(view.status, ThreadStatus::Ready);
    }

    #[test]
    fn first_error_is_terminal() {
        let mut view = ThreadView::loading();
        view.fail(&ClientError::ConversationNotFound);
        view.fail(&ClientError::UserNotFound);
        view.details_loaded = true;
        view.messages_loaded = true;
        view.settle();
        assert_eq!(view.status, ThreadStatus::Error("Chat not found".into()));
    }

    #[test]
    fn labels_are_hours_and_minutes() {
        let label = time_label(Utc::now());
        assert_eq!(label.len(), 5);
        assert_eq!(&label[2..3], ":");
    }
}
