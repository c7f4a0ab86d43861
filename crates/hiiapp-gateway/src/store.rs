use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use hiiapp_db::Database;
use hiiapp_db::documents::CommitResult;
use hiiapp_types::error::StoreError;
use hiiapp_types::events::ChangeEvent;
use hiiapp_types::store::{DocPath, Document, Fields, Query, Snapshot, Write};
use hiiapp_types::subscription::{SUBSCRIPTION_BUFFER, Subscription};

use crate::dispatcher::Dispatcher;

/// Item type of a snapshot subscription.
pub type SnapshotResult = Result<Snapshot, StoreError>;

/// The embedded document store: SQLite for persistence, the dispatcher for
/// realtime fan-out.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl LocalStore {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        let db = self.db.clone();
        let path = path.clone();
        run_blocking(move || db.get_document(&path)).await
    }

    pub async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let db = self.db.clone();
        let query = query.clone();
        run_blocking(move || db.query_documents(&query)).await
    }

    /// Apply a batch atomically, then notify subscribers of the touched
    /// collections.
    pub async fn commit(&self, writes: Vec<Write>) -> Result<CommitResult, StoreError> {
        let db = self.db.clone();
        let result = run_blocking(move || db.commit(&writes)).await?;

        self.dispatcher.broadcast(ChangeEvent {
            collections: result.collections.clone(),
            update_time: result.update_time,
        });
        Ok(result)
    }

    pub async fn set_merge(&self, path: &DocPath, fields: Fields) -> Result<CommitResult, StoreError> {
        self.commit(vec![Write::Set {
            path: path.clone(),
            fields,
            merge: true,
        }])
        .await
    }

    /// Live query. The first item is the current result set; later items
    /// are sent whenever a commit to the collection changes the result.
    pub fn subscribe(&self, query: Query) -> Subscription<SnapshotResult> {
        // Subscribe before the initial read so no commit slips in between.
        let changes = self.dispatcher.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let producer = tokio::spawn(run_listener(self.clone(), query, changes, tx));
        Subscription::new(rx, &producer)
    }
}

async fn run_listener(
    store: LocalStore,
    query: Query,
    mut changes: broadcast::Receiver<ChangeEvent>,
    tx: mpsc::Sender<SnapshotResult>,
) {
    debug!("Listener started for {}", query.collection);
    let mut last: Option<Vec<Document>> = None;

    loop {
        match store.query(&query).await {
            Ok(documents) => {
                if last.as_ref() != Some(&documents) {
                    last = Some(documents.clone());
                    if tx.send(Ok(Snapshot { documents })).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                error!("Listener query on {} failed: {}", query.collection, e);
                let _ = tx.send(Err(e)).await;
                break;
            }
        }

        // Wait for a change that touches this collection
        loop {
            match changes.recv().await {
                Ok(event) if event.touches(&query.collection) => break,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Listener on {} lagged by {} events, re-reading", query.collection, n);
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Dispatcher closed, listener on {} ends", query.collection);
                    return;
                }
            }
        }
    }

    debug!("Listener for {} stopped", query.collection);
}

/// Run blocking DB work off the async runtime.
async fn run_blocking<F, T>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> hiiapp_db::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StoreError::Internal(e.to_string())
        })?
        .map_err(StoreError::from)
}
