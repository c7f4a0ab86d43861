use serde::{Deserialize, Serialize};

use crate::api::ErrorBody;
use crate::store::Snapshot;

/// Emitted after every committed batch.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Collections touched by the batch.
    pub collections: Vec<String>,
    /// Commit timestamp in epoch microseconds.
    pub update_time: i64,
}

impl ChangeEvent {
    pub fn touches(&self, collection: &str) -> bool {
        self.collections.iter().any(|c| c == collection)
    }
}

/// Frames sent FROM server TO client on a subscription socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SubscriptionFrame {
    /// Full, ordered result set of the subscribed query
    Snapshot(Snapshot),

    /// The subscription failed; no further frames follow
    Error(ErrorBody),
}
