use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use hiiapp_types::api::ErrorBody;
use hiiapp_types::events::SubscriptionFrame;
use hiiapp_types::store::Query;

use crate::store::LocalStore;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a client has to send its query after the upgrade.
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve one live query over a pre-authenticated WebSocket.
///
/// The session token was validated at the HTTP upgrade. The first text frame
/// carries the [`Query`]; every later frame from the server is a
/// [`SubscriptionFrame`].
pub async fn handle_subscription(socket: WebSocket, store: LocalStore, uid: String) {
    let (mut sender, mut receiver) = socket.split();

    let query = match wait_for_query(&mut receiver).await {
        Ok(query) => query,
        Err(message) => {
            warn!("{} sent no usable query: {}", uid, message);
            let frame = SubscriptionFrame::Error(ErrorBody {
                code: "invalid-argument".into(),
                message,
            });
            let _ = send_frame(&mut sender, &frame).await;
            return;
        }
    };

    info!("{} subscribed to {}", uid, query.collection);
    run_subscription_loop(sender, receiver, store, query, &uid).await;
    info!("{} unsubscribed", uid);
}

async fn wait_for_query(receiver: &mut SplitStream<WebSocket>) -> Result<Query, String> {
    let first = tokio::time::timeout(QUERY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                return Some(text);
            }
        }
        None
    })
    .await;

    match first {
        Ok(Some(text)) => serde_json::from_str::<Query>(&text).map_err(|e| e.to_string()),
        Ok(None) => Err("connection closed before query".into()),
        Err(_) => Err("timed out waiting for query".into()),
    }
}

async fn run_subscription_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    store: LocalStore,
    query: Query,
    uid: &str,
) {
    let mut subscription = store.subscribe(query);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                item = subscription.next() => {
                    let frame = match item {
                        Some(Ok(snapshot)) => SubscriptionFrame::Snapshot(snapshot),
                        Some(Err(e)) => SubscriptionFrame::Error(ErrorBody {
                            code: e.code().to_string(),
                            message: e.to_string(),
                        }),
                        None => break,
                    };
                    let terminal = matches!(frame, SubscriptionFrame::Error(_));
                    if send_frame(&mut sender, &frame).await.is_err() || terminal {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping subscription", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sender.close().await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Pong(_) => pong_flag_recv.store(true, Ordering::Release),
                Message::Close(_) => break,
                // The query is fixed for the life of the socket
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!("Subscription loop for {} finished", uid);
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &SubscriptionFrame,
) -> Result<(), ()> {
    let text = serde_json::to_string(frame).map_err(|e| warn!("Frame encode failed: {}", e))?;
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}
