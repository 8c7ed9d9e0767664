use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

use futures_util::Stream;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::types::StoredMessage;

/// Registry of live viewer connections. Injected through `AppState` so the
/// fan-out path can be exercised with fake connections; delivery is
/// at-most-once and best-effort, with no queueing or replay for viewers that
/// were not connected at broadcast time.
#[derive(Default)]
pub struct Broadcaster {
    clients: Mutex<HashMap<usize, mpsc::UnboundedSender<String>>>,
    next_client_id: AtomicUsize,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a raw connection and returns its id plus the receiving end.
    /// Callers that do not go through [`Broadcaster::viewer`] are responsible
    /// for calling [`Broadcaster::unregister`] themselves; a closed receiver
    /// is also pruned on the next failed write.
    pub fn subscribe(&self) -> (usize, mpsc::UnboundedReceiver<String>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(client_id, tx);
        }
        (client_id, rx)
    }

    /// Registers a viewer stream that unregisters itself when the transport
    /// closes and the stream is dropped.
    pub fn viewer(self: &Arc<Self>) -> Viewer {
        let (client_id, rx) = self.subscribe();
        Viewer {
            client_id,
            rx,
            broadcaster: Arc::clone(self),
        }
    }

    pub fn unregister(&self, client_id: usize) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.remove(&client_id);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Writes the payload to every registered connection. A failed write
    /// never blocks delivery to the others; the dead connection is removed.
    pub fn broadcast_payload(&self, payload: &str) {
        let Ok(mut clients) = self.clients.lock() else {
            return;
        };
        let stale = clients
            .iter()
            .filter(|(_, tx)| tx.send(payload.to_string()).is_err())
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for client_id in stale {
            clients.remove(&client_id);
        }
    }

    /// Pushes a `new_message` envelope to every live viewer.
    pub fn broadcast_new_message(&self, message: &StoredMessage) {
        if let Some(payload) = event_payload("new_message", message) {
            self.broadcast_payload(&payload);
        }
    }
}

fn event_payload<T: Serialize>(event_type: &str, message: T) -> Option<String> {
    serde_json::to_string(&json!({ "type": event_type, "message": message })).ok()
}

/// One live viewer connection, registered for the lifetime of the stream.
pub struct Viewer {
    client_id: usize,
    rx: mpsc::UnboundedReceiver<String>,
    broadcaster: Arc<Broadcaster>,
}

impl Stream for Viewer {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.broadcaster.unregister(self.client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn sample_message(id: &str) -> StoredMessage {
        StoredMessage {
            id: id.to_string(),
            channel_id: "c1".to_string(),
            channel_name: "Main".to_string(),
            user_id: "U123".to_string(),
            user_name: "Visitor".to_string(),
            text: "hello".to_string(),
            message_type: "text".to_string(),
            image_url: None,
            sticker_package_id: None,
            sticker_id: None,
            timestamp: 1_700_000_000_000,
            direction: "received".to_string(),
            is_read: false,
            is_auto_reply: false,
        }
    }

    #[test]
    fn every_registered_viewer_receives_exactly_one_copy() {
        let broadcaster = Broadcaster::new();
        let mut receivers = (0..5).map(|_| broadcaster.subscribe().1).collect::<Vec<_>>();

        broadcaster.broadcast_new_message(&sample_message("m1"));

        for rx in &mut receivers {
            let payload = rx.try_recv().expect("viewer missed the broadcast");
            let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
            assert_eq!(value["type"], "new_message");
            assert_eq!(value["message"]["id"], "m1");
            assert!(rx.try_recv().is_err(), "viewer received a duplicate");
        }
    }

    #[test]
    fn dead_connection_does_not_block_the_others() {
        let broadcaster = Broadcaster::new();
        let (_id_a, mut rx_a) = broadcaster.subscribe();
        let (_id_b, rx_b) = broadcaster.subscribe();
        let (_id_c, mut rx_c) = broadcaster.subscribe();
        drop(rx_b);

        broadcaster.broadcast_new_message(&sample_message("m2"));

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
        // the failed write pruned the dead registration
        assert_eq!(broadcaster.client_count(), 2);
    }

    #[tokio::test]
    async fn viewer_stream_delivers_and_unregisters_on_drop() {
        let broadcaster = Arc::new(Broadcaster::new());
        let mut viewer = broadcaster.viewer();
        assert_eq!(broadcaster.client_count(), 1);

        broadcaster.broadcast_new_message(&sample_message("m3"));
        let payload = viewer.next().await.expect("stream ended early");
        assert!(payload.contains("\"m3\""));

        drop(viewer);
        assert_eq!(broadcaster.client_count(), 0);
    }

    #[test]
    fn broadcast_with_no_viewers_is_a_no_op() {
        let broadcaster = Broadcaster::new();
        broadcaster.broadcast_new_message(&sample_message("m4"));
        assert_eq!(broadcaster.client_count(), 0);
    }
}
