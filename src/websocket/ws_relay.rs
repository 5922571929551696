//! Relay endpoint over a WebSocket connection.
//!
//! Connects lazily on first use, with a bounded handshake. Connect is
//! serialized per endpoint so two callers never open two sockets.
//! Subscriptions are kept locally and sent again whenever a new connection
//! comes up. Publish acknowledgements belong to the connection that carried
//! the event.

use crate::websocket::relay_message::{ClientMessage, RelayMessage};
use crate::*;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type Ack = (bool, String);

/// Publishes awaiting `OK` on one connection.
type AckTable = Mutex<HashMap<String, oneshot::Sender<Ack>>>;

#[derive(Default)]
struct Shared {
    subscriptions: Mutex<HashMap<String, (Filter, EventSink)>>,
}

impl Shared {
    fn dispatch(&self, url: &str, acks: &AckTable, text: &str) {
        match RelayMessage::from_json(text) {
            Ok(RelayMessage::Event { sub_id, event }) => {
                if let Ok(subscriptions) = self.subscriptions.lock() {
                    if let Some((_, sink)) = subscriptions.get(&sub_id) {
                        let _ = sink.send(event);
                    }
                }
            }
            Ok(RelayMessage::Ok {
                event_id,
                accepted,
                message,
            }) => {
                let ack = acks.lock().ok().and_then(|mut p| p.remove(&event_id));
                if let Some(ack) = ack {
                    let _ = ack.send((accepted, message));
                }
            }
            Ok(RelayMessage::Eose(sub_id)) => debug!("{url}: end of stored events for {sub_id}"),
            Ok(RelayMessage::Notice(message)) => info!("{url}: notice: {message}"),
            Ok(RelayMessage::Closed { sub_id, message }) => {
                warn!("{url}: relay closed {sub_id}: {message}");
                if let Ok(mut subscriptions) = self.subscriptions.lock() {
                    subscriptions.remove(&sub_id);
                }
            }
            Err(e) => debug!("{url}: ignoring frame: {e}"),
        }
    }
}

// Dropping the senders wakes every publisher still waiting on this connection.
fn fail_pending(acks: &AckTable) {
    if let Ok(mut pending) = acks.lock() {
        pending.clear();
    }
}

// Drops the pending acknowledgement when a publish is abandoned (e.g. timed out).
struct PendingAck<'a> {
    acks: &'a AckTable,
    event_id: &'a str,
}

impl Drop for PendingAck<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.acks.lock() {
            pending.remove(self.event_id);
        }
    }
}

#[derive(Clone)]
struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    acks: Arc<AckTable>,
    alive: Arc<AtomicBool>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

pub struct WsRelay {
    url: String,
    connect_timeout: Duration,
    connection: AsyncMutex<Option<Connection>>,
    shared: Arc<Shared>,
}

impl WsRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connection: AsyncMutex::new(None),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Bounds the TCP and WebSocket handshake.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// A live connection, and whether it was just opened.
    async fn outbound(&self) -> Result<(Connection, bool)> {
        let mut connection = self.connection.lock().await;
        if let Some(live) = connection.as_ref().filter(|c| c.is_alive()) {
            return Ok((live.clone(), false));
        }

        let handshake = connect_async(self.url.as_str());
        let (stream, _) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                ZapError::Network(format!(
                    "{}: no handshake within {}ms",
                    self.url,
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| ZapError::Network(format!("{}: {e}", self.url)))?;
        let (mut write, mut read) = stream.split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();
        let alive = Arc::new(AtomicBool::new(true));

        let writer_alive = alive.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                if let Err(e) = write.send(message).await {
                    warn!("{url}: write failed: {e}");
                    break;
                }
            }
            writer_alive.store(false, Ordering::SeqCst);
            let _ = write.close().await;
        });

        let acks = Arc::new(AckTable::default());
        let reader_alive = alive.clone();
        let reader_acks = acks.clone();
        let shared = self.shared.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => shared.dispatch(&url, &reader_acks, &text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("{url}: read failed: {e}");
                        break;
                    }
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
            fail_pending(&reader_acks);
            info!("disconnected from {url}");
        });

        let replay = {
            let subscriptions = self
                .shared
                .subscriptions
                .lock()
                .map_err(|_| ZapError::Network("subscription table poisoned".to_string()))?;
            subscriptions
                .iter()
                .map(|(sub_id, (filter, _))| ClientMessage::Req { sub_id, filter }.to_json())
                .collect::<Result<Vec<_>>>()?
        };
        for frame in replay {
            let _ = outbound.send(Message::Text(frame));
        }

        info!("connected to {}", self.url);
        let live = Connection {
            outbound,
            acks,
            alive,
        };
        *connection = Some(live.clone());
        Ok((live, true))
    }

    fn send(outbound: &mpsc::UnboundedSender<Message>, frame: String) -> Result<()> {
        outbound
            .send(Message::Text(frame))
            .map_err(|_| ZapError::Network("connection closed".to_string()))
    }
}

#[async_trait]
impl Relay for WsRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<()> {
        self.outbound().await.map(|_| ())
    }

    async fn publish(&self, event: &EventData) -> Result<()> {
        let (live, _) = self.outbound().await?;
        let (ack_tx, ack_rx) = oneshot::channel();
        live.acks
            .lock()
            .map_err(|_| ZapError::Network("ack table poisoned".to_string()))?
            .insert(event.id.clone(), ack_tx);
        let _guard = PendingAck {
            acks: &live.acks,
            event_id: &event.id,
        };

        debug!("{}: EVENT {}", self.url, event.id);
        Self::send(&live.outbound, ClientMessage::Event(event).to_json()?)?;
        match ack_rx.await {
            Ok((true, _)) => Ok(()),
            Ok((false, message)) => Err(ZapError::Rejected(message)),
            Err(_) => Err(ZapError::Network(
                "connection closed before acknowledgement".to_string(),
            )),
        }
    }

    async fn subscribe(&self, sub_id: &str, filter: &Filter, sink: EventSink) -> Result<()> {
        self.shared
            .subscriptions
            .lock()
            .map_err(|_| ZapError::Network("subscription table poisoned".to_string()))?
            .insert(sub_id.to_string(), (filter.clone(), sink));

        // If this fails the subscription stays queued and goes out on the next connect.
        let (live, fresh) = self.outbound().await?;
        if !fresh {
            debug!("{}: REQ {sub_id}", self.url);
            Self::send(&live.outbound, ClientMessage::Req { sub_id, filter }.to_json()?)?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, sub_id: &str) -> Result<()> {
        let removed = self
            .shared
            .subscriptions
            .lock()
            .map_err(|_| ZapError::Network("subscription table poisoned".to_string()))?
            .remove(sub_id);
        if removed.is_none() {
            return Ok(());
        }

        let connection = self.connection.lock().await;
        if let Some(live) = connection.as_ref().filter(|c| c.is_alive()) {
            debug!("{}: CLOSE {sub_id}", self.url);
            Self::send(&live.outbound, ClientMessage::Close(sub_id).to_json()?)?;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let mut connection = self.connection.lock().await;
        if let Some(live) = connection.take() {
            let _ = live.outbound.send(Message::Close(None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::rand::rngs::OsRng;
    use secp256k1::{KeyPair, Secp256k1};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    type Frames = mpsc::UnboundedReceiver<(usize, Value)>;

    fn signed_note() -> EventData {
        let key_pair = KeyPair::new(&Secp256k1::new(), &mut OsRng);
        create_event_sig(&key_pair, 1, vec![], "hello".to_string(), unix_now()).unwrap()
    }

    /// Local relay: answers `REQ` with `event` and `EVENT` with `OK true`.
    /// The first connection is closed right after its first acknowledgement.
    async fn serve(event: EventData) -> (String, Frames) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (frames_tx, frames) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut conn = 0;
            while let Ok((tcp, _)) = listener.accept().await {
                let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                    continue;
                };
                while let Some(Ok(message)) = ws.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    let _ = frames_tx.send((conn, frame.clone()));
                    match frame[0].as_str() {
                        Some("REQ") => {
                            let reply = json!(["EVENT", frame[1], event]).to_string();
                            let _ = ws.send(Message::Text(reply)).await;
                        }
                        Some("EVENT") => {
                            let reply = json!(["OK", frame[1]["id"], true, ""]).to_string();
                            let _ = ws.send(Message::Text(reply)).await;
                            if conn == 0 {
                                let _ = ws.close(None).await;
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                conn += 1;
            }
        });
        (url, frames)
    }

    async fn next_frame(frames: &mut Frames) -> (usize, Value) {
        tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unreachable_relay_fails_without_panicking() {
        let relay = WsRelay::new("ws://127.0.0.1:9");
        assert!(matches!(relay.connect().await, Err(ZapError::Network(_))));

        let (sink, _events) = mpsc::unbounded_channel();
        let filter = Filter::new().kind(KIND_ZAP_RECEIPT);
        assert!(relay.subscribe("zap-0", &filter, sink).await.is_err());
        assert!(relay.unsubscribe("zap-0").await.is_ok());
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        // Accepts TCP through the backlog but never answers the upgrade.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let relay = WsRelay::new(url).with_connect_timeout(Duration::from_millis(100));

        let connect = tokio::time::timeout(Duration::from_secs(2), relay.connect()).await;
        assert!(matches!(connect, Ok(Err(ZapError::Network(_)))));

        let (sink, _events) = mpsc::unbounded_channel();
        let filter = Filter::new().kind(KIND_ZAP_RECEIPT);
        let subscribe =
            tokio::time::timeout(Duration::from_secs(2), relay.subscribe("zap-0", &filter, sink))
                .await;
        assert!(matches!(subscribe, Ok(Err(ZapError::Network(_)))));
        drop(listener);
    }

    #[tokio::test]
    async fn test_relay_set_tolerates_unreachable_ws_endpoint() {
        let relays = RelaySet::new(
            vec![Arc::new(WsRelay::new("ws://127.0.0.1:9")) as Arc<dyn Relay>],
            Duration::from_millis(500),
        );
        relays.connect().await;
        let outcome = relays.publish(&signed_note()).await;
        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_frames_over_a_live_connection() {
        let note = signed_note();
        let (url, mut frames) = serve(note.clone()).await;
        let relay = Arc::new(WsRelay::new(url));
        let relays = RelaySet::new(vec![relay.clone() as Arc<dyn Relay>], Duration::from_secs(2));

        let mut subscription = relays.subscribe(Filter::new().kind(1)).await;
        let sub_id = subscription.handle().id().to_string();
        assert_eq!(
            next_frame(&mut frames).await,
            (0, json!(["REQ", sub_id, { "kinds": [1] }]))
        );
        let delivered = tokio::time::timeout(Duration::from_secs(2), subscription.next()).await;
        assert_eq!(delivered.unwrap(), Some(note.clone()));

        relay.publish(&note).await.unwrap();
        let (conn, frame) = next_frame(&mut frames).await;
        assert_eq!((conn, &frame[0]), (0, &json!("EVENT")));
        assert_eq!(frame[1]["id"], json!(note.id));

        // The server hangs up after the acknowledgement; the next call reconnects
        // and the open subscription is requested again.
        tokio::time::sleep(Duration::from_millis(200)).await;
        relay.connect().await.unwrap();
        assert_eq!(
            next_frame(&mut frames).await,
            (1, json!(["REQ", sub_id, { "kinds": [1] }]))
        );

        subscription.close().await;
        assert_eq!(next_frame(&mut frames).await, (1, json!(["CLOSE", sub_id])));
    }

    #[test]
    fn test_dispatch_routes_events_and_acks() {
        let shared = Shared::default();
        let acks = AckTable::default();
        let (sink, mut events) = mpsc::unbounded_channel();
        shared
            .subscriptions
            .lock()
            .unwrap()
            .insert("zap-1".to_string(), (Filter::new(), sink));
        let (ack_tx, mut ack_rx) = oneshot::channel();
        acks.lock().unwrap().insert("abc".to_string(), ack_tx);

        shared.dispatch(
            "wss://test",
            &acks,
            r#"["EVENT","zap-1",{"id":"aa","pubkey":"bb","created_at":1,"kind":1,"tags":[],"content":"","sig":"cc"}]"#,
        );
        shared.dispatch("wss://test", &acks, r#"["OK","abc",false,"blocked: spam"]"#);
        shared.dispatch("wss://test", &acks, r#"["CLOSED","zap-1","bye"]"#);

        assert_eq!(events.try_recv().unwrap().id, "aa");
        assert_eq!(ack_rx.try_recv().unwrap(), (false, "blocked: spam".to_string()));
        assert!(shared.subscriptions.lock().unwrap().is_empty());
    }

    #[test]
    fn test_old_connection_does_not_fail_new_acks() {
        let old_acks = AckTable::default();
        let new_acks = AckTable::default();
        let (stale_tx, mut stale_rx) = oneshot::channel::<Ack>();
        let (live_tx, mut live_rx) = oneshot::channel();
        old_acks.lock().unwrap().insert("aa".to_string(), stale_tx);
        new_acks.lock().unwrap().insert("bb".to_string(), live_tx);

        fail_pending(&old_acks);
        assert!(stale_rx.try_recv().is_err());

        Shared::default().dispatch("wss://test", &new_acks, r#"["OK","bb",true,""]"#);
        assert_eq!(live_rx.try_recv().unwrap(), (true, String::new()));
    }
}
