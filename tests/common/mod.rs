//! In-process test relay.
//!
//! A minimal stand-in for the Robofleet relay server: accepts WebSocket
//! connections, records every inbound frame (binary envelopes and text
//! auth frames), and can broadcast frames to all connected clients. It
//! performs no server-side topic filtering — tests drive client-side
//! dispatch directly.
//!
//! `stop()` frees the listening port so a fresh relay can be started on
//! the same address, which is how the reconnect tests simulate a relay
//! bounce.

#![allow(dead_code)]

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use robofleet_link::{FramedCodec, SubscriptionAction};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

pub struct TestRelay {
    addr: SocketAddr,
    accept_handle: JoinHandle<()>,
    client_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    clients: Arc<Mutex<Vec<mpsc::UnboundedSender<Message>>>>,
    binary_frames: Arc<Mutex<Vec<Bytes>>>,
    text_frames: Arc<Mutex<Vec<String>>>,
}

impl TestRelay {
    /// Start a relay on an ephemeral port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind test relay");
        Self::with_listener(listener)
    }

    /// Start a relay on a specific address, retrying briefly while the
    /// previous listener's port is released.
    pub async fn start_on(addr: SocketAddr) -> Self {
        for _ in 0..50 {
            match TcpListener::bind(addr).await {
                Ok(listener) => return Self::with_listener(listener),
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        panic!("could not rebind test relay on {}", addr);
    }

    fn with_listener(listener: TcpListener) -> Self {
        let addr = listener.local_addr().expect("relay local addr");
        let client_handles = Arc::new(Mutex::new(Vec::new()));
        let clients = Arc::new(Mutex::new(Vec::new()));
        let binary_frames = Arc::new(Mutex::new(Vec::new()));
        let text_frames = Arc::new(Mutex::new(Vec::new()));

        let handles = client_handles.clone();
        let clients_accept = clients.clone();
        let binary_accept = binary_frames.clone();
        let text_accept = text_frames.clone();

        let accept_handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let ws = match accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => continue,
                };

                let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
                clients_accept.lock().unwrap().push(outbound_tx);

                let binary = binary_accept.clone();
                let text = text_accept.clone();
                let handle = tokio::spawn(async move {
                    let (mut sink, mut source) = ws.split();
                    loop {
                        tokio::select! {
                            inbound = source.next() => {
                                match inbound {
                                    Some(Ok(Message::Binary(data))) => {
                                        binary.lock().unwrap().push(data);
                                    }
                                    Some(Ok(Message::Text(data))) => {
                                        text.lock().unwrap().push(data.to_string());
                                    }
                                    Some(Ok(Message::Ping(payload))) => {
                                        let _ = sink.send(Message::Pong(payload)).await;
                                    }
                                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                    Some(Ok(_)) => {}
                                }
                            }
                            outbound = outbound_rx.recv() => {
                                match outbound {
                                    Some(msg) => {
                                        if sink.send(msg).await.is_err() {
                                            break;
                                        }
                                    }
                                    None => break,
                                }
                            }
                        }
                    }
                });
                handles.lock().unwrap().push(handle);
            }
        });

        Self {
            addr,
            accept_handle,
            client_handles,
            clients,
            binary_frames,
            text_frames,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Kill the listener and every live client connection, freeing the
    /// port. Connected clients observe a dropped socket.
    pub async fn stop(self) {
        self.accept_handle.abort();
        let _ = self.accept_handle.await;
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.client_handles.lock().unwrap());
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Number of currently reachable client connections.
    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Send a frame to every connected client.
    pub fn broadcast(&self, frame: Bytes) {
        let clients = self.clients.lock().unwrap();
        for tx in clients.iter() {
            let _ = tx.send(Message::Binary(frame.clone()));
        }
    }

    /// All binary frames received so far, in arrival order.
    pub fn binary_frames(&self) -> Vec<Bytes> {
        self.binary_frames.lock().unwrap().clone()
    }

    /// All text frames (auth messages) received so far.
    pub fn text_frames(&self) -> Vec<String> {
        self.text_frames.lock().unwrap().clone()
    }

    /// Subscription control messages decoded from the received frames.
    pub fn subscription_frames(&self) -> Vec<(String, SubscriptionAction)> {
        let codec = FramedCodec;
        self.binary_frames()
            .iter()
            .filter_map(|frame| codec.decode_subscription(frame).ok())
            .collect()
    }

    /// Wait until `count` clients are connected.
    pub async fn wait_for_clients(&self, count: usize) {
        wait_until(
            || self.client_count() >= count,
            Duration::from_secs(5),
            "waiting for relay clients",
        )
        .await;
    }

    /// Wait until `count` subscription control messages have arrived.
    pub async fn wait_for_subscriptions(&self, count: usize) {
        wait_until(
            || self.subscription_frames().len() >= count,
            Duration::from_secs(5),
            "waiting for subscription frames",
        )
        .await;
    }

    /// Wait until `count` auth text frames have arrived.
    pub async fn wait_for_auth_frames(&self, count: usize) {
        wait_until(
            || self.text_frames().len() >= count,
            Duration::from_secs(5),
            "waiting for auth frames",
        )
        .await;
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
