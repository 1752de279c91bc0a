//! Test helpers for costlink-sync integration tests
//!
//! Provides a scripted in-memory transport:
//! - MockConnector: answers each connect attempt per a script
//! - ServerHandle: the backend side of one accepted transport

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use costlink_common::config::{ReconnectConfig, SyncConfig};
use costlink_common::{Error, Result};
use costlink_sync::connection::{Connector, Transport, WireMessage};
use futures::channel::mpsc as fmpsc;
use futures::future::{self, BoxFuture};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// How the mock answers one connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Fail,
    Accept,
    /// Never completes; exercises the connect timeout
    Hang,
}

/// Connector whose attempts follow a script; an exhausted script fails
pub struct MockConnector {
    script: Mutex<VecDeque<Outcome>>,
    attempts: Mutex<Vec<Instant>>,
    accepted: mpsc::UnboundedSender<ServerHandle>,
}

impl MockConnector {
    pub fn new(script: &[Outcome]) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerHandle>) {
        let (accepted, servers) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            attempts: Mutex::new(Vec::new()),
            accepted,
        });
        (connector, servers)
    }

    /// Instants of every connect attempt so far
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    /// Attempt instants as offsets from `start`
    pub fn attempt_offsets(&self, start: Instant) -> Vec<Duration> {
        self.attempts()
            .into_iter()
            .map(|at| at.duration_since(start))
            .collect()
    }

    pub fn push_outcomes(&self, outcomes: &[Outcome]) {
        self.script.lock().unwrap().extend(outcomes.iter().copied());
    }
}

impl Connector for MockConnector {
    fn connect(&self, _url: &str) -> BoxFuture<'static, Result<Transport>> {
        self.attempts.lock().unwrap().push(Instant::now());
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Fail);

        match outcome {
            Outcome::Fail => {
                future::ready(Err(Error::Transport("connection refused".into()))).boxed()
            }
            Outcome::Hang => future::pending().boxed(),
            Outcome::Accept => {
                let (client_tx, server_rx) = fmpsc::unbounded::<WireMessage>();
                let (server_tx, client_rx) = fmpsc::unbounded::<Result<String>>();
                let _ = self.accepted.send(ServerHandle {
                    received: server_rx,
                    outbound: Some(server_tx),
                });

                let sink = client_tx.sink_map_err(|e| Error::Transport(e.to_string()));
                let transport = Transport {
                    sink: Box::pin(sink),
                    stream: Box::pin(client_rx),
                };
                future::ready(Ok(transport)).boxed()
            }
        }
    }
}

/// Backend side of one accepted mock transport
pub struct ServerHandle {
    received: fmpsc::UnboundedReceiver<WireMessage>,
    outbound: Option<fmpsc::UnboundedSender<Result<String>>>,
}

impl ServerHandle {
    /// Next message the client wrote, pings included
    pub async fn next_message(&mut self) -> Option<WireMessage> {
        self.received.next().await
    }

    /// Next request frame, skipping heartbeats
    pub async fn next_request(&mut self) -> Value {
        loop {
            match self.next_message().await {
                Some(WireMessage::Text(text)) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["type"] != "ping" {
                        return value;
                    }
                }
                Some(other) => panic!("Expected request, got {:?}", other),
                None => panic!("Client closed the transport"),
            }
        }
    }

    /// Deliver a text frame to the client
    pub fn push(&self, text: impl Into<String>) {
        if let Some(outbound) = &self.outbound {
            let _ = outbound.unbounded_send(Ok(text.into()));
        }
    }

    /// Answer `request` with a success response carrying `body` fields
    pub fn respond(&self, request: &Value, body: Value) {
        let mut frame = json!({
            "type": format!("{}_response", request["type"].as_str().unwrap()),
            "messageId": request["messageId"],
            "status": "success",
        });
        if let Value::Object(fields) = body {
            for (key, value) in fields {
                frame[key] = value;
            }
        }
        self.push(frame.to_string());
    }

    /// Answer `request` with an error response
    pub fn respond_error(&self, request: &Value, message: &str) {
        let frame = json!({
            "type": format!("{}_response", request["type"].as_str().unwrap()),
            "messageId": request["messageId"],
            "status": "error",
            "message": message,
        });
        self.push(frame.to_string());
    }

    /// Close the server side; the client observes end of stream
    pub fn close(&mut self) {
        self.outbound = None;
    }

    /// Fail the transport with a read error
    pub fn fail(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.unbounded_send(Err(Error::Transport("connection reset".into())));
        }
    }
}

/// Fast timings for timer-driven tests
pub fn test_config() -> SyncConfig {
    SyncConfig {
        endpoint_url: "ws://mock.invalid/ws".to_string(),
        heartbeat_interval: Duration::from_secs(30),
        request_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(1),
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_attempts: 3,
        },
        status_channel_capacity: 64,
    }
}

/// Poll `condition` on the paused clock until it holds or 10 s pass
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
