//! NIP-01 WebSocket endpoint: subscriptions, event submission, live delivery.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error};

use crate::error::RelayError;
use crate::event::Event;
use crate::filter::Filter;
use crate::relay::Relay;
use crate::subs::{next_conn_id, ConnId, SubKey};

/// Start the WebSocket server.
pub async fn serve_ws(
    addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new().route("/", get(handler)).with_state(relay);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Handle the HTTP upgrade and spawn the connection processor.
async fn handler(ws: WebSocketUpgrade, State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| async move { process(socket, relay).await })
}

/// Process one connection: a writer task drains the outbound channel while
/// inbound frames are handled in arrival order.
async fn process(socket: WebSocket, relay: Arc<Relay>) {
    let conn = next_conn_id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });
    while let Some(Ok(msg)) = ws_rx.next().await {
        if let Message::Text(txt) = msg {
            handle_frame(&txt, conn, &tx, &relay).await;
        }
    }
    // Peer is gone: subscriptions terminate without a CLOSED frame.
    relay.registry.remove_all_for_connection(conn);
    writer.abort();
}

fn send(tx: &UnboundedSender<String>, frame: Value) {
    let _ = tx.send(frame.to_string());
}

fn notice(tx: &UnboundedSender<String>, err: RelayError) {
    debug!(kind = err.as_label(), "protocol notice");
    send(tx, serde_json::json!(["NOTICE", err.reason()]));
}

/// Dispatch one inbound frame. Unparseable frames get a NOTICE and the
/// connection stays open.
async fn handle_frame(raw: &str, conn: ConnId, tx: &UnboundedSender<String>, relay: &Arc<Relay>) {
    let Ok(val) = serde_json::from_str::<Value>(raw) else {
        notice(
            tx,
            RelayError::ProtocolViolation("could not parse message".into()),
        );
        return;
    };
    let Some(arr) = val.as_array() else {
        notice(
            tx,
            RelayError::ProtocolViolation("message is not an array".into()),
        );
        return;
    };
    match arr.first().and_then(Value::as_str) {
        Some("REQ") => handle_req(arr, conn, tx, relay),
        Some("EVENT") => handle_event(arr, tx, relay).await,
        Some("CLOSE") => handle_close(arr, conn, tx, relay),
        _ => notice(tx, RelayError::ProtocolViolation("unknown verb".into())),
    }
}

/// Open or replace a subscription: stream historical matches, then EOSE,
/// then flush anything fan-out queued meanwhile and go live.
fn handle_req(arr: &[Value], conn: ConnId, tx: &UnboundedSender<String>, relay: &Arc<Relay>) {
    let Some(req_id) = arr.get(1).and_then(Value::as_str) else {
        notice(
            tx,
            RelayError::ProtocolViolation("REQ without request id".into()),
        );
        return;
    };
    if arr.len() < 3 {
        notice(
            tx,
            RelayError::ProtocolViolation("REQ without filters".into()),
        );
        return;
    }
    let mut filters = Vec::with_capacity(arr.len() - 2);
    for raw in &arr[2..] {
        match Filter::from_value(raw) {
            Ok(f) => filters.push(f),
            Err(e) => {
                send(tx, serde_json::json!(["CLOSED", req_id, e.reason()]));
                return;
            }
        }
    }
    let plan = relay.compile(&filters);
    if !plan.admitted {
        // Off-topic subscriptions are declined fast, with an empty reason.
        send(tx, serde_json::json!(["CLOSED", req_id, ""]));
        return;
    }
    let key = SubKey {
        conn,
        req: req_id.to_string(),
    };
    // Register before the historical query so writes racing it are queued
    // for delivery after EOSE rather than lost.
    let sub = relay.registry.add(key.clone(), filters, tx.clone());
    match relay.run_historical(&plan) {
        Ok(events) => {
            for ev in &events {
                send(tx, serde_json::json!(["EVENT", req_id, ev]));
            }
            send(tx, serde_json::json!(["EOSE", req_id]));
            sub.go_live();
        }
        Err(e) if e.is_fatal() => {
            error!(error = %e, "aborting on storage failure");
            std::process::abort();
        }
        Err(e) => {
            relay.registry.remove(&key);
            send(tx, serde_json::json!(["CLOSED", req_id, e.reason()]));
        }
    }
}

/// Validate and persist a submitted event, acknowledging before fan-out.
async fn handle_event(arr: &[Value], tx: &UnboundedSender<String>, relay: &Arc<Relay>) {
    let Some(raw) = arr.get(1) else {
        notice(
            tx,
            RelayError::ProtocolViolation("EVENT without payload".into()),
        );
        return;
    };
    let ev = match Event::from_value(raw) {
        Ok(ev) => ev,
        Err(e) => {
            // Answer OK-false when the frame still carries an id to hang it on.
            match raw.get("id").and_then(Value::as_str) {
                Some(id) => send(tx, serde_json::json!(["OK", id, false, e.reason()])),
                None => notice(tx, e),
            }
            return;
        }
    };
    match relay.publish(&ev).await {
        Ok(()) => {
            send(tx, serde_json::json!(["OK", ev.id, true, ""]));
            relay.after_write(&ev);
        }
        Err(e) if e.is_fatal() => {
            error!(error = %e, "aborting on storage failure");
            std::process::abort();
        }
        Err(e) => send(tx, serde_json::json!(["OK", ev.id, false, e.reason()])),
    }
}

/// Remove a subscription; after the CLOSED reply no further EVENT frames are
/// produced for its request id.
fn handle_close(arr: &[Value], conn: ConnId, tx: &UnboundedSender<String>, relay: &Arc<Relay>) {
    let Some(req_id) = arr.get(1).and_then(Value::as_str) else {
        notice(
            tx,
            RelayError::ProtocolViolation("CLOSE without request id".into()),
        );
        return;
    };
    relay.registry.remove(&SubKey {
        conn,
        req: req_id.to_string(),
    });
    send(tx, serde_json::json!(["CLOSED", req_id, ""]));
}
