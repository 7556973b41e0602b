//! WebSocket route wiring: upgrades the HTTP connection, runs
//! `lifecycle::register`, then drives the read loop that feeds every
//! text frame into `frame_handler::handle_frame` and every pong into
//! `lifecycle::handle_pong`, until the socket closes.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::frame_handler;
use crate::hub::Hub;
use crate::lifecycle;
use crate::socket::AxumSocket;

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new().route("/ws/v1/connect", get(connect)).with_state(hub)
}

#[derive(Debug, Deserialize, Default)]
struct ConnectParams {
    client_id: Option<String>,
}

async fn connect(
    State(hub): State<Arc<Hub>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(hub, socket, headers, params.client_id))
}

async fn handle_socket(hub: Arc<Hub>, socket: WebSocket, headers: HeaderMap, requested_client_id: Option<String>) {
    let client_id = requested_client_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let span = info_span!("connection", client_id = %client_id);
    async move {
        let (sink, mut stream) = socket.split();
        let axum_socket = AxumSocket::new(sink);

        let Some(conn) = lifecycle::register(&hub, axum_socket, client_id.clone(), &headers).await else {
            return;
        };
        info!(account_id = %conn.account_id, device_id = %conn.device_id, "connection registered");

        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    frame_handler::handle_frame(&hub, &client_id, &text).await;
                }
                Ok(Message::Pong(_)) => {
                    lifecycle::handle_pong(&hub, &conn).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "websocket read error, treating as close");
                    break;
                }
            }
        }

        lifecycle::handle_close(&hub, &conn).await;
    }
    .instrument(span)
    .await;
}
