//! Websocket channel endpoint
//!
//! One socket serves one tenant+context room: the client receives an
//! `initialized` envelope on connect, every room broadcast after that, and
//! may send `ClientRequest` commands that are dispatched to the context.
//! Dropping the socket drops its broadcast receiver, which is all the
//! cleanup a room needs.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    response::Response,
    routing::get,
    Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;
use workty_core::contexts::{ContextName, ContextRef};
use workty_core::error::Error;
use workty_protocol::{ChannelResponse, ClientRequest};

use crate::error::SupervisorError;
use crate::ApiContextRef;

pub fn router() -> Router<ApiContextRef> {
    Router::new().route("/{tenant}/{context}", get(channel_handler))
}

async fn channel_handler(
    ws: WebSocketUpgrade,
    Path((tenant, context)): Path<(Uuid, String)>,
    State(state): State<ApiContextRef>,
) -> Result<Response, SupervisorError> {
    let name: ContextName = context
        .parse()
        .map_err(|_| SupervisorError::UnknownContext(context.clone()))?;
    let ctx = state
        .locator
        .get(tenant, name)
        .ok_or(SupervisorError::UnknownTenant(tenant))?;

    debug!(%tenant, context = %context, "channel subscriber connecting");
    Ok(ws.on_upgrade(move |socket| channel_loop(socket, tenant, ctx)))
}

async fn channel_loop(socket: WebSocket, tenant: Uuid, ctx: ContextRef) {
    let (mut sender, mut receiver) = socket.split();
    let mut room = ctx.room().subscribe();

    if send_json(&mut sender, &ChannelResponse::initialized())
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            broadcast = room.recv() => {
                match broadcast {
                    Ok(response) => {
                        if send_json(&mut sender, &response).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%tenant, skipped, "channel subscriber lagging, broadcasts dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(%tenant, "room closed, dropping channel");
                        break;
                    }
                }
            }
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientRequest>(&text) {
                            Ok(request) => ctx.dispatch(tenant, request).await,
                            Err(e) => {
                                // still exactly one envelope per command
                                ctx.room().respond(
                                    None,
                                    Err(Error::bad_digest(format!("malformed request: {e}"))),
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(%tenant, "channel subscriber disconnected");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%tenant, error = %e, "channel socket error");
                        break;
                    }
                }
            }
        }
    }
}

async fn send_json<T: Serialize>(
    sender: &mut SplitSink<WebSocket, Message>,
    value: &T,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    sender.send(Message::Text(json.into())).await
}
