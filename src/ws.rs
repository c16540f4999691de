//! WebSocket bridge: forwards event-bus frames to browser clients.
//!
//! Clients are read-only subscribers. Each connection registers its own
//! bounded channel on the bus; the bus's delivery policies (lossy progress,
//! disconnect-on-overflow lifecycle) apply per connection.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use tracing::debug;

use crate::api::AppContext;
use crate::events::SUBSCRIBER_CAPACITY;

pub async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<AppContext>) -> Response {
    ws.on_upgrade(move |socket| client_loop(socket, ctx))
}

async fn client_loop(mut socket: WebSocket, ctx: AppContext) {
    let (sub_id, mut events) = ctx.engine.bus.subscribe(SUBSCRIBER_CAPACITY);
    debug!(subscriber = sub_id, "WebSocket client connected");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    // Bus disconnected this subscriber (lifecycle overflow).
                    break;
                };
                let Ok(json) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // Clients are read-only; ignore everything except close.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    ctx.engine.bus.unsubscribe(sub_id);
    debug!(subscriber = sub_id, "WebSocket client disconnected");
}
