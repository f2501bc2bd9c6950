//! Gateway mode: the same protocol frames over a WebSocket, plus a health
//! endpoint.

use std::sync::Arc;

use {
    axum::{
        extract::{
            ws::{Message, WebSocket, WebSocketUpgrade},
            State,
        },
        response::IntoResponse,
        routing::get,
        Router,
    },
    tokio::sync::{broadcast, mpsc::UnboundedReceiver},
    tracing::{debug, error, info, warn},
};

use {
    crate::app::App,
    hearth_protocol::{encode_outbound, parse_inbound, Outbound},
};

#[derive(Clone)]
struct GatewayState {
    app: Arc<App>,
    outbound: broadcast::Sender<String>,
}

/// Serve the protocol on `GATEWAY_PORT`.
pub async fn run(app: Arc<App>, mut outbound_rx: UnboundedReceiver<Outbound>) -> Result<(), i32> {
    let port = app.env.gateway_port.unwrap_or(8787);

    // Fan outbound frames out to every connected client, in order.
    let (broadcast_tx, _) = broadcast::channel::<String>(1024);
    {
        let broadcast_tx = broadcast_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let _ = broadcast_tx.send(encode_outbound(&frame));
            }
        });
    }

    let state = GatewayState {
        app,
        outbound: broadcast_tx,
    };
    let router = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state);

    let addr = format!("127.0.0.1:{port}");
    info!(%addr, "gateway listening");
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        error!(error = %e, "failed to bind gateway port");
        1
    })?;
    axum::serve(listener, router).await.map_err(|e| {
        error!(error = %e, "gateway server failed");
        1
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let mut outbound = state.outbound.subscribe();
    debug!("gateway client connected");

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Ok(line) => {
                    if socket.send(Message::Text(line.into())).await.is_err() {
                        break;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "gateway client lagging, frames dropped");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => match parse_inbound(&text) {
                    Ok(Some(inbound)) => {
                        let app = Arc::clone(&state.app);
                        tokio::spawn(async move {
                            app.handle_inbound(inbound).await;
                        });
                    },
                    Ok(None) => {},
                    Err(e) => {
                        // Per-connection fail-fast: drop this client.
                        warn!(error = %e, "malformed frame from gateway client");
                        break;
                    },
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}, // no binary frames in this protocol
                Some(Err(e)) => {
                    debug!(error = %e, "websocket error");
                    break;
                },
            },
        }
    }
    debug!("gateway client disconnected");
}
