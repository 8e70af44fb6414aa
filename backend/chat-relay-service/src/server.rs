//! WebSocket listener. Each accepted socket gets a reader loop feeding a [`Connection`] and a
//! writer task draining its outbound queue.

use crate::connection::{Connection, Flow};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::unbounded_channel;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const SUBPROTOCOL: &str = "xmpp";

pub async fn bind(port: u16) -> AppResult<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::StartServer(format!("failed to bind {addr}: {e}")))
}

/// Accept connections until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()>,
) -> AppResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "chat relay listening");
    }
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_socket(state.clone(), stream, peer));
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                }
            }
            _ = &mut shutdown => {
                info!("listener shutting down");
                return Ok(());
            }
        }
    }
}

fn negotiate_subprotocol(
    request: &Request,
    mut response: Response,
) -> Result<Response, ErrorResponse> {
    let offers_xmpp = request
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|offered| offered.split(',').any(|p| p.trim() == SUBPROTOCOL));
    if offers_xmpp {
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
    }
    Ok(response)
}

async fn handle_socket(state: AppState, stream: TcpStream, peer: SocketAddr) {
    let socket = match tokio_tungstenite::accept_hdr_async(stream, negotiate_subprotocol).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!(error = %e, peer = %peer, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = socket.split();
    let (outbound, mut queued) = unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = queued.recv().await {
            if let Err(e) = sink.send(Message::Text(frame.into())).await {
                debug!(error = %e, "websocket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut connection = Connection::new(state, outbound);
    while let Some(incoming) = source.next().await {
        match incoming {
            Ok(Message::Text(text)) => {
                if connection.handle_frame(text.as_str()).await == Flow::Close {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, peer = %peer, "websocket read failed");
                break;
            }
        }
    }

    // Dropping the connection's senders lets the writer flush what is queued and exit
    connection.shutdown().await;
    let _ = writer.await;
}
