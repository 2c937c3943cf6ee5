//! WebSocket bridging after a successful 101 upgrade: both raw streams
//! are wrapped in tungstenite sessions so the rule hook can transform
//! payloads with masking handled correctly.

use std::io;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::rule::{Rule, WsDirection};

/// Relay frames in both directions until either side closes, running
/// every message through the rule's transform hook.
pub(crate) async fn bridge<R, C, U>(rule: &R, client: C, upstream: U) -> io::Result<()>
where
    R: Rule,
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let client_ws = WebSocketStream::from_raw_socket(client, Role::Server, None).await;
    let upstream_ws = WebSocketStream::from_raw_socket(upstream, Role::Client, None).await;

    let (client_sink, client_stream) = client_ws.split();
    let (upstream_sink, upstream_stream) = upstream_ws.split();

    let client_to_server = relay(rule, WsDirection::ClientToServer, client_stream, upstream_sink);
    let server_to_client = relay(rule, WsDirection::ServerToClient, upstream_stream, client_sink);

    // Both directions run to completion; a Close frame (or EOF) on one
    // side ends that direction, and the mirrored Close ends the other.
    let (client_result, server_result) = tokio::join!(client_to_server, server_to_client);
    client_result?;
    server_result?;
    Ok(())
}

async fn relay<R, S, D>(
    rule: &R,
    direction: WsDirection,
    mut source: SplitStream<WebSocketStream<S>>,
    mut sink: SplitSink<WebSocketStream<D>, Message>,
) -> io::Result<()>
where
    R: Rule,
    S: AsyncRead + AsyncWrite + Unpin + Send,
    D: AsyncRead + AsyncWrite + Unpin + Send,
{
    while let Some(next) = source.next().await {
        let mut message = match next {
            Ok(message) => message,
            Err(error) => {
                tracing::debug!(?direction, %error, "websocket read ended");
                break;
            }
        };
        let closing = matches!(message, Message::Close(_));
        rule.on_websocket_message(direction, &mut message).await;
        if let Err(error) = sink.send(message).await {
            tracing::debug!(?direction, %error, "websocket write ended");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.flush().await;
    Ok(())
}
