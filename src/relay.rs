//! Bidirectional WebSocket relay
//!
//! The gateway completes the client handshake itself, dials the resolved
//! backend over WebSocket, and pumps frames in both directions until one
//! side closes. Frame types are preserved; the two directions each run
//! in a dedicated pump so ordering within a direction is guaranteed.

use crate::config::RouteDescriptor;
use crate::error::{json_error_response, ProxyErrorCode};
use futures::{Sink, SinkExt, Stream, StreamExt};
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

/// How a pump ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    /// Clean close frame or peer disconnect
    Clean,
    /// Protocol violation or I/O error
    Failed,
}

/// Headers owned by each handshake leg: the upstream dial computes its
/// own values for these, so the client's copies are never forwarded.
const HANDSHAKE_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "keep-alive",
    "transfer-encoding",
    "content-encoding",
    "sec-websocket-key",
    "sec-websocket-accept",
    "sec-websocket-version",
    "sec-websocket-extensions",
];

/// The upstream WebSocket URL for a resolved route
pub fn upstream_url(router: &RouteDescriptor, path_and_query: &str) -> String {
    format!("ws://{}{}", router.authority(), path_and_query)
}

/// Build the upstream handshake request: the URL supplies the rewritten
/// Host and a fresh key, everything else the client sent (cookies,
/// authorization, subprotocols, the gateway's forwarding headers) is
/// copied through.
fn upstream_request(
    url: &str,
    client_headers: &HeaderMap,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, WsError> {
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();
    for (name, value) in client_headers {
        if HANDSHAKE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        // append keeps repeated names (multiple Cookie lines) intact
        headers.append(name.clone(), value.clone());
    }
    Ok(request)
}

/// Handle an inbound WebSocket upgrade.
///
/// The handshake is always completed; an unroutable path is then closed
/// with a policy-violation code, since no HTTP status can be sent once
/// the client expects an upgrade. `route` carries the resolved
/// descriptor and the forwarded path plus query.
pub async fn handle_upgrade(
    req: Request<Incoming>,
    route: Option<(RouteDescriptor, String)>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
        return Ok(json_error_response(
            ProxyErrorCode::BadUpgrade,
            "Missing Sec-WebSocket-Key header",
        ));
    };
    let accept = derive_accept_key(key.as_bytes());
    // Captured before the upgrade consumes the request; the upstream
    // handshake re-sends these
    let client_headers = req.headers().clone();

    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                error!(error = %e, "Client WebSocket upgrade failed");
                return;
            }
        };
        let mut client =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

        let Some((router, path_and_query)) = route else {
            debug!("No route for WebSocket path, closing with policy violation");
            let _ = client
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "no route for path".into(),
                }))
                .await;
            return;
        };

        let url = upstream_url(&router, &path_and_query);
        let dialed = match upstream_request(&url, &client_headers) {
            Ok(request) => tokio_tungstenite::connect_async(request).await,
            Err(e) => Err(e),
        };
        let upstream = match dialed {
            Ok((upstream, _)) => upstream,
            Err(e) => {
                warn!(backend = %router.name, url = %url, error = %e, "Upstream WebSocket connect failed");
                let _ = client
                    .close(Some(CloseFrame {
                        code: CloseCode::Error,
                        reason: "upstream unreachable".into(),
                    }))
                    .await;
                return;
            }
        };

        debug!(backend = %router.name, url = %url, "WebSocket relay established");
        relay_session(client, upstream, &router.name).await;
        debug!(backend = %router.name, "WebSocket relay session ended");
    });

    Ok(response)
}

/// Pump both directions until either side ends, then actively close
/// whatever is still open. The losing pump is cancelled by the select.
pub async fn relay_session<C, U>(
    client: WebSocketStream<C>,
    upstream: WebSocketStream<U>,
    backend: &str,
) where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let end = {
        let client_to_upstream = pump(&mut client_rx, &mut upstream_tx);
        let upstream_to_client = pump(&mut upstream_rx, &mut client_tx);
        tokio::pin!(client_to_upstream, upstream_to_client);

        tokio::select! {
            end = &mut client_to_upstream => {
                debug!(backend, ?end, "Client side ended relay");
                end
            }
            end = &mut upstream_to_client => {
                debug!(backend, ?end, "Upstream side ended relay");
                end
            }
        }
    };

    // Close both ends; a clean end already carried its close frame, an
    // error gets the internal-error code on whichever side still listens.
    let frame = match end {
        PumpEnd::Clean => None,
        PumpEnd::Failed => Some(CloseFrame {
            code: CloseCode::Error,
            reason: "relay error".into(),
        }),
    };
    let _ = client_tx.send(Message::Close(frame.clone())).await;
    let _ = upstream_tx.send(Message::Close(frame)).await;
    let _ = client_tx.flush().await;
    let _ = upstream_tx.flush().await;
}

/// Forward frames from `rx` to `tx`, preserving frame type, until the
/// stream ends. Text and binary frames pass through distinctly; ping and
/// pong are relayed so keepalives survive the hop; a close frame is
/// forwarded and ends the pump.
async fn pump<R, W>(rx: &mut R, tx: &mut W) -> PumpEnd
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(next) = rx.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return PumpEnd::Clean,
            Err(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)) => {
                // Abrupt disconnect: treated as the session ending, not a relay fault
                return PumpEnd::Clean;
            }
            Err(e) => {
                warn!(error = %e, "WebSocket pump error");
                return PumpEnd::Failed;
            }
        };

        match msg {
            Message::Text(_) | Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {
                if tx.send(msg).await.is_err() {
                    return PumpEnd::Failed;
                }
            }
            Message::Close(frame) => {
                let _ = tx.send(Message::Close(frame)).await;
                return PumpEnd::Clean;
            }
            // Raw frames are not produced by read in normal operation
            Message::Frame(_) => {}
        }
    }
    PumpEnd::Clean
}
