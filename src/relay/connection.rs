//! A single WebSocket connection to one relay.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::{FetchStatus, RelayAddress, RelayError};
use crate::{
    filter::QueryDescriptor,
    message::{ClientMessage, RelayMessage},
};

type Socket = WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>;

/// Persistent message connection to a relay. Carries at most one active
/// subscription at a time; messages for other subscription ids are dropped.
pub struct RelayConnection {
    address: RelayAddress,
    ws: Socket,
    open: bool,
}

impl RelayConnection {
    /// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
    pub async fn connect(address: &RelayAddress, proxy: Option<&str>) -> Result<Self, RelayError> {
        let invalid = |reason: &str| RelayError::InvalidUrl {
            url: address.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(address.as_str()).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(invalid("scheme must be ws or wss"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;
        let req = address.as_str().into_client_request()?;
        let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = proxy {
            Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
        } else {
            Box::new(TcpStream::connect((host, port)).await?)
        };
        let (ws, _) = client_async(req, stream).await?;
        debug!(relay = %address, "connected");
        Ok(Self {
            address: address.clone(),
            ws,
            open: true,
        })
    }

    pub fn address(&self) -> &RelayAddress {
        &self.address
    }

    /// False once the relay closed the socket or a transport error occurred.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Send `["REQ", subscription_id, filters...]`.
    pub async fn subscribe(
        &mut self,
        subscription_id: &str,
        filters: &[QueryDescriptor],
    ) -> Result<(), RelayError> {
        let msg = ClientMessage::Req {
            subscription_id,
            filters,
        };
        self.send(msg).await
    }

    /// Send `["CLOSE", subscription_id]`.
    pub async fn unsubscribe(&mut self, subscription_id: &str) -> Result<(), RelayError> {
        self.send(ClientMessage::Close { subscription_id }).await
    }

    async fn send(&mut self, msg: ClientMessage<'_>) -> Result<(), RelayError> {
        let res = self.ws.send(Message::Text(msg.to_json())).await;
        if res.is_err() {
            self.open = false;
        }
        Ok(res?)
    }

    /// Next decoded message, or `None` once the relay closed the connection.
    /// Frames that fail to decode are logged and skipped.
    pub async fn recv(&mut self) -> Result<Option<RelayMessage>, RelayError> {
        while let Some(frame) = self.ws.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    self.open = false;
                    return Err(e.into());
                }
            };
            match frame {
                Message::Text(txt) => match RelayMessage::parse(&txt) {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(e) => warn!(relay = %self.address, error = %e, "discarding malformed message"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        self.open = false;
        Ok(None)
    }

    /// Collect responses for `subscription_id` into `sink` until the relay
    /// finishes the subscription, `deadline` passes, or `cancel` fires.
    ///
    /// Responses already pushed to `sink` stay there whatever the result.
    pub async fn collect(
        &mut self,
        subscription_id: &str,
        deadline: Instant,
        cancel: &CancellationToken,
        sink: &mut Vec<RelayMessage>,
    ) -> Result<FetchStatus, RelayError> {
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(FetchStatus::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Ok(FetchStatus::TimedOut),
                msg = self.recv() => msg?,
            };
            let Some(msg) = msg else {
                return Err(RelayError::Closed);
            };
            match msg.subscription_id() {
                Some(sub) if sub != subscription_id => {
                    debug!(relay = %self.address, sub, "ignoring message for stale subscription");
                }
                _ => {
                    let done = matches!(
                        msg,
                        RelayMessage::EndOfStoredEvents { .. } | RelayMessage::Closed { .. }
                    );
                    sink.push(msg);
                    if done {
                        return Ok(FetchStatus::Complete);
                    }
                }
            }
        }
    }

    /// Close the WebSocket, ignoring errors.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
