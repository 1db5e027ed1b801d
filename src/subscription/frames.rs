// Transport-level frame readers: WebSocket text frames and text/event-stream events.

use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt, future};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

use crate::error::{ApiError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where a subscription reads its frames from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// One JSON document per text frame. The client never sends.
    WebSocket(Url),
    /// `text/event-stream`; one JSON document per event (`data:` lines joined).
    EventStream(Url),
}

impl Endpoint {
    pub fn url(&self) -> &Url {
        match self {
            Endpoint::WebSocket(u) | Endpoint::EventStream(u) => u,
        }
    }
}

/// `data` payload of every event in an event-stream body. Events without data are skipped.
pub(crate) fn event_frames<S, E>(body: S) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    body.eventsource()
        .filter_map(|event| {
            future::ready(match event {
                Ok(event) if event.data.is_empty() => None,
                Ok(event) => Some(Ok(event.data)),
                Err(EventStreamError::Transport(e)) => Some(Err(ApiError::Transport(e.to_string()))),
                Err(e) => Some(Err(ApiError::Protocol(format!("event stream: {}", e)))),
            })
        })
        .boxed()
}

pub(crate) enum FrameReader {
    WebSocket(Box<WsStream>),
    EventStream(BoxStream<'static, Result<String>>),
}

impl FrameReader {
    /// Open the physical connection. Resolves once the WebSocket handshake completed
    /// or the event-stream response headers arrived with a 2xx status.
    pub(crate) async fn connect(
        http: &reqwest::Client,
        endpoint: &Endpoint,
        connect_timeout: Duration,
    ) -> Result<Self> {
        match endpoint {
            Endpoint::WebSocket(url) => {
                let (ws, _response) = timeout(connect_timeout, connect_async(url.as_str()))
                    .await
                    .map_err(|_| {
                        ApiError::Timeout(format!(
                            "connecting to {} took longer than {:?}",
                            url, connect_timeout
                        ))
                    })?
                    .map_err(|e| ApiError::Transport(format!("{}: {}", url, e)))?;
                Ok(FrameReader::WebSocket(Box::new(ws)))
            }
            Endpoint::EventStream(url) => {
                let resp = timeout(
                    connect_timeout,
                    http.get(url.clone())
                        .header(reqwest::header::ACCEPT, "text/event-stream")
                        .send(),
                )
                .await
                .map_err(|_| {
                    ApiError::Timeout(format!(
                        "connecting to {} took longer than {:?}",
                        url, connect_timeout
                    ))
                })?
                .map_err(ApiError::from_reqwest)?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(ApiError::Http {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Ok(FrameReader::EventStream(event_frames(resp.bytes_stream())))
            }
        }
    }

    /// Next text frame. `None` when the peer closed the connection cleanly.
    pub(crate) async fn next_frame(&mut self) -> Option<Result<String>> {
        match self {
            FrameReader::WebSocket(ws) => loop {
                match ws.next().await? {
                    Ok(Message::Text(text)) => return Some(Ok(text)),
                    Ok(Message::Close(_)) => return None,
                    Ok(_) => continue,
                    Err(e) => return Some(Err(ApiError::Transport(e.to_string()))),
                }
            },
            FrameReader::EventStream(events) => events.next().await,
        }
    }

    pub(crate) async fn close(self) {
        if let FrameReader::WebSocket(mut ws) = self {
            let _ = ws.close(None).await;
        }
    }
}
