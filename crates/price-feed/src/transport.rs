//! WebSocket and HTTP transports for the rate feed

use futures::future;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::debug;

use aurum_core::{FeedError, FeedResult};

use crate::feeds::{MessageStream, PushChannel, RateSource};

/// WebSocket push channel
#[derive(Debug, Clone, Default)]
pub struct WsPushChannel {
    subscribe_message: Option<String>,
}

impl WsPushChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text frame sent right after the handshake
    pub fn with_subscribe_message(mut self, message: Option<String>) -> Self {
        self.subscribe_message = message;
        self
    }
}

#[async_trait::async_trait]
impl PushChannel for WsPushChannel {
    async fn open(&self, url: &str) -> FeedResult<MessageStream> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| FeedError::ConnectionFailed(e.to_string()))?;
        let (mut write, read) = ws_stream.split();

        if let Some(subscribe) = &self.subscribe_message {
            write
                .send(Message::Text(subscribe.clone()))
                .await
                .map_err(|e| FeedError::ConnectionFailed(e.to_string()))?;
            debug!(url, "Sent push subscription");
        }

        // Pong replies are queued by tungstenite and flushed on the next read,
        // so only the read half is kept.
        let stream = read
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => String::from_utf8(bytes).ok().map(Ok),
                    Ok(_) => None,
                    Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                        Some(Err(FeedError::Disconnected))
                    }
                    Err(e) => Some(Err(FeedError::ConnectionFailed(e.to_string()))),
                })
            })
            .boxed();

        Ok(stream)
    }
}

/// HTTP pull source
#[derive(Debug, Clone)]
pub struct HttpRateSource {
    client: reqwest::Client,
}

impl HttpRateSource {
    pub fn new(request_timeout: Duration) -> FeedResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| FeedError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl RateSource for HttpRateSource {
    async fn fetch(&self, url: &str) -> FeedResult<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FeedError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| FeedError::Http(e.to_string()))?;

        response.text().await.map_err(|e| FeedError::Http(e.to_string()))
    }
}
