use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use snafu::ResultExt;
use tokio::sync::oneshot;

use crate::config::EngineConfig;
use crate::error::{EngineResult, TransportConnectSnafu, TransportReadSnafu, TransportStatusSnafu};
use crate::request::ChatRequest;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Raw body chunks from one streamed chat response.
pub type ByteStream = Pin<Box<dyn Stream<Item = EngineResult<Bytes>> + Send>>;

/// Idempotent cancellation trigger for one in-flight turn.
///
/// The underlying sender is consumed on first use, so firing it again is a
/// harmless no-op.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

/// Receiving half awaited by the engine's read loop.
pub type CancelSignal = oneshot::Receiver<()>;

impl CancelHandle {
    pub fn pair() -> (Self, CancelSignal) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Fires the cancellation signal. Returns true on the first call only.
    pub fn cancel(&mut self) -> bool {
        self.tx.take().map(|tx| tx.send(()).is_ok()).unwrap_or(false)
    }
}

/// Seam between the engine and the network.
///
/// The engine selects the cancel signal against the next chunk and drops the
/// stream on the way out, so implementations never observe cancellation as an
/// error; they just see the stream go away.
pub trait Transport: Send + Sync {
    fn open<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, EngineResult<ByteStream>>;
}

/// Production transport backed by reqwest's streamed response bodies.
pub struct HttpTransport {
    client: reqwest::Client,
    chat_url: String,
}

impl HttpTransport {
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .context(TransportConnectSnafu {
                stage: "build-http-client",
            })?;

        Ok(Self {
            client,
            chat_url: config.chat_url(),
        })
    }
}

impl Transport for HttpTransport {
    fn open<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, EngineResult<ByteStream>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.chat_url)
                .json(request)
                .send()
                .await
                .context(TransportConnectSnafu {
                    stage: "send-chat-request",
                })?;

            let status = response.status();
            if !status.is_success() {
                // Fatal and non-retryable for this turn; the caller may
                // resubmit as a new turn.
                let body = response.text().await.unwrap_or_default();
                return TransportStatusSnafu {
                    stage: "check-chat-response-status",
                    status: status.as_u16(),
                    body,
                }
                .fail();
            }

            let stream = response.bytes_stream().map(|chunk| {
                chunk.context(TransportReadSnafu {
                    stage: "read-chat-chunk",
                })
            });

            Ok(Box::pin(stream) as ByteStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_fires_once_and_is_idempotent() {
        let (mut handle, mut signal) = CancelHandle::pair();

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(!handle.cancel());
        assert!(signal.try_recv().is_ok());
    }

    #[test]
    fn cancel_after_receiver_dropped_reports_false() {
        let (mut handle, signal) = CancelHandle::pair();
        drop(signal);
        assert!(!handle.cancel());
    }
}
