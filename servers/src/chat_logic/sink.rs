use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use lib_chat::{ClientSink, DeliveryError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Write half of a `/receive` socket.
///
/// The read half keeps a clone of `closed` and flips it when the peer goes
/// away, so the delivery worker stops without attempting another send.
pub struct WsClientSink {
    sink: SplitSink<WebSocket, Message>,
    closed: Arc<AtomicBool>,
}

impl WsClientSink {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

impl ClientSink for WsClientSink {
    async fn send(&mut self, payload: Arc<str>) -> Result<(), DeliveryError> {
        match self.sink.send(Message::Text(payload.as_ref().into())).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.closed.store(true, Ordering::Release);
                Err(DeliveryError::Send(e.to_string()))
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Err(e) = self.sink.close().await {
            log::debug!("Closing client socket failed: {}", e);
        }
    }
}
