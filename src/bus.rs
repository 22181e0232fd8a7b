// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message bus consumer contract.
//!
//! The capture side publishes each change event as one message: the key is
//! the target table name (raw bytes), the value a UTF-8 JSON document in
//! the [`crate::event::ChangeEvent`] wire shape. The apply engine consumes
//! through the [`BusConsumer`] trait and never touches broker specifics —
//! ordering within one zone's stream is the broker's contract, causal
//! verification is the engine's.
//!
//! [`ChannelBus`] is the in-process implementation: an mpsc-backed stream
//! used by the test suite and by hosts that feed events directly (e.g. a
//! co-located capture task).

use tokio::sync::mpsc;
use tracing::debug;

use crate::session::BoxFuture;

/// One message from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Target table name, raw bytes.
    pub key: Vec<u8>,
    /// UTF-8 JSON change event document.
    pub value: Vec<u8>,
}

impl BusMessage {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A consumer over one zone's ordered change stream.
pub trait BusConsumer: Send + 'static {
    /// Wait for the next message.
    ///
    /// Returns `Ok(None)` when the stream has ended (producer closed);
    /// errors are transport failures.
    fn poll(&mut self) -> BoxFuture<'_, Option<BusMessage>>;

    /// Close the consumer.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// In-process bus backed by a bounded channel.
pub struct ChannelBus {
    rx: mpsc::Receiver<BusMessage>,
}

impl ChannelBus {
    /// Create a sender/consumer pair with the given channel capacity.
    pub fn pair(capacity: usize) -> (mpsc::Sender<BusMessage>, ChannelBus) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, ChannelBus { rx })
    }
}

impl BusConsumer for ChannelBus {
    fn poll(&mut self) -> BoxFuture<'_, Option<BusMessage>> {
        Box::pin(async move { Ok(self.rx.recv().await) })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.rx.close();
            debug!("channel bus closed");
            Ok(())
        })
    }
}
