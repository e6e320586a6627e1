//! Transport abstraction.
//!
//! The sync protocol runs over any bidirectional, reliable, ordered byte
//! message duplex. The in-memory pair backs the tests; real deployments
//! plug in whatever framing their network stack provides.

use crate::wire::{self, SyncMessage};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};

#[async_trait]
pub trait Transport: Send {
    /// Sends one message. Resolves once the write has drained, which is the
    /// protocol's cooperative flow control.
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()>;
    /// Receives the next message. `None` means the peer closed.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;
    async fn close(&mut self) -> Result<()>;
}

/// One end of an in-memory duplex.
pub struct MemoryTransport {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Creates a connected pair of in-memory transports.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (atx, brx) = mpsc::channel(64);
    let (btx, arx) = mpsc::channel(64);
    (
        MemoryTransport { tx: atx, rx: arx },
        MemoryTransport { tx: btx, rx: brx },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.tx
            .send(bytes)
            .await
            .map_err(|_| anyhow!("transport closed"))
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.next().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx.close_channel();
        self.rx.close();
        Ok(())
    }
}

/// Sends a [`SyncMessage`] over a transport.
pub async fn send_msg(transport: &mut dyn Transport, msg: &SyncMessage) -> Result<()> {
    transport.send(wire::encode_message(msg)).await
}

/// Receives and decodes the next [`SyncMessage`]. `None` when closed.
pub async fn recv_msg(transport: &mut dyn Transport) -> Result<Option<SyncMessage>> {
    match transport.recv().await? {
        Some(bytes) => Ok(Some(wire::decode_message(&bytes)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Payload, Unsubscribe};

    #[async_std::test]
    async fn pair_roundtrip() {
        let (mut a, mut b) = memory_pair();
        let msg = SyncMessage {
            v: 0,
            doc_id: "doc".into(),
            payload: Some(Payload::Unsubscribe(Unsubscribe { subscription_id: 7 })),
        };
        send_msg(&mut a, &msg).await.unwrap();
        let got = recv_msg(&mut b).await.unwrap().unwrap();
        assert_eq!(got, msg);

        a.close().await.unwrap();
        assert!(recv_msg(&mut b).await.unwrap().is_none());
    }
}
