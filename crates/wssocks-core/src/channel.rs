//! Per-session channel registry.
//!
//! Maps channel identifiers to the bounded inbound queue of the endpoint
//! task that owns the tunneled connection. Each channel has exactly one
//! owner draining its queue; removal drops the sender, which the drain
//! task observes as end-of-channel and closes its socket on.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, WssocksError};
use crate::messages::{Protocol, UdpAddrs};

/// Bound of each channel's inbound queue, in frames.
pub const INBOUND_QUEUE_DEPTH: usize = 64;

/// An inbound event delivered to a channel's owner task.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A DATA frame's payload. `udp` is present for UDP associations.
    Data {
        data: Vec<u8>,
        udp: Option<UdpAddrs>,
    },
    /// The peer sent DISCONNECT for this channel.
    Disconnect,
}

struct ChannelEntry {
    protocol: Protocol,
    tx: mpsc::Sender<ChannelEvent>,
}

/// Session-local registry of active channels.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<Uuid, ChannelEntry>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel and hand back the receiving end of its inbound
    /// queue. Fails on a duplicate identifier.
    pub fn register(
        &self,
        channel_id: Uuid,
        protocol: Protocol,
    ) -> Result<mpsc::Receiver<ChannelEvent>> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let mut channels = self.channels.lock().unwrap();
        if channels.contains_key(&channel_id) {
            return Err(WssocksError::Protocol(format!(
                "duplicate channel {channel_id}"
            )));
        }
        channels.insert(channel_id, ChannelEntry { protocol, tx });
        Ok(rx)
    }

    pub fn protocol(&self, channel_id: &Uuid) -> Option<Protocol> {
        self.channels
            .lock()
            .unwrap()
            .get(channel_id)
            .map(|e| e.protocol)
    }

    fn sender(&self, channel_id: &Uuid) -> Option<mpsc::Sender<ChannelEvent>> {
        self.channels
            .lock()
            .unwrap()
            .get(channel_id)
            .map(|e| e.tx.clone())
    }

    /// Push an event without waiting. A full queue fails with the
    /// transient [`WssocksError::Backpressure`] kind, an unregistered
    /// channel with [`WssocksError::ChannelGone`]; either way the event
    /// comes back so the caller can yield and retry.
    pub fn try_deliver(
        &self,
        channel_id: Uuid,
        event: ChannelEvent,
    ) -> std::result::Result<(), (WssocksError, ChannelEvent)> {
        let Some(tx) = self.sender(&channel_id) else {
            return Err((
                WssocksError::ChannelGone(channel_id.to_string()),
                event,
            ));
        };
        match tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                Err((WssocksError::Backpressure, event))
            }
            Err(mpsc::error::TrySendError::Closed(event)) => Err((
                WssocksError::ChannelGone(channel_id.to_string()),
                event,
            )),
        }
    }

    /// Push an event onto the channel's bounded inbound queue.
    ///
    /// Backpressure is resolved here: on a full queue this call yields
    /// until the owner drains, which is what stalls the session read loop
    /// for the channel. Fails only with `ChannelGone`.
    pub async fn deliver(&self, channel_id: Uuid, event: ChannelEvent) -> Result<()> {
        match self.try_deliver(channel_id, event) {
            Ok(()) => Ok(()),
            Err((WssocksError::Backpressure, event)) => {
                debug!(channel = %channel_id, "inbound queue full, backpressuring");
                let Some(tx) = self.sender(&channel_id) else {
                    return Err(WssocksError::ChannelGone(channel_id.to_string()));
                };
                tx.send(event)
                    .await
                    .map_err(|_| WssocksError::ChannelGone(channel_id.to_string()))
            }
            Err((err, _)) => Err(err),
        }
    }

    /// Remove a channel. Idempotent: removing an unknown channel is a no-op.
    ///
    /// Dropping the sender ends the owner's queue, which closes the socket.
    pub fn remove(&self, channel_id: &Uuid) -> bool {
        self.channels.lock().unwrap().remove(channel_id).is_some()
    }

    /// Drop every channel. Invoked on session end.
    pub fn drain_all(&self) {
        let mut channels = self.channels.lock().unwrap();
        let n = channels.len();
        channels.clear();
        if n > 0 {
            debug!(count = n, "drained channel registry");
        }
    }

    pub fn len(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_deliver() {
        let reg = ChannelRegistry::new();
        let id = Uuid::new_v4();
        let mut rx = reg.register(id, Protocol::Tcp).unwrap();

        reg.deliver(
            id,
            ChannelEvent::Data {
                data: b"abc".to_vec(),
                udp: None,
            },
        )
        .await
        .unwrap();
        match rx.recv().await.unwrap() {
            ChannelEvent::Data { data, .. } => assert_eq!(data, b"abc"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let reg = ChannelRegistry::new();
        let id = Uuid::new_v4();
        let _rx = reg.register(id, Protocol::Tcp).unwrap();
        assert!(reg.register(id, Protocol::Tcp).is_err());
    }

    #[tokio::test]
    async fn deliver_unknown_channel_is_channel_gone() {
        let reg = ChannelRegistry::new();
        let id = Uuid::new_v4();
        let err = reg
            .deliver(id, ChannelEvent::Disconnect)
            .await
            .unwrap_err();
        assert!(matches!(err, WssocksError::ChannelGone(_)));

        match reg.try_deliver(id, ChannelEvent::Disconnect) {
            Err((WssocksError::ChannelGone(gone), _)) => {
                assert_eq!(gone, id.to_string());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_closes_queue() {
        let reg = ChannelRegistry::new();
        let id = Uuid::new_v4();
        let mut rx = reg.register(id, Protocol::Udp).unwrap();

        assert!(reg.remove(&id));
        assert!(!reg.remove(&id));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn drain_all_closes_every_queue() {
        let reg = ChannelRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = reg.register(a, Protocol::Tcp).unwrap();
        let mut rx_b = reg.register(b, Protocol::Tcp).unwrap();

        reg.drain_all();
        assert!(reg.is_empty());
        assert!(rx_a.recv().await.is_none());
        assert!(rx_b.recv().await.is_none());
    }

    #[tokio::test]
    async fn try_deliver_signals_backpressure_when_full() {
        let reg = ChannelRegistry::new();
        let id = Uuid::new_v4();
        let mut rx = reg.register(id, Protocol::Tcp).unwrap();

        for _ in 0..INBOUND_QUEUE_DEPTH {
            reg.try_deliver(
                id,
                ChannelEvent::Data {
                    data: vec![0],
                    udp: None,
                },
            )
            .unwrap();
        }

        // Full: the event comes back with the transient error kind.
        let event = match reg.try_deliver(
            id,
            ChannelEvent::Data {
                data: vec![1],
                udp: None,
            },
        ) {
            Err((WssocksError::Backpressure, event)) => event,
            other => panic!("unexpected outcome: {other:?}"),
        };

        // After the owner drains one slot the retry goes through.
        assert!(rx.recv().await.is_some());
        reg.try_deliver(id, event).unwrap();
    }

    #[tokio::test]
    async fn full_queue_backpressures_until_drained() {
        let reg = ChannelRegistry::new();
        let id = Uuid::new_v4();
        let mut rx = reg.register(id, Protocol::Tcp).unwrap();

        for _ in 0..INBOUND_QUEUE_DEPTH {
            reg.deliver(
                id,
                ChannelEvent::Data {
                    data: vec![0],
                    udp: None,
                },
            )
            .await
            .unwrap();
        }

        // The queue is full; the next deliver must wait for the drain below.
        let deliver = reg.deliver(
            id,
            ChannelEvent::Data {
                data: vec![1],
                udp: None,
            },
        );
        let drain = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            rx.recv().await
        };
        let (outcome, drained) = tokio::join!(deliver, drain);
        assert!(outcome.is_ok());
        assert!(drained.is_some());
    }
}
