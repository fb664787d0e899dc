//! Datagram sessions.
//!
//! A datagram session is allocated by the server over a short control
//! exchange (`UdpRequest` / `UdpResponse`) and then carries UDP payloads as
//! QUIC datagrams tagged with its session id. One dispatcher task per
//! connection reads every inbound datagram and routes it to the owning
//! session's queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use quinn::{Connection, RecvStream, SendDatagramError, SendStream};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::UdpMessage;

/// Inbound messages buffered per session before new ones are dropped.
pub const SESSION_QUEUE_SIZE: usize = 1024;

/// Routing table from session id to the session's inbound queue.
#[derive(Debug, Default)]
pub(crate) struct SessionTable {
    queues: Mutex<HashMap<u32, mpsc::Sender<UdpMessage>>>,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, mpsc::Sender<UdpMessage>>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a session id and returns its inbound queue.
    pub(crate) fn register(&self, id: u32) -> Result<mpsc::Receiver<UdpMessage>> {
        let mut queues = self.lock();
        if queues.contains_key(&id) {
            return Err(Error::DatagramUnsupported(format!(
                "server reused datagram session id {}",
                id
            )));
        }
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_SIZE);
        queues.insert(id, tx);
        Ok(rx)
    }

    pub(crate) fn remove(&self, id: u32) {
        self.lock().remove(&id);
    }

    /// Routes an inbound message. Returns false if it was dropped.
    pub(crate) fn deliver(&self, msg: UdpMessage) -> bool {
        let mut queues = self.lock();
        let Some(tx) = queues.get(&msg.session_id) else {
            tracing::trace!(session_id = msg.session_id, "datagram for unknown session");
            return false;
        };
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::trace!(session_id = msg.session_id, "datagram queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(msg)) => {
                queues.remove(&msg.session_id);
                false
            }
        }
    }

    /// Drops every queue so pending receivers observe the end of the session.
    pub(crate) fn close_all(&self) {
        self.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Reads datagrams off `connection` until it closes, routing them by session id.
pub(crate) async fn dispatch(connection: Connection, table: Arc<SessionTable>) {
    loop {
        match connection.read_datagram().await {
            Ok(datagram) => match UdpMessage::decode(&datagram) {
                Ok(msg) => {
                    table.deliver(msg);
                }
                Err(e) => {
                    tracing::debug!(error = %e, len = datagram.len(), "invalid datagram");
                }
            },
            Err(e) => {
                tracing::debug!(reason = %e, "datagram dispatcher stopped");
                break;
            }
        }
    }
    table.close_all();
}

/// One datagram session over the tunnel.
///
/// Packets for this session travel as unreliable QUIC datagrams; nothing
/// is retransmitted or reordered. Cheap to share behind an `Arc` between
/// a sending and a receiving task.
#[derive(Debug)]
pub struct UdpSession {
    id: u32,
    connection: Connection,
    table: Arc<SessionTable>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<UdpMessage>>,
    // Held open for the life of the session; finishing it releases the id
    // on the server.
    control: Mutex<Option<(SendStream, RecvStream)>>,
    closed: AtomicBool,
}

impl UdpSession {
    pub(crate) fn new(
        id: u32,
        connection: Connection,
        table: Arc<SessionTable>,
        inbound: mpsc::Receiver<UdpMessage>,
        control: (SendStream, RecvStream),
    ) -> Self {
        Self {
            id,
            connection,
            table,
            inbound: tokio::sync::Mutex::new(inbound),
            control: Mutex::new(Some(control)),
            closed: AtomicBool::new(false),
        }
    }

    /// Session id assigned by the server.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Largest payload that fits in one datagram when addressed to `addr`.
    pub fn max_payload_size(&self, addr: &str) -> Option<usize> {
        let overhead = UdpMessage {
            session_id: self.id,
            addr: addr.to_string(),
            payload: Bytes::new(),
        }
        .encoded_len();
        self.connection
            .max_datagram_size()
            .map(|max| max.saturating_sub(overhead))
    }

    /// Sends `payload` to `addr` (host:port) through the tunnel.
    pub fn send(&self, addr: &str, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let msg = UdpMessage {
            session_id: self.id,
            addr: addr.to_string(),
            payload: Bytes::copy_from_slice(payload),
        };
        let size = msg.encoded_len();
        let max = self.connection.max_datagram_size().ok_or_else(|| {
            Error::DatagramUnsupported("peer does not accept datagrams".to_string())
        })?;
        if size > max {
            return Err(Error::DatagramTooLarge { size, max });
        }

        let mut buf = BytesMut::with_capacity(size);
        msg.encode(&mut buf);
        self.connection
            .send_datagram(buf.freeze())
            .map_err(|e| match e {
                SendDatagramError::TooLarge => Error::DatagramTooLarge { size, max },
                SendDatagramError::ConnectionLost(_) => Error::Closed,
                other => Error::DatagramUnsupported(other.to_string()),
            })
    }

    /// Waits for the next inbound packet, returning its source address and payload.
    ///
    /// Fails with [`Error::Closed`] once the session or the tunnel is closed.
    pub async fn recv(&self) -> Result<(String, Bytes)> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(msg) if !self.is_closed() => Ok((msg.addr, msg.payload)),
            _ => Err(Error::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.connection.close_reason().is_some()
    }

    /// Releases the session. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.table.remove(self.id);
        let control = self
            .control
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((mut send, _recv)) = control {
            let _ = send.finish();
        }
        tracing::debug!(session_id = self.id, "datagram session closed");
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(session_id: u32, payload: &'static [u8]) -> UdpMessage {
        UdpMessage {
            session_id,
            addr: "1.1.1.1:53".to_string(),
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_deliver_routes_by_session_id() {
        let table = SessionTable::new();
        let mut a = table.register(1).unwrap();
        let mut b = table.register(2).unwrap();

        assert!(table.deliver(message(2, b"to-b")));
        assert!(table.deliver(message(1, b"to-a")));

        assert_eq!(a.recv().await.unwrap().payload, Bytes::from_static(b"to-a"));
        assert_eq!(b.recv().await.unwrap().payload, Bytes::from_static(b"to-b"));
    }

    #[tokio::test]
    async fn test_deliver_preserves_order_within_session() {
        let table = SessionTable::new();
        let mut rx = table.register(9).unwrap();
        for payload in [&b"1"[..], b"2", b"3"] {
            table.deliver(UdpMessage {
                session_id: 9,
                addr: "x:1".to_string(),
                payload: Bytes::copy_from_slice(payload),
            });
        }
        for expected in [&b"1"[..], b"2", b"3"] {
            assert_eq!(&rx.recv().await.unwrap().payload[..], expected);
        }
    }

    #[test]
    fn test_unknown_session_is_dropped() {
        let table = SessionTable::new();
        assert!(!table.deliver(message(42, b"lost")));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let table = SessionTable::new();
        let _rx = table.register(5).unwrap();
        assert!(matches!(
            table.register(5),
            Err(Error::DatagramUnsupported(_))
        ));
    }

    #[test]
    fn test_full_queue_drops() {
        let table = SessionTable::new();
        let _rx = table.register(1).unwrap();
        for _ in 0..SESSION_QUEUE_SIZE {
            assert!(table.deliver(message(1, b"x")));
        }
        assert!(!table.deliver(message(1, b"overflow")));
    }

    #[test]
    fn test_closed_receiver_is_unregistered() {
        let table = SessionTable::new();
        drop(table.register(3).unwrap());
        assert!(!table.deliver(message(3, b"x")));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_close_all_ends_receivers() {
        let table = SessionTable::new();
        let mut rx = table.register(1).unwrap();
        table.close_all();
        assert!(rx.recv().await.is_none());
    }
}
