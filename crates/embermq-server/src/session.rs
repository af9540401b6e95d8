//! Durable per-client state.
//!
//! A session outlives its connection when the client asked for a
//! persistent session. The session owns the offline queue of QoS>0
//! messages and the in-flight packet-id table; the connection holds a
//! strong reference to its session while the session only holds a weak
//! one back, which breaks the ownership cycle and makes takeover a
//! single pointer swap.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;

use embermq_core::packet::{self, Publish};

use crate::connection::ConnectionHandle;
use crate::store::WillMessage;

/// A QoS>0 message parked for an offline session.
#[derive(Debug, Clone)]
pub struct QueuedPublish {
    pub packet_id: u16,
    pub publish: Publish,
}

#[derive(Default)]
struct SessionQueues {
    /// Waiting for the client to come back.
    queued: VecDeque<QueuedPublish>,
    /// Sent to a live connection, waiting for the ack.
    in_flight: AHashMap<u16, Publish>,
}

pub struct Session {
    client_id: String,
    connection: Mutex<Weak<ConnectionHandle>>,
    queues: Mutex<SessionQueues>,
    next_packet_id: AtomicU16,
    session_expiry_interval: AtomicU32,
    last_activity: Mutex<Instant>,
    disconnected_at: Mutex<Option<Instant>>,
    /// Will kept alive until it fires or the client reconnects.
    pending_will: Mutex<Option<Arc<WillMessage>>>,
}

impl Session {
    pub fn new(client_id: impl Into<String>, session_expiry_interval: u32) -> Self {
        Self {
            client_id: client_id.into(),
            connection: Mutex::new(Weak::new()),
            queues: Mutex::new(SessionQueues::default()),
            next_packet_id: AtomicU16::new(1),
            session_expiry_interval: AtomicU32::new(session_expiry_interval),
            last_activity: Mutex::new(Instant::now()),
            disconnected_at: Mutex::new(Some(Instant::now())),
            pending_will: Mutex::new(None),
        }
    }

    #[inline]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn touch(&self, now: Instant) {
        *self.last_activity.lock() = now;
    }

    pub fn session_expiry_interval(&self) -> u32 {
        self.session_expiry_interval.load(Ordering::Relaxed)
    }

    pub fn set_session_expiry_interval(&self, seconds: u32) {
        self.session_expiry_interval.store(seconds, Ordering::Relaxed);
    }

    /// Bind a new connection, displacing whatever was bound before.
    /// The swap is atomic under the mutex, so a takeover invalidates
    /// the old weak handle in the same step.
    pub fn bind_connection(&self, handle: &Arc<ConnectionHandle>) {
        *self.connection.lock() = Arc::downgrade(handle);
        *self.disconnected_at.lock() = None;
        // A returning client cancels any pending will.
        self.pending_will.lock().take();
    }

    /// Drop the binding, but only if `handle` is still the bound one;
    /// a takeover may already have replaced it.
    pub fn unbind_connection(&self, handle: &Arc<ConnectionHandle>) {
        let mut bound = self.connection.lock();
        if bound.upgrade().is_some_and(|current| Arc::ptr_eq(&current, handle)) {
            *bound = Weak::new();
            *self.disconnected_at.lock() = Some(Instant::now());
        }
    }

    /// The live connection, if one is bound and not on its way out.
    pub fn current_connection(&self) -> Option<Arc<ConnectionHandle>> {
        self.connection
            .lock()
            .upgrade()
            .filter(|conn| !conn.is_disconnecting())
    }

    /// True when the session has been offline longer than its expiry.
    pub fn expired(&self, now: Instant) -> bool {
        if self.current_connection().is_some() {
            return false;
        }
        let disconnected_at = self.disconnected_at.lock();
        match *disconnected_at {
            Some(at) => {
                let expiry = Duration::from_secs(u64::from(self.session_expiry_interval()));
                at + expiry <= now
            }
            None => false,
        }
    }

    /// Packet ids 1..=65535; 0 is invalid on the wire.
    pub fn next_packet_id(&self) -> u16 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Deliver one publication to this session at `effective_qos`.
    ///
    /// With a live connection the packet goes straight into that
    /// connection's write buffer; a failure there disconnects the
    /// receiver, never the publisher. Without a connection, QoS 0 is
    /// dropped and QoS>0 is parked up to `max_qos_packets` with
    /// tail-drop beyond that.
    pub fn deliver_publish(&self, publish: &Publish, effective_qos: u8, max_qos_packets: usize) {
        // The stored copy carries the effective QoS; the original may
        // have been published higher than this subscription asked for.
        let mut effective = publish.clone();
        effective.qos = effective_qos;

        if let Some(conn) = self.current_connection() {
            let packet_id = if effective_qos > 0 {
                let id = self.next_packet_id();
                self.queues.lock().in_flight.insert(id, effective.clone());
                Some(id)
            } else {
                None
            };
            let pkt = packet::publish_packet(
                &effective,
                effective_qos,
                packet_id,
                effective.retain,
                conn.protocol_version(),
            );
            conn.write_packet_blaming_receiver(&pkt);
            return;
        }

        if effective_qos == 0 {
            return;
        }

        let mut queues = self.queues.lock();
        if queues.queued.len() >= max_qos_packets {
            log::warn!(
                "session '{}' queue full ({} messages), dropping QoS {} publish to '{}'",
                self.client_id,
                max_qos_packets,
                effective_qos,
                publish.topic
            );
            return;
        }
        let packet_id = self.next_packet_id();
        queues.queued.push_back(QueuedPublish {
            packet_id,
            publish: effective,
        });
    }

    /// PUBACK / PUBREC for an in-flight packet id. Returns whether the
    /// id was known.
    pub fn acknowledge(&self, packet_id: u16) -> bool {
        self.queues.lock().in_flight.remove(&packet_id).is_some()
    }

    /// Flush the offline queue to a freshly bound connection. The
    /// messages move to the in-flight table until acked.
    pub fn drain_queued_messages(&self, conn: &Arc<ConnectionHandle>) {
        let mut queues = self.queues.lock();
        while let Some(entry) = queues.queued.pop_front() {
            let pkt = packet::publish_packet(
                &entry.publish,
                entry.publish.qos,
                Some(entry.packet_id),
                entry.publish.retain,
                conn.protocol_version(),
            );
            queues.in_flight.insert(entry.packet_id, entry.publish);
            conn.write_packet_blaming_receiver(&pkt);
            if conn.is_disconnecting() {
                break;
            }
        }
    }

    pub fn set_pending_will(&self, will: Arc<WillMessage>) {
        *self.pending_will.lock() = Some(will);
    }

    pub fn take_pending_will(&self) -> Option<Arc<WillMessage>> {
        self.pending_will.lock().take()
    }

    /// Queued messages, for persistence. In-flight messages are folded
    /// back in: unacked means undelivered as far as the broker knows.
    pub fn snapshot_queued(&self) -> Vec<QueuedPublish> {
        let queues = self.queues.lock();
        let mut out: Vec<QueuedPublish> = queues
            .in_flight
            .iter()
            .map(|(&packet_id, publish)| QueuedPublish {
                packet_id,
                publish: publish.clone(),
            })
            .collect();
        out.extend(queues.queued.iter().cloned());
        out
    }

    /// Restore queued messages from persistence.
    pub fn restore_queued(&self, messages: Vec<QueuedPublish>) {
        let mut queues = self.queues.lock();
        for entry in messages {
            queues.queued.push_back(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn publish(topic: &str, qos: u8) -> Publish {
        Publish::new(topic, Bytes::from_static(b"payload"), qos)
    }

    #[test]
    fn offline_qos0_is_dropped() {
        let session = Session::new("c1", 300);
        session.deliver_publish(&publish("a/b", 0), 0, 16);
        assert!(session.snapshot_queued().is_empty());
    }

    #[test]
    fn offline_qos1_is_queued_with_tail_drop() {
        let session = Session::new("c1", 300);
        for i in 0..20 {
            session.deliver_publish(&publish(&format!("t/{}", i), 1), 1, 16);
        }
        let queued = session.snapshot_queued();
        assert_eq!(queued.len(), 16);
        // Oldest messages survive; the excess was dropped at the tail.
        assert_eq!(queued[0].publish.topic, "t/0");
        assert_eq!(queued[15].publish.topic, "t/15");
    }

    #[test]
    fn acknowledge_unknown_id_is_false() {
        let session = Session::new("c1", 300);
        assert!(!session.acknowledge(42));
    }

    #[test]
    fn packet_ids_skip_zero() {
        let session = Session::new("c1", 300);
        session.next_packet_id.store(65_534, Ordering::Relaxed);
        assert_eq!(session.next_packet_id(), 65_534);
        assert_eq!(session.next_packet_id(), 65_535);
        let wrapped = session.next_packet_id();
        assert_ne!(wrapped, 0);
    }

    #[test]
    fn expiry_counts_from_disconnect() {
        let session = Session::new("c1", 0);
        // Freshly created with no connection: expiry interval 0 means
        // it is already reapable.
        assert!(session.expired(Instant::now() + Duration::from_millis(1)));

        let session = Session::new("c1", 3600);
        assert!(!session.expired(Instant::now()));
        assert!(session.expired(Instant::now() + Duration::from_secs(3601)));
    }

    #[test]
    fn rebind_displaces_previous_connection() {
        let limits = crate::config::LimitsConfig::default();
        let session = Session::new("c1", 300);
        let first = crate::connection::ConnectionHandle::new_detached(&limits);
        let second = crate::connection::ConnectionHandle::new_detached(&limits);

        session.bind_connection(&first);
        session.bind_connection(&second);

        let bound = session.current_connection().unwrap();
        assert!(Arc::ptr_eq(&bound, &second));

        // Unbinding the displaced handle is a no-op.
        session.unbind_connection(&first);
        assert!(session.current_connection().is_some());

        session.unbind_connection(&second);
        assert!(session.current_connection().is_none());
    }

    #[test]
    fn restore_roundtrip() {
        let session = Session::new("c1", 300);
        session.deliver_publish(&publish("x/y", 2), 2, 16);
        let snapshot = session.snapshot_queued();

        let restored = Session::new("c1", 300);
        restored.restore_queued(snapshot);
        assert_eq!(restored.snapshot_queued().len(), 1);
        assert_eq!(restored.snapshot_queued()[0].publish.qos, 2);
    }
}
