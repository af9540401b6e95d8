//! The shared store: subscription tree, retained tree, session
//! registry, pending wills and the delayed session-removal queue.
//!
//! Locking: the two trees sit behind rwlocks (many concurrent
//! publishes, rare subscribe/unsubscribe); the registry, will list and
//! removal queue behind plain mutexes. Fan-out copies the recipient
//! set out under the read lock and delivers after releasing it, so a
//! tree lock is never held while a per-connection write-buffer mutex
//! is taken.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use embermq_core::packet::{self, reason, Publish};

use crate::connection::Connection;
use crate::persistence::{self, QueuedPacketRecord, RetainedRecord, SessionRecord};
use crate::retained::RetainedTree;
use crate::session::{QueuedPublish, Session};
use crate::subscription::{split_topic, ReceivingSubscriber, SubscriptionTree};

/// A last-will registration waiting to fire. The owning session holds
/// the strong reference; dropping it (reconnect) cancels the will.
pub struct WillMessage {
    pub publish: Publish,
    /// Seconds to hold the will back after the disconnect.
    pub delay: u32,
}

struct QueuedWill {
    session: Weak<Session>,
    will: Weak<WillMessage>,
    execute_at: Instant,
}

/// Delayed removal request for a persistent session. A no-op if the
/// client reconnects before it comes due.
struct QueuedSessionRemoval {
    session: Weak<Session>,
    expires_at: Instant,
}

pub struct Store {
    subscriptions: RwLock<SubscriptionTree>,
    retained: RwLock<RetainedTree>,
    sessions: Mutex<AHashMap<String, Arc<Session>>>,
    pending_wills: Mutex<Vec<QueuedWill>>,
    /// Sorted by `expires_at` ascending; reaping pops from the front.
    session_removals: Mutex<VecDeque<QueuedSessionRemoval>>,
}

pub type StoreHandle = Arc<Store>;

impl Store {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(SubscriptionTree::new()),
            retained: RwLock::new(RetainedTree::new()),
            sessions: Mutex::new(AHashMap::new()),
            pending_wills: Mutex::new(Vec::new()),
            session_removals: Mutex::new(VecDeque::new()),
        }
    }

    // === Sessions ===

    /// Bind `conn` to the session for `client_id`, creating or
    /// replacing it per `clean_start`, and kick whatever connection
    /// held the session before. Returns whether a previous session was
    /// resumed; the caller replays the queued messages after it has
    /// sent CONNACK.
    pub fn register_client_and_kick_existing_one(
        &self,
        conn: &mut Connection,
        client_id: &str,
        clean_start: bool,
        session_expiry_interval: u32,
    ) -> bool {
        let mut sessions = self.sessions.lock();

        if let Some(existing) = sessions.get(client_id) {
            if let Some(old_conn) = existing.current_connection() {
                if !Arc::ptr_eq(&old_conn, &conn.handle) {
                    if old_conn.protocol_version().is_v5() {
                        let _ =
                            old_conn.write_packet(&packet::disconnect(reason::SESSION_TAKEN_OVER));
                    }
                    old_conn.mark_disconnecting();
                    log::info!("session takeover for client '{}'", client_id);
                }
            }
        }

        let existing = sessions.get(client_id).cloned();
        let (session, session_present) = match existing {
            Some(existing) if !clean_start => (existing, true),
            _ => {
                let fresh = Arc::new(Session::new(client_id, session_expiry_interval));
                sessions.insert(client_id.to_string(), fresh.clone());
                (fresh, false)
            }
        };

        session.set_session_expiry_interval(session_expiry_interval);
        session.bind_connection(&conn.handle);
        conn.session = Some(session);

        session_present
    }

    #[allow(dead_code)] // Used by tests and handy for tooling.
    pub fn lookup_session(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(client_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Remove a session now (clean-session disconnect), unless it has
    /// already been replaced by a newer one for the same client id.
    pub fn remove_session(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.lock();
        if let Some(current) = sessions.get(session.client_id()) {
            if Arc::ptr_eq(current, session) {
                sessions.remove(session.client_id());
            }
        }
    }

    /// Schedule a session for removal once its expiry elapses.
    pub fn queue_session_removal(&self, session: &Arc<Session>, now: Instant) {
        let expires_at =
            now + Duration::from_secs(u64::from(session.session_expiry_interval()));
        let mut queue = self.session_removals.lock();
        // Most entries land at the back; walk from the rear to keep
        // the queue sorted when expiry intervals differ.
        let insert_at = queue
            .iter()
            .rposition(|entry| entry.expires_at <= expires_at)
            .map_or(0, |i| i + 1);
        queue.insert(
            insert_at,
            QueuedSessionRemoval {
                session: Arc::downgrade(session),
                expires_at,
            },
        );
    }

    /// Drop sessions whose removal came due and that were not rebound
    /// to a live connection in the meantime.
    pub fn remove_expired_sessions(&self, now: Instant) {
        loop {
            let entry = {
                let mut queue = self.session_removals.lock();
                let due = queue.front().is_some_and(|front| front.expires_at <= now);
                if due {
                    queue.pop_front()
                } else {
                    None
                }
            };
            let Some(entry) = entry else { break };
            let Some(session) = entry.session.upgrade() else {
                continue;
            };
            if !session.expired(now) {
                // Rebound, or its expiry was renegotiated; a newer
                // queue entry covers it.
                continue;
            }
            let mut sessions = self.sessions.lock();
            if let Some(current) = sessions.get(session.client_id()) {
                if Arc::ptr_eq(current, &session) {
                    log::debug!("removing expired session '{}'", session.client_id());
                    sessions.remove(session.client_id());
                }
            }
        }
    }

    // === Subscriptions ===

    pub fn add_subscription(&self, session: &Arc<Session>, subtopics: &[String], qos: u8) {
        self.subscriptions
            .write()
            .add_subscription(session, subtopics, qos);
    }

    pub fn remove_subscription(&self, client_id: &str, subtopics: &[String]) {
        self.subscriptions
            .write()
            .remove_subscription(client_id, subtopics);
    }

    /// Periodic sweep of expired weak sessions out of the tree.
    pub fn clean_subscriptions(&self) -> usize {
        self.subscriptions.write().clean_subscriptions()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().subscription_count()
    }

    // === Publish path ===

    /// Fan a publish out to every matching session. The recipient list
    /// is copied out under the read lock; delivery (which takes
    /// per-connection write-buffer mutexes) happens after release.
    pub fn queue_packet_at_subscribers(&self, publish: &Publish, max_qos_packets: usize) {
        let subtopics = split_topic(&publish.topic);
        let mut receivers: AHashMap<String, ReceivingSubscriber> = AHashMap::new();
        {
            let tree = self.subscriptions.read();
            tree.collect_receivers(&subtopics, &mut receivers);
        }

        for receiver in receivers.into_values() {
            let effective_qos = receiver.qos.min(publish.qos);
            receiver
                .session
                .deliver_publish(publish, effective_qos, max_qos_packets);
        }
    }

    /// Store or delete the retained message for this publish topic.
    pub fn set_retained_message(&self, publish: &Publish) {
        let subtopics = split_topic(&publish.topic);
        self.retained.write().set_retained_message(
            &publish.topic,
            &subtopics,
            publish.payload.clone(),
            publish.qos,
        );
    }

    /// Replay retained messages matching a fresh subscription. Copies
    /// the matches out under the read lock, then delivers.
    pub fn give_client_retained_messages(
        &self,
        session: &Arc<Session>,
        filter_subtopics: &[String],
        max_qos: u8,
        max_qos_packets: usize,
    ) {
        let mut messages = Vec::new();
        {
            let tree = self.retained.read();
            tree.collect_matching(filter_subtopics, &mut messages);
        }

        for message in messages {
            let effective_qos = message.qos.min(max_qos);
            let publish = Publish {
                topic: message.topic,
                payload: message.payload,
                qos: message.qos,
                retain: true,
            };
            session.deliver_publish(&publish, effective_qos, max_qos_packets);
        }
    }

    pub fn retained_count(&self) -> i64 {
        self.retained.read().retained_count()
    }

    // === Wills ===

    /// Queue a will for delivery. Immediate wills (no delay, or no
    /// session to park them on) publish right away; delayed wills wait
    /// on the pending list and die silently if the client returns.
    pub fn queue_will_message(
        &self,
        will: Arc<WillMessage>,
        session: Option<&Arc<Session>>,
        max_qos_packets: usize,
    ) {
        let session = match session {
            Some(session) if will.delay > 0 => session,
            _ => {
                self.publish_will(&will.publish, max_qos_packets);
                return;
            }
        };

        let execute_at = Instant::now() + Duration::from_secs(u64::from(will.delay));
        session.set_pending_will(will.clone());
        self.pending_wills.lock().push(QueuedWill {
            session: Arc::downgrade(session),
            will: Arc::downgrade(&will),
            execute_at,
        });
    }

    /// Fire due delayed wills.
    pub fn send_queued_will_messages(&self, now: Instant, max_qos_packets: usize) {
        let due: Vec<QueuedWill> = {
            let mut pending = self.pending_wills.lock();
            let mut due = Vec::new();
            pending.retain(|entry| {
                if entry.execute_at <= now {
                    due.push(QueuedWill {
                        session: entry.session.clone(),
                        will: entry.will.clone(),
                        execute_at: entry.execute_at,
                    });
                    false
                } else {
                    true
                }
            });
            due
        };

        for entry in due {
            // A dead weak ref means the client reconnected (or the
            // session was reaped) and the will was cancelled.
            let Some(will) = entry.will.upgrade() else {
                continue;
            };
            if let Some(session) = entry.session.upgrade() {
                match session.take_pending_will() {
                    Some(current) if Arc::ptr_eq(&current, &will) => {
                        self.publish_will(&will.publish, max_qos_packets);
                    }
                    Some(other) => session.set_pending_will(other),
                    None => {}
                }
            }
        }
    }

    fn publish_will(&self, publish: &Publish, max_qos_packets: usize) {
        if publish.retain {
            self.set_retained_message(publish);
        }
        let mut outgoing = publish.clone();
        outgoing.retain = false;
        self.queue_packet_at_subscribers(&outgoing, max_qos_packets);
    }

    // === Persistence ===

    pub fn save_state(&self, dir: &Path) -> std::io::Result<()> {
        let mut retained = Vec::new();
        self.retained.read().collect_all(&mut retained);
        let retained_records: Vec<RetainedRecord> = retained
            .into_iter()
            .map(|m| RetainedRecord {
                topic: m.topic,
                payload: m.payload.to_vec(),
                qos: m.qos,
            })
            .collect();
        persistence::save_retained(&retained_records, dir)?;

        // Subscriptions are reconstructed from the tree walk, grouped
        // by client id.
        let mut filters_by_client: AHashMap<String, Vec<(String, u8)>> = AHashMap::new();
        self.subscriptions.read().for_each_subscription(|client_id, filter, qos| {
            filters_by_client
                .entry(client_id.to_string())
                .or_default()
                .push((filter.to_string(), qos));
        });

        let sessions = self.sessions.lock();
        let session_records: Vec<SessionRecord> = sessions
            .values()
            .map(|session| SessionRecord {
                client_id: session.client_id().to_string(),
                session_expiry_interval: session.session_expiry_interval(),
                queued: session
                    .snapshot_queued()
                    .into_iter()
                    .map(|q| QueuedPacketRecord {
                        packet_id: q.packet_id,
                        topic: q.publish.topic,
                        payload: q.publish.payload.to_vec(),
                        qos: q.publish.qos,
                    })
                    .collect(),
                subscriptions: filters_by_client
                    .remove(session.client_id())
                    .unwrap_or_default(),
            })
            .collect();
        drop(sessions);

        persistence::save_sessions(&session_records, dir)?;
        log::info!(
            "saved state: {} retained messages, {} sessions",
            retained_records.len(),
            session_records.len()
        );
        Ok(())
    }

    pub fn load_state(&self, dir: &Path, now: Instant) -> std::io::Result<()> {
        let retained_records = persistence::load_retained(dir)?;
        let retained_count = retained_records.len();
        {
            let mut tree = self.retained.write();
            for record in retained_records {
                let subtopics = split_topic(&record.topic);
                tree.set_retained_message(
                    &record.topic,
                    &subtopics,
                    Bytes::from(record.payload),
                    record.qos,
                );
            }
        }

        let session_records = persistence::load_sessions(dir)?;
        let session_count = session_records.len();
        for record in session_records {
            let session = Arc::new(Session::new(
                record.client_id.clone(),
                record.session_expiry_interval,
            ));
            session.restore_queued(
                record
                    .queued
                    .into_iter()
                    .map(|q| QueuedPublish {
                        packet_id: q.packet_id,
                        publish: Publish::new(q.topic, q.payload, q.qos),
                    })
                    .collect(),
            );
            {
                let mut tree = self.subscriptions.write();
                for (filter, qos) in &record.subscriptions {
                    tree.add_subscription(&session, &split_topic(filter), *qos);
                }
            }
            self.sessions.lock().insert(record.client_id, session.clone());
            // Loaded sessions are offline; their expiry clock starts
            // now.
            self.queue_session_removal(&session, now);
        }

        log::info!(
            "loaded state: {} retained messages, {} sessions",
            retained_count,
            session_count
        );
        Ok(())
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::split_topic;

    fn store_session(store: &Store, id: &str, expiry: u32) -> Arc<Session> {
        let session = Arc::new(Session::new(id, expiry));
        store
            .sessions
            .lock()
            .insert(id.to_string(), session.clone());
        session
    }

    fn publish(topic: &str, payload: &'static [u8], qos: u8) -> Publish {
        Publish::new(topic, Bytes::from_static(payload), qos)
    }

    #[test]
    fn fanout_delivers_at_min_qos() {
        let store = Store::new();
        let session = store_session(&store, "c1", 300);
        store.add_subscription(&session, &split_topic("a/+/c"), 2);

        store.queue_packet_at_subscribers(&publish("a/b/c", b"hi", 1), 16);

        // Offline session: the QoS 1 publish is queued at
        // min(sub_qos=2, pub_qos=1) = 1.
        let queued = session.snapshot_queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].publish.qos, 1);

        store.queue_packet_at_subscribers(&publish("a/b/d", b"no", 1), 16);
        assert_eq!(session.snapshot_queued().len(), 1);
    }

    #[test]
    fn dollar_topics_do_not_match_plain_wildcards() {
        let store = Store::new();
        let wildcard = store_session(&store, "wild", 300);
        let explicit = store_session(&store, "sys", 300);
        store.add_subscription(&wildcard, &split_topic("#"), 1);
        store.add_subscription(&explicit, &split_topic("$SYS/#"), 1);

        store.queue_packet_at_subscribers(&publish("$SYS/x", b"1", 1), 16);

        assert!(wildcard.snapshot_queued().is_empty());
        assert_eq!(explicit.snapshot_queued().len(), 1);
    }

    #[test]
    fn retained_replay_after_delete_is_empty() {
        let store = Store::new();
        store.set_retained_message(&publish("a/b", b"1", 0));
        assert_eq!(store.retained_count(), 1);

        store.set_retained_message(&publish("a/b", b"", 0));
        assert_eq!(store.retained_count(), 0);

        let session = store_session(&store, "c1", 300);
        store.give_client_retained_messages(&session, &split_topic("a/#"), 1, 16);
        assert!(session.snapshot_queued().is_empty());
    }

    #[test]
    fn retained_replay_reaches_offline_queue() {
        let store = Store::new();
        store.set_retained_message(&publish("a/b", b"state", 1));

        let session = store_session(&store, "c1", 300);
        store.give_client_retained_messages(&session, &split_topic("a/+"), 2, 16);

        let queued = session.snapshot_queued();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].publish.retain);
    }

    #[test]
    fn expired_session_is_reaped() {
        let store = Store::new();
        let session = store_session(&store, "c1", 0);
        let now = Instant::now();
        store.queue_session_removal(&session, now);

        store.remove_expired_sessions(now + Duration::from_secs(1));
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn session_removal_is_noop_after_rebind() {
        let store = Store::new();
        let session = store_session(&store, "c1", 1);
        let now = Instant::now();
        store.queue_session_removal(&session, now);

        // The client reconnects before the removal comes due.
        let limits = crate::config::LimitsConfig::default();
        let handle = crate::connection::ConnectionHandle::new_detached(&limits);
        session.bind_connection(&handle);

        store.remove_expired_sessions(now + Duration::from_secs(5));
        assert!(store.lookup_session("c1").is_some());
    }

    #[test]
    fn session_removal_queue_stays_sorted() {
        let store = Store::new();
        let long = store_session(&store, "long", 3600);
        let short = store_session(&store, "short", 1);
        let now = Instant::now();

        store.queue_session_removal(&long, now);
        store.queue_session_removal(&short, now);

        {
            let queue = store.session_removals.lock();
            assert!(queue[0].expires_at <= queue[1].expires_at);
        }

        // Only the short-expiry session is reaped.
        store.remove_expired_sessions(now + Duration::from_secs(10));
        assert!(store.lookup_session("long").is_some());
        assert!(store.lookup_session("short").is_none());
    }

    #[test]
    fn delayed_will_fires_after_delay() {
        let store = Store::new();
        let subscriber = store_session(&store, "watcher", 300);
        store.add_subscription(&subscriber, &split_topic("wills/#"), 1);

        let owner = store_session(&store, "flaky", 300);
        let will = Arc::new(WillMessage {
            publish: publish("wills/flaky", b"gone", 1),
            delay: 5,
        });
        store.queue_will_message(will, Some(&owner), 16);

        let now = Instant::now();
        store.send_queued_will_messages(now, 16);
        assert!(subscriber.snapshot_queued().is_empty());

        store.send_queued_will_messages(now + Duration::from_secs(6), 16);
        assert_eq!(subscriber.snapshot_queued().len(), 1);
    }

    #[test]
    fn reconnect_cancels_delayed_will() {
        let store = Store::new();
        let subscriber = store_session(&store, "watcher", 300);
        store.add_subscription(&subscriber, &split_topic("wills/#"), 1);

        let owner = store_session(&store, "flaky", 300);
        let will = Arc::new(WillMessage {
            publish: publish("wills/flaky", b"gone", 1),
            delay: 5,
        });
        store.queue_will_message(will, Some(&owner), 16);

        // The client comes back: the session drops its strong ref.
        owner.take_pending_will();

        store.send_queued_will_messages(Instant::now() + Duration::from_secs(6), 16);
        assert!(subscriber.snapshot_queued().is_empty());
    }

    #[test]
    fn immediate_will_publishes_and_retains() {
        let store = Store::new();
        let mut will_publish = publish("wills/now", b"bye", 1);
        will_publish.retain = true;

        let will = Arc::new(WillMessage {
            publish: will_publish,
            delay: 0,
        });
        store.queue_will_message(will, None, 16);

        assert_eq!(store.retained_count(), 1);
    }

    #[test]
    fn takeover_kicks_existing_connection() {
        use crate::connection::{Connection, Transport};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let make_conn = |token: usize| {
            let std_stream = std::net::TcpStream::connect(addr).unwrap();
            std_stream.set_nonblocking(true).unwrap();
            let stream = mio::net::TcpStream::from_std(std_stream);
            Connection::new(
                mio::Token(token),
                Transport::plain(stream),
                addr,
                0,
                -1,
                &crate::config::LimitsConfig::default(),
            )
        };

        let store = Store::new();
        let mut first = make_conn(1);
        first.client_id = Some("dup".to_string());
        let present = store.register_client_and_kick_existing_one(&mut first, "dup", false, 300);
        assert!(!present);
        assert!(!first.handle.is_disconnecting());

        let mut second = make_conn(2);
        second.client_id = Some("dup".to_string());
        let present = store.register_client_and_kick_existing_one(&mut second, "dup", false, 300);
        assert!(present);

        // The old connection was kicked; only the new one is bound.
        assert!(first.handle.is_disconnecting());
        let session = store.lookup_session("dup").unwrap();
        let bound = session.current_connection().unwrap();
        assert!(Arc::ptr_eq(&bound, &second.handle));
    }

    #[test]
    fn state_roundtrip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new();

        store.set_retained_message(&publish("room/1", b"on", 1));
        let session = store_session(&store, "c1", 1234);
        store.add_subscription(&session, &split_topic("room/+"), 2);
        session.deliver_publish(&publish("room/1", b"queued", 1), 1, 16);

        store.save_state(dir.path()).unwrap();

        let restored = Store::new();
        restored.load_state(dir.path(), Instant::now()).unwrap();

        assert_eq!(restored.retained_count(), 1);
        let loaded = restored.lookup_session("c1").unwrap();
        assert_eq!(loaded.session_expiry_interval(), 1234);
        assert_eq!(loaded.snapshot_queued().len(), 1);
        assert_eq!(restored.subscription_count(), 1);

        // The restored subscription routes publishes again.
        restored.queue_packet_at_subscribers(&publish("room/1", b"again", 1), 16);
        assert_eq!(loaded.snapshot_queued().len(), 2);
    }
}
