//! Worker thread event loop.
//!
//! Each worker owns its own `mio::Poll` and the connections pinned to
//! it; only this thread reads those sockets and advances their read
//! buffers. Cross-thread publish delivery writes directly into a
//! target connection's buffer through its [`ConnectionHandle`] and
//! nudges epoll from there, so the control channel carries only new
//! connections and shutdown.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam_channel::Receiver;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use embermq_core::codec::{MqttPacket, PacketType};
use embermq_core::error::{Error, ProtocolError, Result};
use embermq_core::packet::{self, reason, Publish};

use crate::config::Config;
use crate::connection::{Connection, ConnectionState, Transport};
use crate::store::{StoreHandle, WillMessage};
use crate::subscription::{split_topic, valid_subscribe_filter};

/// Control messages from the accept loop.
pub enum WorkerMsg {
    NewConnection { stream: TcpStream, addr: SocketAddr },
    Shutdown,
}

/// First token handed to a client connection.
const CLIENT_START: usize = 1;

const POLL_TIMEOUT: Duration = Duration::from_millis(10);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);
const TREE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Worker {
    id: usize,
    poll: Poll,
    epoll_fd: i32,
    connections: AHashMap<Token, Connection>,
    next_token: usize,
    store: StoreHandle,
    rx: Receiver<WorkerMsg>,
    config: Arc<Config>,
    /// Reused between reads to avoid per-batch allocation.
    packet_queue: Vec<MqttPacket>,
    last_housekeeping: Instant,
    last_tree_cleanup: Instant,
    /// Counter for broker-assigned client ids.
    next_generated_id: u64,
}

impl Worker {
    pub fn new(
        id: usize,
        store: StoreHandle,
        rx: Receiver<WorkerMsg>,
        config: Arc<Config>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let epoll_fd = poll.as_raw_fd();

        Ok(Self {
            id,
            poll,
            epoll_fd,
            connections: AHashMap::new(),
            next_token: CLIENT_START,
            store,
            rx,
            config,
            packet_queue: Vec::with_capacity(64),
            last_housekeeping: Instant::now(),
            last_tree_cleanup: Instant::now(),
            next_generated_id: 1,
        })
    }

    /// Blocking event loop; returns on shutdown.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        loop {
            if self.run_once(&mut events)? {
                return Ok(());
            }
        }
    }

    /// One event-loop iteration. Returns true on shutdown.
    pub fn run_once(&mut self, events: &mut Events) -> io::Result<bool> {
        self.poll.poll(events, Some(POLL_TIMEOUT))?;

        for event in events.iter() {
            let token = event.token();

            if event.is_error() || event.is_read_closed() || event.is_write_closed() {
                if let Some(conn) = self.connections.get_mut(&token) {
                    conn.set_disconnect_reason("socket error or hangup");
                    conn.mark_as_disconnecting();
                }
                continue;
            }

            if event.is_readable() {
                self.handle_readable(token);
            }
            if event.is_writable() {
                self.handle_writable(token);
            }
        }

        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                WorkerMsg::NewConnection { stream, addr } => {
                    match self.accept_connection(stream, addr) {
                        // Edge-triggered epoll won't report bytes that
                        // arrived before registration, so read once
                        // right away.
                        Ok(token) => self.handle_readable(token),
                        Err(e) => log::warn!("worker {}: accept failed: {}", self.id, e),
                    }
                }
                WorkerMsg::Shutdown => return Ok(true),
            }
        }

        self.cleanup_connections();

        if self.last_housekeeping.elapsed() >= HOUSEKEEPING_INTERVAL {
            self.housekeeping();
        }

        Ok(false)
    }

    fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;

        let mut transport = Transport::plain(stream);
        self.poll
            .registry()
            .register(transport.tcp_stream_mut(), token, Interest::READABLE)?;

        let conn = Connection::new(
            token,
            transport,
            addr,
            self.id,
            self.epoll_fd,
            &self.config.limits,
        );
        self.connections.insert(token, conn);
        log::debug!("worker {}: new connection from {}", self.id, addr);
        Ok(token)
    }

    fn handle_readable(&mut self, token: Token) {
        {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            if conn.state == ConnectionState::Disconnecting {
                return;
            }
            if let Err(e) = conn.read_socket() {
                conn.set_disconnect_reason(&format!("read: {}", e));
                conn.mark_as_disconnecting();
                return;
            }
        }
        self.process_read_buffer(token);
    }

    fn handle_writable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if let Err(e) = conn.flush() {
            conn.set_disconnect_reason(&format!("write: {}", e));
            conn.mark_as_disconnecting();
        }
    }

    /// Frame and dispatch everything the read buffer holds.
    fn process_read_buffer(&mut self, token: Token) {
        let mut packets = std::mem::take(&mut self.packet_queue);
        packets.clear();

        let framed = {
            let Some(conn) = self.connections.get_mut(&token) else {
                self.packet_queue = packets;
                return;
            };
            conn.frame_packets(&mut packets)
        };
        if let Err(e) = framed {
            self.fail_connection(token, &e);
            self.packet_queue = packets;
            return;
        }

        for pkt in packets.drain(..) {
            let still_here = self
                .connections
                .get(&token)
                .is_some_and(|c| c.state != ConnectionState::Disconnecting);
            if !still_here {
                break;
            }
            if let Err(e) = self.handle_packet(token, pkt) {
                self.fail_connection(token, &e);
                break;
            }
        }

        self.packet_queue = packets;
    }

    /// Apply the error policy: MQTT 5 clients get a DISCONNECT with a
    /// reason code, older clients just get the socket closed.
    fn fail_connection(&mut self, token: Token, error: &Error) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if let Error::Protocol(protocol_error) = error {
            if conn.protocol_version.is_v5() {
                let _ = conn
                    .handle
                    .write_packet(&packet::disconnect(protocol_error.disconnect_reason()));
            }
        }
        conn.set_disconnect_reason(&error.to_string());
        conn.mark_as_disconnecting();
    }

    fn handle_packet(&mut self, token: Token, pkt: MqttPacket) -> Result<()> {
        let Some(state) = self.connections.get(&token).map(|c| c.state) else {
            return Ok(());
        };

        if pkt.packet_type == PacketType::Connect {
            if state != ConnectionState::Connecting {
                // A second CONNECT on a live connection is a protocol
                // violation.
                return Err(ProtocolError::UnexpectedPacket.into());
            }
            return self.handle_connect(token, &pkt);
        }

        if state == ConnectionState::Connecting {
            return Err(ProtocolError::FirstPacketNotConnect.into());
        }
        if state == ConnectionState::Disconnecting {
            return Ok(());
        }

        match pkt.packet_type {
            PacketType::Publish => self.handle_publish(token, &pkt),
            PacketType::Puback | PacketType::Pubcomp => {
                let packet_id = packet::parse_packet_id(&pkt)?;
                if let Some(conn) = self.connections.get(&token) {
                    if let Some(session) = &conn.session {
                        session.acknowledge(packet_id);
                    }
                }
                Ok(())
            }
            PacketType::Pubrec => {
                let packet_id = packet::parse_packet_id(&pkt)?;
                if let Some(conn) = self.connections.get(&token) {
                    if let Some(session) = &conn.session {
                        session.acknowledge(packet_id);
                    }
                    let _ = conn
                        .handle
                        .write_packet(&packet::pub_response(PacketType::Pubrel, packet_id));
                }
                Ok(())
            }
            PacketType::Pubrel => {
                let packet_id = packet::parse_packet_id(&pkt)?;
                if let Some(conn) = self.connections.get_mut(&token) {
                    conn.incoming_qos2.remove(&packet_id);
                    let _ = conn
                        .handle
                        .write_packet(&packet::pub_response(PacketType::Pubcomp, packet_id));
                }
                Ok(())
            }
            PacketType::Subscribe => self.handle_subscribe(token, &pkt),
            PacketType::Unsubscribe => self.handle_unsubscribe(token, &pkt),
            PacketType::Pingreq => {
                if let Some(conn) = self.connections.get_mut(&token) {
                    if conn.handle.write_ping_resp().is_err() {
                        conn.mark_as_disconnecting();
                    }
                }
                Ok(())
            }
            PacketType::Disconnect => {
                self.handle_disconnect(token, &pkt);
                Ok(())
            }
            _ => Err(ProtocolError::UnexpectedPacket.into()),
        }
    }

    fn handle_connect(&mut self, token: Token, pkt: &MqttPacket) -> Result<()> {
        let connect = packet::parse_connect(pkt)?;
        let generated_id = format!("embermq-{}-{}", self.id, self.next_generated_id);

        let Some(conn) = self.connections.get_mut(&token) else {
            return Ok(());
        };

        conn.protocol_version = connect.protocol_version;
        conn.handle.set_protocol_version(connect.protocol_version);

        let client_id = if connect.client_id.is_empty() {
            // Older protocol levels require a client id when the
            // session is persistent [MQTT-3.1.3-8].
            if !connect.clean_start && !connect.protocol_version.is_v5() {
                let ack = packet::conn_ack(
                    connect.protocol_version,
                    reason::CLIENT_ID_NOT_VALID,
                    false,
                );
                let _ = conn.handle.write_packet(&ack);
                conn.set_disconnect_reason("empty client id with persistent session");
                conn.mark_as_disconnecting();
                return Ok(());
            }
            self.next_generated_id += 1;
            generated_id
        } else {
            connect.client_id.clone()
        };

        let session_expiry = connect
            .session_expiry_interval
            .unwrap_or(self.config.session.session_expiry_interval);

        conn.client_id = Some(client_id.clone());
        conn.username = connect.username.clone();
        conn.keep_alive = connect.keep_alive;
        conn.clean_session = connect.clean_start;
        conn.will = connect.will.clone();
        conn.state = ConnectionState::Connected;
        conn.last_activity = Instant::now();

        let session_present = self.store.register_client_and_kick_existing_one(
            conn,
            &client_id,
            connect.clean_start,
            session_expiry,
        );

        let ack = packet::conn_ack(connect.protocol_version, reason::SUCCESS, session_present);
        if conn.handle.write_packet(&ack).is_err() {
            conn.set_disconnect_reason("failed to queue CONNACK");
            conn.mark_as_disconnecting();
            return Ok(());
        }

        log::info!(
            "client connected: {} (protocol {:?}, keepalive {}s, clean={})",
            conn,
            connect.protocol_version,
            connect.keep_alive,
            connect.clean_start
        );

        // Resume the session queue only after CONNACK is in the buffer.
        if session_present {
            if let Some(session) = conn.session.clone() {
                session.drain_queued_messages(&conn.handle);
            }
        }

        Ok(())
    }

    fn handle_publish(&mut self, token: Token, pkt: &MqttPacket) -> Result<()> {
        let Some(conn) = self.connections.get_mut(&token) else {
            return Ok(());
        };
        let incoming = packet::parse_publish(pkt, conn.protocol_version)?;
        let mut publish = incoming.publish;

        match (publish.qos, incoming.packet_id) {
            (1, Some(packet_id)) => {
                let _ = conn
                    .handle
                    .write_packet(&packet::pub_response(PacketType::Puback, packet_id));
            }
            (2, Some(packet_id)) => {
                let _ = conn
                    .handle
                    .write_packet(&packet::pub_response(PacketType::Pubrec, packet_id));
                if !conn.incoming_qos2.insert(packet_id) {
                    // Redelivery of an id we already forwarded; ack
                    // again but don't fan out twice.
                    return Ok(());
                }
            }
            _ => {}
        }

        if publish.retain {
            self.store.set_retained_message(&publish);
        }

        // Live forwards never carry the retain flag [MQTT-3.3.1-9].
        publish.retain = false;
        self.store
            .queue_packet_at_subscribers(&publish, self.config.limits.max_qos_packets);

        Ok(())
    }

    fn handle_subscribe(&mut self, token: Token, pkt: &MqttPacket) -> Result<()> {
        let Some(conn) = self.connections.get(&token) else {
            return Ok(());
        };
        let version = conn.protocol_version;
        let subscribe = packet::parse_subscribe(pkt, version)?;
        let Some(session) = conn.session.clone() else {
            return Err(ProtocolError::UnexpectedPacket.into());
        };

        let failure_code = if version.is_v5() {
            reason::TOPIC_FILTER_INVALID
        } else {
            reason::UNSPECIFIED_ERROR
        };

        let mut return_codes = Vec::with_capacity(subscribe.topics.len());
        let mut accepted = Vec::new();
        for (filter, requested_qos) in &subscribe.topics {
            let subtopics = split_topic(filter);
            if !valid_subscribe_filter(&subtopics) {
                log::debug!("rejecting invalid filter '{}' from {}", filter, conn);
                return_codes.push(failure_code);
                continue;
            }
            let granted_qos = (*requested_qos).min(2);
            self.store.add_subscription(&session, &subtopics, granted_qos);
            return_codes.push(granted_qos);
            accepted.push((subtopics, granted_qos));
        }

        let ack = packet::sub_ack(version, subscribe.packet_id, &return_codes);
        conn.handle.write_packet_blaming_receiver(&ack);

        // Retained replay follows the SUBACK.
        for (subtopics, granted_qos) in accepted {
            self.store.give_client_retained_messages(
                &session,
                &subtopics,
                granted_qos,
                self.config.limits.max_qos_packets,
            );
        }

        Ok(())
    }

    fn handle_unsubscribe(&mut self, token: Token, pkt: &MqttPacket) -> Result<()> {
        let Some(conn) = self.connections.get(&token) else {
            return Ok(());
        };
        let version = conn.protocol_version;
        let unsubscribe = packet::parse_unsubscribe(pkt, version)?;

        if let Some(client_id) = conn.client_id.clone() {
            for filter in &unsubscribe.topics {
                self.store
                    .remove_subscription(&client_id, &split_topic(filter));
            }
        }

        let ack = packet::unsub_ack(version, unsubscribe.packet_id, unsubscribe.topics.len());
        conn.handle.write_packet_blaming_receiver(&ack);
        Ok(())
    }

    fn handle_disconnect(&mut self, token: Token, pkt: &MqttPacket) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        conn.graceful_disconnect = true;

        // MQTT 5 reason 0x04 asks for the will despite the graceful
        // close; everything else cancels it.
        let keep_will =
            conn.protocol_version.is_v5() && pkt.payload().first() == Some(&0x04);
        if !keep_will {
            conn.will = None;
        }

        conn.set_disconnect_reason("client sent DISCONNECT");
        conn.mark_as_disconnecting();
    }

    /// Remove connections that are done: marked disconnecting (from
    /// this thread, a takeover, or an error) or finished flushing a
    /// DISCONNECT. Queues wills and schedules session removal.
    fn cleanup_connections(&mut self) {
        let done: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| {
                conn.state == ConnectionState::Disconnecting
                    || conn.handle.is_disconnecting()
                    || conn.handle.ready_for_disconnect()
            })
            .map(|(&token, _)| token)
            .collect();

        for token in done {
            let Some(mut conn) = self.connections.remove(&token) else {
                continue;
            };
            conn.mark_as_disconnecting();

            let _ = self
                .poll
                .registry()
                .deregister(conn.transport.tcp_stream_mut());

            log::info!(
                "removing client {} (token {}). reason(s): {}",
                conn,
                conn.token.0,
                conn.disconnect_reason()
            );

            if !conn.graceful_disconnect {
                if let Some(will) = conn.will.take() {
                    let mut publish = Publish::new(will.topic, will.payload, will.qos);
                    publish.retain = will.retain;
                    let message = Arc::new(WillMessage {
                        publish,
                        delay: will.delay_interval,
                    });
                    self.store.queue_will_message(
                        message,
                        conn.session.as_ref(),
                        self.config.limits.max_qos_packets,
                    );
                }
            }

            if let Some(session) = conn.session.take() {
                session.unbind_connection(&conn.handle);
                if conn.clean_session {
                    self.store.remove_session(&session);
                } else {
                    self.store.queue_session_removal(&session, Instant::now());
                }
            }
            // The socket closes when the transport drops.
        }
    }

    /// Periodic pass: keepalive expiry, session reaping, due wills,
    /// buffer shrinking, and the occasional tree sweep.
    fn housekeeping(&mut self) {
        let now = Instant::now();
        self.last_housekeeping = now;

        for conn in self.connections.values_mut() {
            if conn.state != ConnectionState::Disconnecting && conn.keep_alive_expired(now) {
                if conn.protocol_version.is_v5() {
                    let _ = conn
                        .handle
                        .write_packet(&packet::disconnect(reason::KEEP_ALIVE_TIMEOUT));
                }
                conn.set_disconnect_reason("keep-alive expired");
                conn.mark_as_disconnecting();
                continue;
            }
            conn.reset_buffers_if_eligible();
            conn.report_dropped_messages();
        }

        self.store.remove_expired_sessions(now);
        self.store
            .send_queued_will_messages(now, self.config.limits.max_qos_packets);

        if self.last_tree_cleanup.elapsed() >= TREE_CLEANUP_INTERVAL {
            self.last_tree_cleanup = now;
            let pruned = self.store.clean_subscriptions();
            if pruned > 0 {
                log::debug!(
                    "worker {}: pruned {} expired subscriptions",
                    self.id,
                    pruned
                );
            }
            log::debug!(
                "store: {} sessions, {} subscriptions, {} retained messages",
                self.store.session_count(),
                self.store.subscription_count(),
                self.store.retained_count()
            );
        }
    }
}
