//! Per-socket connection state and buffer management.
//!
//! Each connection is split in two:
//! - [`Connection`]: owned by exactly one worker thread. Holds the
//!   transport, the read buffer and protocol identity. Only the owning
//!   worker reads the socket, so the read buffer needs no lock.
//! - [`ConnectionHandle`]: shared across threads. Any worker delivering
//!   a publish locks the write buffer, appends, and updates the epoll
//!   interest set directly (`epoll_ctl` is thread-safe).

use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashSet;
use mio::net::TcpStream;
use mio::Token;
use parking_lot::Mutex;

use embermq_core::codec::{self, MqttPacket, PacketType};
use embermq_core::packet::{ProtocolVersion, Will};
use embermq_core::{CircularBuffer, Result};

use crate::config::LimitsConfig;
use crate::session::Session;
use crate::util::RateLimitedCounter;

/// Grace period before a connection must complete CONNECT.
const PRE_AUTH_TIMEOUT: Duration = Duration::from_secs(20);

/// Transport layer seam. TLS or WebSocket wrappers would slot in as
/// further variants; the broker only sees `Read`/`Write`.
pub enum Transport {
    Plain(TcpStream),
}

impl Transport {
    pub fn plain(stream: TcpStream) -> Self {
        Transport::Plain(stream)
    }

    /// The underlying TCP stream, for event-loop registration.
    pub fn tcp_stream_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(s) => s,
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
        }
    }
}

impl AsRawFd for Transport {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Transport::Plain(s) => s.as_raw_fd(),
        }
    }
}

/// Connection lifecycle state. The move to `Disconnecting` is one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for CONNECT.
    Connecting,
    /// CONNECT accepted.
    Connected,
    /// On the way out; I/O is refused from here on.
    Disconnecting,
}

/// Cross-thread write access to one connection.
pub struct ConnectionHandle {
    write_buf: Mutex<CircularBuffer>,
    ready_for_writing: AtomicBool,
    ready_for_reading: AtomicBool,
    disconnecting: AtomicBool,
    disconnect_when_bytes_written: AtomicBool,
    /// QoS 0 publishes dropped because the write buffer was full even
    /// after capped growth. Reported by the owning worker.
    dropped_qos0: AtomicU64,
    protocol_version: AtomicU8,
    epoll_fd: RawFd,
    socket_fd: RawFd,
    token: Token,
    worker_id: usize,
    initial_buffer_size: usize,
    max_packet_size: usize,
}

impl ConnectionHandle {
    fn new(
        worker_id: usize,
        epoll_fd: RawFd,
        socket_fd: RawFd,
        token: Token,
        limits: &LimitsConfig,
    ) -> Self {
        Self {
            write_buf: Mutex::new(CircularBuffer::new(limits.client_initial_buffer_size)),
            ready_for_writing: AtomicBool::new(false),
            ready_for_reading: AtomicBool::new(true),
            disconnecting: AtomicBool::new(false),
            disconnect_when_bytes_written: AtomicBool::new(false),
            dropped_qos0: AtomicU64::new(0),
            protocol_version: AtomicU8::new(ProtocolVersion::Mqtt311 as u8),
            epoll_fd,
            socket_fd,
            token,
            worker_id,
            initial_buffer_size: limits.client_initial_buffer_size,
            max_packet_size: limits.max_packet_size,
        }
    }

    /// Handle without a live socket, for unit tests. Interest updates
    /// against the dummy fds fail harmlessly.
    #[cfg(test)]
    pub(crate) fn new_detached(limits: &LimitsConfig) -> Arc<Self> {
        Arc::new(Self::new(0, -1, -1, Token(0), limits))
    }

    #[inline]
    pub fn set_protocol_version(&self, version: ProtocolVersion) {
        self.protocol_version.store(version as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn protocol_version(&self) -> ProtocolVersion {
        match self.protocol_version.load(Ordering::Relaxed) {
            3 => ProtocolVersion::Mqtt31,
            5 => ProtocolVersion::Mqtt5,
            _ => ProtocolVersion::Mqtt311,
        }
    }

    /// One-way; all later reads and writes fail fast.
    pub fn mark_disconnecting(&self) {
        self.disconnecting.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::Acquire)
    }

    /// True once a DISCONNECT has been queued and fully flushed.
    pub fn ready_for_disconnect(&self) -> bool {
        self.disconnect_when_bytes_written.load(Ordering::Acquire)
            && self.write_buf.lock().is_empty()
    }

    /// Queue a packet on this connection's write buffer. Growth per
    /// packet is capped; a QoS 0 PUBLISH that still does not fit is
    /// dropped (counted). Pings, acks and QoS>0 publishes are never
    /// dropped here: session queues bound them upstream.
    pub fn write_packet(&self, pkt: &MqttPacket) -> io::Result<()> {
        if self.is_disconnecting() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is disconnecting",
            ));
        }

        let size = pkt.size_including_non_present_header();
        let grow_max = size.saturating_mul(1000).min(self.max_packet_size);

        let mut buf = self.write_buf.lock();
        buf.ensure_free_space(size, grow_max);

        if pkt.packet_type == PacketType::Publish
            && pkt.qos() == 0
            && size > buf.free_space()
        {
            drop(buf);
            self.dropped_qos0.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if size > buf.free_space() {
            buf.ensure_free_space(size, usize::MAX);
        }

        pkt.write_to(&mut buf);

        if pkt.packet_type == PacketType::Disconnect {
            self.disconnect_when_bytes_written.store(true, Ordering::Release);
        }

        drop(buf);
        self.set_ready_for_writing(true);
        Ok(())
    }

    /// Write a packet destined for this connection during fan-out. A
    /// failure here is this receiver's fault, so it disconnects the
    /// receiver instead of bubbling up to the publisher.
    pub fn write_packet_blaming_receiver(&self, pkt: &MqttPacket) {
        if let Err(e) = self.write_packet(pkt) {
            log::debug!(
                "disconnecting slow or dead receiver (worker={}, token={:?}): {}",
                self.worker_id,
                self.token.0,
                e
            );
            self.mark_disconnecting();
        }
    }

    /// PINGRESP is always the same two bytes.
    pub fn write_ping_resp(&self) -> io::Result<()> {
        if self.is_disconnecting() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is disconnecting",
            ));
        }
        let mut buf = self.write_buf.lock();
        buf.ensure_free_space(2, usize::MAX);
        buf.write(&[0xD0, 0x00]);
        drop(buf);
        self.set_ready_for_writing(true);
        Ok(())
    }

    /// Drain the write buffer into the socket. Uses `try_lock`: when
    /// another thread is mid-append the socket stays write-ready and
    /// the next EPOLLOUT picks the bytes up, which also keeps the lock
    /// order store-lock → write-buffer acyclic.
    pub fn flush(&self, transport: &mut Transport) -> io::Result<()> {
        let Some(mut buf) = self.write_buf.try_lock() else {
            return Ok(());
        };

        if self.is_disconnecting() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is disconnecting",
            ));
        }

        let mut would_block = false;
        while buf.used_bytes() > 0 {
            match transport.write(buf.read_slice()) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "peer closed"));
                }
                Ok(n) => buf.advance_tail(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    would_block = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        // Recompute interest while still holding the lock, so a writer
        // that sneaks in after us re-raises the flag instead of losing
        // its wakeup.
        let has_data = buf.used_bytes() > 0;
        self.set_ready_for_writing(has_data || would_block);
        Ok(())
    }

    /// Dropped-QoS0 count since the last call.
    pub fn take_dropped_qos0(&self) -> u64 {
        self.dropped_qos0.swap(0, Ordering::Relaxed)
    }

    pub fn reset_write_buffer_if_eligible(&self) {
        self.write_buf.lock().reset_size_if_eligible(self.initial_buffer_size);
    }

    pub fn set_ready_for_writing(&self, val: bool) {
        if self.is_disconnecting() {
            return;
        }
        if self.ready_for_writing.swap(val, Ordering::AcqRel) == val {
            return;
        }
        self.update_interest();
    }

    pub fn set_ready_for_reading(&self, val: bool) {
        if self.is_disconnecting() {
            return;
        }
        if self.ready_for_reading.swap(val, Ordering::AcqRel) == val {
            return;
        }
        self.update_interest();
    }

    /// Push the current readiness flags into the epoll interest set.
    fn update_interest(&self) {
        let mut events = libc::EPOLLET as u32;
        if self.ready_for_reading.load(Ordering::Acquire) {
            events |= libc::EPOLLIN as u32;
        }
        if self.ready_for_writing.load(Ordering::Acquire) {
            events |= libc::EPOLLOUT as u32;
        }

        let mut ev = libc::epoll_event {
            events,
            u64: self.token.0 as u64,
        };

        // epoll_ctl is thread-safe; a failure here means the fd is
        // already gone, which the owning worker handles as disconnect.
        let rc = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, self.socket_fd, &mut ev)
        };
        if rc != 0 {
            log::warn!(
                "epoll_ctl failed for token {:?}: {}",
                self.token.0,
                io::Error::last_os_error()
            );
            self.mark_disconnecting();
        }
    }
}

/// Worker-owned connection state.
pub struct Connection {
    pub token: Token,
    pub transport: Transport,
    pub remote_addr: SocketAddr,
    pub state: ConnectionState,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub protocol_version: ProtocolVersion,
    pub keep_alive: u16,
    pub clean_session: bool,
    /// Will registration from CONNECT; cleared on graceful disconnect.
    pub will: Option<Will>,
    pub graceful_disconnect: bool,
    pub last_activity: Instant,
    /// Session this connection is bound to after CONNECT.
    pub session: Option<Arc<Session>>,
    /// Incoming QoS 2 packet ids between PUBLISH and PUBREL.
    pub incoming_qos2: AHashSet<u16>,
    pub handle: Arc<ConnectionHandle>,

    read_buf: CircularBuffer,
    disconnect_reason: String,
    max_packet_size: usize,
    initial_buffer_size: usize,
    backpressure_log: RateLimitedCounter,
}

impl Connection {
    pub fn new(
        token: Token,
        transport: Transport,
        remote_addr: SocketAddr,
        worker_id: usize,
        epoll_fd: RawFd,
        limits: &LimitsConfig,
    ) -> Self {
        let socket_fd = transport.as_raw_fd();
        let handle = Arc::new(ConnectionHandle::new(
            worker_id, epoll_fd, socket_fd, token, limits,
        ));

        Self {
            token,
            transport,
            remote_addr,
            state: ConnectionState::Connecting,
            client_id: None,
            username: None,
            protocol_version: ProtocolVersion::Mqtt311,
            keep_alive: 0,
            clean_session: true,
            will: None,
            graceful_disconnect: false,
            last_activity: Instant::now(),
            session: None,
            incoming_qos2: AHashSet::new(),
            handle,
            read_buf: CircularBuffer::new(limits.client_initial_buffer_size),
            disconnect_reason: String::new(),
            max_packet_size: limits.max_packet_size,
            initial_buffer_size: limits.client_initial_buffer_size,
            backpressure_log: RateLimitedCounter::new(Duration::from_secs(10)),
        }
    }

    #[inline]
    pub fn authenticated(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Non-blocking read loop into the read buffer. The buffer doubles
    /// under pressure up to `max_packet_size`; past that, read interest
    /// is dropped until the framer drains bytes (backpressure).
    pub fn read_socket(&mut self) -> io::Result<()> {
        if self.handle.is_disconnecting() || self.state == ConnectionState::Disconnecting {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is disconnecting",
            ));
        }

        loop {
            if self.read_buf.free_space() == 0 {
                if self.read_buf.size() * 2 <= self.max_packet_size {
                    self.read_buf.double_size();
                } else {
                    self.handle.set_ready_for_reading(false);
                    break;
                }
            }

            match self.transport.read(self.read_buf.write_slice()) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed connection",
                    ));
                }
                Ok(n) => self.read_buf.advance_head(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        self.last_activity = Instant::now();
        if let Some(session) = &self.session {
            session.touch(self.last_activity);
        }

        Ok(())
    }

    /// Frame as many packets as the read buffer holds, then re-enable
    /// read interest if there is room again.
    pub fn frame_packets(&mut self, out: &mut Vec<MqttPacket>) -> Result<()> {
        let authenticated = self.authenticated();
        let result = codec::drain_packets(&mut self.read_buf, authenticated, out);
        self.handle
            .set_ready_for_reading(self.read_buf.free_space() > 0);
        result
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.handle.flush(&mut self.transport)
    }

    /// Before CONNECT completes a flat 20 s applies; after that, twice
    /// the negotiated keepalive (MQTT's factor of 1.5, rounded up to
    /// whole intervals).
    pub fn keep_alive_expired(&self, now: Instant) -> bool {
        if !self.authenticated() {
            return now.duration_since(self.last_activity) > PRE_AUTH_TIMEOUT;
        }
        let allowed = Duration::from_secs(u64::from(self.keep_alive) * 10 / 5);
        now.duration_since(self.last_activity) > allowed
    }

    pub fn mark_as_disconnecting(&mut self) {
        if self.state == ConnectionState::Disconnecting {
            return;
        }
        self.state = ConnectionState::Disconnecting;
        self.handle.mark_disconnecting();
    }

    /// Accumulate reasons; everything is reported once at removal.
    pub fn set_disconnect_reason(&mut self, reason: &str) {
        if !self.disconnect_reason.is_empty() {
            self.disconnect_reason.push_str(", ");
        }
        self.disconnect_reason.push_str(reason);
    }

    pub fn disconnect_reason(&self) -> &str {
        if self.disconnect_reason.is_empty() {
            "not specified"
        } else {
            &self.disconnect_reason
        }
    }

    /// Shrink grown buffers back once they are idle.
    pub fn reset_buffers_if_eligible(&mut self) {
        self.read_buf.reset_size_if_eligible(self.initial_buffer_size);
        self.handle.reset_write_buffer_if_eligible();
    }

    /// Surface dropped-QoS0 counts, rate limited.
    pub fn report_dropped_messages(&mut self) {
        let dropped = self.handle.take_dropped_qos0();
        if let Some(total) = self.backpressure_log.add(dropped) {
            log::warn!(
                "dropped {} QoS 0 messages to slow client {}",
                total,
                self
            );
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[client={}, user={}, addr={}]",
            self.client_id.as_deref().unwrap_or("?"),
            self.username.as_deref().unwrap_or(""),
            self.remote_addr
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embermq_core::packet::{self, Publish};

    fn test_handle(limits: &LimitsConfig) -> ConnectionHandle {
        // Dummy fds: interest updates fail harmlessly in tests.
        ConnectionHandle::new(0, -1, -1, Token(1), limits)
    }

    fn small_limits() -> LimitsConfig {
        LimitsConfig {
            client_initial_buffer_size: 64,
            max_packet_size: 256,
            max_qos_packets: 16,
        }
    }

    /// A connection over a real (never accepted) localhost socket.
    /// The listener is returned so the peer stays alive for the test.
    fn test_connection() -> (Connection, std::net::TcpListener) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let std_stream = std::net::TcpStream::connect(addr).unwrap();
        std_stream.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(std_stream);
        let conn = Connection::new(
            Token(1),
            Transport::plain(stream),
            addr,
            0,
            -1,
            &small_limits(),
        );
        (conn, listener)
    }

    #[test]
    fn ping_resp_is_two_literal_bytes() {
        let handle = test_handle(&small_limits());
        handle.write_ping_resp().unwrap();
        let mut buf = handle.write_buf.lock();
        assert_eq!(buf.take_bytes(2), vec![0xD0, 0x00]);
    }

    #[test]
    fn qos0_publish_dropped_when_buffer_cannot_grow() {
        let handle = test_handle(&small_limits());
        let publish = Publish::new("t", vec![0u8; 300], 0);
        let pkt = packet::publish_packet(&publish, 0, None, false, ProtocolVersion::Mqtt311);

        // Larger than max_packet_size: capped growth can't make room.
        handle.write_packet(&pkt).unwrap();
        assert_eq!(handle.take_dropped_qos0(), 1);
        assert!(handle.write_buf.lock().is_empty());
    }

    #[test]
    fn qos1_publish_is_never_dropped() {
        let handle = test_handle(&small_limits());
        let publish = Publish::new("t", vec![0u8; 300], 1);
        let pkt = packet::publish_packet(&publish, 1, Some(1), false, ProtocolVersion::Mqtt311);

        handle.write_packet(&pkt).unwrap();
        assert_eq!(handle.take_dropped_qos0(), 0);
        assert_eq!(
            handle.write_buf.lock().used_bytes(),
            pkt.size_including_non_present_header()
        );
    }

    #[test]
    fn keep_alive_grace_before_connect() {
        let (conn, _listener) = test_connection();
        let now = Instant::now();
        assert!(!conn.keep_alive_expired(now + Duration::from_secs(19)));
        assert!(conn.keep_alive_expired(now + Duration::from_secs(21)));
    }

    #[test]
    fn keep_alive_allows_twice_the_interval_after_connect() {
        let (mut conn, _listener) = test_connection();
        conn.state = ConnectionState::Connected;
        conn.keep_alive = 60;
        let now = Instant::now();
        conn.last_activity = now;

        assert!(!conn.keep_alive_expired(now + Duration::from_secs(119)));
        assert!(conn.keep_alive_expired(now + Duration::from_secs(121)));
    }

    #[test]
    fn zero_keep_alive_expires_once_activity_lapses() {
        // The expiry formula has no special case for 0: the allowance
        // is zero seconds, so any lapse past the last activity counts.
        let (mut conn, _listener) = test_connection();
        conn.state = ConnectionState::Connected;
        conn.keep_alive = 0;
        let now = Instant::now();
        conn.last_activity = now;

        assert!(!conn.keep_alive_expired(now));
        assert!(conn.keep_alive_expired(now + Duration::from_secs(1)));
    }

    #[test]
    fn writes_fail_after_disconnecting() {
        let handle = test_handle(&small_limits());
        handle.mark_disconnecting();
        assert!(handle.write_ping_resp().is_err());
        let pkt = packet::disconnect(packet::reason::NORMAL_DISCONNECTION);
        assert!(handle.write_packet(&pkt).is_err());
    }

    #[test]
    fn disconnect_packet_arms_deferred_close() {
        let handle = test_handle(&small_limits());
        let pkt = packet::disconnect(packet::reason::SESSION_TAKEN_OVER);
        handle.write_packet(&pkt).unwrap();
        assert!(!handle.ready_for_disconnect());

        // Once the bytes are flushed the connection may close.
        let mut buf = handle.write_buf.lock();
        let n = buf.used_bytes();
        buf.take_bytes(n);
        drop(buf);
        assert!(handle.ready_for_disconnect());
    }
}
