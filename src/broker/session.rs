//! Blocking MQTT session over plain TCP.
//!
//! The session is driven from the node's single loop: [`MqttSession::maintain`]
//! keeps the connection up, [`MqttSession::poll`] collects capture requests,
//! and the [`Publisher`] impl sends one frame per call. Every wait is bounded
//! by `op_timeout`.
//!
//! Liveness: a PINGREQ goes out when nothing was sent or received for half the
//! keep-alive, and after a publish that saw no PUBACK. If no bytes arrive
//! within `op_timeout` (or the keep-alive, if shorter) of that ping, the link
//! is considered dead and dropped.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, info, trace, warn};

use super::packet::{self, Connect, Packet, QoS};
use super::{BrokerError, Publisher};
use crate::frame::FrameGuard;

/// Largest packet accepted from the broker.
pub const MAX_INBOUND_PACKET: usize = 25_000;

const POLL_WAIT: Duration = Duration::from_millis(10);
const POLL_MAX_READS: usize = 8;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub request_topic: String,
    pub connect_retry: Duration,
    pub op_timeout: Duration,
}

pub struct MqttSession {
    options: SessionOptions,
    stream: Option<TcpStream>,
    read_buf: BytesMut,
    next_packet_id: u16,
    last_attempt: Option<Instant>,
    last_sent: Instant,
    last_received: Instant,
    ping_sent: Option<Instant>,
    requests: VecDeque<String>,
}

impl MqttSession {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            stream: None,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            next_packet_id: 0,
            last_attempt: None,
            last_sent: Instant::now(),
            last_received: Instant::now(),
            ping_sent: None,
            requests: VecDeque::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Keeps the session usable: pings an idle link, drops a link whose ping
    /// went unanswered, and reconnects at most once per `connect_retry` while
    /// disconnected.
    ///
    /// Returns `true` when the session is connected after the call.
    pub fn maintain(&mut self) -> bool {
        if self.stream.is_some() {
            if let Some(sent) = self.ping_sent {
                if sent.elapsed() < self.ping_deadline() {
                    return true;
                }
                self.drop_connection(&BrokerError::Timeout {
                    waiting_for: "PINGRESP",
                });
                return false;
            }

            let keep_alive = self.options.keep_alive;
            let idle = self.last_sent.elapsed().max(self.last_received.elapsed());
            if !keep_alive.is_zero() && idle >= keep_alive / 2 {
                if let Err(err) = self.send_ping() {
                    self.drop_connection(&err);
                    return false;
                }
            }
            return true;
        }

        if let Some(last) = self.last_attempt {
            if last.elapsed() < self.options.connect_retry {
                return false;
            }
        }
        self.last_attempt = Some(Instant::now());

        match self.connect() {
            Ok(()) => true,
            Err(err) => {
                info!(
                    host = %self.options.host,
                    port = self.options.port,
                    error = %err,
                    retry_ms = self.options.connect_retry.as_millis() as u64,
                    "failed to connect to broker"
                );
                false
            }
        }
    }

    /// Opens a fresh connection, then subscribes to the request topic.
    pub fn connect(&mut self) -> Result<(), BrokerError> {
        self.stream = None;
        self.read_buf.clear();
        self.ping_sent = None;

        debug!(host = %self.options.host, port = self.options.port, "connecting to broker");
        let stream = self.open_stream()?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(self.options.op_timeout))?;
        self.stream = Some(stream);
        self.last_received = Instant::now();

        if let Err(err) = self.handshake() {
            self.stream = None;
            return Err(err);
        }

        info!(host = %self.options.host, port = self.options.port, "connected to broker");
        Ok(())
    }

    /// Returns the request ids received since the last call, oldest first.
    pub fn poll(&mut self) -> Vec<String> {
        if self.stream.is_some() {
            if let Err(err) = self.pump() {
                self.drop_connection(&err);
            }
        }
        self.requests.drain(..).collect()
    }

    fn open_stream(&self) -> Result<TcpStream, BrokerError> {
        let addrs = (self.options.host.as_str(), self.options.port).to_socket_addrs()?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.options.op_timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }

        Err(match last_err {
            Some(err) => err.into(),
            None => BrokerError::Resolve {
                host: self.options.host.clone(),
                port: self.options.port,
            },
        })
    }

    fn handshake(&mut self) -> Result<(), BrokerError> {
        let mut buf = BytesMut::with_capacity(64);
        packet::encode_connect(
            &Connect {
                client_id: &self.options.client_id,
                username: self.options.username.as_deref(),
                password: self.options.password.as_deref(),
                keep_alive_secs: u16::try_from(self.options.keep_alive.as_secs())
                    .unwrap_or(u16::MAX),
            },
            &mut buf,
        )?;
        self.write(&buf)?;

        match self.await_packet("CONNACK", |p| matches!(p, Packet::ConnAck { .. }))? {
            Packet::ConnAck { return_code: 0, .. } => {}
            Packet::ConnAck { return_code, .. } => {
                return Err(BrokerError::Refused { code: return_code });
            }
            other => {
                return Err(BrokerError::protocol(format!("expected CONNACK, got {other:?}")));
            }
        }

        let packet_id = self.next_packet_id();
        buf.clear();
        packet::encode_subscribe(packet_id, &self.options.request_topic, QoS::AtMostOnce, &mut buf)?;
        self.write(&buf)?;

        let suback = self.await_packet("SUBACK", |p| {
            matches!(p, Packet::SubAck { packet_id: id, .. } if *id == packet_id)
        })?;
        if let Packet::SubAck { granted, .. } = suback {
            if granted.iter().any(|code| *code == 0x80) {
                warn!(topic = %self.options.request_topic, "broker rejected subscription");
            } else {
                info!(topic = %self.options.request_topic, "subscribed to capture requests");
            }
        }
        Ok(())
    }

    fn try_publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if self.stream.is_none() {
            return Err(BrokerError::NotConnected);
        }

        let packet_id = self.next_packet_id();
        let mut header = BytesMut::with_capacity(topic.len() + 8);
        packet::encode_publish_header(topic, Some(packet_id), payload.len(), &mut header)?;
        self.write(&header)?;
        self.write(payload)?;

        self.await_packet("PUBACK", |p| {
            matches!(p, Packet::PubAck { packet_id: id } if *id == packet_id)
        })?;
        Ok(())
    }

    /// Reads until `wanted` matches a packet. Everything else that arrives in
    /// the meantime goes through `handle_packet`, so triggers are queued.
    fn await_packet<F>(
        &mut self,
        waiting_for: &'static str,
        mut wanted: F,
    ) -> Result<Packet, BrokerError>
    where
        F: FnMut(&Packet) -> bool,
    {
        let deadline = Instant::now() + self.options.op_timeout;
        loop {
            while let Some(packet) = packet::decode(&mut self.read_buf, MAX_INBOUND_PACKET)? {
                if wanted(&packet) {
                    return Ok(packet);
                }
                self.handle_packet(packet)?;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BrokerError::Timeout { waiting_for });
            }
            self.fill(deadline - now)?;
        }
    }

    fn pump(&mut self) -> Result<(), BrokerError> {
        self.drain_buffer()?;
        for _ in 0..POLL_MAX_READS {
            if self.fill(POLL_WAIT)? == 0 {
                break;
            }
            self.drain_buffer()?;
        }
        Ok(())
    }

    fn drain_buffer(&mut self) -> Result<(), BrokerError> {
        while let Some(packet) = packet::decode(&mut self.read_buf, MAX_INBOUND_PACKET)? {
            self.handle_packet(packet)?;
        }
        Ok(())
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<(), BrokerError> {
        match packet {
            Packet::Publish {
                topic,
                packet_id,
                payload,
            } => {
                if let Some(id) = packet_id {
                    let mut buf = BytesMut::with_capacity(4);
                    packet::encode_puback(id, &mut buf);
                    self.write(&buf)?;
                }
                if topic == self.options.request_topic {
                    let request_id = String::from_utf8_lossy(&payload).into_owned();
                    debug!(topic = %topic, request_id = %request_id, "received message");
                    self.requests.push_back(request_id);
                } else {
                    debug!(topic = %topic, "ignoring message on unexpected topic");
                }
            }
            Packet::PingResp => trace!("received PINGRESP"),
            other => trace!(packet = ?other, "ignoring packet"),
        }
        Ok(())
    }

    fn send_ping(&mut self) -> Result<(), BrokerError> {
        let mut buf = BytesMut::with_capacity(2);
        packet::encode_pingreq(&mut buf);
        self.write(&buf)?;
        self.ping_sent = Some(Instant::now());
        trace!("sent PINGREQ");
        Ok(())
    }

    fn ping_deadline(&self) -> Duration {
        let keep_alive = self.options.keep_alive;
        if keep_alive.is_zero() {
            self.options.op_timeout
        } else {
            self.options.op_timeout.min(keep_alive)
        }
    }

    /// Reads at most one chunk, waiting up to `timeout`. Returns 0 on timeout.
    /// Any inbound bytes count as an answer to an outstanding ping.
    fn fill(&mut self, timeout: Duration) -> Result<usize, BrokerError> {
        let stream = self.stream.as_mut().ok_or(BrokerError::NotConnected)?;
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut chunk = [0u8; READ_CHUNK];
        match stream.read(&mut chunk) {
            Ok(0) => Err(BrokerError::Closed),
            Ok(n) => {
                self.read_buf.extend_from_slice(&chunk[..n]);
                self.last_received = Instant::now();
                self.ping_sent = None;
                Ok(n)
            }
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(0)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), BrokerError> {
        let stream = self.stream.as_mut().ok_or(BrokerError::NotConnected)?;
        stream.write_all(bytes)?;
        self.last_sent = Instant::now();
        Ok(())
    }

    fn next_packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        self.next_packet_id
    }

    fn drop_connection(&mut self, err: &BrokerError) {
        warn!(error = %err, "dropping broker connection");
        self.stream = None;
        self.read_buf.clear();
        self.ping_sent = None;
    }
}

impl Publisher for MqttSession {
    fn publish(&mut self, topic: &str, frame: FrameGuard<'_>) -> bool {
        let bytes = frame.len();
        let captured_ms = frame.timestamp_ms();
        match self.try_publish(topic, &frame) {
            Ok(()) => {
                info!(topic, bytes, captured_ms, "image published to broker");
                true
            }
            Err(err) => {
                warn!(topic, bytes, error = %err, "failed to publish image to broker");
                match err {
                    BrokerError::Io { .. } | BrokerError::Closed | BrokerError::Protocol { .. } => {
                        self.drop_connection(&err);
                    }
                    // The link may be half-open; `maintain` drops it if this goes unanswered.
                    BrokerError::Timeout { .. } if self.ping_sent.is_none() => {
                        if let Err(err) = self.send_ping() {
                            self.drop_connection(&err);
                        }
                    }
                    _ => {}
                }
                false
            }
        }
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if self.stream.is_some() {
            let mut buf = BytesMut::with_capacity(2);
            packet::encode_disconnect(&mut buf);
            let _ = self.write(&buf);
        }
    }
}
