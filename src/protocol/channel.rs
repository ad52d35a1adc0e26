//! RTS/CTS transaction channel over one connection.
//!
//! At most one logical message is in flight per connection. All socket I/O
//! happens under a single-slot lock; a separate "initiation in progress"
//! flag (mutex + condvar) queues local threads that want to push a message,
//! so they never hold the I/O lock while waiting their turn.
//!
//! Initiator: `RTS{id, size}` -> expect `CTS{id}` -> send exactly `size`
//! bytes -> expect `response`. A mismatched or missing CTS releases the lock,
//! backs off for a random 0..max_backoff and retries. Any other failure is
//! returned and is fatal to the connection.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::{AlertrError, AlertrResult, ProtocolError, TransportError};

use super::codec::{self, FrameReader};
use super::envelope::{ControlPayload, Envelope, MessageType, ResponseResult};
use super::transport::{shutdown_socket, Transport};

/// Timing parameters of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Read timeout of one receive poll; the I/O lock is released between polls.
    pub poll_timeout: Duration,
    /// How long to wait for a CTS before backing off.
    pub handshake_timeout: Duration,
    /// How long to wait for a payload or a response once a transaction started.
    pub receive_timeout: Duration,
    /// Upper bound of the random backoff after a rejected handshake.
    pub max_backoff: Duration,
    /// Handshake attempts before giving up.
    pub max_handshake_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(20),
            receive_timeout: Duration::from_secs(50),
            max_backoff: Duration::from_secs(1),
            max_handshake_attempts: 10,
        }
    }
}

fn lock_err(context: &'static str) -> AlertrError {
    AlertrError::internal(format!("poisoned lock: {context}"))
}

struct ChannelIo {
    transport: Box<dyn Transport>,
    frames: FrameReader,
}

impl ChannelIo {
    fn write(&mut self, bytes: &[u8]) -> AlertrResult<()> {
        codec::write_frame(self.transport.as_mut(), bytes)
    }

    fn send(&mut self, envelope: &Envelope) -> AlertrResult<()> {
        let bytes = codec::encode(envelope)?;
        self.write(&bytes)
    }
}

enum Handshake {
    Accepted,
    Rejected(String),
}

/// A connection speaking the transaction protocol.
pub struct TransactionChannel {
    io: Mutex<ChannelIo>,
    initiating: Mutex<bool>,
    initiation_done: Condvar,
    socket: Option<TcpStream>,
    closed: AtomicBool,
    peer: String,
    cfg: ChannelConfig,
}

impl std::fmt::Debug for TransactionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionChannel")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Clears the initiation flag when the initiating thread is done.
struct InitiationGuard<'a> {
    channel: &'a TransactionChannel,
}

impl Drop for InitiationGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut busy) = self.channel.initiating.lock() {
            *busy = false;
        }
        self.channel.initiation_done.notify_all();
    }
}

/// A request received from the peer, holding the I/O lock until answered.
pub struct InboundRequest<'a> {
    io: MutexGuard<'a, ChannelIo>,
    request: Envelope,
}

impl InboundRequest<'_> {
    #[must_use]
    pub fn message(&self) -> MessageType {
        self.request.message
    }

    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.request
    }

    /// Completes the transaction with a response.
    pub fn respond(mut self, result: ResponseResult) -> AlertrResult<()> {
        let response = Envelope::response(self.request.message, result)?;
        self.io.send(&response)
    }

    /// Completes the transaction with an error reply.
    pub fn reject(mut self, reason: &str) -> AlertrResult<()> {
        let response = Envelope::error(self.request.message, reason);
        self.io.send(&response)
    }
}

impl TransactionChannel {
    /// Wraps a connected transport.
    pub fn new<T: Transport + 'static>(transport: T, cfg: ChannelConfig) -> Self {
        let socket = transport.socket_handle().ok();
        let peer = transport
            .peer_addr()
            .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string());
        Self {
            io: Mutex::new(ChannelIo {
                transport: Box::new(transport),
                frames: FrameReader::new(),
            }),
            initiating: Mutex::new(false),
            initiation_done: Condvar::new(),
            socket,
            closed: AtomicBool::new(false),
            peer,
            cfg,
        }
    }

    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.cfg
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the connection. Threads blocked on it return with an error.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(socket) = &self.socket {
            shutdown_socket(socket);
        }
        self.initiation_done.notify_all();
        debug!(peer = %self.peer, "channel closed");
    }

    fn ensure_open(&self) -> AlertrResult<()> {
        if self.is_closed() {
            Err(ProtocolError::Closed.into())
        } else {
            Ok(())
        }
    }

    fn lock_io(&self) -> AlertrResult<MutexGuard<'_, ChannelIo>> {
        let io = self.io.lock().map_err(|_| lock_err("channel io"))?;
        io.transport
            .set_read_timeout(Some(self.cfg.poll_timeout.max(Duration::from_millis(1))))
            .map_err(|e| TransportError::io("set read timeout", e))?;
        Ok(io)
    }

    fn begin_initiation(&self) -> AlertrResult<InitiationGuard<'_>> {
        let busy = self.initiating.lock().map_err(|_| lock_err("channel initiation"))?;
        let mut busy = self
            .initiation_done
            .wait_while(busy, |busy| *busy && !self.is_closed())
            .map_err(|_| lock_err("channel initiation"))?;
        self.ensure_open()?;
        *busy = true;
        Ok(InitiationGuard { channel: self })
    }

    /// Waits (bounded by one poll interval) for local initiators to finish.
    fn yield_to_initiators(&self) -> AlertrResult<()> {
        let busy = self.initiating.lock().map_err(|_| lock_err("channel initiation"))?;
        let _busy = self
            .initiation_done
            .wait_timeout_while(busy, self.cfg.poll_timeout, |busy| *busy && !self.is_closed())
            .map_err(|_| lock_err("channel initiation"))?;
        Ok(())
    }

    fn backoff(&self) -> Duration {
        let max_ms = u64::try_from(self.cfg.max_backoff.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Sends one request to the peer and returns its response.
    pub fn send_request<T: Serialize>(&self, message: MessageType, body: &T) -> AlertrResult<ResponseResult> {
        let frame = codec::encode(&Envelope::request(message, body)?)?;
        let _initiation = self.begin_initiation()?;

        let mut attempt = 0;
        loop {
            self.ensure_open()?;
            attempt += 1;

            let mut io = self.lock_io()?;
            match self.handshake(&mut io, message, frame.len())? {
                Handshake::Accepted => return self.finish_request(&mut io, message, &frame),
                Handshake::Rejected(reason) => {
                    drop(io);
                    if attempt >= self.cfg.max_handshake_attempts {
                        return Err(ProtocolError::HandshakeExhausted { attempts: attempt }.into());
                    }
                    let backoff = self.backoff();
                    debug!(
                        peer = %self.peer,
                        msg_type = %message,
                        attempt,
                        reason = %reason,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "handshake not accepted, backing off"
                    );
                    thread::sleep(backoff);
                }
            }
        }
    }

    fn handshake(&self, io: &mut ChannelIo, message: MessageType, size: usize) -> AlertrResult<Handshake> {
        let id: u32 = rand::random();
        io.send(&Envelope::rts(message, id, size)?)?;
        trace!(peer = %self.peer, msg_type = %message, id, size, "sent rts");

        let deadline = Instant::now() + self.cfg.handshake_timeout;
        let reply = match io.frames.read_envelope_until(
            io.transport.as_mut(),
            deadline,
            "clear to send",
            self.cfg.handshake_timeout,
        ) {
            Ok(reply) => reply,
            Err(AlertrError::Transport(TransportError::Timeout { .. })) => {
                return Ok(Handshake::Rejected("no clear to send before timeout".to_string()));
            }
            Err(e) => return Err(e),
        };

        if let Some(error) = &reply.error {
            return Ok(Handshake::Rejected(format!("peer error: {error}")));
        }
        match reply.control() {
            Ok(ControlPayload::Cts { id: echoed }) if echoed == id && reply.message == message => Ok(Handshake::Accepted),
            Ok(other) => Ok(Handshake::Rejected(format!(
                "expected cts {id} for {message}, got {other:?} for {}",
                reply.message
            ))),
            Err(e) => Ok(Handshake::Rejected(e.to_string())),
        }
    }

    fn finish_request(&self, io: &mut ChannelIo, message: MessageType, frame: &[u8]) -> AlertrResult<ResponseResult> {
        io.write(frame)?;

        let deadline = Instant::now() + self.cfg.receive_timeout;
        let reply = io
            .frames
            .read_envelope_until(io.transport.as_mut(), deadline, "response", self.cfg.receive_timeout)?;
        if reply.message != message {
            return Err(ProtocolError::UnexpectedMessage {
                expected: message.to_string(),
                actual: reply.message.to_string(),
            }
            .into());
        }
        reply.ensure_no_error()?;

        match reply.control()? {
            ControlPayload::Response { result } => {
                if result == ResponseResult::Expired {
                    warn!(peer = %self.peer, msg_type = %message, "peer reported message as expired");
                }
                Ok(result)
            }
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "response".to_string(),
                actual: format!("{other:?}"),
            }
            .into()),
        }
    }

    /// Waits one poll interval for the peer to start a transaction.
    ///
    /// Returns the request with the I/O lock still held; answer it with
    /// [`InboundRequest::respond`] or [`InboundRequest::reject`].
    pub fn poll_request(&self) -> AlertrResult<Option<InboundRequest<'_>>> {
        self.ensure_open()?;
        self.yield_to_initiators()?;

        let mut io = self.lock_io()?;
        match self.accept_request(&mut io)? {
            Some(request) => Ok(Some(InboundRequest { io, request })),
            None => Ok(None),
        }
    }

    fn accept_request(&self, io: &mut ChannelIo) -> AlertrResult<Option<Envelope>> {
        let Some(rts) = io.frames.poll_envelope(io.transport.as_mut())? else {
            return Ok(None);
        };
        rts.ensure_no_error()?;

        let (id, size) = match (rts.control()?, rts.size) {
            (ControlPayload::Rts { id }, Some(size)) => (id, size),
            (other, _) => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "rts".to_string(),
                    actual: format!("{other:?}"),
                }
                .into())
            }
        };
        io.send(&Envelope::cts(rts.message, id)?)?;
        trace!(peer = %self.peer, msg_type = %rts.message, id, size, "sent cts");

        let deadline = Instant::now() + self.cfg.receive_timeout;
        let request = io
            .frames
            .read_sized(io.transport.as_mut(), size, deadline, self.cfg.receive_timeout)?;
        if request.message != rts.message {
            return Err(ProtocolError::UnexpectedMessage {
                expected: rts.message.to_string(),
                actual: request.message.to_string(),
            }
            .into());
        }
        Ok(Some(request))
    }
}

impl Drop for TransactionChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn fast_config() -> ChannelConfig {
        ChannelConfig {
            poll_timeout: Duration::from_millis(20),
            handshake_timeout: Duration::from_millis(300),
            receive_timeout: Duration::from_secs(2),
            max_backoff: Duration::from_millis(20),
            max_handshake_attempts: 3,
        }
    }

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn poll_until_request(channel: &TransactionChannel) -> InboundRequest<'_> {
        for _ in 0..200 {
            if let Some(request) = channel.poll_request().unwrap() {
                return request;
            }
        }
        panic!("no request arrived");
    }

    #[test]
    fn test_request_response_exchange() {
        let (a, b) = tcp_pair();
        let initiator = Arc::new(TransactionChannel::new(a, fast_config()));
        let responder = TransactionChannel::new(b, fast_config());

        let sender = {
            let initiator = Arc::clone(&initiator);
            thread::spawn(move || initiator.send_request(MessageType::Ping, &json!({"note": "hello"})))
        };

        let request = poll_until_request(&responder);
        assert_eq!(request.message(), MessageType::Ping);
        let body: serde_json::Value = request.envelope().request_body().unwrap();
        assert_eq!(body["note"], "hello");
        request.respond(ResponseResult::Ok).unwrap();

        assert_eq!(sender.join().unwrap().unwrap(), ResponseResult::Ok);
    }

    #[test]
    fn test_rejected_request_surfaces_peer_error() {
        let (a, b) = tcp_pair();
        let initiator = Arc::new(TransactionChannel::new(a, fast_config()));
        let responder = TransactionChannel::new(b, fast_config());

        let sender = {
            let initiator = Arc::clone(&initiator);
            thread::spawn(move || initiator.send_request(MessageType::Option, &json!({})))
        };
        poll_until_request(&responder).reject("not permitted").unwrap();

        let err = sender.join().unwrap().unwrap_err();
        assert!(matches!(err, AlertrError::Protocol(ProtocolError::PeerError { .. })));
    }

    #[test]
    fn test_cts_mismatch_retries_then_gives_up() {
        let (a, mut raw_peer) = tcp_pair();
        let initiator = TransactionChannel::new(a, fast_config());

        let peer = thread::spawn(move || {
            let mut frames = FrameReader::new();
            raw_peer.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
            let mut seen = 0;
            let deadline = Instant::now() + Duration::from_secs(5);
            while seen < 3 && Instant::now() < deadline {
                if let Some(rts) = frames.poll_envelope(&mut raw_peer).unwrap() {
                    let ControlPayload::Rts { id } = rts.control().unwrap() else {
                        panic!("expected rts");
                    };
                    let wrong = Envelope::cts(rts.message, id.wrapping_add(1)).unwrap();
                    raw_peer.write_all(&codec::encode(&wrong).unwrap()).unwrap();
                    seen += 1;
                }
            }
            seen
        });

        let err = initiator.send_request(MessageType::Ping, &json!({})).unwrap_err();
        assert!(matches!(err, AlertrError::Protocol(ProtocolError::HandshakeExhausted { attempts: 3 })));
        assert_eq!(peer.join().unwrap(), 3);
    }

    #[test]
    fn test_silent_peer_gets_another_rts() {
        let (a, mut raw_peer) = tcp_pair();
        let initiator = TransactionChannel::new(a, fast_config());

        let peer = thread::spawn(move || {
            let mut frames = FrameReader::new();
            raw_peer.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
            let mut seen = 0;
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                let Some(rts) = frames.poll_envelope(&mut raw_peer).unwrap() else {
                    continue;
                };
                seen += 1;
                // First one goes unanswered until the initiator times out.
                if seen == 1 {
                    continue;
                }
                let ControlPayload::Rts { id } = rts.control().unwrap() else {
                    panic!("expected rts");
                };
                raw_peer
                    .write_all(&codec::encode(&Envelope::cts(rts.message, id).unwrap()).unwrap())
                    .unwrap();
                let request = frames
                    .read_sized(&mut raw_peer, rts.size.unwrap(), deadline, Duration::from_secs(5))
                    .unwrap();
                assert_eq!(request.message, MessageType::Ping);
                let response = Envelope::response(request.message, ResponseResult::Ok).unwrap();
                raw_peer.write_all(&codec::encode(&response).unwrap()).unwrap();
                break;
            }
            seen
        });

        let started = Instant::now();
        assert_eq!(initiator.send_request(MessageType::Ping, &json!({})).unwrap(), ResponseResult::Ok);
        assert!(started.elapsed() >= fast_config().handshake_timeout);
        assert_eq!(peer.join().unwrap(), 2);
    }

    #[test]
    fn test_malformed_rts_is_fatal() {
        let (mut raw_peer, b) = tcp_pair();
        let responder = TransactionChannel::new(b, fast_config());
        raw_peer.write_all(b"{\"msgTime\": 1, \"message\": \"ping\", \"payload\": [1, 2]}").unwrap();

        let mut outcome = None;
        for _ in 0..100 {
            match responder.poll_request() {
                Ok(None) => continue,
                Ok(Some(_)) => panic!("malformed rts accepted"),
                Err(e) => {
                    outcome = Some(e);
                    break;
                }
            }
        }
        let err = outcome.expect("malformed rts not reported");
        assert!(err.is_fatal_to_connection());
    }

    #[test]
    fn test_request_without_rts_is_fatal() {
        let (mut raw_peer, b) = tcp_pair();
        let responder = TransactionChannel::new(b, fast_config());
        let response = Envelope::response(MessageType::Ping, ResponseResult::Ok).unwrap();
        raw_peer.write_all(&codec::encode(&response).unwrap()).unwrap();

        let err = loop {
            match responder.poll_request() {
                Ok(None) => {}
                Ok(Some(_)) => panic!("response accepted as request"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, AlertrError::Protocol(ProtocolError::UnexpectedMessage { .. })));
    }

    #[test]
    fn test_close_wakes_blocked_peer_reads() {
        let (a, mut raw_peer) = tcp_pair();
        let channel = TransactionChannel::new(a, fast_config());
        channel.close();
        assert!(channel.is_closed());
        assert!(matches!(
            channel.poll_request(),
            Err(AlertrError::Protocol(ProtocolError::Closed))
        ));

        let mut buf = [0u8; 8];
        raw_peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(raw_peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_concurrent_initiators_are_serialized() {
        let (a, b) = tcp_pair();
        let initiator = Arc::new(TransactionChannel::new(a, fast_config()));
        let responder = TransactionChannel::new(b, fast_config());

        let senders: Vec<_> = (0..4)
            .map(|i| {
                let initiator = Arc::clone(&initiator);
                thread::spawn(move || initiator.send_request(MessageType::StateChange, &json!({ "n": i })))
            })
            .collect();

        let mut seen = Vec::new();
        while seen.len() < 4 {
            let request = poll_until_request(&responder);
            let body: serde_json::Value = request.envelope().request_body().unwrap();
            seen.push(body["n"].as_i64().unwrap());
            request.respond(ResponseResult::Ok).unwrap();
        }
        for sender in senders {
            assert_eq!(sender.join().unwrap().unwrap(), ResponseResult::Ok);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
