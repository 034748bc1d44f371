//! Length-prefixed bencode request/response protocol over a stream.
//!
//! Each message is `<decimal-length>:<bencode-list>`; the list opens
//! with a one-byte type tag (`C` command, `R` reply, `E` error reply),
//! then the request id, then for commands the endpoint name, then the
//! body. Outgoing requests are tracked in a deque ordered by their
//! monotonically allocated ids; replies match by binary search, and a
//! periodic check times out the front of the deque (ids are monotonic
//! and the timeout constant, so the front is always the earliest).
//!
//! Malformed input is terminal: the stream closes with
//! [`BPARSER_EXCEPTION`](crate::BPARSER_EXCEPTION).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use protocol_bt::{FrameAssembler, ListConsumer, ListProducer};
use tracing::{debug, trace, warn};

use crate::config::StreamCloseCb;
use crate::connection::Connection;
use crate::error::{BPARSER_EXCEPTION, Error};
use crate::event_loop::with_reactor;
use crate::stream::Stream;
use crate::types::ConnectionID;

/// How long an outgoing request waits for its response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Expiry check cadence.
const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Handler for an incoming command registered under an endpoint name.
pub type CommandHandler = Arc<dyn Fn(BtMessage) + Send + Sync>;

/// One-shot handler for the response (or timeout) of a sent request.
pub type ResponseHandler = Box<dyn FnOnce(BtMessage) + Send>;

struct SentRequest {
    rid: i64,
    expiry: Instant,
    cb: Option<ResponseHandler>,
}

/// Loop-side protocol state attached to the carrying stream.
pub(crate) struct BtState {
    assembler: FrameAssembler,
    sent_reqs: VecDeque<SentRequest>,
    commands: HashMap<Vec<u8>, CommandHandler>,
    next_rid: i64,
    timeout: Duration,
}

impl BtState {
    fn new() -> Self {
        Self {
            assembler: FrameAssembler::new(),
            sent_reqs: VecDeque::new(),
            commands: HashMap::new(),
            next_rid: 0,
            timeout: REQUEST_TIMEOUT,
        }
    }
}

// ── Message ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Command,
    Reply,
    Error,
    Timeout,
}

/// A decoded protocol message, handed to command handlers and response
/// callbacks.
///
/// Holds only ids back to its originating stream, so a message kept
/// around by the application does not keep the stream alive; replying
/// to a stream that has since gone away is a no-op.
pub struct BtMessage {
    kind: Kind,
    rid: i64,
    endpoint_name: Vec<u8>,
    body: Vec<u8>,
    origin: Option<Stream>,
}

impl BtMessage {
    pub(crate) fn timeout(rid: i64) -> Self {
        Self {
            kind: Kind::Timeout,
            rid,
            endpoint_name: Vec::new(),
            body: Vec::new(),
            origin: None,
        }
    }

    /// The request id this message belongs to.
    pub fn rid(&self) -> i64 {
        self.rid
    }

    /// The command's endpoint name (empty for replies).
    pub fn endpoint(&self) -> &[u8] {
        &self.endpoint_name
    }

    /// The message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// True for error replies and timeouts.
    pub fn is_error(&self) -> bool {
        matches!(self.kind, Kind::Error | Kind::Timeout)
    }

    /// True when this message reports a request timeout rather than a
    /// peer response.
    pub fn timed_out(&self) -> bool {
        self.kind == Kind::Timeout
    }

    /// Successful response or incoming command.
    pub fn ok(&self) -> bool {
        !self.is_error()
    }

    /// Post a reply on the originating stream. No-op if the stream is
    /// gone.
    pub fn respond(&self, body: impl Into<Vec<u8>>, is_error: bool) {
        let Some(origin) = &self.origin else {
            debug!("respond() on a message without an origin stream");
            return;
        };
        let frame = encode_response(self.rid, &body.into(), is_error);
        origin.send(frame);
    }
}

// ── Wire encoding ───────────────────────────────────────────────────

fn encode_command(rid: i64, endpoint: &[u8], body: &[u8]) -> Vec<u8> {
    let mut list = ListProducer::new();
    list.append_bytes(b"C")
        .append_int(rid)
        .append_bytes(endpoint)
        .append_bytes(body);
    list.into_framed()
}

fn encode_response(rid: i64, body: &[u8], is_error: bool) -> Vec<u8> {
    let mut list = ListProducer::new();
    list.append_bytes(if is_error { b"E" } else { b"R" })
        .append_int(rid)
        .append_bytes(body);
    list.into_framed()
}

fn decode_frame(frame: &[u8], origin: &Stream) -> Result<BtMessage, protocol_bt::ParseError> {
    let mut list = ListConsumer::new(frame)?;
    let kind = match list.next_bytes()? {
        t if t == b"C" => Kind::Command,
        t if t == b"R" => Kind::Reply,
        t if t == b"E" => Kind::Error,
        _ => return Err(protocol_bt::ParseError::Bencode("unknown message type")),
    };
    let rid = list.next_int()?;
    let endpoint_name = if kind == Kind::Command {
        list.next_bytes()?.to_vec()
    } else {
        Vec::new()
    };
    let body = list.next_bytes()?.to_vec();
    Ok(BtMessage {
        kind,
        rid,
        endpoint_name,
        body,
        origin: Some(origin.clone()),
    })
}

// ── Stream integration ──────────────────────────────────────────────

/// Open a fresh stream on `conn` carrying the request protocol.
pub(crate) fn open(
    conn: &Connection,
    close_cb: Option<StreamCloseCb>,
) -> Result<BtRequestStream, Error> {
    let stream = conn.open_stream_with(None, close_cb)?;
    install(&stream)?;
    Ok(BtRequestStream { stream })
}

/// Attach protocol state and the expiry ticker to `stream`.
fn install(stream: &Stream) -> Result<(), Error> {
    let h = stream.clone();
    stream.ev_loop.clone().call_get(move || {
        let (ep_id, cid, token) = (h.endpoint, h.conn, h.token);
        with_reactor(|r| {
            let timer_slot: Arc<OnceLock<u64>> = Arc::new(OnceLock::new());
            let slot = timer_slot.clone();
            let timer = r.timers.create(
                Box::new(move || check_timeouts(ep_id, cid, token, &slot)),
                Some(TIMEOUT_CHECK_INTERVAL),
                true,
                None,
            );
            timer_slot.set(timer).ok();
            r.timers.arm(timer, Instant::now() + TIMEOUT_CHECK_INTERVAL);

            let ep = r.endpoints.get_mut(ep_id).ok_or(Error::EndpointClosed)?;
            let state = ep.conns.get_mut(&cid).ok_or(Error::UnknownConnection)?;
            let s = state.streams.get_mut(&token).ok_or(Error::UnknownStream)?;
            s.bt = Some(Box::new(BtState::new()));
            Ok(())
        })
    })?
}

/// Raw stream data for a BT stream: feed the frame assembler, then
/// dispatch every completed frame. Runs outside the reactor borrow.
pub(crate) fn on_stream_data(stream: Stream, data: Bytes) {
    let frames = with_reactor(|r| {
        let bt = r
            .endpoints
            .get_mut(stream.endpoint)
            .and_then(|ep| ep.conns.get_mut(&stream.conn))
            .and_then(|c| c.streams.get_mut(&stream.token))
            .and_then(|s| s.bt.as_mut());
        match bt {
            Some(bt) => bt.assembler.push(&data).map(Some),
            None => Ok(None),
        }
    });

    match frames {
        Ok(Some(frames)) => {
            for frame in frames {
                dispatch_frame(&stream, frame);
            }
        }
        Ok(None) => {}
        Err(e) => {
            warn!("bt parser error: {e}; closing stream");
            stream.close(BPARSER_EXCEPTION);
        }
    }
}

fn dispatch_frame(stream: &Stream, frame: Vec<u8>) {
    let msg = match decode_frame(&frame, stream) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("bt frame decode failed: {e}; closing stream");
            stream.close(BPARSER_EXCEPTION);
            return;
        }
    };

    match msg.kind {
        Kind::Reply | Kind::Error => {
            let rid = msg.rid;
            let cb = with_reactor(|r| {
                let bt = r
                    .endpoints
                    .get_mut(stream.endpoint)
                    .and_then(|ep| ep.conns.get_mut(&stream.conn))
                    .and_then(|c| c.streams.get_mut(&stream.token))
                    .and_then(|s| s.bt.as_mut())?;
                let idx = bt
                    .sent_reqs
                    .binary_search_by(|req| req.rid.cmp(&rid))
                    .ok()?;
                bt.sent_reqs.remove(idx).and_then(|req| req.cb)
            });
            match cb {
                Some(cb) => {
                    trace!("matched response to request {rid}");
                    cb(msg);
                }
                None => debug!("response for unknown request {rid}, dropped"),
            }
        }
        Kind::Command => {
            let handler = with_reactor(|r| {
                let bt = r
                    .endpoints
                    .get_mut(stream.endpoint)
                    .and_then(|ep| ep.conns.get_mut(&stream.conn))
                    .and_then(|c| c.streams.get_mut(&stream.token))
                    .and_then(|s| s.bt.as_mut())?;
                bt.commands.get(&msg.endpoint_name).cloned()
            });
            match handler {
                Some(handler) => handler(msg),
                None => debug!(
                    "no handler for command endpoint {:?}, dropped",
                    String::from_utf8_lossy(&msg.endpoint_name)
                ),
            }
        }
        Kind::Timeout => unreachable!("timeouts are synthesized locally"),
    }
}

/// Ticker body: fire expired requests from the front of the deque.
fn check_timeouts(ep_id: usize, cid: ConnectionID, token: u64, timer: &Arc<OnceLock<u64>>) {
    let mut fired: Vec<(i64, ResponseHandler)> = Vec::new();
    with_reactor(|r| {
        let bt = r
            .endpoints
            .get_mut(ep_id)
            .and_then(|ep| ep.conns.get_mut(&cid))
            .and_then(|c| c.streams.get_mut(&token))
            .and_then(|s| s.bt.as_mut());
        let Some(bt) = bt else {
            // Stream is gone; retire the ticker with it.
            if let Some(&id) = timer.get() {
                r.timers.remove(id);
            }
            return;
        };
        let now = Instant::now();
        while let Some(front) = bt.sent_reqs.front() {
            if front.expiry > now {
                break;
            }
            let mut req = bt.sent_reqs.pop_front().expect("front checked");
            if let Some(cb) = req.cb.take() {
                fired.push((req.rid, cb));
            }
        }
    });
    for (rid, cb) in fired {
        debug!("request {rid} timed out");
        cb(BtMessage::timeout(rid));
    }
}

/// Take every outstanding request when the stream closes out; the
/// caller fires their callbacks with timeout messages once the state
/// borrow is released.
pub(crate) fn drain_requests(bt: &mut BtState) -> Vec<(i64, ResponseHandler)> {
    bt.sent_reqs
        .drain(..)
        .filter_map(|mut req| req.cb.take().map(|cb| (req.rid, cb)))
        .collect()
}

// ── Application handle ──────────────────────────────────────────────

/// A stream carrying the length-prefixed request protocol.
#[derive(Clone)]
pub struct BtRequestStream {
    stream: Stream,
}

impl BtRequestStream {
    /// Attach the request protocol to an existing stream (typically in
    /// a stream-open callback on the accepting side).
    pub fn upgrade(stream: &Stream) -> Result<Self, Error> {
        install(stream)?;
        Ok(Self {
            stream: stream.clone(),
        })
    }

    /// The underlying stream.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Override the response timeout for requests sent after this call
    /// (default [`REQUEST_TIMEOUT`]).
    pub fn set_request_timeout(&self, timeout: Duration) {
        let h = self.stream.clone();
        self.stream.ev_loop.clone().call(move || {
            with_reactor(|r| {
                let bt = r
                    .endpoints
                    .get_mut(h.endpoint)
                    .and_then(|ep| ep.conns.get_mut(&h.conn))
                    .and_then(|c| c.streams.get_mut(&h.token))
                    .and_then(|s| s.bt.as_mut());
                if let Some(bt) = bt {
                    bt.timeout = timeout;
                }
            });
        });
    }

    /// Register a handler for incoming commands addressed to `name`.
    pub fn register_command(
        &self,
        name: impl Into<Vec<u8>>,
        handler: impl Fn(BtMessage) + Send + Sync + 'static,
    ) {
        let name = name.into();
        let handler: CommandHandler = Arc::new(handler);
        let h = self.stream.clone();
        self.stream.ev_loop.clone().call(move || {
            with_reactor(|r| {
                let bt = r
                    .endpoints
                    .get_mut(h.endpoint)
                    .and_then(|ep| ep.conns.get_mut(&h.conn))
                    .and_then(|c| c.streams.get_mut(&h.token))
                    .and_then(|s| s.bt.as_mut());
                if let Some(bt) = bt {
                    bt.commands.insert(name, handler);
                }
            });
        });
    }

    /// Send a command to the peer's `endpoint` handler; `cb` fires
    /// exactly once with the response, an error reply, or a timeout.
    pub fn request(
        &self,
        endpoint: impl Into<Vec<u8>>,
        body: impl Into<Vec<u8>>,
        cb: impl FnOnce(BtMessage) + Send + 'static,
    ) -> Result<(), Error> {
        let endpoint = endpoint.into();
        let body = body.into();
        let cb: ResponseHandler = Box::new(cb);
        let h = self.stream.clone();
        self.stream.ev_loop.clone().call_get(move || {
            let frame = with_reactor(|r| {
                let bt = r
                    .endpoints
                    .get_mut(h.endpoint)
                    .and_then(|ep| ep.conns.get_mut(&h.conn))
                    .and_then(|c| c.streams.get_mut(&h.token))
                    .and_then(|s| s.bt.as_mut())
                    .ok_or(Error::UnknownStream)?;
                let rid = bt.next_rid;
                bt.next_rid += 1;
                bt.sent_reqs.push_back(SentRequest {
                    rid,
                    expiry: Instant::now() + bt.timeout,
                    cb: Some(cb),
                });
                Ok::<_, Error>(encode_command(rid, &endpoint, &body))
            })?;
            crate::connection::stream_append(&h, frame.into());
            Ok(())
        })?
    }

    /// Send a command without expecting a response.
    pub fn command(
        &self,
        endpoint: impl Into<Vec<u8>>,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), Error> {
        let endpoint = endpoint.into();
        let body = body.into();
        let h = self.stream.clone();
        self.stream.ev_loop.clone().call_get(move || {
            let frame = with_reactor(|r| {
                let bt = r
                    .endpoints
                    .get_mut(h.endpoint)
                    .and_then(|ep| ep.conns.get_mut(&h.conn))
                    .and_then(|c| c.streams.get_mut(&h.token))
                    .and_then(|s| s.bt.as_mut())
                    .ok_or(Error::UnknownStream)?;
                let rid = bt.next_rid;
                bt.next_rid += 1;
                Ok::<_, Error>(encode_command(rid, &endpoint, &body))
            })?;
            crate::connection::stream_append(&h, frame.into());
            Ok(())
        })?
    }

    /// Close the carrying stream.
    pub fn close(&self, code: u64) {
        self.stream.close(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command_frame() {
        let frame = encode_command(0, b"ping", b"body");
        // body list: l 1:C i0e 4:ping 4:body e -> 21 bytes
        let body = b"l1:Ci0e4:ping4:bodye";
        let expected = format!("{}:", body.len());
        assert!(frame.starts_with(expected.as_bytes()));
        assert!(frame.ends_with(body));
    }

    #[test]
    fn test_encode_response_frames() {
        let ok = encode_response(3, b"pong", false);
        assert!(ok.ends_with(b"l1:Ri3e4:ponge"));
        let err = encode_response(3, b"nope", true);
        assert!(err.ends_with(b"l1:Ei3e4:nopee"));
    }

    #[test]
    fn test_timeout_message_shape() {
        let msg = BtMessage::timeout(9);
        assert_eq!(msg.rid(), 9);
        assert!(msg.timed_out());
        assert!(msg.is_error());
        assert!(!msg.ok());
    }
}
