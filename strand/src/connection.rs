//! Per-connection state machine.
//!
//! A [`ConnState`] owns the engine's connection object and everything
//! hanging off it: the stream map (keyed by a library-local token, since
//! streams can exist before the engine admits them), the pending-stream
//! queue, the datagram engine, and the retransmit/handshake timers.
//!
//! The driving pattern mirrors the engine wrapper it is built on: feed
//! datagrams and timeouts into the engine, drain its event queue into
//! state changes, fill stream frames, pump transmits, re-arm the timer.
//! Application callbacks are never invoked while the reactor is
//! borrowed; event processing collects [`Dispatch`] values that run
//! afterwards.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use quinn_proto::{Dir, Event, SendDatagramError, StreamEvent, StreamId, VarInt, WriteError};
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::config::{
    ConnClosedCb, ConnOpenCb, DatagramCb, StreamCloseCb, StreamDataCb, StreamOpenCb,
};
use crate::datagram::DatagramEngine;
use crate::endpoint::EndpointState;
use crate::error::{Error, STREAM_ERROR_EXCEPTION};
use crate::event_loop::{EventLoop, Timers, with_reactor};
use crate::metrics;
use crate::stream::{ChunkProducer, Stream, StreamState, WatermarkState};
use crate::types::{ConnectionID, Direction};

/// Bytes read from a stream per chunk handed to the data callback.
const RECV_CHUNK: usize = 64 * 1024;

/// Engine transmits pumped per flush before the connection re-posts
/// itself, so one busy connection cannot starve the loop.
const MAX_FLUSH_PACKETS: usize = 128;

// ── Loop-side state ─────────────────────────────────────────────────

pub(crate) struct ConnState {
    pub(crate) id: ConnectionID,
    pub(crate) handle: quinn_proto::ConnectionHandle,
    pub(crate) conn: quinn_proto::Connection,
    pub(crate) direction: Direction,

    /// Streams by library token; admitted streams also appear in
    /// `by_sid`, not-yet-admitted ones in `pending_streams` (never
    /// both).
    pub(crate) streams: HashMap<u64, StreamState>,
    pub(crate) by_sid: HashMap<StreamId, u64>,
    pub(crate) pending_streams: VecDeque<u64>,
    next_stream_token: u64,

    pub(crate) datagrams: Option<DatagramEngine>,

    pub(crate) established: bool,
    pub(crate) closing: bool,
    pub(crate) draining: bool,
    pub(crate) engine_drained: bool,
    pub(crate) closed_cb_fired: bool,
    local_close_code: u64,
    io_ready_pending: bool,

    pub(crate) retransmit_timer: u64,
    pub(crate) handshake_timer: Option<u64>,

    pub(crate) callbacks: ConnCallbacks,
}

/// Callback bundle a connection carries for its lifetime.
#[derive(Default)]
pub(crate) struct ConnCallbacks {
    pub(crate) on_established: Option<ConnOpenCb>,
    pub(crate) on_closed: Option<ConnClosedCb>,
    pub(crate) stream_data: Option<StreamDataCb>,
    pub(crate) stream_close: Option<StreamCloseCb>,
    pub(crate) stream_open: Option<StreamOpenCb>,
    pub(crate) datagram: Option<DatagramCb>,
}

impl ConnState {
    pub(crate) fn new(
        id: ConnectionID,
        handle: quinn_proto::ConnectionHandle,
        conn: quinn_proto::Connection,
        direction: Direction,
        datagrams: Option<DatagramEngine>,
        retransmit_timer: u64,
        callbacks: ConnCallbacks,
    ) -> Self {
        Self {
            id,
            handle,
            conn,
            direction,
            streams: HashMap::new(),
            by_sid: HashMap::new(),
            pending_streams: VecDeque::new(),
            next_stream_token: 1,
            datagrams,
            established: false,
            closing: false,
            draining: false,
            engine_drained: false,
            closed_cb_fired: false,
            local_close_code: 0,
            io_ready_pending: false,
            retransmit_timer,
            handshake_timer: None,
            callbacks,
        }
    }

    fn alloc_token(&mut self) -> u64 {
        let token = self.next_stream_token;
        self.next_stream_token += 1;
        token
    }
}

// ── Deferred application callbacks ──────────────────────────────────

/// Work collected while the reactor is borrowed and executed after the
/// borrow is released, so callbacks may freely re-enter the library.
pub(crate) enum Dispatch {
    /// Inbound stream data. The sink (data callback or BT layer) is
    /// resolved at dispatch time, after any stream-open callback queued
    /// ahead of it has run and had its chance to install one.
    StreamData {
        stream: Stream,
        data: Bytes,
    },
    StreamOpened {
        cb: StreamOpenCb,
        stream: Stream,
    },
    /// Tear a stream down: removal and the close callback run at
    /// dispatch time so data chunks queued ahead of the teardown still
    /// find the stream.
    StreamFinalize {
        stream: Stream,
        code: u64,
    },
    Established {
        cb: ConnOpenCb,
        conn: Connection,
    },
    ConnClosed {
        cb: ConnClosedCb,
        conn: Connection,
        code: u64,
    },
    Datagram {
        cb: DatagramCb,
        conn: Connection,
        data: Bytes,
    },
    Watermark {
        hook: Arc<dyn Fn(Stream) + Send + Sync>,
        stream: Stream,
    },
    ProducerDone {
        cb: Box<dyn FnOnce(Stream) + Send>,
        stream: Stream,
    },
    ManualSend {
        hook: crate::config::SendHook,
        path: crate::types::Path,
        data: Vec<u8>,
        segment_size: Option<usize>,
    },
}

/// Run collected dispatches. Must be called without the reactor
/// borrowed.
pub(crate) fn run_dispatches(dispatches: Vec<Dispatch>) {
    for dispatch in dispatches {
        match dispatch {
            Dispatch::StreamData { stream, data } => deliver_stream_data(stream, data),
            Dispatch::StreamOpened { cb, stream } => {
                if !cb(stream.clone()) {
                    debug!("stream open callback rejected stream");
                    stream_close(&stream, 1);
                }
            }
            Dispatch::StreamFinalize { stream, code } => finalize_stream(stream, code),
            Dispatch::Established { cb, conn } => cb(conn),
            Dispatch::ConnClosed { cb, conn, code } => cb(conn, code),
            Dispatch::Datagram { cb, conn, data } => cb(conn, data),
            Dispatch::Watermark { hook, stream } => hook(stream),
            Dispatch::ProducerDone { cb, stream } => cb(stream),
            Dispatch::ManualSend {
                hook,
                path,
                data,
                segment_size,
            } => {
                let seg = segment_size.unwrap_or(data.len()).max(1);
                for piece in data.chunks(seg) {
                    hook(path, piece);
                }
            }
        }
    }
}

/// Route one inbound chunk to whatever sink the stream has now.
fn deliver_stream_data(stream: Stream, data: Bytes) {
    enum Sink {
        Bt,
        Callback(StreamDataCb),
        None,
    }
    let sink = with_reactor(|r| {
        let s = r
            .endpoints
            .get_mut(stream.endpoint)
            .and_then(|ep| ep.conns.get_mut(&stream.conn))
            .and_then(|c| c.streams.get_mut(&stream.token));
        match s {
            Some(s) if s.bt.is_some() => Sink::Bt,
            Some(s) => match s.data_cb.clone() {
                Some(cb) => Sink::Callback(cb),
                None => Sink::None,
            },
            None => Sink::None,
        }
    });
    match sink {
        Sink::Bt => crate::btstream::on_stream_data(stream, data),
        Sink::Callback(cb) => {
            if cb(stream.clone(), data).is_err() {
                warn!("stream data callback failed, closing stream");
                stream_close(&stream, STREAM_ERROR_EXCEPTION);
            }
        }
        Sink::None => {
            trace!("stream {} has no data sink, {} bytes dropped", stream.token, data.len());
        }
    }
}

// ── Driving ─────────────────────────────────────────────────────────

/// Coalesced io-ready: schedule one drive job for this connection.
pub(crate) fn io_ready(
    shared: &Arc<crate::event_loop::LoopShared>,
    ep_id: usize,
    state: &mut ConnState,
) {
    if state.io_ready_pending {
        return;
    }
    state.io_ready_pending = true;
    let cid = state.id;
    shared.post(Box::new(move || drive(ep_id, cid)));
}

/// The io-ready job: translate engine events, fill streams, pump
/// transmits, re-arm timers, then run application callbacks.
pub(crate) fn drive(ep_id: usize, cid: ConnectionID) {
    let mut out = Vec::new();
    with_reactor(|r| {
        let shared = r.shared.clone();
        let timers = &mut r.timers;
        if let Some(ep) = r.endpoints.get_mut(ep_id) {
            drive_locked(&shared, timers, ep_id, ep, cid, &mut out);
        }
    });
    run_dispatches(out);
}

/// Retransmit timer fire: hand the expiry to the engine, then drive.
fn on_retransmit(ep_id: usize, cid: ConnectionID) {
    with_reactor(|r| {
        if let Some(ep) = r.endpoints.get_mut(ep_id) {
            if let Some(state) = ep.conns.get_mut(&cid) {
                state.conn.handle_timeout(Instant::now());
            }
        }
    });
    drive(ep_id, cid);
}

/// Create the persistent retransmit timer entry for a connection.
pub(crate) fn make_retransmit_timer(timers: &mut Timers, ep_id: usize, cid: ConnectionID) -> u64 {
    timers.create(
        Box::new(move || on_retransmit(ep_id, cid)),
        None,
        true,
        None,
    )
}

/// Arm the handshake deadline; fires once and closes the connection if
/// it is still handshaking.
pub(crate) fn arm_handshake_timer(
    timers: &mut Timers,
    ep_id: usize,
    cid: ConnectionID,
    timeout: Duration,
) -> u64 {
    let id = timers.create(
        Box::new(move || on_handshake_deadline(ep_id, cid)),
        None,
        false,
        None,
    );
    timers.arm(id, Instant::now() + timeout);
    id
}

fn on_handshake_deadline(ep_id: usize, cid: ConnectionID) {
    let expired = with_reactor(|r| {
        let ep = r.endpoints.get_mut(ep_id)?;
        let state = ep.conns.get_mut(&cid)?;
        if state.established || state.closing || state.draining {
            return None;
        }
        Some(Connection {
            ev_loop: ep.ev_loop.clone(),
            endpoint: ep_id,
            id: cid,
        })
    });
    if let Some(conn) = expired {
        debug!("connection {cid} handshake timed out");
        conn.close(0, "handshake timeout");
    }
}

/// The full per-connection drive pass, reactor borrowed.
pub(crate) fn drive_locked(
    shared: &Arc<crate::event_loop::LoopShared>,
    timers: &mut Timers,
    ep_id: usize,
    ep: &mut EndpointState,
    cid: ConnectionID,
    out: &mut Vec<Dispatch>,
) {
    if !ep.conns.contains_key(&cid) {
        return;
    }
    let now = Instant::now();

    process_endpoint_events(ep, cid);
    process_app_events(shared, timers, ep_id, ep, cid, out);

    let draining = match ep.conns.get_mut(&cid) {
        Some(state) => {
            state.io_ready_pending = false;
            state.draining
        }
        None => return,
    };
    if !draining {
        fill_streams(ep_id, ep, cid, out);
    }
    pump_transmits(shared, ep_id, ep, cid, now, out);
    arm_retransmit(timers, ep, cid, now);
}

/// Step 1 of the drive: shuttle endpoint events between the connection
/// and the engine endpoint (connection id churn, drained notice).
fn process_endpoint_events(ep: &mut EndpointState, cid: ConnectionID) {
    let EndpointState { quic, conns, .. } = ep;
    let Some(state) = conns.get_mut(&cid) else {
        return;
    };
    while let Some(event) = state.conn.poll_endpoint_events() {
        if event.is_drained() {
            state.engine_drained = true;
        }
        if let Some(conn_event) = quic.handle_event(state.handle, event) {
            state.conn.handle_event(conn_event);
        }
    }
}

/// Step 2: drain the engine's application event queue.
fn process_app_events(
    shared: &Arc<crate::event_loop::LoopShared>,
    timers: &mut Timers,
    ep_id: usize,
    ep: &mut EndpointState,
    cid: ConnectionID,
    out: &mut Vec<Dispatch>,
) {
    let ev_loop = ep.ev_loop.clone();
    let Some(state) = ep.conns.get_mut(&cid) else {
        return;
    };
    let mut lost: Option<quinn_proto::ConnectionError> = None;

    while let Some(event) = state.conn.poll() {
        match event {
            Event::Connected => {
                state.established = true;
                if let Some(id) = state.handshake_timer.take() {
                    timers.remove(id);
                }
                trace!("connection {cid} established");
                // The peer's stream allowance is first known here; admit
                // anything opened before the handshake finished.
                check_pending_streams(shared, ep_id, state);
                if let Some(cb) = state.callbacks.on_established.clone() {
                    out.push(Dispatch::Established {
                        cb,
                        conn: Connection {
                            ev_loop: ev_loop.clone(),
                            endpoint: ep_id,
                            id: cid,
                        },
                    });
                }
            }
            Event::ConnectionLost { reason } => {
                debug!("connection {cid} lost: {reason}");
                lost = Some(reason);
                break;
            }
            Event::Stream(stream_event) => {
                handle_stream_event(shared, ep_id, &ev_loop, state, cid, stream_event, out);
            }
            Event::DatagramReceived => {
                let mut raw = Vec::new();
                while let Some(data) = state.conn.datagrams().recv() {
                    raw.push(data);
                }
                if let Some(engine) = &mut state.datagrams {
                    for data in raw {
                        if let Some(whole) = engine.receive(data) {
                            metrics::DATAGRAMS_RECEIVED.increment();
                            if let Some(cb) = state.callbacks.datagram.clone() {
                                out.push(Dispatch::Datagram {
                                    cb,
                                    conn: Connection {
                                        ev_loop: ev_loop.clone(),
                                        endpoint: ep_id,
                                        id: cid,
                                    },
                                    data: whole,
                                });
                            }
                        }
                    }
                }
            }
            Event::DatagramsUnblocked => {
                if let Some(engine) = &mut state.datagrams {
                    while let Some(data) = engine.unsent.pop_front() {
                        match state.conn.datagrams().send(data, false) {
                            Ok(()) => {}
                            Err(SendDatagramError::Blocked(data)) => {
                                engine.unsent.push_front(data);
                                break;
                            }
                            Err(e) => {
                                debug!("queued datagram dropped: {e}");
                            }
                        }
                    }
                }
            }
            Event::HandshakeDataReady => {}
        }
    }

    if let Some(reason) = lost {
        let code = close_code_of(&reason, state.local_close_code);
        crate::endpoint::drain_connection(ep, cid, code, out);
    }
}

/// Map an engine loss reason to the application-visible close code.
fn close_code_of(reason: &quinn_proto::ConnectionError, local: u64) -> u64 {
    match reason {
        quinn_proto::ConnectionError::ApplicationClosed(close) => close.error_code.into_inner(),
        quinn_proto::ConnectionError::LocallyClosed => local,
        _ => 0,
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_stream_event(
    shared: &Arc<crate::event_loop::LoopShared>,
    ep_id: usize,
    ev_loop: &EventLoop,
    state: &mut ConnState,
    cid: ConnectionID,
    event: StreamEvent,
    out: &mut Vec<Dispatch>,
) {
    match event {
        StreamEvent::Opened { dir: Dir::Bi } => {
            while let Some(sid) = state.conn.streams().accept(Dir::Bi) {
                accept_stream(ep_id, ev_loop, state, cid, sid, out);
            }
        }
        StreamEvent::Opened { dir: Dir::Uni } => {
            // This transport is bidirectional-only; refuse politely.
            while let Some(sid) = state.conn.streams().accept(Dir::Uni) {
                let _ = state.conn.recv_stream(sid).stop(0u32.into());
            }
        }
        StreamEvent::Readable { id } => {
            read_stream(shared, ep_id, ev_loop, state, cid, id, out);
        }
        StreamEvent::Writable { .. } => {
            // Flow control opened; the fill pass after event processing
            // picks the buffered data up.
        }
        StreamEvent::Available { dir: Dir::Bi } => {
            check_pending_streams(shared, ep_id, state);
        }
        StreamEvent::Available { dir: Dir::Uni } => {}
        StreamEvent::Finished { id } => {
            if let Some(&token) = state.by_sid.get(&id) {
                if let Some(s) = state.streams.get_mut(&token) {
                    s.send_done = true;
                }
                maybe_finish_stream(ep_id, ev_loop, state, cid, token, out);
            }
        }
        StreamEvent::Stopped { id, error_code } => {
            if let Some(&token) = state.by_sid.get(&id) {
                if let Some(s) = state.streams.get_mut(&token) {
                    debug!("peer stopped stream {id} with code {error_code}");
                    s.send_done = true;
                    s.close_code = error_code.into_inner();
                    s.user_buffers.clear();
                    s.unacked_size = 0;
                }
                maybe_finish_stream(ep_id, ev_loop, state, cid, token, out);
            }
        }
    }
}

/// Construct state for a peer-opened stream and queue the open callback.
fn accept_stream(
    ep_id: usize,
    ev_loop: &EventLoop,
    state: &mut ConnState,
    cid: ConnectionID,
    sid: StreamId,
    out: &mut Vec<Dispatch>,
) {
    let token = state.alloc_token();
    let mut s = StreamState::new(
        token,
        state.callbacks.stream_data.clone(),
        state.callbacks.stream_close.clone(),
    );
    s.sid = Some(sid);
    s.ready = true;
    state.streams.insert(token, s);
    state.by_sid.insert(sid, token);
    metrics::STREAMS_OPENED.increment();
    debug!("peer opened stream {sid} on {cid}");

    if let Some(cb) = state.callbacks.stream_open.clone() {
        out.push(Dispatch::StreamOpened {
            cb,
            stream: Stream {
                ev_loop: ev_loop.clone(),
                endpoint: ep_id,
                conn: cid,
                token,
            },
        });
    }
}

/// Drain readable data into the stream's sink.
fn read_stream(
    shared: &Arc<crate::event_loop::LoopShared>,
    ep_id: usize,
    ev_loop: &EventLoop,
    state: &mut ConnState,
    cid: ConnectionID,
    sid: StreamId,
    out: &mut Vec<Dispatch>,
) {
    let Some(&token) = state.by_sid.get(&sid) else {
        return;
    };

    let mut chunks_data = Vec::new();
    let mut fin = false;
    let mut reset: Option<u64> = None;
    let mut want_transmit = false;

    {
        let mut recv = state.conn.recv_stream(sid);
        let mut chunks = match recv.read(true) {
            Ok(chunks) => chunks,
            Err(_) => return,
        };
        loop {
            match chunks.next(RECV_CHUNK) {
                Ok(Some(chunk)) => chunks_data.push(chunk.bytes),
                Ok(None) => {
                    fin = true;
                    break;
                }
                Err(quinn_proto::ReadError::Blocked) => break,
                Err(quinn_proto::ReadError::Reset(code)) => {
                    reset = Some(code.into_inner());
                    break;
                }
            }
        }
        if chunks.finalize().should_transmit() {
            want_transmit = true;
        }
    }

    let Some(s) = state.streams.get_mut(&token) else {
        return;
    };
    let stream = Stream {
        ev_loop: ev_loop.clone(),
        endpoint: ep_id,
        conn: cid,
        token,
    };

    for data in chunks_data {
        out.push(Dispatch::StreamData {
            stream: stream.clone(),
            data,
        });
    }

    if let Some(code) = reset {
        debug!("stream {sid} reset by peer with code {code}");
        s.recv_done = true;
        s.send_done = true;
        s.close_code = code;
        maybe_finish_stream(ep_id, ev_loop, state, cid, token, out);
    } else if fin {
        trace!("stream {sid} finished by peer");
        s.recv_done = true;
        maybe_finish_stream(ep_id, ev_loop, state, cid, token, out);
    }

    if want_transmit {
        io_ready(shared, ep_id, state);
    }
}

/// Fire the close callback and drop the stream once both directions are
/// done.
fn maybe_finish_stream(
    ep_id: usize,
    ev_loop: &EventLoop,
    state: &mut ConnState,
    cid: ConnectionID,
    token: u64,
    out: &mut Vec<Dispatch>,
) {
    let Some(s) = state.streams.get_mut(&token) else {
        return;
    };
    if !(s.recv_done && s.send_done) {
        return;
    }
    let code = s.close_code;
    finish_stream(ep_id, ev_loop, state, cid, token, code, out);
}

/// Schedule a stream's teardown: marks it shut down and queues the
/// finalize dispatch (exactly once per stream).
pub(crate) fn finish_stream(
    ep_id: usize,
    ev_loop: &EventLoop,
    state: &mut ConnState,
    cid: ConnectionID,
    token: u64,
    code: u64,
    out: &mut Vec<Dispatch>,
) {
    let Some(s) = state.streams.get_mut(&token) else {
        return;
    };
    if s.is_shutdown {
        return;
    }
    s.is_shutdown = true;
    s.is_closing = true;
    debug!("stream {token} on {cid} closing with code {code}");
    out.push(Dispatch::StreamFinalize {
        stream: Stream {
            ev_loop: ev_loop.clone(),
            endpoint: ep_id,
            conn: cid,
            token,
        },
        code,
    });
}

/// The deferred half of [`finish_stream`]: erase the state, fail
/// outstanding BT requests, fire the close callback exactly once.
fn finalize_stream(stream: Stream, code: u64) {
    let work = with_reactor(|r| {
        let state = r
            .endpoints
            .get_mut(stream.endpoint)
            .and_then(|ep| ep.conns.get_mut(&stream.conn))?;
        let mut s = state.streams.remove(&stream.token)?;
        if let Some(sid) = s.sid {
            state.by_sid.remove(&sid);
        }
        state.pending_streams.retain(|&t| t != stream.token);
        metrics::STREAMS_CLOSED.increment();

        let failed = match s.bt.as_mut() {
            Some(bt) => crate::btstream::drain_requests(bt),
            None => Vec::new(),
        };
        let close_cb = if s.close_cb_fired {
            None
        } else {
            s.close_cb.clone()
        };
        Some((failed, close_cb))
    });

    let Some((failed, close_cb)) = work else {
        return;
    };
    for (rid, cb) in failed {
        debug!("request {rid} failed: stream closed");
        cb(crate::btstream::BtMessage::timeout(rid));
    }
    if let Some(cb) = close_cb {
        cb(stream, code);
    }
}

/// Admit pending streams FIFO while the engine hands out ids.
fn check_pending_streams(
    shared: &Arc<crate::event_loop::LoopShared>,
    ep_id: usize,
    state: &mut ConnState,
) {
    let mut admitted = false;
    while let Some(&token) = state.pending_streams.front() {
        match state.conn.streams().open(Dir::Bi) {
            Some(sid) => {
                state.pending_streams.pop_front();
                if let Some(s) = state.streams.get_mut(&token) {
                    debug!("pending stream {token} admitted as {sid}");
                    s.sid = Some(sid);
                    s.ready = true;
                    state.by_sid.insert(sid, token);
                    admitted = true;
                } else {
                    // Stream was closed while pending; release the id by
                    // finishing it immediately.
                    let _ = state.conn.send_stream(sid).finish();
                }
            }
            None => break,
        }
    }
    if admitted {
        io_ready(shared, ep_id, state);
    }
}

/// Step 3: move buffered stream data into the engine.
///
/// Iteration starts at a uniformly random offset into the stream list so
/// early streams cannot starve later ones. The engine consumes what its
/// flow-control window allows; blocked streams drop out of the round and
/// resume on the next writable event.
fn fill_streams(ep_id: usize, ep: &mut EndpointState, cid: ConnectionID, out: &mut Vec<Dispatch>) {
    let ev_loop = ep.ev_loop.clone();
    let Some(state) = ep.conns.get_mut(&cid) else {
        return;
    };
    if state.closing || state.draining {
        return;
    }

    let mut tokens: Vec<u64> = state
        .streams
        .iter()
        .filter(|(_, s)| s.ready && s.sid.is_some() && !s.sent_fin && !s.is_shutdown)
        .filter(|(_, s)| s.has_unsent() || s.producer.is_some() || s.is_closing)
        .map(|(&t, _)| t)
        .collect();
    if tokens.is_empty() {
        return;
    }
    let start = rand::thread_rng().gen_range(0..tokens.len());
    tokens.rotate_left(start);

    let mut finished = Vec::new();
    for token in tokens {
        let ConnState { conn, streams, .. } = state;
        let Some(s) = streams.get_mut(&token) else {
            continue;
        };
        let sid = s.sid.expect("filtered on sid");
        let mut stopped: Option<u64> = None;

        loop {
            if let Some(done) = s.refill_from_producer() {
                out.push(Dispatch::ProducerDone {
                    cb: done,
                    stream: Stream {
                        ev_loop: ev_loop.clone(),
                        endpoint: ep_id,
                        conn: cid,
                        token,
                    },
                });
            }

            let mut accepted = 0usize;
            'chunks: for chunk in s.pending() {
                let mut offset = 0;
                while offset < chunk.len() {
                    match conn.send_stream(sid).write(&chunk[offset..]) {
                        Ok(0) => break 'chunks,
                        Ok(n) => {
                            offset += n;
                            accepted += n;
                        }
                        Err(WriteError::Blocked) => break 'chunks,
                        Err(WriteError::Stopped(code)) => {
                            stopped = Some(code.into_inner());
                            break 'chunks;
                        }
                        Err(_) => break 'chunks,
                    }
                }
            }

            if accepted == 0 {
                break;
            }
            // The engine owns accepted bytes from here (it buffers and
            // retransmits internally), so consumption and release
            // coincide.
            s.wrote(accepted);
            s.acknowledge(accepted);
            if let Some(hook) = s.take_watermark_fire() {
                out.push(Dispatch::Watermark {
                    hook,
                    stream: Stream {
                        ev_loop: ev_loop.clone(),
                        endpoint: ep_id,
                        conn: cid,
                        token,
                    },
                });
            }
        }

        if let Some(code) = stopped {
            s.send_done = true;
            s.close_code = code;
            s.user_buffers.clear();
            s.unacked_size = 0;
            finished.push(token);
            continue;
        }

        if s.is_closing && !s.sent_fin && !s.has_unsent() {
            trace!("sending FIN on stream {sid}");
            if conn.send_stream(sid).finish().is_ok() {
                s.sent_fin = true;
            }
        }
    }

    for token in finished {
        maybe_finish_stream(ep_id, &ev_loop, state, cid, token, out);
    }
}

/// Step 4: drain the engine's transmit queue through the endpoint's
/// send path.
fn pump_transmits(
    shared: &Arc<crate::event_loop::LoopShared>,
    ep_id: usize,
    ep: &mut EndpointState,
    cid: ConnectionID,
    now: Instant,
    out: &mut Vec<Dispatch>,
) {
    let max_segments = ep.max_gso_segments();
    let mut budget = MAX_FLUSH_PACKETS;
    let mut buf = Vec::with_capacity(u16::MAX as usize);
    let mut again = false;

    loop {
        let Some(state) = ep.conns.get_mut(&cid) else {
            return;
        };
        buf.clear();
        let transmit = match state.conn.poll_transmit(now, max_segments, &mut buf) {
            Some(t) => t,
            None => break,
        };
        let segments = transmit.size.div_ceil(transmit.segment_size.unwrap_or(transmit.size).max(1));
        ep.send_transmit(
            transmit.destination,
            transmit.ecn,
            buf[..transmit.size].to_vec(),
            transmit.segment_size,
            out,
        );
        budget = budget.saturating_sub(segments.max(1));
        if budget == 0 {
            again = true;
            break;
        }
    }

    if again {
        if let Some(state) = ep.conns.get_mut(&cid) {
            io_ready(shared, ep_id, state);
        }
    }
}

/// Step 5: re-arm the retransmit timer from the engine's next deadline,
/// truncated to millisecond granularity. An already-due deadline fires
/// the expiry inline.
fn arm_retransmit(timers: &mut Timers, ep: &mut EndpointState, cid: ConnectionID, now: Instant) {
    let Some(state) = ep.conns.get_mut(&cid) else {
        return;
    };
    match state.conn.poll_timeout() {
        Some(deadline) => {
            let delay = Duration::from_millis(
                deadline.saturating_duration_since(now).as_millis() as u64
            );
            timers.arm(state.retransmit_timer, now + delay);
        }
        None => timers.disarm(state.retransmit_timer),
    }
}

// ── Operations invoked from application handles ─────────────────────

pub(crate) fn stream_append(h: &Stream, data: Bytes) {
    let mut ok = true;
    with_reactor(|r| {
        let shared = r.shared.clone();
        let Some(ep) = r.endpoints.get_mut(h.endpoint) else {
            ok = false;
            return;
        };
        let Some(state) = ep.conns.get_mut(&h.conn) else {
            ok = false;
            return;
        };
        let Some(s) = state.streams.get_mut(&h.token) else {
            ok = false;
            return;
        };
        if s.is_closing || s.is_shutdown {
            ok = false;
            return;
        }
        s.append(data);
        if s.ready {
            io_ready(&shared, h.endpoint, state);
        } else {
            trace!("stream {} not admitted yet, data on deck", h.token);
        }
    });
    if !ok {
        debug!("stream_append on a closed or unknown stream, dropped");
    }
}

pub(crate) fn stream_install_producer(h: &Stream, producer: ChunkProducer) {
    with_reactor(|r| {
        let shared = r.shared.clone();
        let Some(ep) = r.endpoints.get_mut(h.endpoint) else {
            return;
        };
        let Some(state) = ep.conns.get_mut(&h.conn) else {
            return;
        };
        let Some(s) = state.streams.get_mut(&h.token) else {
            return;
        };
        if s.is_closing || s.is_shutdown {
            return;
        }
        s.producer = Some(producer);
        if s.ready {
            io_ready(&shared, h.endpoint, state);
        }
    });
}

pub(crate) fn stream_set_watermark(h: &Stream, wm: Option<WatermarkState>) {
    with_reactor(|r| {
        let Some(ep) = r.endpoints.get_mut(h.endpoint) else {
            return;
        };
        let Some(state) = ep.conns.get_mut(&h.conn) else {
            return;
        };
        if let Some(s) = state.streams.get_mut(&h.token) {
            s.watermark = wm;
        }
    });
}

/// Close from the application: code 0 drains then FINs, non-zero resets
/// both directions at once. Idempotent.
pub(crate) fn stream_close(h: &Stream, code: u64) {
    let mut out = Vec::new();
    with_reactor(|r| {
        let shared = r.shared.clone();
        let Some(ep) = r.endpoints.get_mut(h.endpoint) else {
            return;
        };
        let ev_loop = ep.ev_loop.clone();
        let Some(state) = ep.conns.get_mut(&h.conn) else {
            return;
        };
        let Some(s) = state.streams.get_mut(&h.token) else {
            return;
        };
        if s.is_shutdown {
            return;
        }

        if code == 0 {
            if s.is_closing {
                return;
            }
            s.is_closing = true;
            if s.ready {
                io_ready(&shared, h.endpoint, state);
            }
            return;
        }

        s.close_code = code;
        let sid = s.sid;
        s.user_buffers.clear();
        s.unacked_size = 0;
        if let Some(sid) = sid {
            let code = VarInt::from_u64(code).unwrap_or(VarInt::MAX);
            let _ = state.conn.send_stream(sid).reset(code);
            let _ = state.conn.recv_stream(sid).stop(code);
        }
        finish_stream(
            h.endpoint,
            &ev_loop,
            state,
            h.conn,
            h.token,
            code,
            &mut out,
        );
        io_ready(&shared, h.endpoint, state);
    });
    run_dispatches(out);
}

pub(crate) fn stream_query<R>(
    h: &Stream,
    f: impl FnOnce(&StreamState) -> R,
) -> Result<R, Error> {
    with_reactor(|r| {
        r.endpoints
            .get_mut(h.endpoint)
            .and_then(|ep| ep.conns.get_mut(&h.conn))
            .and_then(|state| state.streams.get(&h.token))
            .map(f)
            .ok_or(Error::UnknownStream)
    })
}

pub(crate) fn with_conn<R>(
    ep_id: usize,
    cid: ConnectionID,
    f: impl FnOnce(&mut ConnState) -> R,
) -> Result<R, Error> {
    with_reactor(|r| {
        r.endpoints
            .get_mut(ep_id)
            .and_then(|ep| ep.conns.get_mut(&cid))
            .map(f)
            .ok_or(Error::UnknownConnection)
    })
}

// ── Application handle ──────────────────────────────────────────────

/// Handle to a connection. Clonable and usable from any thread.
#[derive(Clone)]
pub struct Connection {
    pub(crate) ev_loop: EventLoop,
    pub(crate) endpoint: usize,
    pub(crate) id: ConnectionID,
}

impl Connection {
    /// The library-local connection id.
    pub fn id(&self) -> ConnectionID {
        self.id
    }

    /// Which side initiated the connection.
    pub fn direction(&self) -> Result<Direction, Error> {
        let (ep_id, cid) = (self.endpoint, self.id);
        self.ev_loop
            .call_get(move || with_conn(ep_id, cid, |s| s.direction))?
    }

    /// The peer's address.
    pub fn remote_address(&self) -> Result<std::net::SocketAddr, Error> {
        let (ep_id, cid) = (self.endpoint, self.id);
        self.ev_loop
            .call_get(move || with_conn(ep_id, cid, |s| s.conn.remote_address()))?
    }

    /// Open a bidirectional stream with no callbacks (fire-and-forget
    /// sender).
    pub fn open_stream(&self) -> Result<Stream, Error> {
        self.open_stream_with(None, None)
    }

    /// Open a bidirectional stream. If the peer's stream allowance is
    /// exhausted the stream is queued and admitted when the limit
    /// extends; data sent meanwhile stays on deck.
    pub fn open_stream_with(
        &self,
        data_cb: Option<StreamDataCb>,
        close_cb: Option<StreamCloseCb>,
    ) -> Result<Stream, Error> {
        let h = self.clone();
        let (ep_id, cid) = (self.endpoint, self.id);
        let token = self.ev_loop.call_get(move || {
            with_reactor(|r| {
                let shared = r.shared.clone();
                let ep = r.endpoints.get_mut(ep_id).ok_or(Error::EndpointClosed)?;
                let state = ep.conns.get_mut(&cid).ok_or(Error::UnknownConnection)?;
                if state.closing || state.draining {
                    return Err(Error::ConnectionClosed);
                }
                let token = state.alloc_token();
                let mut s = StreamState::new(token, data_cb, close_cb);
                match state.conn.streams().open(Dir::Bi) {
                    Some(sid) => {
                        s.sid = Some(sid);
                        s.ready = true;
                        state.streams.insert(token, s);
                        state.by_sid.insert(sid, token);
                        io_ready(&shared, ep_id, state);
                    }
                    None => {
                        debug!("stream limit reached, {token} queued as pending");
                        state.streams.insert(token, s);
                        state.pending_streams.push_back(token);
                    }
                }
                metrics::STREAMS_OPENED.increment();
                Ok(token)
            })
        })??;
        Ok(Stream {
            ev_loop: h.ev_loop,
            endpoint: h.endpoint,
            conn: h.id,
            token,
        })
    }

    /// Open a [`BtRequestStream`](crate::BtRequestStream) carrying the
    /// length-prefixed request protocol.
    pub fn open_bt_stream(
        &self,
        close_cb: Option<StreamCloseCb>,
    ) -> Result<crate::btstream::BtRequestStream, Error> {
        crate::btstream::open(self, close_cb)
    }

    /// Send an unreliable datagram. Fails synchronously when datagrams
    /// are disabled or the payload exceeds
    /// [`max_datagram_size`](Self::max_datagram_size).
    pub fn send_datagram(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        let data = data.into();
        let (ep_id, cid) = (self.endpoint, self.id);
        self.ev_loop.call_get(move || {
            with_reactor(|r| {
                let shared = r.shared.clone();
                let ep = r.endpoints.get_mut(ep_id).ok_or(Error::EndpointClosed)?;
                let state = ep.conns.get_mut(&cid).ok_or(Error::UnknownConnection)?;
                if state.closing || state.draining {
                    return Err(Error::ConnectionClosed);
                }
                let engine_max = state.conn.datagrams().max_size();
                let engine = state.datagrams.as_mut().ok_or(Error::DatagramsDisabled)?;
                let pieces = engine.prepare_send(data, engine_max)?;
                metrics::DATAGRAMS_SENT.increment();
                for piece in pieces {
                    let piece_len = piece.len();
                    match state.conn.datagrams().send(piece, false) {
                        Ok(()) => {}
                        Err(SendDatagramError::Blocked(piece)) => {
                            let engine = state.datagrams.as_mut().expect("checked above");
                            engine.unsent.push_back(piece);
                        }
                        Err(SendDatagramError::TooLarge) => {
                            // The per-packet maximum shrank between the
                            // pre-split check and the send.
                            return Err(Error::DatagramTooLarge {
                                size: piece_len,
                                max: state.conn.datagrams().max_size().unwrap_or(0),
                            });
                        }
                        Err(_) => return Err(Error::DatagramsDisabled),
                    }
                }
                io_ready(&shared, ep_id, state);
                Ok(())
            })
        })?
    }

    /// Current maximum application datagram size; 0 until the handshake
    /// settles, doubled (minus headers) with active splitting.
    pub fn max_datagram_size(&self) -> Result<usize, Error> {
        let (ep_id, cid) = (self.endpoint, self.id);
        self.ev_loop.call_get(move || {
            with_conn(ep_id, cid, |state| {
                let engine_max = state.conn.datagrams().max_size();
                state
                    .datagrams
                    .as_ref()
                    .map(|engine| engine.max_datagram_size(engine_max))
                    .ok_or(Error::DatagramsDisabled)
            })?
        })?
    }

    /// Close the connection. A CONNECTION_CLOSE with `code` and `reason`
    /// goes out (unless the connection is already closing) and the
    /// connection drains. Idempotent.
    pub fn close(&self, code: u64, reason: &str) {
        let (ep_id, cid) = (self.endpoint, self.id);
        let reason = Bytes::copy_from_slice(reason.as_bytes());
        self.ev_loop.clone().call(move || {
            with_reactor(|r| {
                let shared = r.shared.clone();
                let Some(ep) = r.endpoints.get_mut(ep_id) else {
                    return;
                };
                let Some(state) = ep.conns.get_mut(&cid) else {
                    return;
                };
                if state.closing || state.draining {
                    return;
                }
                state.closing = true;
                state.local_close_code = code;
                state.conn.close(
                    Instant::now(),
                    VarInt::from_u64(code).unwrap_or(VarInt::MAX),
                    reason,
                );
                io_ready(&shared, ep_id, state);
            });
        });
    }
}
