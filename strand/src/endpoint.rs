//! The endpoint: one UDP socket, many connections.
//!
//! Inbound datagrams are classified by the engine: packets for a known
//! connection route through the handle table to their [`ConnState`];
//! packets that open a new connection are admitted only while listening;
//! stateless responses (version negotiation, retry, stateless reset) are
//! sent as-is. Outbound transmits funnel through
//! [`EndpointState::send_transmit`], which queues on socket backpressure
//! and resumes from the writable event, or hands packets to the
//! manual-routing hook when one is installed.
//!
//! Closing: a draining connection stays in the map, with its deadline in
//! a time-ordered queue that a 250 ms ticker sweeps.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quinn_proto::{DatagramEvent, EcnCodepoint};
use sha2::{Digest, Sha256};
use tracing::{debug, info, trace, warn};

use crate::config::{transport_config, ConnectOptions, EndpointOptions, ListenOptions, SendHook};
use crate::connection::{
    arm_handshake_timer, drive_locked, io_ready, make_retransmit_timer, run_dispatches,
    ConnCallbacks, ConnState, Connection, Dispatch,
};
use crate::creds::Credentials;
use crate::datagram::DatagramEngine;
use crate::error::{Error, STREAM_ERROR_CONNECTION_EXPIRED};
use crate::event_loop::{with_reactor, EventLoop, LoopShared, Timers};
use crate::metrics;
use crate::socket::{SendOutcome, UdpSocket};
use crate::types::{ConnectionID, Direction, Packet, Path};

/// Sweep interval for the draining queue.
const EXPIRY_INTERVAL: Duration = Duration::from_millis(250);

/// Engine max_ack_delay default, folded into the PTO estimate used for
/// drain deadlines.
const MAX_ACK_DELAY: Duration = Duration::from_millis(25);

/// A transmit the socket refused; `offset` tracks the datagrams already
/// accepted.
struct QueuedTransmit {
    dest: SocketAddr,
    ecn: Option<EcnCodepoint>,
    contents: Vec<u8>,
    offset: usize,
    segment_size: Option<usize>,
}

pub(crate) struct ListenContext {
    pub(crate) opts: ListenOptions,
}

/// Loop-side endpoint state.
pub(crate) struct EndpointState {
    pub(crate) id: usize,
    pub(crate) local: SocketAddr,
    pub(crate) ev_loop: EventLoop,
    registry: mio::Registry,

    pub(crate) socket: Option<UdpSocket>,
    manual: Option<SendHook>,

    pub(crate) quic: quinn_proto::Endpoint,
    pub(crate) conns: HashMap<ConnectionID, ConnState>,
    pub(crate) by_handle: HashMap<quinn_proto::ConnectionHandle, ConnectionID>,
    /// Draining connections by removal deadline.
    draining: BinaryHeap<Reverse<(Instant, ConnectionID)>>,

    listen: Option<ListenContext>,
    pub(crate) opts: EndpointOptions,
    transport: Arc<quinn_proto::TransportConfig>,
    pending_sends: VecDeque<QueuedTransmit>,
    pub(crate) closed: bool,
}

impl EndpointState {
    pub(crate) fn max_gso_segments(&self) -> usize {
        self.socket.as_ref().map(UdpSocket::gso_segments).unwrap_or(1)
    }

    /// Send one engine transmit (possibly a GSO batch). Backpressure
    /// queues the remainder and arms the writable waiter; transient
    /// errors drop the packet and leave recovery to the engine.
    pub(crate) fn send_transmit(
        &mut self,
        dest: SocketAddr,
        ecn: Option<EcnCodepoint>,
        contents: Vec<u8>,
        segment_size: Option<usize>,
        out: &mut Vec<Dispatch>,
    ) {
        if let Some(hook) = &self.manual {
            out.push(Dispatch::ManualSend {
                hook: hook.clone(),
                path: Path {
                    local: self.local,
                    remote: dest,
                },
                data: contents,
                segment_size,
            });
            metrics::PACKETS_SENT.increment();
            return;
        }

        if !self.pending_sends.is_empty() {
            // Keep packet order: everything goes behind the blocked
            // queue.
            self.pending_sends.push_back(QueuedTransmit {
                dest,
                ecn,
                contents,
                offset: 0,
                segment_size,
            });
            return;
        }

        let Some(socket) = &mut self.socket else {
            warn!("cannot send on a closed socket (to {dest})");
            return;
        };
        match socket.send(dest, ecn, &contents, segment_size) {
            Ok(SendOutcome::Sent) => {
                metrics::PACKETS_SENT.increment();
            }
            Ok(SendOutcome::Blocked { sent }) => {
                metrics::PACKETS_BLOCKED.increment();
                trace!("socket blocked after {sent} bytes, queueing transmit");
                self.pending_sends.push_back(QueuedTransmit {
                    dest,
                    ecn,
                    contents,
                    offset: sent,
                    segment_size,
                });
                let _ = socket.set_want_writable(&self.registry, true);
            }
            Err(e) => {
                debug!("UDP send to {dest} failed: {e}");
            }
        }
    }

    /// Writable event: drain the blocked queue, re-arming only if still
    /// blocked.
    fn flush_pending(&mut self) {
        while let Some(front) = self.pending_sends.front_mut() {
            let Some(socket) = &mut self.socket else {
                self.pending_sends.clear();
                return;
            };
            match socket.send(
                front.dest,
                front.ecn,
                &front.contents[front.offset..],
                front.segment_size,
            ) {
                Ok(SendOutcome::Sent) => {
                    metrics::PACKETS_SENT.increment();
                    self.pending_sends.pop_front();
                }
                Ok(SendOutcome::Blocked { sent }) => {
                    front.offset += sent;
                    let _ = socket.set_want_writable(&self.registry, true);
                    return;
                }
                Err(e) => {
                    debug!("deferred UDP send failed: {e}");
                    self.pending_sends.pop_front();
                }
            }
        }
        if let Some(socket) = &mut self.socket {
            let _ = socket.set_want_writable(&self.registry, false);
        }
    }
}

// ── Creation ────────────────────────────────────────────────────────

pub(crate) fn create(
    ev_loop: EventLoop,
    addr: SocketAddr,
    opts: EndpointOptions,
) -> Result<Endpoint, Error> {
    opts.validate()?;
    let handle = ev_loop.clone();
    let (id, local) = ev_loop.call_get(move || create_locked(handle, addr, opts))??;
    Ok(Endpoint { ev_loop: ev_loop.clone(), id, local })
}

fn create_locked(
    ev_loop: EventLoop,
    addr: SocketAddr,
    opts: EndpointOptions,
) -> Result<(usize, SocketAddr), Error> {
    with_reactor(|r| {
        let registry = r.registry().try_clone().map_err(Error::Io)?;

        let manual = opts.manual_routing.clone();
        let (socket, local) = if manual.is_none() {
            let socket = UdpSocket::bind(addr)?;
            let local = socket.local();
            (Some(socket), local)
        } else {
            (None, addr)
        };

        // The static secret seeds the engine's deterministic randomness
        // (reset tokens, connection ids); absent one, the engine gets
        // fresh entropy.
        let rng_seed = opts.static_secret.as_ref().map(|secret| {
            let mut hasher = Sha256::new();
            hasher.update(secret);
            let digest = hasher.finalize();
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&digest);
            seed
        });

        let quic = quinn_proto::Endpoint::new(
            Arc::new(quinn_proto::EndpointConfig::default()),
            None,
            true,
            rng_seed,
        );

        let transport = Arc::new(transport_config(&opts));
        let entry = r.endpoints.vacant_entry();
        let id = entry.key();

        let mut socket = socket;
        if let Some(socket) = &mut socket {
            socket
                .register(&registry, mio::Token(id))
                .map_err(Error::Io)?;
        }

        let expiry_timer = r.timers.create(
            Box::new(move || sweep_draining(id)),
            Some(EXPIRY_INTERVAL),
            true,
            None,
        );
        r.timers.arm(expiry_timer, Instant::now() + EXPIRY_INTERVAL);

        entry.insert(EndpointState {
            id,
            local,
            ev_loop,
            registry,
            socket,
            manual,
            quic,
            conns: HashMap::new(),
            by_handle: HashMap::new(),
            draining: BinaryHeap::new(),
            listen: None,
            opts,
            transport,
            pending_sends: VecDeque::new(),
            closed: false,
        });

        info!("QUIC endpoint listening on {local}");
        Ok((id, local))
    })
}

// ── Socket events and packet handling ───────────────────────────────

/// Readable/writable dispatch for an endpoint's socket token.
pub(crate) fn on_socket_event(ep_id: usize, readable: bool, writable: bool) {
    let mut out = Vec::new();
    let mut more = false;

    with_reactor(|r| {
        let shared = r.shared.clone();
        let timers = &mut r.timers;
        let Some(ep) = r.endpoints.get_mut(ep_id) else {
            return;
        };

        if writable {
            ep.flush_pending();
        }

        if readable {
            let mut packets = Vec::new();
            if let Some(socket) = &mut ep.socket {
                match socket.recv_batch(&mut |pkt| packets.push(pkt)) {
                    Ok(m) => more = m,
                    Err(e) => warn!("UDP recv failed: {e}"),
                }
            }
            let mut touched = HashSet::new();
            for pkt in packets {
                handle_packet(&shared, timers, ep_id, ep, pkt, &mut touched, &mut out);
            }
            for cid in touched {
                drive_locked(&shared, timers, ep_id, ep, cid, &mut out);
            }
        }
    });

    run_dispatches(out);

    if more {
        // The socket still has queued datagrams; keep draining from a
        // fresh job so other work interleaves.
        let posted = with_reactor(|r| {
            r.shared
                .post(Box::new(move || on_socket_event(ep_id, true, false)))
        });
        let _ = posted;
    }
}

/// Classify one inbound datagram via the engine and act on the verdict.
fn handle_packet(
    shared: &Arc<LoopShared>,
    timers: &mut Timers,
    ep_id: usize,
    ep: &mut EndpointState,
    pkt: Packet,
    touched: &mut HashSet<ConnectionID>,
    out: &mut Vec<Dispatch>,
) {
    metrics::PACKETS_RECEIVED.increment();
    let now = Instant::now();
    let mut resp_buf = Vec::new();

    let event = ep.quic.handle(
        now,
        pkt.path.remote,
        Some(pkt.path.local.ip()),
        pkt.ecn,
        pkt.data,
        &mut resp_buf,
    );

    match event {
        Some(DatagramEvent::ConnectionEvent(ch, event)) => {
            let Some(&cid) = ep.by_handle.get(&ch) else {
                debug!("event for unknown connection handle, dropped");
                return;
            };
            if let Some(state) = ep.conns.get_mut(&cid) {
                state.conn.handle_event(event);
                touched.insert(cid);
            }
        }
        Some(DatagramEvent::NewConnection(incoming)) => {
            if ep.closed || ep.listen.is_none() {
                debug!(
                    "dropping packet from {}: unknown connection id and not accepting inbound",
                    pkt.path.remote
                );
                ep.quic.ignore(incoming);
                return;
            }
            match ep.quic.accept(incoming, now, &mut resp_buf, None) {
                Ok((ch, conn)) => {
                    let listen_opts = ep.listen.as_ref().map(|l| l.opts.clone()).unwrap_or_default();
                    let callbacks = ConnCallbacks {
                        on_established: listen_opts.on_established,
                        on_closed: listen_opts.on_closed,
                        stream_data: listen_opts.stream_data_cb,
                        stream_close: listen_opts.stream_close_cb,
                        stream_open: listen_opts.stream_open_cb,
                        datagram: listen_opts.datagram_cb,
                    };
                    let cid = insert_conn(
                        shared,
                        timers,
                        ep_id,
                        ep,
                        ch,
                        conn,
                        Direction::Inbound,
                        callbacks,
                    );
                    metrics::CONNECTIONS_ACCEPTED.increment();
                    info!("accepted inbound connection {cid} from {}", pkt.path.remote);
                    touched.insert(cid);
                }
                Err(err) => {
                    debug!("inbound connection refused: {}", err.cause);
                    if let Some(response) = err.response {
                        let contents = resp_buf[..response.size].to_vec();
                        ep.send_transmit(
                            response.destination,
                            response.ecn,
                            contents,
                            response.segment_size,
                            out,
                        );
                    }
                }
            }
        }
        Some(DatagramEvent::Response(response)) => {
            // Stateless engine response: version negotiation, retry,
            // stateless reset.
            let contents = resp_buf[..response.size].to_vec();
            ep.send_transmit(
                response.destination,
                response.ecn,
                contents,
                response.segment_size,
                out,
            );
        }
        None => {}
    }
}

/// Insert a fresh connection under a collision-free random id.
#[allow(clippy::too_many_arguments)]
fn insert_conn(
    shared: &Arc<LoopShared>,
    timers: &mut Timers,
    ep_id: usize,
    ep: &mut EndpointState,
    ch: quinn_proto::ConnectionHandle,
    conn: quinn_proto::Connection,
    direction: Direction,
    callbacks: ConnCallbacks,
) -> ConnectionID {
    let mut cid = ConnectionID::random();
    while ep.conns.contains_key(&cid) {
        cid = ConnectionID::random();
    }

    let retransmit = make_retransmit_timer(timers, ep_id, cid);
    let datagrams = ep.opts.datagrams.as_ref().map(DatagramEngine::new);
    let mut state = ConnState::new(cid, ch, conn, direction, datagrams, retransmit, callbacks);
    if let Some(timeout) = ep.opts.handshake_timeout {
        state.handshake_timer = Some(arm_handshake_timer(timers, ep_id, cid, timeout));
    }

    ep.by_handle.insert(ch, cid);
    ep.conns.insert(cid, state);
    if let Some(state) = ep.conns.get_mut(&cid) {
        io_ready(shared, ep_id, state);
    }
    cid
}

// ── Close and draining ──────────────────────────────────────────────

/// Move a connection into the draining state: closed callback exactly
/// once, surviving streams expired, removal scheduled at now + 3·PTO.
pub(crate) fn drain_connection(
    ep: &mut EndpointState,
    cid: ConnectionID,
    code: u64,
    out: &mut Vec<Dispatch>,
) {
    let ep_id = ep.id;
    let ev_loop = ep.ev_loop.clone();
    let Some(state) = ep.conns.get_mut(&cid) else {
        return;
    };
    if state.draining {
        return;
    }
    state.draining = true;
    debug!("connection {cid} draining (code {code})");

    if !state.closed_cb_fired {
        state.closed_cb_fired = true;
        if let Some(cb) = state.callbacks.on_closed.clone() {
            out.push(Dispatch::ConnClosed {
                cb,
                conn: Connection {
                    ev_loop: ev_loop.clone(),
                    endpoint: ep_id,
                    id: cid,
                },
                code,
            });
        }
    }

    // Streams die with the connection; their close callbacks see the
    // synthetic expiry code.
    let tokens: Vec<u64> = state.streams.keys().copied().collect();
    for token in tokens {
        crate::connection::finish_stream(
            ep_id,
            &ev_loop,
            state,
            cid,
            token,
            STREAM_ERROR_CONNECTION_EXPIRED,
            out,
        );
    }

    let pto = state.conn.rtt() + MAX_ACK_DELAY;
    let deadline = Instant::now() + pto * 3;
    ep.draining.push(Reverse((deadline, cid)));
    metrics::CONNECTIONS_CLOSED.increment();
}

/// Expiry ticker: remove draining connections whose deadline passed, in
/// time order.
fn sweep_draining(ep_id: usize) {
    with_reactor(|r| {
        let timers = &mut r.timers;
        let Some(ep) = r.endpoints.get_mut(ep_id) else {
            return;
        };
        let now = Instant::now();
        while let Some(&Reverse((deadline, cid))) = ep.draining.peek() {
            if deadline > now {
                break;
            }
            ep.draining.pop();
            if let Some(state) = ep.conns.remove(&cid) {
                debug!("removing drained connection {cid}");
                ep.by_handle.remove(&state.handle);
                timers.remove(state.retransmit_timer);
                if let Some(t) = state.handshake_timer {
                    timers.remove(t);
                }
            }
        }
    });
}

// ── Application handle ──────────────────────────────────────────────

/// Handle to an endpoint. Clonable and usable from any thread.
#[derive(Clone)]
pub struct Endpoint {
    pub(crate) ev_loop: EventLoop,
    pub(crate) id: usize,
    pub(crate) local: SocketAddr,
}

impl Endpoint {
    /// The realized local address (relevant when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Enable inbound connections with the given credentials and
    /// default callbacks.
    pub fn listen(&self, creds: &Credentials, opts: ListenOptions) -> Result<(), Error> {
        let ep_id = self.id;
        let creds = creds.clone();
        self.ev_loop.call_get(move || {
            with_reactor(|r| {
                let ep = r.endpoints.get_mut(ep_id).ok_or(Error::EndpointClosed)?;
                if ep.closed {
                    return Err(Error::EndpointClosed);
                }
                let mut server_config = creds.server_config(&ep.opts.inbound_alpns)?;
                server_config.transport = ep.transport.clone();
                ep.quic.set_server_config(Some(Arc::new(server_config)));
                ep.listen = Some(ListenContext { opts });
                info!("endpoint {} accepting inbound connections", ep.local);
                Ok(())
            })
        })?
    }

    /// Initiate an outbound connection. Synchronous from any thread;
    /// executes on the loop. The returned handle is live immediately
    /// (streams may be opened before the handshake completes).
    pub fn connect(
        &self,
        remote: SocketAddr,
        creds: &Credentials,
        opts: ConnectOptions,
    ) -> Result<Connection, Error> {
        let ep_id = self.id;
        let ev_loop = self.ev_loop.clone();
        let creds = creds.clone();
        let cid = self.ev_loop.call_get(move || {
            with_reactor(|r| {
                let shared = r.shared.clone();
                let timers = &mut r.timers;
                let ep = r.endpoints.get_mut(ep_id).ok_or(Error::EndpointClosed)?;
                if ep.closed {
                    return Err(Error::EndpointClosed);
                }

                let mut client_config = creds.client_config(&ep.opts.outbound_alpns)?;
                client_config.transport_config(ep.transport.clone());
                let server_name = opts.server_name.as_deref().unwrap_or("localhost");

                let (ch, conn) =
                    ep.quic
                        .connect(Instant::now(), client_config, remote, server_name)?;
                let callbacks = ConnCallbacks {
                    on_established: opts.on_established,
                    on_closed: opts.on_closed,
                    stream_data: opts.stream_data_cb,
                    stream_close: opts.stream_close_cb,
                    stream_open: opts.stream_open_cb,
                    datagram: opts.datagram_cb,
                };
                let cid = insert_conn(
                    &shared,
                    timers,
                    ep_id,
                    ep,
                    ch,
                    conn,
                    Direction::Outbound,
                    callbacks,
                );
                metrics::CONNECTIONS_OPENED.increment();
                info!("connecting to {remote} as {cid}");
                Ok(cid)
            })
        })??;
        Ok(Connection {
            ev_loop,
            endpoint: ep_id,
            id: cid,
        })
    }

    /// Snapshot of live (non-draining) connections, optionally filtered
    /// by direction.
    pub fn get_all_conns(&self, direction: Option<Direction>) -> Result<Vec<Connection>, Error> {
        let ep_id = self.id;
        let ev_loop = self.ev_loop.clone();
        self.ev_loop.call_get(move || {
            with_reactor(|r| {
                let ep = r.endpoints.get_mut(ep_id).ok_or(Error::EndpointClosed)?;
                Ok(ep
                    .conns
                    .iter()
                    .filter(|(_, s)| !s.draining)
                    .filter(|(_, s)| direction.map(|d| s.direction == d).unwrap_or(true))
                    .map(|(&cid, _)| Connection {
                        ev_loop: ev_loop.clone(),
                        endpoint: ep_id,
                        id: cid,
                    })
                    .collect())
            })
        })?
    }

    /// Close every connection (optionally only one direction).
    pub fn close_conns(&self, direction: Option<Direction>) -> Result<(), Error> {
        for conn in self.get_all_conns(direction)? {
            conn.close(0, "endpoint closing");
        }
        Ok(())
    }

    /// Close the endpoint: stop admission, close every connection.
    pub fn close(&self) {
        let ep_id = self.id;
        let _ = self.close_conns(None);
        self.ev_loop.clone().call(move || {
            with_reactor(|r| {
                if let Some(ep) = r.endpoints.get_mut(ep_id) {
                    ep.closed = true;
                    ep.listen = None;
                    ep.quic.set_server_config(None);
                }
            });
        });
    }

    /// Inject a packet, bypassing the socket. The ingress half of
    /// manual routing, and useful for tunneled transports.
    pub fn receive_packet(&self, pkt: Packet) {
        let ep_id = self.id;
        self.ev_loop.clone().call(move || {
            let mut out = Vec::new();
            with_reactor(|r| {
                let shared = r.shared.clone();
                let timers = &mut r.timers;
                let Some(ep) = r.endpoints.get_mut(ep_id) else {
                    return;
                };
                let mut touched = HashSet::new();
                handle_packet(&shared, timers, ep_id, ep, pkt, &mut touched, &mut out);
                for cid in touched {
                    drive_locked(&shared, timers, ep_id, ep, cid, &mut out);
                }
            });
            run_dispatches(out);
        });
    }
}
