//! Ordered byte streams.
//!
//! A stream's outbound buffer is a deque of [`Bytes`] segments: each
//! segment is a refcounted view that keeps its backing storage alive
//! until the transport releases it, so callers hand data over without a
//! copy. `unacked_size` counts the bytes already consumed by the engine
//! but not yet released; [`StreamState::pending`] exposes the unsent
//! tail, [`StreamState::wrote`] and [`StreamState::acknowledge`] move the
//! two cursors.
//!
//! [`Stream`] is the application handle: clonable, usable from any
//! thread, dispatching onto the loop.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::config::{StreamCloseCb, StreamDataCb};
use crate::connection::Connection;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::types::ConnectionID;

/// Pull-mode chunk source installed by [`Stream::send_chunks`].
pub(crate) struct ChunkProducer {
    /// Yields the next chunk, or `None` at end-of-stream.
    pub(crate) next: Box<dyn FnMut() -> Option<Bytes> + Send>,
    /// Fired once after the final chunk has been queued.
    pub(crate) done: Option<Box<dyn FnOnce(Stream) + Send>>,
    /// Chunks kept queued ahead of the engine.
    pub(crate) parallelism: usize,
    pub(crate) finished: bool,
}

/// Buffer watermark installed by [`Stream::set_watermark`].
pub(crate) struct WatermarkState {
    pub(crate) low: usize,
    pub(crate) high: usize,
    pub(crate) hook: Arc<dyn Fn(Stream) + Send + Sync>,
    pub(crate) persist: bool,
    /// Set once the buffer has risen to `high`; the hook fires when it
    /// then drains to `low`.
    pub(crate) primed: bool,
}

/// Loop-side per-stream state.
pub(crate) struct StreamState {
    /// Library-local key, stable from creation (streams may exist before
    /// the engine admits them and assigns a wire id).
    pub(crate) token: u64,
    pub(crate) sid: Option<quinn_proto::StreamId>,
    pub(crate) user_buffers: VecDeque<Bytes>,
    /// Bytes consumed by the engine but not yet released.
    pub(crate) unacked_size: usize,
    /// False while waiting in the pending queue for a stream id.
    pub(crate) ready: bool,
    pub(crate) is_closing: bool,
    pub(crate) is_shutdown: bool,
    pub(crate) sent_fin: bool,
    /// The engine confirmed the peer received our whole send side.
    pub(crate) send_done: bool,
    /// The peer's send side has ended (FIN read or reset).
    pub(crate) recv_done: bool,
    pub(crate) close_code: u64,
    pub(crate) close_cb_fired: bool,
    pub(crate) data_cb: Option<StreamDataCb>,
    pub(crate) close_cb: Option<StreamCloseCb>,
    pub(crate) producer: Option<ChunkProducer>,
    pub(crate) watermark: Option<WatermarkState>,
    /// BT request-stream layer, when this stream carries one.
    pub(crate) bt: Option<Box<crate::btstream::BtState>>,
}

impl StreamState {
    pub(crate) fn new(
        token: u64,
        data_cb: Option<StreamDataCb>,
        close_cb: Option<StreamCloseCb>,
    ) -> Self {
        Self {
            token,
            sid: None,
            user_buffers: VecDeque::new(),
            unacked_size: 0,
            ready: false,
            is_closing: false,
            is_shutdown: false,
            sent_fin: false,
            send_done: false,
            recv_done: false,
            close_code: 0,
            close_cb_fired: false,
            data_cb,
            close_cb,
            producer: None,
            watermark: None,
            bt: None,
        }
    }

    /// Total buffered bytes, acknowledged-pending plus unsent.
    pub(crate) fn size(&self) -> usize {
        self.user_buffers.iter().map(Bytes::len).sum()
    }

    /// Buffered bytes the engine has not consumed yet.
    pub(crate) fn unsent(&self) -> usize {
        self.size() - self.unacked_size
    }

    pub(crate) fn has_unsent(&self) -> bool {
        self.unsent() > 0
    }

    /// Append a segment. The caller signals io-ready separately (a
    /// not-yet-admitted stream keeps the data on deck).
    pub(crate) fn append(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        if let Some(wm) = &mut self.watermark {
            // Prime on the rising edge so the drain hook has a fall to
            // detect.
            if !wm.primed && self.user_buffers.iter().map(Bytes::len).sum::<usize>() + data.len() >= wm.high {
                wm.primed = true;
            }
        }
        self.user_buffers.push_back(data);
    }

    /// The unsent tail of the buffer: every byte past `unacked_size`,
    /// as cheap sub-views in order.
    pub(crate) fn pending(&self) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut skip = self.unacked_size;
        for buf in &self.user_buffers {
            if skip >= buf.len() {
                skip -= buf.len();
                continue;
            }
            if skip > 0 {
                out.push(buf.slice(skip..));
                skip = 0;
            } else {
                out.push(buf.clone());
            }
        }
        out
    }

    /// The engine consumed `n` bytes into packets.
    pub(crate) fn wrote(&mut self, n: usize) {
        trace!("stream {} wrote {n} bytes", self.token);
        self.unacked_size += n;
        debug_assert!(self.unacked_size <= self.size());
    }

    /// The engine acknowledged `n` bytes: release fully-covered segments
    /// and advance a partially-covered front.
    pub(crate) fn acknowledge(&mut self, n: usize) {
        assert!(n <= self.unacked_size, "ack of {n} exceeds unacked size");
        self.unacked_size -= n;

        let mut remaining = n;
        while remaining > 0 {
            let front = self.user_buffers.front_mut().expect("acked past buffer");
            if remaining >= front.len() {
                remaining -= front.len();
                self.user_buffers.pop_front();
            } else {
                let rest = front.slice(remaining..);
                *front = rest;
                remaining = 0;
            }
        }
    }

    /// After a release, decide whether the drain watermark fires.
    /// Returns the hook to invoke outside the state borrow.
    pub(crate) fn take_watermark_fire(&mut self) -> Option<Arc<dyn Fn(Stream) + Send + Sync>> {
        let fire = match &mut self.watermark {
            Some(wm) if wm.primed && self.user_buffers.iter().map(Bytes::len).sum::<usize>() <= wm.low => {
                wm.primed = false;
                let hook = wm.hook.clone();
                Some((hook, wm.persist))
            }
            _ => None,
        };
        match fire {
            Some((hook, persist)) => {
                if !persist {
                    self.watermark = None;
                }
                Some(hook)
            }
            None => None,
        }
    }

    /// Pull chunks from the producer until `parallelism` chunks are
    /// queued or the producer ends. Returns the done callback when the
    /// producer finished on this refill.
    pub(crate) fn refill_from_producer(&mut self) -> Option<Box<dyn FnOnce(Stream) + Send>> {
        let producer = self.producer.as_mut()?;
        if producer.finished {
            return None;
        }
        while self.user_buffers.len() < producer.parallelism {
            match (producer.next)() {
                Some(chunk) => {
                    if !chunk.is_empty() {
                        self.user_buffers.push_back(chunk);
                    }
                }
                None => {
                    producer.finished = true;
                    // End of stream: schedule the FIN once the buffer
                    // drains.
                    self.is_closing = true;
                    return producer.done.take();
                }
            }
        }
        None
    }
}

// ── Application handle ──────────────────────────────────────────────

/// Handle to a stream. Clonable and usable from any thread; operations
/// are dispatched onto the owning event loop.
#[derive(Clone)]
pub struct Stream {
    pub(crate) ev_loop: EventLoop,
    pub(crate) endpoint: usize,
    pub(crate) conn: ConnectionID,
    pub(crate) token: u64,
}

impl Stream {
    /// Handle to the owning connection.
    pub fn connection(&self) -> Connection {
        Connection {
            ev_loop: self.ev_loop.clone(),
            endpoint: self.endpoint,
            id: self.conn,
        }
    }

    /// Queue `data` for ordered delivery. Bytes submitted from one
    /// thread arrive at the peer in submission order.
    pub fn send(&self, data: impl Into<Bytes>) {
        let data = data.into();
        let h = self.clone();
        self.ev_loop.clone().call(move || {
            crate::connection::stream_append(&h, data);
        });
    }

    /// Stream the output of `producer` with up to `parallelism` chunks
    /// buffered ahead of the engine. When the producer returns `None`
    /// the stream's FIN is scheduled and `done` fires.
    pub fn send_chunks(
        &self,
        producer: impl FnMut() -> Option<Bytes> + Send + 'static,
        done: impl FnOnce(Stream) + Send + 'static,
        parallelism: usize,
    ) {
        let h = self.clone();
        let producer = ChunkProducer {
            next: Box::new(producer),
            done: Some(Box::new(done)),
            parallelism: parallelism.max(1),
            finished: false,
        };
        self.ev_loop.clone().call(move || {
            crate::connection::stream_install_producer(&h, producer);
        });
    }

    /// Close the stream. Code 0 drains the buffer and finishes with a
    /// FIN; a non-zero code resets both directions immediately.
    /// Idempotent; the close callback fires exactly once.
    pub fn close(&self, code: u64) {
        let h = self.clone();
        self.ev_loop.clone().call(move || {
            crate::connection::stream_close(&h, code);
        });
    }

    /// Install a buffer watermark: once the outbound buffer has grown to
    /// `high` bytes, `hook` fires when it drains back to `low`. With
    /// `persist` false the hook is one-shot.
    pub fn set_watermark(
        &self,
        low: usize,
        high: usize,
        hook: impl Fn(Stream) + Send + Sync + 'static,
        persist: bool,
    ) {
        let h = self.clone();
        let wm = WatermarkState {
            low,
            high,
            hook: Arc::new(hook),
            persist,
            primed: false,
        };
        self.ev_loop.clone().call(move || {
            crate::connection::stream_set_watermark(&h, Some(wm));
        });
    }

    /// Remove an installed watermark.
    pub fn clear_watermark(&self) {
        let h = self.clone();
        self.ev_loop.clone().call(move || {
            crate::connection::stream_set_watermark(&h, None);
        });
    }

    /// The engine-assigned stream id, once admitted.
    pub fn stream_id(&self) -> Result<Option<u64>, Error> {
        let h = self.clone();
        self.ev_loop.clone().call_get(move || {
            crate::connection::stream_query(&h, |s| s.sid.map(|sid| sid.index()))
        })?
    }

    /// Bytes currently buffered (unsent plus unreleased).
    pub fn buffered(&self) -> Result<usize, Error> {
        let h = self.clone();
        self.ev_loop.clone().call_get(move || {
            crate::connection::stream_query(&h, |s| s.size())
        })?
    }
}
