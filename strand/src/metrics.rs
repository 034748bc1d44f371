//! Transport metrics.
//!
//! Process-wide counters exposed through metriken's registry; pick them
//! up with any metriken exposition sink.

use metriken::{Counter, metric};

#[metric(
    name = "strand/connections/accepted",
    description = "Inbound connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "strand/connections/opened",
    description = "Outbound connections initiated"
)]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(
    name = "strand/connections/closed",
    description = "Connections removed after close or drain"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(name = "strand/packets/sent", description = "UDP packets sent")]
pub static PACKETS_SENT: Counter = Counter::new();

#[metric(name = "strand/packets/received", description = "UDP packets received")]
pub static PACKETS_RECEIVED: Counter = Counter::new();

#[metric(
    name = "strand/packets/blocked",
    description = "Transmits deferred on socket backpressure"
)]
pub static PACKETS_BLOCKED: Counter = Counter::new();

#[metric(name = "strand/streams/opened", description = "Streams opened, both directions")]
pub static STREAMS_OPENED: Counter = Counter::new();

#[metric(name = "strand/streams/closed", description = "Streams closed")]
pub static STREAMS_CLOSED: Counter = Counter::new();

#[metric(
    name = "strand/datagrams/sent",
    description = "Application datagrams sent (pre-split)"
)]
pub static DATAGRAMS_SENT: Counter = Counter::new();

#[metric(
    name = "strand/datagrams/received",
    description = "Application datagrams delivered (post-reassembly)"
)]
pub static DATAGRAMS_RECEIVED: Counter = Counter::new();

#[metric(
    name = "strand/datagrams/dropped",
    description = "Partial datagrams dropped by reassembly rotation"
)]
pub static DATAGRAMS_DROPPED: Counter = Counter::new();
