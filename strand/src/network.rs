//! Process-level entry point: one [`Network`] owns one event loop and
//! hosts any number of endpoints on it.

use std::net::SocketAddr;
use std::sync::Once;

use tracing::info;

use crate::config::EndpointOptions;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::event_loop::{EventLoop, with_reactor};

/// Process-wide initialisation (the rustls default crypto provider) runs
/// exactly once, no matter how many networks come and go.
static INIT: Once = Once::new();

/// Owns the event loop; endpoints are created through it and live on its
/// thread.
pub struct Network {
    ev_loop: EventLoop,
}

impl Network {
    /// Start a network with a fresh loop thread.
    pub fn new() -> Result<Self, Error> {
        INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
        let ev_loop = EventLoop::new()?;
        Ok(Self { ev_loop })
    }

    /// The underlying event loop, for timers and job dispatch.
    pub fn event_loop(&self) -> &EventLoop {
        &self.ev_loop
    }

    /// Create an endpoint bound on `addr` (port 0 picks a free port;
    /// see [`Endpoint::local_addr`]).
    pub fn endpoint(&self, addr: SocketAddr, opts: EndpointOptions) -> Result<Endpoint, Error> {
        crate::endpoint::create(self.ev_loop.clone(), addr, opts)
    }

    /// Close every endpoint, then shut the loop down and join its
    /// thread.
    pub fn close(&self) {
        info!("shutting down network");
        let ids: Vec<usize> = self
            .ev_loop
            .call_get(|| with_reactor(|r| r.endpoints.iter().map(|(k, _)| k).collect()))
            .unwrap_or_default();
        for id in ids {
            let handle = Endpoint {
                ev_loop: self.ev_loop.clone(),
                id,
                local: "0.0.0.0:0".parse().expect("static addr"),
            };
            handle.close();
        }
        self.ev_loop.shutdown(false);
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        if !self.ev_loop.in_loop() {
            self.close();
        }
    }
}
