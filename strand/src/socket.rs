//! Non-blocking UDP socket with GSO-batched sends and ECN.
//!
//! Linux-first, like the rest of the I/O layer: sends go through
//! `sendmsg` so a whole transmit batch can be handed to the kernel as one
//! segmented buffer (`UDP_SEGMENT`), and receives go through `recvmsg`
//! with `IP_RECVTOS`/`IPV6_RECVTCLASS` so packets carry their ECN
//! codepoint. GSO support is probed at bind time; sockets that refuse it
//! (or error on a segmented send) fall back to one `sendmsg` per
//! datagram.
//!
//! Backpressure: a blocked send surfaces as [`SendOutcome::Blocked`] with
//! the number of bytes the kernel did accept; the caller queues the rest
//! and asks for a single WRITABLE notification via
//! [`UdpSocket::set_want_writable`]. Multiple waiters coalesce into that
//! one notification.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::AsRawFd;

use bytes::BytesMut;
use quinn_proto::EcnCodepoint;
use tracing::{debug, trace};

use crate::types::{Packet, Path};

/// Upper bound on datagrams in one kernel GSO send.
const MAX_GSO_SEGMENTS: usize = 64;

/// Packets drained per readable dispatch before the remainder is deferred
/// to a fresh loop job (edge-triggered readiness must not be abandoned,
/// but one busy socket must not starve the loop either).
pub(crate) const RECV_BATCH: usize = 256;

const MAX_UDP_PAYLOAD: usize = 65527;

/// Result of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    /// The whole transmit was handed to the kernel.
    Sent,
    /// The kernel accepted `sent` bytes (a prefix of whole datagrams) and
    /// blocked on the rest; retry after the next writable event.
    Blocked { sent: usize },
}

pub(crate) struct UdpSocket {
    io: mio::net::UdpSocket,
    local: SocketAddr,
    /// Max datagrams per segmented send; 1 when GSO is unavailable.
    gso_segments: usize,
    /// WRITABLE interest currently registered.
    want_writable: bool,
    token: Option<mio::Token>,
}

impl UdpSocket {
    /// Bind a non-blocking socket and probe its capabilities.
    pub(crate) fn bind(addr: SocketAddr) -> io::Result<Self> {
        let std_sock = std::net::UdpSocket::bind(addr)?;
        std_sock.set_nonblocking(true)?;
        let local = std_sock.local_addr()?;
        let io = mio::net::UdpSocket::from_std(std_sock);

        let fd = io.as_raw_fd();
        enable_recv_ecn(fd, local.is_ipv4())?;
        let gso_segments = if probe_gso(fd) { MAX_GSO_SEGMENTS } else { 1 };
        debug!(
            "UDP socket bound on {local}, gso {}",
            if gso_segments > 1 { "on" } else { "off" }
        );

        Ok(Self {
            io,
            local,
            gso_segments,
            want_writable: false,
            token: None,
        })
    }

    pub(crate) fn local(&self) -> SocketAddr {
        self.local
    }

    pub(crate) fn gso_segments(&self) -> usize {
        self.gso_segments
    }

    pub(crate) fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
    ) -> io::Result<()> {
        registry.register(&mut self.io, token, mio::Interest::READABLE)?;
        self.token = Some(token);
        Ok(())
    }

    pub(crate) fn deregister(&mut self, registry: &mio::Registry) {
        if self.token.take().is_some() {
            let _ = registry.deregister(&mut self.io);
        }
    }

    /// Arm or disarm the one-shot writable notification. Idempotent, so
    /// any number of blocked senders share a single OS-level wakeup.
    pub(crate) fn set_want_writable(
        &mut self,
        registry: &mio::Registry,
        on: bool,
    ) -> io::Result<()> {
        if self.want_writable == on {
            return Ok(());
        }
        let token = match self.token {
            Some(t) => t,
            None => return Ok(()),
        };
        let interest = if on {
            mio::Interest::READABLE | mio::Interest::WRITABLE
        } else {
            mio::Interest::READABLE
        };
        registry.reregister(&mut self.io, token, interest)?;
        self.want_writable = on;
        Ok(())
    }

    pub(crate) fn wants_writable(&self) -> bool {
        self.want_writable
    }

    /// Drain up to [`RECV_BATCH`] packets into `f`.
    ///
    /// Returns `true` when the socket still has queued data (the caller
    /// must schedule another drain: readiness is edge-triggered).
    pub(crate) fn recv_batch(&mut self, f: &mut dyn FnMut(Packet)) -> io::Result<bool> {
        let fd = self.io.as_raw_fd();
        let mut buf = [0u8; MAX_UDP_PAYLOAD];

        for _ in 0..RECV_BATCH {
            let mut control = CmsgBuf::new();
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut iov = libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            };
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
            msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = control.buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = control.buf.len() as _;

            let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
            if n < 0 {
                let err = io::Error::last_os_error();
                return match err.kind() {
                    io::ErrorKind::WouldBlock => Ok(false),
                    io::ErrorKind::Interrupted => continue,
                    _ => Err(err),
                };
            }

            let remote = match sockaddr_to_socket_addr(&storage) {
                Some(addr) => addr,
                None => continue,
            };
            let ecn = ecn_from_cmsgs(&msg);

            f(Packet {
                path: Path {
                    local: self.local,
                    remote,
                },
                ecn,
                data: BytesMut::from(&buf[..n as usize]),
            });
        }

        Ok(true)
    }

    /// Send `contents` to `dest`: one datagram, or a GSO batch of
    /// `segment_size`-byte datagrams when `segment_size` is set and
    /// smaller than the contents.
    pub(crate) fn send(
        &mut self,
        dest: SocketAddr,
        ecn: Option<EcnCodepoint>,
        contents: &[u8],
        segment_size: Option<usize>,
    ) -> io::Result<SendOutcome> {
        match segment_size {
            Some(seg) if seg < contents.len() => {
                if self.gso_segments > 1 {
                    match self.send_gso(dest, ecn, contents, seg) {
                        Ok(outcome) => return Ok(outcome),
                        Err(e)
                            if matches!(
                                e.raw_os_error(),
                                Some(libc::EIO) | Some(libc::EINVAL)
                            ) =>
                        {
                            // Kernel or NIC refused the segmented send;
                            // stop trying for this socket's lifetime.
                            debug!("disabling GSO after send error: {e}");
                            self.gso_segments = 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
                self.send_chunks(dest, ecn, contents, seg)
            }
            _ => match self.sendmsg(dest, ecn, contents, None) {
                Ok(()) => Ok(SendOutcome::Sent),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    Ok(SendOutcome::Blocked { sent: 0 })
                }
                Err(e) => Err(e),
            },
        }
    }

    fn send_gso(
        &mut self,
        dest: SocketAddr,
        ecn: Option<EcnCodepoint>,
        contents: &[u8],
        seg: usize,
    ) -> io::Result<SendOutcome> {
        match self.sendmsg(dest, ecn, contents, Some(seg as u16)) {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(SendOutcome::Blocked { sent: 0 }),
            Err(e) => Err(e),
        }
    }

    /// Per-datagram fallback. Blocked mid-batch reports the prefix that
    /// did go out so the caller only re-queues the tail.
    fn send_chunks(
        &mut self,
        dest: SocketAddr,
        ecn: Option<EcnCodepoint>,
        contents: &[u8],
        seg: usize,
    ) -> io::Result<SendOutcome> {
        let mut offset = 0;
        while offset < contents.len() {
            let end = (offset + seg).min(contents.len());
            match self.sendmsg(dest, ecn, &contents[offset..end], None) {
                Ok(()) => offset = end,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SendOutcome::Blocked { sent: offset });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(SendOutcome::Sent)
    }

    fn sendmsg(
        &self,
        dest: SocketAddr,
        ecn: Option<EcnCodepoint>,
        data: &[u8],
        gso_segment: Option<u16>,
    ) -> io::Result<()> {
        let fd = self.io.as_raw_fd();
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let addr_len = socket_addr_to_sockaddr(dest, &mut storage);

        let mut iov = libc::iovec {
            iov_base: data.as_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        };
        let mut control = CmsgBuf::new();
        let control_len = control.fill(dest.is_ipv4(), ecn, gso_segment);

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
        msg.msg_namelen = addr_len;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if control_len > 0 {
            msg.msg_control = control.buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = control_len as _;
        }

        loop {
            let n = unsafe { libc::sendmsg(fd, &msg, 0) };
            if n >= 0 {
                trace!("sent {n} bytes to {dest}");
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

// ── Control messages ────────────────────────────────────────────────

/// Aligned scratch space for send/recv control messages.
#[repr(align(8))]
struct CmsgBuf {
    buf: [u8; 64],
}

impl CmsgBuf {
    fn new() -> Self {
        Self { buf: [0u8; 64] }
    }

    /// Write the outbound cmsgs (ECN codepoint, GSO segment size).
    /// Returns the total control length, 0 when none are needed.
    fn fill(&mut self, ipv4: bool, ecn: Option<EcnCodepoint>, gso_segment: Option<u16>) -> usize {
        let mut len = 0usize;

        unsafe {
            let base = self.buf.as_mut_ptr();

            if let Some(ecn) = ecn {
                let hdr = &mut *(base.add(len) as *mut libc::cmsghdr);
                hdr.cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::c_int>() as u32) as _;
                if ipv4 {
                    hdr.cmsg_level = libc::IPPROTO_IP;
                    hdr.cmsg_type = libc::IP_TOS;
                } else {
                    hdr.cmsg_level = libc::IPPROTO_IPV6;
                    hdr.cmsg_type = libc::IPV6_TCLASS;
                }
                let data = libc::CMSG_DATA(hdr) as *mut libc::c_int;
                data.write_unaligned(ecn as u8 as libc::c_int);
                len += libc::CMSG_SPACE(mem::size_of::<libc::c_int>() as u32) as usize;
            }

            if let Some(seg) = gso_segment {
                let hdr = &mut *(base.add(len) as *mut libc::cmsghdr);
                hdr.cmsg_len = libc::CMSG_LEN(mem::size_of::<u16>() as u32) as _;
                hdr.cmsg_level = libc::SOL_UDP;
                hdr.cmsg_type = libc::UDP_SEGMENT;
                let data = libc::CMSG_DATA(hdr) as *mut u16;
                data.write_unaligned(seg);
                len += libc::CMSG_SPACE(mem::size_of::<u16>() as u32) as usize;
            }
        }

        len
    }
}

fn ecn_from_cmsgs(msg: &libc::msghdr) -> Option<EcnCodepoint> {
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            let is_tos = (hdr.cmsg_level == libc::IPPROTO_IP
                && (hdr.cmsg_type == libc::IP_TOS || hdr.cmsg_type == libc::IP_RECVTOS))
                || (hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_TCLASS);
            if is_tos {
                let data = libc::CMSG_DATA(cmsg);
                // IPv4 delivers a single byte, IPv6 a c_int.
                let tos = if hdr.cmsg_len as usize
                    >= libc::CMSG_LEN(mem::size_of::<libc::c_int>() as u32) as usize
                {
                    (data as *const libc::c_int).read_unaligned() as u8
                } else {
                    *data
                };
                return EcnCodepoint::from_bits(tos & 0b11);
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    None
}

// ── Socket options ──────────────────────────────────────────────────

fn enable_recv_ecn(fd: libc::c_int, ipv4: bool) -> io::Result<()> {
    let on: libc::c_int = 1;
    let (level, option) = if ipv4 {
        (libc::IPPROTO_IP, libc::IP_RECVTOS)
    } else {
        (libc::IPPROTO_IPV6, libc::IPV6_RECVTCLASS)
    };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn probe_gso(fd: libc::c_int) -> bool {
    // Set then clear UDP_SEGMENT; actual sends use the per-message cmsg.
    let seg: libc::c_int = 1200;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_UDP,
            libc::UDP_SEGMENT,
            &seg as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return false;
    }
    let off: libc::c_int = 0;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_UDP,
            libc::UDP_SEGMENT,
            &off as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    true
}

#[cfg(not(target_os = "linux"))]
fn probe_gso(_fd: libc::c_int) -> bool {
    false
}

// ── sockaddr conversions ────────────────────────────────────────────

fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sin = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sin6 = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = storage as *const _ as *const libc::sockaddr_in;
            let (ip, port) = unsafe {
                (
                    Ipv4Addr::from((*sin).sin_addr.s_addr.to_ne_bytes()),
                    u16::from_be((*sin).sin_port),
                )
            };
            Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let sin6 = storage as *const _ as *const libc::sockaddr_in6;
            let (ip, port, flow, scope) = unsafe {
                (
                    Ipv6Addr::from((*sin6).sin6_addr.s6_addr),
                    u16::from_be((*sin6).sin6_port),
                    (*sin6).sin6_flowinfo,
                    (*sin6).sin6_scope_id,
                )
            };
            Some(SocketAddr::V6(SocketAddrV6::new(ip, port, flow, scope)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn recv_until(sock: &mut UdpSocket, want: usize) -> Vec<Packet> {
        let mut got = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while got.len() < want {
            assert!(Instant::now() < deadline, "recv timed out");
            sock.recv_batch(&mut |pkt| got.push(pkt)).unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        got
    }

    #[test]
    fn test_send_recv_single() {
        let mut a = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut b = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let out = a
            .send(b.local(), Some(EcnCodepoint::Ect0), b"ping", None)
            .unwrap();
        assert_eq!(out, SendOutcome::Sent);

        let pkts = recv_until(&mut b, 1);
        assert_eq!(&pkts[0].data[..], b"ping");
        assert_eq!(pkts[0].path.remote, a.local());
        assert_eq!(pkts[0].ecn, Some(EcnCodepoint::Ect0));
    }

    #[test]
    fn test_send_segmented() {
        let mut a = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut b = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        // Three 8-byte datagrams in one transmit; exercises either the
        // GSO path or the chunked fallback.
        let contents: Vec<u8> = (0u8..24).collect();
        let out = a.send(b.local(), None, &contents, Some(8)).unwrap();
        assert_eq!(out, SendOutcome::Sent);

        let mut pkts = recv_until(&mut b, 3);
        pkts.sort_by_key(|p| p.data[0]);
        for (i, pkt) in pkts.iter().enumerate() {
            assert_eq!(&pkt.data[..], &contents[i * 8..(i + 1) * 8]);
        }
    }

    #[test]
    fn test_short_final_segment() {
        let mut a = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut b = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        // 20 bytes at segment size 8: two full datagrams plus a runt.
        let contents: Vec<u8> = (0u8..20).collect();
        a.send(b.local(), None, &contents, Some(8)).unwrap();

        let mut pkts = recv_until(&mut b, 3);
        pkts.sort_by_key(|p| p.data[0]);
        assert_eq!(pkts[2].data.len(), 4);
    }
}
