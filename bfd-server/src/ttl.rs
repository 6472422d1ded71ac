//! Listening socket with received-TTL extraction
//!
//! RFC 5881 section 5 requires single-hop BFD packets to arrive with an
//! IPv4 TTL (or IPv6 hop limit) of exactly 255. The kernel only exposes
//! the received TTL through ancillary data, so the listening socket
//! enables `IP_RECVTTL` / `IPV6_RECVHOPLIMIT` and the receive path walks
//! the control messages with `CMSG_FIRSTHDR`/`CMSG_NXTHDR` instead of
//! assuming a fixed byte offset.
//!
//! # Linux
//!
//! Fully supported.
//!
//! # Other platforms
//!
//! Not implemented; binding a listening socket fails with `Unsupported`.

use std::io;
use std::net::SocketAddr;

#[cfg(target_os = "linux")]
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
#[cfg(target_os = "linux")]
use std::os::unix::io::{AsRawFd, RawFd};
#[cfg(not(target_os = "linux"))]
use std::os::fd::AsRawFd;

use tokio::io::unix::AsyncFd;

/// A non-blocking UDP listening socket that reports the TTL of every
/// received datagram
pub(crate) struct RecvSocket {
    fd: AsyncFd<std::net::UdpSocket>,
}

impl RecvSocket {
    /// Bind the address and enable TTL delivery in ancillary data
    pub(crate) fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        enable_recv_ttl(&socket, addr.is_ipv6())?;

        Ok(Self {
            fd: AsyncFd::new(socket)?,
        })
    }

    /// Receive one datagram; returns the payload length, the received TTL
    /// (when the kernel delivered one) and the sender address
    pub(crate) async fn recv_with_ttl(
        &self,
        buf: &mut [u8],
    ) -> io::Result<(usize, Option<u8>, SocketAddr)> {
        loop {
            let mut guard = self.fd.readable().await?;

            match guard.try_io(|inner| recv_msg_ttl(inner.get_ref().as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.fd.get_ref().local_addr()
    }
}

/// Ask the kernel to deliver the received TTL / hop limit as a control
/// message on every datagram
#[cfg(target_os = "linux")]
fn enable_recv_ttl(socket: &std::net::UdpSocket, is_ipv6: bool) -> io::Result<()> {
    let (level, option) = if is_ipv6 {
        (libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT)
    } else {
        (libc::IPPROTO_IP, libc::IP_RECVTTL)
    };

    let val: libc::c_int = 1;
    // SAFETY:
    // - socket.as_raw_fd() is a valid socket file descriptor owned by the caller
    // - val is a properly initialized c_int on the stack
    // - IP_RECVTTL / IPV6_RECVHOPLIMIT are valid options for UDP sockets of
    //   the matching address family
    // - The option length matches the c_int size
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
fn enable_recv_ttl(_socket: &std::net::UdpSocket, _is_ipv6: bool) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "received-TTL delivery not supported on this platform",
    ))
}

/// Aligned buffer for control messages
#[cfg(target_os = "linux")]
#[repr(C, align(8))]
struct AlignedCmsgBuf {
    data: [u8; 128],
}

/// One `recvmsg` call returning payload, TTL and sender
#[cfg(target_os = "linux")]
fn recv_msg_ttl(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<u8>, SocketAddr)> {
    let mut cmsg_buf = AlignedCmsgBuf { data: [0u8; 128] };

    // SAFETY:
    // - sockaddr_storage and msghdr are POD types that can be safely
    //   zero-initialized; all msghdr fields are set below before use
    let mut addr_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut _,
        iov_len: buf.len(),
    };

    msg.msg_name = &mut addr_storage as *mut _ as *mut _;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.data.as_mut_ptr() as *mut _;
    msg.msg_controllen = cmsg_buf.data.len() as _;

    // SAFETY:
    // - fd is a valid non-blocking socket file descriptor
    // - &mut msg points to a properly initialized msghdr:
    //   - msg_name/msg_namelen describe the sockaddr_storage on the stack
    //   - msg_iov/msg_iovlen describe the single payload buffer
    //   - msg_control/msg_controllen describe the aligned cmsg buffer
    // - All buffers remain valid for the duration of recvmsg
    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let ttl = parse_ttl_cmsg(&msg);
    let addr = sockaddr_to_std(&addr_storage)?;

    Ok((n as usize, ttl, addr))
}

/// Walk the control messages looking for the TTL / hop limit payload
#[cfg(target_os = "linux")]
fn parse_ttl_cmsg(msg: &libc::msghdr) -> Option<u8> {
    // SAFETY:
    // - msg was populated by a successful recvmsg call
    // - msg.msg_control points to a valid buffer of msg.msg_controllen bytes
    // - CMSG_FIRSTHDR returns NULL or a valid pointer within that buffer
    // - CMSG_NXTHDR returns NULL when no more messages remain
    // - cmsg is only dereferenced after the null check
    // - CMSG_DATA points at a c_int for both IP_TTL and IPV6_HOPLIMIT, read
    //   with read_unaligned to sidestep alignment concerns
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let level = (*cmsg).cmsg_level;
            let kind = (*cmsg).cmsg_type;

            let is_ttl = (level == libc::IPPROTO_IP && kind == libc::IP_TTL)
                || (level == libc::IPPROTO_IPV6 && kind == libc::IPV6_HOPLIMIT);

            if is_ttl {
                let value: libc::c_int =
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int);
                return Some(value as u8);
            }

            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }

    None
}

/// Convert the kernel-filled sockaddr into a std address
#[cfg(target_os = "linux")]
fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: ss_family says this is a sockaddr_in, which is smaller
            // than sockaddr_storage, so the reinterpretation is in bounds
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // SAFETY: ss_family says this is a sockaddr_in6, which is smaller
            // than sockaddr_storage, so the reinterpretation is in bounds
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr.sin6_addr.s6_addr),
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unknown address family",
        )),
    }
}

#[cfg(not(target_os = "linux"))]
fn recv_msg_ttl(
    _fd: std::os::fd::RawFd,
    _buf: &mut [u8],
) -> io::Result<(usize, Option<u8>, SocketAddr)> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "received-TTL delivery not supported on this platform",
    ))
}
