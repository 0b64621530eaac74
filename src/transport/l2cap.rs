//! Minimal async L2CAP sequential-packet sockets
//!
//! Neither std nor tokio know about `AF_BLUETOOTH`, so the sockets are
//! created with libc and driven through tokio's `AsyncFd`.

use nix::errno::Errno;
use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;

const AF_BLUETOOTH: libc::c_int = 31;
const BTPROTO_L2CAP: libc::c_int = 0;

/// `struct sockaddr_l2` from `<bluetooth/l2cap.h>`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct SockaddrL2 {
    l2_family: libc::sa_family_t,
    l2_psm: u16,
    l2_bdaddr: [u8; 6],
    l2_cid: u16,
    l2_bdaddr_type: u8,
}

impl SockaddrL2 {
    fn any(psm: u16) -> Self {
        Self {
            l2_family: AF_BLUETOOTH as libc::sa_family_t,
            l2_psm: psm.to_le(),
            ..Default::default()
        }
    }
}

/// Bluetooth device address, stored little-endian as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BdAddr(pub [u8; 6]);

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

fn new_socket() -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the descriptor is owned right away
    let fd = Errno::result(unsafe {
        libc::socket(
            AF_BLUETOOTH,
            libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            BTPROTO_L2CAP,
        )
    })
    .map_err(io::Error::from)?;
    // SAFETY: fd was just returned by socket(2) and is not owned elsewhere
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Hand an owned descriptor to the tokio reactor
pub(super) fn register(fd: OwnedFd) -> io::Result<AsyncFd<OwnedFd>> {
    // SAFETY: the OwnedFd stays open and keeps the same descriptor for as
    // long as the AsyncFd owns it
    Ok(unsafe { AsyncFd::register(fd) }?)
}

/// Whether the kernel has Bluetooth socket support at all
pub fn bluetooth_available() -> bool {
    new_socket().is_ok()
}

/// Listening socket bound to one PSM on all adapters
pub struct L2capListener {
    fd: AsyncFd<OwnedFd>,
    psm: u16,
}

impl L2capListener {
    pub fn bind(psm: u16) -> io::Result<Self> {
        let socket = new_socket()?;
        let addr = SockaddrL2::any(psm);

        // SAFETY: addr is a valid sockaddr_l2 for the duration of the call
        Errno::result(unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const SockaddrL2 as *const libc::sockaddr,
                mem::size_of::<SockaddrL2>() as libc::socklen_t,
            )
        })
        .map_err(io::Error::from)?;

        // SAFETY: listen(2) on a socket we own
        Errno::result(unsafe { libc::listen(socket.as_raw_fd(), 1) }).map_err(io::Error::from)?;

        Ok(Self {
            fd: register(socket)?,
            psm,
        })
    }

    pub fn psm(&self) -> u16 {
        self.psm
    }

    /// Accept one connection; cancel-safe
    pub async fn accept(&self) -> io::Result<(L2capStream, BdAddr)> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| accept_raw(inner.as_raw_fd())) {
                Ok(result) => {
                    let (fd, addr) = result?;
                    return Ok((L2capStream::new(fd)?, addr));
                }
                Err(_would_block) => continue,
            }
        }
    }
}

fn accept_raw(listener: RawFd) -> io::Result<(OwnedFd, BdAddr)> {
    let mut addr = SockaddrL2::default();
    let mut len = mem::size_of::<SockaddrL2>() as libc::socklen_t;

    // SAFETY: addr/len describe a writable sockaddr_l2
    let fd = Errno::result(unsafe {
        libc::accept4(
            listener,
            &mut addr as *mut SockaddrL2 as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    })
    .map_err(io::Error::from)?;

    // SAFETY: fd was just returned by accept4(2)
    Ok((unsafe { OwnedFd::from_raw_fd(fd) }, BdAddr(addr.l2_bdaddr)))
}

/// One connected L2CAP channel
pub struct L2capStream {
    fd: AsyncFd<OwnedFd>,
}

impl L2capStream {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        Ok(Self { fd: register(fd)? })
    }

    /// Send one packet
    pub async fn send(&self, packet: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| {
                // SAFETY: packet is a valid buffer of packet.len() bytes
                let n = Errno::result(unsafe {
                    libc::send(
                        inner.as_raw_fd(),
                        packet.as_ptr() as *const libc::c_void,
                        packet.len(),
                        libc::MSG_NOSIGNAL,
                    )
                })
                .map_err(io::Error::from)?;
                Ok(n as usize)
            });

            match result {
                Ok(Ok(n)) if n == packet.len() => return Ok(()),
                Ok(Ok(n)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short L2CAP write: {} of {} bytes", n, packet.len()),
                    ))
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one packet; `Ok(0)` means the peer closed the channel
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                // SAFETY: buf is a valid writable buffer of buf.len() bytes
                let n = Errno::result(unsafe {
                    libc::recv(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                })
                .map_err(io::Error::from)?;
                Ok(n as usize)
            });

            match result {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}
