//! Outbound UDP socket setup.

use anyhow::{Context, Result};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

/// Open a non-blocking UDP socket on an ephemeral port in the same address
/// family as `destination`, optionally shrinking its send buffer.
pub fn open_socket(
    destination: SocketAddr,
    send_buffer_size: Option<usize>,
) -> Result<UdpSocket> {
    let local: SocketAddr = match destination {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket =
        UdpSocket::bind(local).with_context(|| format!("binding UDP socket on {}", local))?;
    socket
        .set_nonblocking(true)
        .context("setting UDP socket non-blocking")?;

    if let Some(size) = send_buffer_size {
        set_send_buffer_size(&socket, size)
            .with_context(|| format!("setting SO_SNDBUF to {} bytes", size))?;
    }
    Ok(socket)
}

#[cfg(target_os = "linux")]
pub fn set_send_buffer_size(socket: &UdpSocket, size: usize) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let value = libc::c_int::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "send buffer size too large"))?;
    // SAFETY: the fd belongs to a live UdpSocket and the option value is a c_int
    // whose size is passed alongside it.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_send_buffer_size(_socket: &UdpSocket, size: usize) -> io::Result<()> {
    log::warn!(
        "send buffer override ({} bytes) is not supported on this platform; using the system default",
        size
    );
    Ok(())
}

/// Effective kernel send buffer size. Linux reports double the requested value
/// to account for bookkeeping overhead.
#[cfg(all(test, target_os = "linux"))]
fn send_buffer_size(socket: &UdpSocket) -> io::Result<usize> {
    use std::os::unix::io::AsRawFd;

    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value and len point to properly sized locals for SO_SNDBUF.
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &mut value as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value.max(0) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_port_in_destination_family() {
        let socket = open_socket("127.0.0.1:5005".parse().unwrap(), None).unwrap();
        let local = socket.local_addr().unwrap();
        assert!(local.is_ipv4());
        assert_ne!(local.port(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn shrinks_send_buffer_when_requested() {
        let socket = open_socket("127.0.0.1:5005".parse().unwrap(), Some(16 * 1024)).unwrap();
        let effective = send_buffer_size(&socket).unwrap();
        assert!(effective >= 16 * 1024, "effective SO_SNDBUF {}", effective);
        assert!(effective <= 4 * 16 * 1024, "effective SO_SNDBUF {}", effective);
    }
}
