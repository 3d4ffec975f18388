//! UDP socket creation with SO_REUSEPORT.
//!
//! Every socket in the pool binds the same address; with SO_REUSEPORT the
//! kernel spreads incoming datagrams across them, so the reader pool scales
//! without any user-space synchronization on the receive path.

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket as Socket2, Type};
use std::net::{SocketAddr, UdpSocket};

/// Create and configure one UDP socket of the pool.
///
/// The socket is left in blocking mode; readers bound it with a read
/// timeout to get their polling window.
pub fn create_udp_socket(
    bind_addr: SocketAddr,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
) -> Result<UdpSocket> {
    let domain = match bind_addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket =
        Socket2::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("creating UDP socket")?;

    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;

    enable_port_sharing(&socket).context("requesting port sharing")?;

    if let Some(size) = recv_buffer_size {
        socket
            .set_recv_buffer_size(size)
            .with_context(|| format!("setting SO_RCVBUF to {}", size))?;
    }

    if let Some(size) = send_buffer_size {
        socket
            .set_send_buffer_size(size)
            .with_context(|| format!("setting SO_SNDBUF to {}", size))?;
    }

    if let SocketAddr::V6(addr) = bind_addr {
        socket
            .set_only_v6(!addr.ip().is_unspecified())
            .context("setting IPV6_V6ONLY")?;
    }

    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("binding UDP socket to {}", bind_addr))?;

    Ok(socket.into())
}

/// Request SO_REUSEPORT for a pool member.
///
/// Without it the pool still works, it just collapses to a single
/// effective receive queue — a parallelism loss, not a correctness one. A
/// kernel that does not know the option is therefore downgraded to a
/// warning; any other failure is real and propagates.
#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
fn enable_port_sharing(socket: &Socket2) -> std::io::Result<()> {
    let Err(err) = socket.set_reuse_port(true) else {
        return Ok(());
    };

    let option_unknown = matches!(
        err.raw_os_error(),
        Some(libc::ENOPROTOOPT) | Some(libc::EINVAL)
    );
    if option_unknown {
        tracing::warn!("kernel rejected SO_REUSEPORT, pool will not share inbound load");
        return Ok(());
    }
    Err(err)
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
fn enable_port_sharing(_socket: &Socket2) -> std::io::Result<()> {
    tracing::warn!("SO_REUSEPORT unavailable on this target, pool will not share inbound load");
    Ok(())
}
