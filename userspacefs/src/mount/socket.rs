//! Listening socket for the fallback share server.

use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, ToSocketAddrs};
use std::ops::RangeInclusive;
use std::os::fd::AsRawFd;

use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType,
    SockaddrStorage,
};
use rand::Rng;
use tracing::{debug, info};

use super::error::{MountError, MountResult};
use super::options::ListenAddress;

/// Ports tried when no port is given.
pub const RANDOM_PORT_RANGE: RangeInclusive<u16> = 60000..=u16::MAX;

/// Give up on random ports after this many are found in use.
pub const MAX_PORT_ATTEMPTS: usize = 4096;

/// Resolve the host part of a listen address to an IP.
pub fn resolve_host(host: &str) -> MountResult<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    (host, 0)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip())
        .ok_or_else(|| MountError::InvalidListenAddress(format!("cannot resolve {:?}", host)))
}

/// Bind a listening TCP socket for `address`.
pub fn bind_listener(address: &ListenAddress) -> MountResult<TcpListener> {
    let ip = resolve_host(&address.host)?;
    bind_with(ip, address.port, bind_socket)
}

/// Bind through `bind`, which receives the address and whether port reuse
/// should be enabled.
///
/// An explicit port is bound once with reuse enabled. Otherwise random ports
/// from [`RANDOM_PORT_RANGE`] are tried until one is not in use; any other
/// error stops the search.
pub fn bind_with<T, F>(ip: IpAddr, port: Option<u16>, mut bind: F) -> MountResult<T>
where
    F: FnMut(SocketAddr, bool) -> io::Result<T>,
{
    if let Some(port) = port {
        let addr = SocketAddr::new(ip, port);
        let bound = bind(addr, true).map_err(|source| MountError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        info!(addr = %addr, "Listening");
        return Ok(bound);
    }

    let mut rng = rand::rng();
    for attempt in 0..MAX_PORT_ATTEMPTS {
        let addr = SocketAddr::new(ip, rng.random_range(RANDOM_PORT_RANGE));
        match bind(addr, false) {
            Ok(bound) => {
                info!(addr = %addr, attempt, "Listening");
                return Ok(bound);
            }
            Err(e) if e.raw_os_error() == Some(libc::EADDRINUSE) => {
                debug!(addr = %addr, "Port in use, trying another");
            }
            Err(source) => {
                return Err(MountError::Bind {
                    addr: addr.to_string(),
                    source,
                })
            }
        }
    }
    Err(MountError::Bind {
        addr: format!("{}:*", ip),
        source: io::Error::from_raw_os_error(libc::EADDRINUSE),
    })
}

fn bind_socket(addr: SocketAddr, reuse: bool) -> io::Result<TcpListener> {
    let family = if addr.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };
    let fd = socket(family, SockType::Stream, SockFlag::empty(), None)?;
    if reuse {
        setsockopt(&fd, sockopt::ReuseAddr, &true)?;
        setsockopt(&fd, sockopt::ReusePort, &true)?;
    }
    bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))?;
    listen(&fd, Backlog::MAXCONN)?;
    Ok(TcpListener::from(fd))
}
