//! Peer transport bring-up: listeners, direct connects, and the SOCKS5
//! proxy chain.
//!
//! The tunnel core only needs a connected stream fd; everything here runs
//! blocking, before the ring takes over the socket.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::MAX_PROXY_HOPS;

/// Resolve `host:port` to the first usable socket address.
pub fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{addr}: no usable address"),
        )
    })
}

/// Split `host:port` (IPv6 hosts in brackets) without resolving, so domain
/// names survive to the proxy that should resolve them.
pub fn split_host_port(addr: &str) -> io::Result<(String, u16)> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{addr}: expected host:port"),
        )
    })?;
    let port: u16 = port
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("{addr}: bad port")))?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{addr}: empty host"),
        ));
    }
    Ok((host.to_string(), port))
}

fn stream_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
}

/// Direct blocking connect.
pub fn connect(addr: &str) -> io::Result<Socket> {
    let resolved = resolve(addr)?;
    let socket = stream_socket(&resolved)?;
    socket.connect(&resolved.into())?;
    socket.set_nodelay(true)?;
    Ok(socket)
}

/// Bound and listening socket with `SO_REUSEADDR`, backlog 1: the tunnel
/// serves one peer at a time.
pub fn listen(addr: &str) -> io::Result<Socket> {
    let resolved = resolve(addr)?;
    let socket = stream_socket(&resolved)?;
    socket.set_reuse_address(true)?;
    socket.bind(&resolved.into())?;
    socket.listen(1)?;
    Ok(socket)
}

/// Blocking accept; logs the peer address.
pub fn accept(listener: &Socket) -> io::Result<Socket> {
    let (socket, peer) = listener.accept()?;
    match peer.as_socket() {
        Some(addr) => eprintln!("new connection from {addr}"),
        None => eprintln!("new connection"),
    }
    socket.set_nodelay(true)?;
    Ok(socket)
}

/// Connect to `target` through `proxies` applied left-to-right, each hop
/// speaking the SOCKS5 no-auth CONNECT profile.
pub fn connect_chain(proxies: &[String], target: &str) -> io::Result<Socket> {
    if proxies.is_empty() {
        return connect(target);
    }
    if proxies.len() > MAX_PROXY_HOPS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("proxy chain longer than {MAX_PROXY_HOPS} hops"),
        ));
    }

    let mut socket = connect(&proxies[0])?;
    for hop in &proxies[1..] {
        socks5_connect(&mut socket, hop)?;
    }
    socks5_connect(&mut socket, target)?;
    Ok(socket)
}

/// Build the SOCKS5 CONNECT request for `host:port`. ATYP follows the host
/// shape: literal v4/v6 addresses go as addresses, anything else as a
/// domain name for the proxy to resolve.
fn socks5_request(host: &str, port: u16) -> io::Result<Vec<u8>> {
    let mut req = vec![0x05, 0x01, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            req.push(0x01);
            req.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            req.push(0x04);
            req.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "domain name longer than 255 bytes",
                ));
            }
            req.push(0x03);
            req.push(host.len() as u8);
            req.extend_from_slice(host.as_bytes());
        }
    }
    req.extend_from_slice(&port.to_be_bytes());
    Ok(req)
}

fn socks5_reply_error(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

/// Run a SOCKS5 no-auth CONNECT handshake on an established stream, asking
/// the remote proxy to open `addr`.
fn socks5_connect(socket: &mut Socket, addr: &str) -> io::Result<()> {
    let (host, port) = split_host_port(addr)?;

    socket.write_all(&[0x05, 0x01, 0x00])?;
    let mut method = [0u8; 2];
    socket.read_exact(&mut method)?;
    if method != [0x05, 0x00] {
        return Err(io::Error::other(format!(
            "{addr}: proxy refused no-auth method"
        )));
    }

    socket.write_all(&socks5_request(&host, port)?)?;

    let mut head = [0u8; 4];
    socket.read_exact(&mut head)?;
    if head[0] != 0x05 {
        return Err(io::Error::other(format!("{addr}: not a SOCKS5 reply")));
    }
    if head[1] != 0x00 {
        return Err(io::Error::other(format!(
            "{addr}: proxy connect failed: {}",
            socks5_reply_error(head[1])
        )));
    }

    // Skip the bound address the proxy reports.
    let bound_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            socket.read_exact(&mut len)?;
            len[0] as usize
        }
        other => {
            return Err(io::Error::other(format!(
                "{addr}: unknown ATYP {other} in reply"
            )));
        }
    };
    let mut skip = vec![0u8; bound_len + 2];
    socket.read_exact(&mut skip)?;

    Ok(())
}
