// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Stream and datagram I/O with the uniform read/write/connect/bind/accept
//! contract the rest of the crate builds on.
//!
//! Sockets are backed by `mio`'s non-blocking net types so the same value can
//! be registered with the event loop's `Poll` once the handshake is done;
//! `read_into`/`write_all`/`accept` present a blocking-looking interface by
//! retrying on `WouldBlock`, so callers never have to handle a partial read
//! or write themselves.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use mio::net as mnet;

use crate::error::Error;

const RETRY_BACKOFF: Duration = Duration::from_millis(2);

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

/// Common read/write contract shared by the stream and datagram sockets.
pub trait StreamSocket {
    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error>;
    fn is_connected(&self) -> bool;
}

pub trait DatagramSocket {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error>;
    fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error>;
    fn is_connected(&self) -> bool;
}

/// A connected TCP stream, used for control and `Transport::Stream` payload
/// frames.
pub struct TcpSocket {
    inner: mnet::TcpStream,
}

impl TcpSocket {
    pub fn connect(addr: SocketAddr) -> Result<TcpSocket, Error> {
        let std_stream = std::net::TcpStream::connect(addr).map_err(Error::ConnectFailed)?;
        std_stream.set_nodelay(true).ok();
        Ok(TcpSocket { inner: mnet::TcpStream::from_std(std_stream) })
    }

    pub(crate) fn from_accepted(stream: mnet::TcpStream) -> TcpSocket {
        TcpSocket { inner: stream }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// Exposes the underlying `mio` source so the event loop can register or
    /// reregister interest for this socket.
    pub(crate) fn source(&mut self) -> &mut mnet::TcpStream {
        &mut self.inner
    }
}

impl StreamSocket for TcpSocket {
    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            match self.inner.read(buf) {
                Ok(n) => return Ok(n),
                Err(ref e) if would_block(e) => thread::sleep(RETRY_BACKOFF),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::ReadFailed(e)),
            }
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let mut written = 0;
        while written < bytes.len() {
            match self.inner.write(&bytes[written..]) {
                Ok(0) => return Err(Error::WriteFailed(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"))),
                Ok(n) => written += n,
                Err(ref e) if would_block(e) => thread::sleep(RETRY_BACKOFF),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::WriteFailed(e)),
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        match self.inner.take_error() {
            Ok(None) => self.inner.peer_addr().is_ok(),
            _ => false,
        }
    }
}

/// A UDP socket. Peers use one connected to the remote's listening port for
/// sending; `Network` owns exactly one, bound and unconnected, for
/// receiving from the whole mesh.
pub struct UdpSocket {
    inner: mnet::UdpSocket,
}

impl UdpSocket {
    pub fn bind(port: u16) -> Result<UdpSocket, Error> {
        let addr: SocketAddr = ("0.0.0.0", port)
            .to_socket_addrs()
            .map_err(Error::BindFailed)?
            .next()
            .expect("at least one resolved address");
        let inner = mnet::UdpSocket::bind(addr).map_err(Error::BindFailed)?;
        Ok(UdpSocket { inner })
    }

    pub fn bind_ephemeral() -> Result<UdpSocket, Error> {
        UdpSocket::bind(0)
    }

    pub fn connect(&mut self, addr: SocketAddr) -> Result<(), Error> {
        self.inner.connect(addr).map_err(Error::ConnectFailed)
    }

    pub(crate) fn source(&mut self) -> &mut mnet::UdpSocket {
        &mut self.inner
    }
}

impl DatagramSocket for UdpSocket {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        loop {
            match self.inner.send(bytes) {
                Ok(_) => return Ok(()),
                Err(ref e) if would_block(e) => thread::sleep(RETRY_BACKOFF),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::WriteFailed(e)),
            }
        }
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        loop {
            match self.inner.recv_from(buf) {
                Ok(r) => return Ok(r),
                Err(ref e) if would_block(e) => thread::sleep(RETRY_BACKOFF),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::ReadFailed(e)),
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.peer_addr().is_ok()
    }
}

/// The listening stream socket. `accept` blocks (by retrying) until a
/// connection arrives; `Network`'s event loop only calls it once `Poll` has
/// reported the listener readable, so in practice it never spins.
pub struct Acceptor {
    inner: mnet::TcpListener,
}

impl Acceptor {
    pub fn bind(port: u16) -> Result<Acceptor, Error> {
        let addr: SocketAddr = ("0.0.0.0", port)
            .to_socket_addrs()
            .map_err(Error::BindFailed)?
            .next()
            .expect("at least one resolved address");
        let inner = mnet::TcpListener::bind(addr).map_err(Error::BindFailed)?;
        Ok(Acceptor { inner })
    }

    pub fn accept(&mut self) -> Result<(TcpSocket, SocketAddr), Error> {
        loop {
            match self.inner.accept() {
                Ok((stream, addr)) => return Ok((TcpSocket::from_accepted(stream), addr)),
                Err(ref e) if would_block(e) => thread::sleep(RETRY_BACKOFF),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::BindFailed(e)),
            }
        }
    }

    pub(crate) fn source(&mut self) -> &mut mnet::TcpListener {
        &mut self.inner
    }
}
