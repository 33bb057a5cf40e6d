// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! One remote participant: dual sockets, handshake state, and the
//! subscriptions it forwards to.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::control::{self, CONNECT, DISCONNECT, SUBSCRIBE};
use crate::error::Error;
use crate::message::{Message, Payload, Transport};
use crate::router::{self, Listener};
use crate::socket::{DatagramSocket, StreamSocket, TcpSocket, UdpSocket};
use crate::wire::FrameDecoder;
use crate::UserId;

pub type PeerId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Idle,
    HalfOpen,
    Established,
}

struct Sockets {
    stream: Option<TcpSocket>,
    datagram_out: Option<UdpSocket>,
}

/// The outcome of pumping bytes off a peer's stream socket once it has been
/// reported readable.
pub(crate) enum StreamPump {
    /// Zero or more frames were decoded and dispatched; keep the peer.
    Continue,
    /// A `Disconnect` frame was among them; the caller must drop the peer.
    Disconnected,
}

pub struct Peer {
    id: PeerId,
    local_user_id: UserId,
    my_listening_port: u16,
    remote_host: IpAddr,
    remote_port: Mutex<u16>,
    remote_user_id: Mutex<UserId>,
    status: Mutex<ConnectStatus>,
    sockets: Mutex<Sockets>,
    decoder: Mutex<FrameDecoder>,
    subscribed_types: Mutex<HashSet<u16>>,
    active: AtomicBool,
}

impl Peer {
    /// Outbound (active) side of the handshake: dial both sockets, send our
    /// `Connect`, then block for the remote's `Connect` reply.
    pub(crate) fn dial(
        id: PeerId,
        local_user_id: UserId,
        my_listening_port: u16,
        host: IpAddr,
        port: u16,
    ) -> Result<Arc<Peer>, Error> {
        let remote_addr = SocketAddr::new(host, port);
        let stream = TcpSocket::connect(remote_addr)?;
        let mut datagram_out = UdpSocket::bind_ephemeral()?;
        datagram_out.connect(remote_addr)?;

        let peer = Arc::new(Peer {
            id,
            local_user_id,
            my_listening_port,
            remote_host: host,
            remote_port: Mutex::new(port),
            remote_user_id: Mutex::new(0),
            status: Mutex::new(ConnectStatus::HalfOpen),
            sockets: Mutex::new(Sockets { stream: Some(stream), datagram_out: Some(datagram_out) }),
            decoder: Mutex::new(FrameDecoder::new()),
            subscribed_types: Mutex::new(HashSet::new()),
            active: AtomicBool::new(true),
        });

        let hello = control::Connect { listening_port: my_listening_port, user_id: local_user_id }
            .into_message()
            .encode();
        peer.write_stream_with_retry(&hello)?;

        let reply = peer.read_one_stream_frame()?;
        if reply.type_id() != CONNECT {
            return Err(Error::protocol_violation("first message from a peer was not a Connect"));
        }

        let connect = control::Connect::decode(reply.body())
            .ok_or_else(|| Error::protocol_violation("malformed Connect body"))?;
        *peer.remote_port.lock().unwrap() = connect.listening_port;
        *peer.remote_user_id.lock().unwrap() = connect.user_id;

        if connect.listening_port != port {
            let advertised_addr = SocketAddr::new(host, connect.listening_port);
            let mut sockets = peer.sockets.lock().unwrap();
            if let Some(datagram_out) = sockets.datagram_out.as_mut() {
                datagram_out.connect(advertised_addr)?;
            }
        }

        *peer.status.lock().unwrap() = ConnectStatus::Established;

        Ok(peer)
    }

    /// Inbound (passive) side: the `Network` has already read the first
    /// frame off an unattached socket and confirmed it is a `Connect`.
    pub(crate) fn from_accepted(
        id: PeerId,
        local_user_id: UserId,
        my_listening_port: u16,
        stream: TcpSocket,
        remote_ip: IpAddr,
        connect: control::Connect,
    ) -> Result<Arc<Peer>, Error> {
        let remote_addr = SocketAddr::new(remote_ip, connect.listening_port);
        let mut datagram_out = UdpSocket::bind_ephemeral()?;
        datagram_out.connect(remote_addr)?;

        let peer = Arc::new(Peer {
            id,
            local_user_id,
            my_listening_port,
            remote_host: remote_ip,
            remote_port: Mutex::new(connect.listening_port),
            remote_user_id: Mutex::new(connect.user_id),
            status: Mutex::new(ConnectStatus::HalfOpen),
            sockets: Mutex::new(Sockets { stream: Some(stream), datagram_out: Some(datagram_out) }),
            decoder: Mutex::new(FrameDecoder::new()),
            subscribed_types: Mutex::new(HashSet::new()),
            active: AtomicBool::new(true),
        });

        let reply = control::Connect { listening_port: my_listening_port, user_id: local_user_id }
            .into_message()
            .encode();
        peer.write_stream_with_retry(&reply)?;
        *peer.status.lock().unwrap() = ConnectStatus::Established;

        Ok(peer)
    }

    pub fn peer_id(&self) -> PeerId {
        self.id
    }

    pub fn ip(&self) -> IpAddr {
        self.remote_host
    }

    pub fn listening_port(&self) -> u16 {
        *self.remote_port.lock().unwrap()
    }

    pub fn remote_user_id(&self) -> UserId {
        *self.remote_user_id.lock().unwrap()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        if !matches!(*self.status.lock().unwrap(), ConnectStatus::Established) {
            return false;
        }

        let ok = {
            let sockets = self.sockets.lock().unwrap();
            sockets.stream.as_ref().map(StreamSocket::is_connected).unwrap_or(false)
                && sockets.datagram_out.as_ref().map(DatagramSocket::is_connected).unwrap_or(false)
        };

        if !ok {
            *self.status.lock().unwrap() = ConnectStatus::HalfOpen;
        }

        ok
    }

    /// Sends a message to this peer. Loop protection: a message reconstructed
    /// from the wire is never re-forwarded.
    pub fn send(&self, msg: &Message) -> bool {
        if !self.is_active() {
            return false;
        }

        if msg.incoming() {
            return true;
        }

        match msg.transport() {
            Transport::LocalOnly => true,
            Transport::Stream => self.send_stream(msg),
            Transport::Datagram => self.send_datagram(msg),
        }
    }

    pub fn subscribe(&self, type_id: u16) -> bool {
        let msg = control::Subscribe { type_id }.into_message();
        self.send(&msg)
    }

    /// Called by `Network` once it has read a complete frame off this peer's
    /// stream (handshake control frames) or demultiplexed a datagram to it.
    pub(crate) fn receive(self: &Arc<Peer>, mut msg: Message) {
        if !self.is_active() {
            return;
        }

        msg.set_sender_peer_id(self.id);

        match msg.type_id() {
            SUBSCRIBE => {
                if let Some(sub) = control::Subscribe::decode(msg.body()) {
                    self.handle_subscribe(sub.type_id);
                } else {
                    warn!("peer {}: malformed Subscribe frame", self.id);
                }
            }
            DISCONNECT => {
                self.handle_disconnect();
            }
            type_id => {
                router::broker_for(type_id).publish(msg);
            }
        }
    }

    fn handle_subscribe(self: &Arc<Peer>, type_id: u16) {
        let newly_inserted = self.subscribed_types.lock().unwrap().insert(type_id);

        if newly_inserted {
            router::broker_for(type_id).register_listener(self.clone() as Arc<dyn Listener>);
            debug!("peer {} subscribed to type {}", self.id, type_id);
        }
    }

    fn handle_disconnect(self: &Arc<Peer>) {
        let disconnect_router = router::broker_for(DISCONNECT);
        let mut msg = control::Disconnect.into_message();
        msg.set_sender_peer_id(self.id);
        disconnect_router.publish(msg);

        let subscribed: Vec<u16> = self.subscribed_types.lock().unwrap().drain().collect();
        for type_id in subscribed {
            router::broker_for(type_id).unregister_listener(&(self.clone() as Arc<dyn Listener>));
        }

        self.close_sockets();
        self.active.store(false, Ordering::SeqCst);
    }

    /// Runs on `Network`'s remove_peer/disconnect_all: tell the remote we're
    /// leaving, then tear down locally without waiting for its reply.
    pub(crate) fn initiate_disconnect(self: &Arc<Peer>) {
        if self.is_active() {
            let msg = control::Disconnect.into_message();
            let _ = self.send(&msg);
        }

        let subscribed: Vec<u16> = self.subscribed_types.lock().unwrap().drain().collect();
        for type_id in subscribed {
            router::broker_for(type_id).unregister_listener(&(self.clone() as Arc<dyn Listener>));
        }

        self.close_sockets();
        self.active.store(false, Ordering::SeqCst);
    }

    /// Registers this peer's stream socket with the event loop's poll
    /// instance for the given token. Called once per loop iteration since the
    /// socket may have been swapped out by a reconnect.
    pub(crate) fn register_readable(&self, registry: &mio::Registry, token: mio::Token) -> bool {
        let mut sockets = self.sockets.lock().unwrap();
        match sockets.stream.as_mut() {
            Some(s) => registry.register(s.source(), token, mio::Interest::READABLE).is_ok(),
            None => false,
        }
    }

    /// Tears the peer down after an unrecoverable socket error observed by
    /// the event loop. Unlike `initiate_disconnect`, no `Disconnect` frame is
    /// sent, since the socket is already unusable.
    pub(crate) fn force_deactivate(self: &Arc<Peer>) {
        let subscribed: Vec<u16> = self.subscribed_types.lock().unwrap().drain().collect();
        for type_id in subscribed {
            router::broker_for(type_id).unregister_listener(&(self.clone() as Arc<dyn Listener>));
        }

        self.close_sockets();
        self.active.store(false, Ordering::SeqCst);
    }

    pub(crate) fn on_stream_readable(self: &Arc<Peer>) -> Result<StreamPump, Error> {
        let mut buf = [0u8; 4096];
        let n = {
            let mut sockets = self.sockets.lock().unwrap();
            match sockets.stream.as_mut() {
                Some(s) => s.read_into(&mut buf)?,
                None => return Err(Error::PeerClosed),
            }
        };

        if n == 0 {
            return Err(Error::PeerClosed);
        }

        self.decoder.lock().unwrap().feed(&buf[..n]);

        loop {
            let next = self.decoder.lock().unwrap().next_frame();
            match next {
                Some(Ok(frame)) => {
                    let is_disconnect = frame.type_id() == DISCONNECT;
                    self.receive(frame);
                    if is_disconnect {
                        return Ok(StreamPump::Disconnected);
                    }
                }
                Some(Err(e)) => warn!("peer {}: dropping undecodable frame: {}", self.id, e),
                None => return Ok(StreamPump::Continue),
            }
        }
    }

    pub(crate) fn handle_datagram(self: &Arc<Peer>, body_with_header: &[u8]) {
        match crate::wire::decode_frame(body_with_header, Transport::Datagram) {
            Ok(frame) => self.receive(frame),
            Err(e) => warn!("peer {}: dropping undecodable datagram: {}", self.id, e),
        }
    }

    fn read_one_stream_frame(&self) -> Result<Message, Error> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(result) = self.decoder.lock().unwrap().next_frame() {
                return result;
            }

            let n = {
                let mut sockets = self.sockets.lock().unwrap();
                match sockets.stream.as_mut() {
                    Some(s) => s.read_into(&mut buf)?,
                    None => return Err(Error::PeerClosed),
                }
            };

            if n == 0 {
                return Err(Error::PeerClosed);
            }

            self.decoder.lock().unwrap().feed(&buf[..n]);
        }
    }

    fn write_stream_with_retry(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut sockets = self.sockets.lock().unwrap();
        let stream = sockets.stream.as_mut().ok_or(Error::PeerClosed)?;

        if stream.write_all(bytes).is_ok() {
            return Ok(());
        }

        stream.write_all(bytes)
    }

    fn send_stream(&self, msg: &Message) -> bool {
        if !matches!(*self.status.lock().unwrap(), ConnectStatus::Established) {
            warn!("peer {}: dropped message, not established", self.id);
            return false;
        }

        let frame = msg.encode();
        let first_attempt = {
            let mut sockets = self.sockets.lock().unwrap();
            match sockets.stream.as_mut() {
                Some(s) => s.write_all(&frame),
                None => return false,
            }
        };

        if first_attempt.is_ok() {
            return true;
        }

        if self.reconnect_stream() {
            let mut sockets = self.sockets.lock().unwrap();
            if let Some(s) = sockets.stream.as_mut() {
                if s.write_all(&frame).is_ok() {
                    return true;
                }
            }
        }

        error!("peer {}: write failed twice, tearing down", self.id);
        *self.status.lock().unwrap() = ConnectStatus::Idle;
        self.active.store(false, Ordering::SeqCst);
        false
    }

    fn send_datagram(&self, msg: &Message) -> bool {
        let frame = crate::wire::encode_datagram(msg.type_id(), msg.body(), self.local_user_id);
        let mut sockets = self.sockets.lock().unwrap();
        match sockets.datagram_out.as_mut() {
            Some(s) => match s.write_all(&frame) {
                Ok(()) => true,
                Err(e) => {
                    warn!("peer {}: datagram send failed: {}", self.id, e);
                    false
                }
            },
            None => false,
        }
    }

    fn reconnect_stream(&self) -> bool {
        let addr = SocketAddr::new(self.remote_host, *self.remote_port.lock().unwrap());
        match TcpSocket::connect(addr) {
            Ok(s) => {
                self.sockets.lock().unwrap().stream = Some(s);
                true
            }
            Err(_) => false,
        }
    }

    fn close_sockets(&self) {
        let mut sockets = self.sockets.lock().unwrap();
        sockets.stream = None;
        sockets.datagram_out = None;
    }
}

impl Listener for Peer {
    /// A peer forwards every locally published message of a type it has
    /// subscribed to, except ones it just decoded off the wire itself (that
    /// would re-forward into the mesh and, in a cycle, loop forever).
    fn on_message(&self, msg: &Message) -> bool {
        self.send(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener as StdListener};
    use std::thread;

    fn free_port() -> u16 {
        StdListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap().local_addr().unwrap().port()
    }

    #[test]
    fn handshake_establishes_both_sides() {
        control::register_all();

        let listen_port = free_port();
        let acceptor = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, listen_port)).unwrap();

        let server = thread::spawn(move || {
            let (stream, addr) = acceptor.accept().unwrap();
            stream.set_nonblocking(true).unwrap();
            let mut tcp = TcpSocket::from_accepted(mio::net::TcpStream::from_std(stream));

            let mut buf = [0u8; 4096];
            let mut decoder = FrameDecoder::new();
            let frame = loop {
                if let Some(f) = decoder.next_frame() {
                    break f.unwrap();
                }
                let n = tcp.read_into(&mut buf).unwrap();
                decoder.feed(&buf[..n]);
            };

            let connect = control::Connect::decode(frame.body()).unwrap();
            assert_eq!(9999, connect.listening_port);

            let reply = control::Connect { listening_port: listen_port, user_id: 77 }
                .into_message()
                .encode();
            tcp.write_all(&reply).unwrap();

            addr.ip()
        });

        control::register_all();
        let peer = Peer::dial(1, 55, 9999, Ipv4Addr::LOCALHOST.into(), listen_port).unwrap();

        server.join().unwrap();

        assert_eq!(listen_port, peer.listening_port());
        assert_eq!(77, peer.remote_user_id());
        assert!(matches!(*peer.status.lock().unwrap(), ConnectStatus::Established));
    }
}
