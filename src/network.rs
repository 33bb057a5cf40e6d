// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Owns the listening sockets and runs the event loop that demultiplexes the
//! mesh into peers.
//!
//! Each iteration rebuilds the readiness set from scratch: the listening TCP
//! and UDP sockets, every unattached accepted stream, and every established
//! peer's stream. A long-lived registration set can't be kept safely here:
//! `Peer::reconnect_stream` can swap in a brand new socket from whichever
//! thread calls `send`, which would leave a stale token registered against a
//! closed fd until the next deliberate re-registration. Building a fresh
//! `Poll` every pass keeps the registered set always in sync with the
//! sockets actually in use.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use mio::{Events, Interest, Poll, Token};

use crate::control;
use crate::error::Error;
use crate::message::Payload;
use crate::peer::{Peer, PeerId, StreamPump};
use crate::router;
use crate::socket::{Acceptor, DatagramSocket, StreamSocket, TcpSocket, UdpSocket};
use crate::wire::{self, FrameDecoder};
use crate::UserId;

const TOKEN_LISTEN_TCP: Token = Token(0);
const TOKEN_LISTEN_UDP: Token = Token(1);
const UNATTACHED_TOKEN_BASE: usize = 1_000;
const PEER_TOKEN_BASE: usize = 1_000_000;

const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const DATAGRAM_BUFFER_LEN: usize = 65536;

struct UnattachedSocket {
    socket: TcpSocket,
    remote_ip: IpAddr,
    decoder: FrameDecoder,
}

struct State {
    user_id: UserId,
    listening_port: u16,
    acceptor: Mutex<Acceptor>,
    datagram_socket: Mutex<UdpSocket>,
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
    unattached: Mutex<HashMap<u32, UnattachedSocket>>,
    next_peer_id: AtomicU32,
    next_unattached_id: AtomicU32,
    shutdown: AtomicBool,
}

/// The local participation in the mesh: one listening TCP port, one
/// listening UDP port (same number), and a background thread that
/// multiplexes both into the router.
pub struct Network {
    state: Arc<State>,
    event_loop: Option<thread::JoinHandle<()>>,
}

impl Network {
    /// Binds both listen sockets on `listening_port` and starts the event
    /// loop thread. `user_id` is exchanged with every peer during its
    /// connect handshake.
    pub fn new(listening_port: u16, user_id: UserId) -> Result<Network, Error> {
        mask_sigpipe();
        control::register_all();
        router::broker_for(control::DISCONNECT).enable_synchronous();

        let acceptor = Acceptor::bind(listening_port)?;
        let datagram_socket = UdpSocket::bind(listening_port)?;

        let state = Arc::new(State {
            user_id,
            listening_port,
            acceptor: Mutex::new(acceptor),
            datagram_socket: Mutex::new(datagram_socket),
            peers: Mutex::new(HashMap::new()),
            unattached: Mutex::new(HashMap::new()),
            next_peer_id: AtomicU32::new(1),
            next_unattached_id: AtomicU32::new(1),
            shutdown: AtomicBool::new(false),
        });

        let loop_state = state.clone();
        let event_loop = thread::spawn(move || run_event_loop(loop_state));

        info!("network listening on port {} (user_id {})", listening_port, user_id);

        Ok(Network { state, event_loop: Some(event_loop) })
    }

    pub fn listening_port(&self) -> u16 {
        self.state.listening_port
    }

    pub fn user_id(&self) -> UserId {
        self.state.user_id
    }

    /// Dials `(host, port)`, blocking until the handshake completes or
    /// fails. On success the new peer is in the peer map and `NewPeer` has
    /// already been published.
    pub fn add_peer(&self, host: IpAddr, port: u16) -> Option<Arc<Peer>> {
        let id = self.state.next_peer_id.fetch_add(1, Ordering::SeqCst);

        match Peer::dial(id, self.state.user_id, self.state.listening_port, host, port) {
            Ok(peer) => {
                self.state.peers.lock().unwrap().insert(id, peer.clone());
                publish_new_peer(id);
                debug!("peer {} established to {}:{}", id, host, port);
                Some(peer)
            }
            Err(e) => {
                warn!("add_peer to {}:{} failed: {}", host, port, e);
                None
            }
        }
    }

    pub fn remove_peer(&self, peer_id: PeerId) {
        let peer = self.state.peers.lock().unwrap().remove(&peer_id);
        if let Some(peer) = peer {
            peer.initiate_disconnect();
        }
    }

    /// Disconnects every current peer. Also available as [`Network::disconnect`].
    pub fn disconnect_all(&self) {
        let peers: Vec<Arc<Peer>> = self.state.peers.lock().unwrap().drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.initiate_disconnect();
        }
    }

    pub fn disconnect(&self) {
        self.disconnect_all();
    }

    pub fn peer_by_id(&self, peer_id: PeerId) -> Option<Arc<Peer>> {
        self.state.peers.lock().unwrap().get(&peer_id).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.state.peers.lock().unwrap().values().cloned().collect()
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.event_loop.take() {
            let _ = handle.join();
        }
        self.disconnect_all();
    }
}

fn publish_new_peer(peer_id: PeerId) {
    let msg = control::NewPeer { peer_id }.into_message();
    router::broker_for(control::NEW_PEER).publish(msg);
}

#[cfg(unix)]
fn mask_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn mask_sigpipe() {}

fn run_event_loop(state: Arc<State>) {
    let mut events = Events::with_capacity(256);
    let mut datagram_buf = [0u8; DATAGRAM_BUFFER_LEN];

    while !state.shutdown.load(Ordering::SeqCst) {
        let peer_ids: Vec<PeerId> = {
            let mut peers = state.peers.lock().unwrap();
            peers.retain(|_, p| p.is_active());
            peers.keys().cloned().collect()
        };

        let unattached_ids: Vec<u32> = state.unattached.lock().unwrap().keys().cloned().collect();

        let poll = match Poll::new() {
            Ok(p) => p,
            Err(e) => {
                error!("failed to create a poll instance, stopping the event loop: {}", e);
                return;
            }
        };

        if let Err(e) =
            poll.registry().register(state.acceptor.lock().unwrap().source(), TOKEN_LISTEN_TCP, Interest::READABLE)
        {
            error!("failed to register the listening tcp socket: {}", e);
            return;
        }

        if let Err(e) = poll.registry().register(
            state.datagram_socket.lock().unwrap().source(),
            TOKEN_LISTEN_UDP,
            Interest::READABLE,
        ) {
            error!("failed to register the listening udp socket: {}", e);
            return;
        }

        {
            let mut unattached = state.unattached.lock().unwrap();
            for (i, id) in unattached_ids.iter().enumerate() {
                if let Some(entry) = unattached.get_mut(id) {
                    let _ = poll.registry().register(
                        entry.socket.source(),
                        Token(UNATTACHED_TOKEN_BASE + i),
                        Interest::READABLE,
                    );
                }
            }
        }

        {
            let peers = state.peers.lock().unwrap();
            for (i, id) in peer_ids.iter().enumerate() {
                if let Some(peer) = peers.get(id) {
                    peer.register_readable(poll.registry(), Token(PEER_TOKEN_BASE + i));
                }
            }
        }

        match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("poll failed, stopping the event loop: {}", e);
                return;
            }
        }

        for event in events.iter() {
            let token = event.token();

            if token == TOKEN_LISTEN_TCP {
                accept_new_connection(&state);
            } else if token == TOKEN_LISTEN_UDP {
                handle_datagram(&state, &mut datagram_buf);
            } else if token.0 >= PEER_TOKEN_BASE {
                if let Some(id) = peer_ids.get(token.0 - PEER_TOKEN_BASE) {
                    handle_peer_readable(&state, *id);
                }
            } else if token.0 >= UNATTACHED_TOKEN_BASE {
                if let Some(id) = unattached_ids.get(token.0 - UNATTACHED_TOKEN_BASE) {
                    handle_unattached_readable(&state, *id);
                }
            }
        }
    }
}

fn accept_new_connection(state: &Arc<State>) {
    match state.acceptor.lock().unwrap().accept() {
        Ok((socket, addr)) => {
            let id = state.next_unattached_id.fetch_add(1, Ordering::SeqCst);
            state
                .unattached
                .lock()
                .unwrap()
                .insert(id, UnattachedSocket { socket, remote_ip: addr.ip(), decoder: FrameDecoder::new() });
            debug!("accepted a connection from {}, awaiting Connect", addr);
        }
        Err(e) => warn!("accept failed: {}", e),
    }
}

fn handle_datagram(state: &Arc<State>, buf: &mut [u8]) {
    let (n, _from) = match state.datagram_socket.lock().unwrap().recv_from(buf) {
        Ok(r) => r,
        Err(e) => {
            warn!("datagram read failed: {}", e);
            return;
        }
    };

    if n < wire::TRAILER_LEN {
        warn!("dropping a datagram shorter than the sender trailer");
        return;
    }

    let frame_len = n - wire::TRAILER_LEN;
    let sender_user_id = LittleEndian::read_u32(&buf[frame_len..n]);

    let peer = state.peers.lock().unwrap().values().find(|p| p.remote_user_id() == sender_user_id).cloned();

    match peer {
        Some(peer) => peer.handle_datagram(&buf[..frame_len]),
        None => warn!("dropping a datagram from unrecognized user_id {}", sender_user_id),
    }
}

fn handle_peer_readable(state: &Arc<State>, peer_id: PeerId) {
    let peer = match state.peers.lock().unwrap().get(&peer_id).cloned() {
        Some(p) => p,
        None => return,
    };

    match peer.on_stream_readable() {
        Ok(StreamPump::Continue) => {}
        Ok(StreamPump::Disconnected) => {
            state.peers.lock().unwrap().remove(&peer_id);
        }
        Err(e) => {
            warn!("peer {}: stream error, tearing down: {}", peer_id, e);
            peer.force_deactivate();
            state.peers.lock().unwrap().remove(&peer_id);
        }
    }
}

fn handle_unattached_readable(state: &Arc<State>, id: u32) {
    let mut buf = [0u8; 4096];

    let read = {
        let mut unattached = state.unattached.lock().unwrap();
        match unattached.get_mut(&id) {
            Some(entry) => entry.socket.read_into(&mut buf),
            None => return,
        }
    };

    let n = match read {
        Ok(0) | Err(_) => {
            state.unattached.lock().unwrap().remove(&id);
            return;
        }
        Ok(n) => n,
    };

    let decoded = {
        let mut unattached = state.unattached.lock().unwrap();
        match unattached.get_mut(&id) {
            Some(entry) => {
                entry.decoder.feed(&buf[..n]);
                entry.decoder.next_frame()
            }
            None => return,
        }
    };

    if let Some(frame_result) = decoded {
        handle_unattached_frame(state, id, frame_result);
    }
}

fn handle_unattached_frame(state: &Arc<State>, id: u32, frame: Result<crate::Message, Error>) {
    let frame = match frame {
        Ok(f) => f,
        Err(e) => {
            warn!("undecodable frame on an unattached socket: {}", e);
            state.unattached.lock().unwrap().remove(&id);
            return;
        }
    };

    if frame.type_id() != control::CONNECT {
        warn!("first frame on an accepted socket was not Connect, dropping it");
        state.unattached.lock().unwrap().remove(&id);
        return;
    }

    let connect = match control::Connect::decode(frame.body()) {
        Some(c) => c,
        None => {
            warn!("malformed Connect body on an unattached socket");
            state.unattached.lock().unwrap().remove(&id);
            return;
        }
    };

    let entry = match state.unattached.lock().unwrap().remove(&id) {
        Some(e) => e,
        None => return,
    };

    let peer_id = state.next_peer_id.fetch_add(1, Ordering::SeqCst);

    match Peer::from_accepted(peer_id, state.user_id, state.listening_port, entry.socket, entry.remote_ip, connect) {
        Ok(peer) => {
            state.peers.lock().unwrap().insert(peer_id, peer);
            publish_new_peer(peer_id);
            debug!("peer {} established from {}", peer_id, entry.remote_ip);
        }
        Err(e) => warn!("inbound handshake from {} failed: {}", entry.remote_ip, e),
    }
}
