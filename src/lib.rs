// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! A broker-less peer-to-peer message bus.
//!
//! Every participating process is simultaneously client and server: there is
//! no central broker, no directory, no super-node. Processes connect to each
//! other by explicit address, and each connection (a [`Peer`]) carries its
//! own subscription list: a peer only receives messages of a given type from
//! another peer once it has asked that peer to forward them.
//!
//! Locally, typed publish/subscribe fan-out is handled by a [`Router`] per
//! message type. A [`Network`] owns the listening sockets, runs the event
//! loop that demultiplexes bytes from the mesh, and hands decoded messages to
//! the router so that both in-process listeners and subscribed remote peers
//! receive them.

#[macro_use]
extern crate log;

mod control;
mod error;
mod message;
mod peer;
mod router;
mod socket;
mod wire;

pub mod network;

pub use control::{CONNECT, DISCONNECT, INVALID_MESSAGE, NEW_PEER, STANDARD_MESSAGE, SUBSCRIBE};
pub use error::Error;
pub use message::{register, DecoderFn, Message, Payload, Transport};
pub use network::Network;
pub use peer::{ConnectStatus, Peer, PeerId};
pub use router::{Listener, Router};

/// 32-bit identifier chosen by the application to tag its own process.
///
/// Exchanged during the connect handshake so each side can attribute an
/// incoming datagram to the peer that sent it (datagrams carry no connection
/// context of their own).
pub type UserId = u32;
