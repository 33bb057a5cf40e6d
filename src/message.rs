// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::error::Error;

/// Which socket a message travels over, chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Sent/received on the per-peer TCP stream.
    Stream,
    /// Sent/received on the per-peer UDP socket, trailer-tagged with the
    /// sender's user id.
    Datagram,
    /// Never put on the wire. `NewPeer` is the only message of this kind.
    LocalOnly,
}

/// A typed, length-prefixed record flowing through the bus.
///
/// `body` is the still-encoded payload produced by a [`Payload`] impl; the
/// crate never decodes it into the application type itself, it only carries
/// it between the wire, the router and the application's own `Payload::decode`.
#[derive(Debug, Clone)]
pub struct Message {
    type_id: u16,
    body: Vec<u8>,
    transport: Transport,
    sender_peer_id: u32,
    incoming: bool,
}

impl Message {
    /// Builds a message for local publication (not yet attributed to a peer).
    pub fn new(type_id: u16, body: Vec<u8>, transport: Transport) -> Message {
        Message {
            type_id,
            body,
            transport,
            sender_peer_id: 0,
            incoming: false,
        }
    }

    /// Builds a message as the decoder registered for `type_id` is expected
    /// to: same type id, the raw bytes it was handed, `incoming = true`.
    /// Public so application decoders (the closures passed to [`register`])
    /// can construct their return value.
    pub fn from_wire(type_id: u16, body: Vec<u8>, transport: Transport) -> Message {
        Message {
            type_id,
            body,
            transport,
            sender_peer_id: 0,
            incoming: true,
        }
    }

    pub fn type_id(&self) -> u16 {
        self.type_id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_length(&self) -> u16 {
        self.body.len() as u16
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn incoming(&self) -> bool {
        self.incoming
    }

    pub fn sender_peer_id(&self) -> u32 {
        self.sender_peer_id
    }

    pub(crate) fn set_sender_peer_id(&mut self, peer_id: u32) {
        self.sender_peer_id = peer_id;
    }

    /// Encodes the 4-byte header plus body, ready to be written to a stream
    /// or datagram socket.
    pub fn encode(&self) -> Vec<u8> {
        crate::wire::encode_frame(self.type_id, &self.body)
    }
}

/// Something an application registers with the bus: a numeric type id, a
/// transport preference, and a wire encoding.
///
/// Application message types stay plain Rust structs that implement this
/// trait rather than a class hierarchy.
pub trait Payload {
    const TYPE_ID: u16;

    fn transport(&self) -> Transport {
        Transport::Stream
    }

    fn encode_body(&self) -> Vec<u8>;

    fn into_message(self) -> Message
    where
        Self: Sized,
    {
        let transport = self.transport();
        Message::new(Self::TYPE_ID, self.encode_body(), transport)
    }
}

pub type DecoderFn = fn(&[u8]) -> Message;

fn registry() -> &'static Mutex<HashMap<u16, DecoderFn>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u16, DecoderFn>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers a decoder for `type_id`.
///
/// Idempotent: registering an id that is already registered leaves the first
/// decoder in place. Registering ids out of order (e.g. 7 before 5) is fine,
/// the registry is a map, not a dense vector.
pub fn register(type_id: u16, decoder: DecoderFn) {
    let mut map = registry().lock().unwrap();
    map.entry(type_id).or_insert(decoder);
}

/// Looks up the decoder for `type_id` and runs it against `body`, the bytes
/// following the 4-byte frame header.
pub(crate) fn decode_body(type_id: u16, body: &[u8]) -> Result<Message, Error> {
    let map = registry().lock().unwrap();
    match map.get(&type_id) {
        Some(decoder) => Ok(decoder(body)),
        None => Err(Error::UnregisteredType(type_id)),
    }
}

pub(crate) fn is_registered(type_id: u16) -> bool {
    registry().lock().unwrap().contains_key(&type_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_decoder(body: &[u8]) -> Message {
        Message::from_wire(200, body.to_vec(), Transport::Stream)
    }

    #[test]
    fn register_is_idempotent() {
        fn other_decoder(body: &[u8]) -> Message {
            Message::from_wire(201, body.to_vec(), Transport::Stream)
        }

        register(200, echo_decoder);
        register(200, other_decoder);

        let decoded = decode_body(200, b"hi").unwrap();
        assert_eq!(200, decoded.type_id());
    }

    #[test]
    fn unregistered_type_is_an_error() {
        let err = decode_body(9999, b"hi").unwrap_err();
        assert!(matches!(err, Error::UnregisteredType(9999)));
    }
}
