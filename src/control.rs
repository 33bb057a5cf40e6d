// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The fixed catalog of control messages the Peer/Network state machine
//! consumes directly, rather than routing to application listeners.

use byteorder::{ByteOrder, LittleEndian};

use crate::message::{register, Message, Payload, Transport};
use crate::UserId;

pub const INVALID_MESSAGE: u16 = 0;
pub const STANDARD_MESSAGE: u16 = 1;
pub const SUBSCRIBE: u16 = 2;
pub const CONNECT: u16 = 3;
pub const DISCONNECT: u16 = 4;
pub const NEW_PEER: u16 = 5;

/// Registers the five control message decoders. Must run before any network
/// I/O; `Network::new` calls this once.
pub(crate) fn register_all() {
    register(INVALID_MESSAGE, |body| Message::from_wire(INVALID_MESSAGE, body.to_vec(), Transport::Stream));
    register(SUBSCRIBE, |body| Message::from_wire(SUBSCRIBE, body.to_vec(), Transport::Stream));
    register(CONNECT, |body| Message::from_wire(CONNECT, body.to_vec(), Transport::Stream));
    register(DISCONNECT, |body| Message::from_wire(DISCONNECT, body.to_vec(), Transport::Stream));
    register(NEW_PEER, |body| Message::from_wire(NEW_PEER, body.to_vec(), Transport::LocalOnly));
}

pub struct Subscribe {
    pub type_id: u16,
}

impl Payload for Subscribe {
    const TYPE_ID: u16 = SUBSCRIBE;

    fn transport(&self) -> Transport {
        Transport::Stream
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut body = vec![0u8; 2];
        LittleEndian::write_u16(&mut body, self.type_id);
        body
    }
}

impl Subscribe {
    pub fn decode(body: &[u8]) -> Option<Subscribe> {
        if body.len() < 2 {
            return None;
        }
        Some(Subscribe { type_id: LittleEndian::read_u16(&body[0..2]) })
    }
}

pub struct Connect {
    pub listening_port: u16,
    pub user_id: UserId,
}

impl Payload for Connect {
    const TYPE_ID: u16 = CONNECT;

    fn transport(&self) -> Transport {
        Transport::Stream
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut body = vec![0u8; 6];
        LittleEndian::write_u16(&mut body[0..2], self.listening_port);
        LittleEndian::write_u32(&mut body[2..6], self.user_id);
        body
    }
}

impl Connect {
    pub fn decode(body: &[u8]) -> Option<Connect> {
        if body.len() < 6 {
            return None;
        }
        Some(Connect {
            listening_port: LittleEndian::read_u16(&body[0..2]),
            user_id: LittleEndian::read_u32(&body[2..6]),
        })
    }
}

pub struct Disconnect;

impl Payload for Disconnect {
    const TYPE_ID: u16 = DISCONNECT;

    fn transport(&self) -> Transport {
        Transport::Stream
    }

    fn encode_body(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Local-only event published on `Router::broker_for(NEW_PEER)` whenever a
/// peer (inbound or outbound) finishes its handshake. The body is the new
/// peer's id so a listener can look it up via `Network::peer_by_id`.
pub struct NewPeer {
    pub peer_id: u32,
}

impl Payload for NewPeer {
    const TYPE_ID: u16 = NEW_PEER;

    fn transport(&self) -> Transport {
        Transport::LocalOnly
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut body = vec![0u8; 4];
        LittleEndian::write_u32(&mut body, self.peer_id);
        body
    }
}

impl NewPeer {
    pub fn decode(body: &[u8]) -> Option<NewPeer> {
        if body.len() < 4 {
            return None;
        }
        Some(NewPeer { peer_id: LittleEndian::read_u32(&body[0..4]) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_round_trips() {
        let msg = Connect { listening_port: 5001, user_id: 42 }.into_message();
        let decoded = Connect::decode(msg.body()).unwrap();
        assert_eq!(5001, decoded.listening_port);
        assert_eq!(42, decoded.user_id);
    }

    #[test]
    fn subscribe_round_trips() {
        let msg = Subscribe { type_id: 6 }.into_message();
        let decoded = Subscribe::decode(msg.body()).unwrap();
        assert_eq!(6, decoded.type_id);
    }
}
