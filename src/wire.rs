// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Frame encoding and the stream decoder driver.
//!
//! Wire format, little-endian:
//!
//! ```text
//! +--------+--------+----------------+
//! |type_id | length | body (length)  |
//! | LE u16 | LE u16 | opaque bytes   |
//! +--------+--------+----------------+
//! ```
//!
//! Frames on the stream transport are concatenated with no delimiter beyond
//! the header; the decoder below drives the accumulation buffer for a single
//! peer's stream socket, pulling out as many complete frames as are
//! currently buffered.

use byteorder::{ByteOrder, LittleEndian};

use crate::message::{self, Message, Transport};
use crate::Error;

pub const HEADER_LEN: usize = 4;

/// The little-endian trailer every peer-to-peer datagram carries: the
/// sender's user id. Peer datagrams never omit it (spec's resolution of an
/// otherwise ambiguous source behavior).
pub const TRAILER_LEN: usize = 4;

pub fn encode_frame(type_id: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    let mut header = [0u8; HEADER_LEN];
    LittleEndian::write_u16(&mut header[0..2], type_id);
    LittleEndian::write_u16(&mut header[2..4], body.len() as u16);
    out.extend_from_slice(&header);
    out.extend_from_slice(body);
    out
}

pub fn encode_datagram(type_id: u16, body: &[u8], sender_user_id: u32) -> Vec<u8> {
    let mut out = encode_frame(type_id, body);
    let mut trailer = [0u8; TRAILER_LEN];
    LittleEndian::write_u32(&mut trailer, sender_user_id);
    out.extend_from_slice(&trailer);
    out
}

/// Decodes a single complete frame (no trailer) into a `Message`, marking it
/// incoming. Used by the datagram path (after the trailer has been split
/// off) and available to tests for round-trip checks.
pub fn decode_frame(bytes: &[u8], transport: Transport) -> Result<Message, Error> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::protocol_violation("frame shorter than header"));
    }

    let type_id = LittleEndian::read_u16(&bytes[0..2]);
    let body_len = LittleEndian::read_u16(&bytes[2..4]) as usize;

    if bytes.len() != HEADER_LEN + body_len {
        return Err(Error::protocol_violation("body length does not match buffered bytes"));
    }

    let mut msg = message::decode_body(type_id, &bytes[HEADER_LEN..])?;
    msg = Message::from_wire(type_id, msg.body().to_vec(), transport);
    Ok(msg)
}

/// Accumulates bytes read off a stream socket and yields complete, decoded
/// frames as they become available. Short reads (mid-frame) simply leave the
/// remainder buffered for the next call.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder { buf: Vec::new() }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pulls the next complete frame out of the buffer, if any. A frame with
    /// an unregistered type id is reported as an error but still consumed
    /// from the buffer so the stream doesn't get stuck.
    pub fn next_frame(&mut self) -> Option<Result<Message, Error>> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }

        let type_id = LittleEndian::read_u16(&self.buf[0..2]);
        let body_len = LittleEndian::read_u16(&self.buf[2..4]) as usize;
        let frame_len = HEADER_LEN + body_len;

        if self.buf.len() < frame_len {
            return None;
        }

        let frame: Vec<u8> = self.buf.drain(0..frame_len).collect();

        let result = if message::is_registered(type_id) {
            message::decode_body(type_id, &frame[HEADER_LEN..])
                .map(|_| Message::from_wire(type_id, frame[HEADER_LEN..].to_vec(), Transport::Stream))
        } else {
            Err(Error::UnregisteredType(type_id))
        };

        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::register;

    fn roundtrip_decoder(body: &[u8]) -> Message {
        Message::from_wire(42, body.to_vec(), Transport::Stream)
    }

    #[test]
    fn frame_round_trip() {
        register(42, roundtrip_decoder);

        let body = vec![1, 2, 3, 4, 5];
        let encoded = encode_frame(42, &body);

        assert_eq!(4 + body.len(), encoded.len());
        assert_eq!(body.len() as u16, LittleEndian::read_u16(&encoded[2..4]));

        let decoded = decode_frame(&encoded, Transport::Stream).unwrap();
        assert_eq!(42, decoded.type_id());
        assert_eq!(&body[..], decoded.body());
    }

    #[test]
    fn decoder_yields_concatenated_frames_one_at_a_time() {
        register(43, roundtrip_decoder);
        let f1 = encode_frame(43, &[1, 2, 3]);
        let f2 = encode_frame(43, &[4, 5]);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&f1);
        decoder.feed(&f2[..2]);

        let first = decoder.next_frame().unwrap().unwrap();
        assert_eq!(&[1, 2, 3], first.body());
        assert!(decoder.next_frame().is_none());

        decoder.feed(&f2[2..]);
        let second = decoder.next_frame().unwrap().unwrap();
        assert_eq!(&[4, 5], second.body());
    }

    #[test]
    fn unregistered_type_is_dropped_but_does_not_stall_the_buffer() {
        let frame = encode_frame(9001, &[9, 9]);
        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame);

        let err = decoder.next_frame().unwrap().unwrap_err();
        assert!(matches!(err, Error::UnregisteredType(9001)));
        assert!(decoder.next_frame().is_none());
    }
}
