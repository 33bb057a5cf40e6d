// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::fmt;
use std::io;

/// Errors surfaced by the socket and network layers.
///
/// Per the library's error handling policy, most public operations (send,
/// subscribe, add_peer) do not propagate this type: they return a bool or
/// `Option` and log the `Error` that caused the failure. `Error` is exposed
/// for the few constructors that can fail outright (binding the listening
/// sockets) and for callers that want the detail behind a log line.
#[derive(Debug)]
pub enum Error {
    BindFailed(io::Error),
    ConnectFailed(io::Error),
    ReadFailed(io::Error),
    WriteFailed(io::Error),
    PeerClosed,
    ProtocolViolation(&'static str),
    UnregisteredType(u16),
}

impl Error {
    pub(crate) fn protocol_violation(msg: &'static str) -> Error {
        Error::ProtocolViolation(msg)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::BindFailed(ref e) => write!(f, "failed to bind socket: {}", e),
            Error::ConnectFailed(ref e) => write!(f, "failed to connect socket: {}", e),
            Error::ReadFailed(ref e) => write!(f, "failed to read from socket: {}", e),
            Error::WriteFailed(ref e) => write!(f, "failed to write to socket: {}", e),
            Error::PeerClosed => write!(f, "peer closed the connection"),
            Error::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Error::UnregisteredType(id) => write!(f, "no decoder for type {}", id),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::BindFailed(ref e)
            | Error::ConnectFailed(ref e)
            | Error::ReadFailed(ref e)
            | Error::WriteFailed(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::ReadFailed(e)
    }
}
