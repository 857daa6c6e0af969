// #![deny(warnings)]

#![warn(unused_extern_crates)]
// Enable some groups of clippy lints.
#![deny(clippy::suspicious)]
#![deny(clippy::perf)]
// Specific lints to enforce.
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::disallowed_types)]
#![deny(clippy::manual_let_else)]
#![allow(clippy::unreachable)]

pub mod client;
pub mod config;
pub(crate) mod constants;
pub(crate) mod crypto;
pub mod error;
pub mod keystore;
pub mod keytab;
pub mod proto;
pub mod replay;
pub mod server;

pub use crate::client::{AccessOutcome, KerberosClient};
pub use crate::error::{ErrorKind, KrbError};

use bytes::BytesMut;
use proto::{KerberosReply, KerberosRequest};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::DEFAULT_IO_MAX_SIZE;

/// Server side of a datagram: requests in, replies out.
pub struct KdcUdpCodec {
    max_size: usize,
}

/// Client side of a datagram: requests out, replies in.
pub struct KerberosUdpCodec {
    max_size: usize,
}

impl Default for KdcUdpCodec {
    fn default() -> Self {
        KdcUdpCodec {
            max_size: DEFAULT_IO_MAX_SIZE,
        }
    }
}

impl Default for KerberosUdpCodec {
    fn default() -> Self {
        KerberosUdpCodec {
            max_size: DEFAULT_IO_MAX_SIZE,
        }
    }
}

// One datagram is exactly one message. The whole buffer is taken before decoding
// so that a bad datagram is reported once and then gone, never decoded again.
fn take_datagram(buf: &mut BytesMut, max_size: usize) -> Result<Option<BytesMut>, io::Error> {
    if buf.is_empty() {
        return Ok(None);
    }

    let datagram = buf.split();

    if datagram.len() > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            KrbError::MessageTooLarge,
        ));
    }

    Ok(Some(datagram))
}

impl Decoder for KdcUdpCodec {
    type Item = KerberosRequest;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(datagram) = take_datagram(buf, self.max_size)? else {
            return Ok(None);
        };

        KerberosRequest::from_bytes(&datagram)
            .map(Some)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

impl Encoder<KerberosReply> for KdcUdpCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: KerberosReply, buf: &mut BytesMut) -> io::Result<()> {
        let bytes = msg
            .to_bytes()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        buf.clear();
        buf.extend_from_slice(&bytes);
        Ok(())
    }
}

impl Decoder for KerberosUdpCodec {
    type Item = KerberosReply;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(datagram) = take_datagram(buf, self.max_size)? else {
            return Ok(None);
        };

        KerberosReply::from_bytes(&datagram)
            .map(Some)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

impl Encoder<KerberosRequest> for KerberosUdpCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: KerberosRequest, buf: &mut BytesMut) -> io::Result<()> {
        let bytes = msg
            .to_bytes()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        buf.clear();
        buf.extend_from_slice(&bytes);
        Ok(())
    }
}
