use binrw::{binread, binwrite};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{error, trace};

use super::codec::{read_from_slice, write_to_vec, Data};
use crate::constants::DEFAULT_IO_MAX_SIZE;
use crate::error::KrbError;

/// The first byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    AsReq = 10,
    AsRep = 11,
    TgsReq = 12,
    TgsRep = 13,
    ApReq = 14,
    ApRep = 15,
    Reject = 30,
}

#[binwrite]
#[brw(big)]
#[binread]
enum RequestWire {
    #[brw(magic = 10u8)]
    As { client: Data, nonce: u64 },
    #[brw(magic = 12u8)]
    Tgs {
        service: Data,
        nonce: u64,
        ticket: Data,
        authenticator: Data,
    },
    #[brw(magic = 14u8)]
    Ap {
        action: Data,
        ticket: Data,
        authenticator: Data,
    },
}

#[binwrite]
#[brw(big)]
#[binread]
enum ReplyWire {
    #[brw(magic = 11u8)]
    As { enc_part: Data, ticket: Data },
    #[brw(magic = 13u8)]
    Tgs { enc_part: Data, ticket: Data },
    #[brw(magic = 15u8)]
    Ap { granted: u8, enc_part: Data },
    #[brw(magic = 30u8)]
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationRequest {
    pub client_name: String,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketGrantRequest {
    pub service_name: String,
    pub nonce: u64,
    pub ticket: Vec<u8>,
    pub authenticator: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationRequest {
    pub action: String,
    pub ticket: Vec<u8>,
    pub authenticator: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KerberosRequest {
    AS(AuthenticationRequest),
    TGS(TicketGrantRequest),
    AP(ApplicationRequest),
}

/// The AS and TGS reply shape: a part sealed for the client, and a ticket sealed
/// for the next server that the client relays without being able to read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdcReply {
    pub enc_part: Vec<u8>,
    pub ticket: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationReply {
    pub granted: bool,
    pub enc_part: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KerberosReply {
    AS(KdcReply),
    TGS(KdcReply),
    AP(ApplicationReply),
    /// Sent for every failed request, whatever the reason.
    Reject,
}

fn check_datagram(bytes: &[u8]) -> Result<MessageType, KrbError> {
    if bytes.len() > DEFAULT_IO_MAX_SIZE {
        error!(len = %bytes.len(), "datagram exceeds maximum size");
        return Err(KrbError::MessageTooLarge);
    }

    let Some(first) = bytes.first() else {
        return Err(KrbError::InsufficientData);
    };

    MessageType::try_from(*first).map_err(|_| {
        error!(msg_type = %first, "unknown message type");
        KrbError::InvalidMessageType
    })
}

fn check_size(bytes: Vec<u8>) -> Result<Vec<u8>, KrbError> {
    if bytes.len() > DEFAULT_IO_MAX_SIZE {
        error!(len = %bytes.len(), "refusing to emit oversized datagram");
        Err(KrbError::MessageTooLarge)
    } else {
        Ok(bytes)
    }
}

impl KerberosRequest {
    pub fn message_type(&self) -> MessageType {
        match self {
            KerberosRequest::AS(_) => MessageType::AsReq,
            KerberosRequest::TGS(_) => MessageType::TgsReq,
            KerberosRequest::AP(_) => MessageType::ApReq,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, KrbError> {
        let wire = match self {
            KerberosRequest::AS(req) => RequestWire::As {
                client: req.client_name.as_str().into(),
                nonce: req.nonce,
            },
            KerberosRequest::TGS(req) => RequestWire::Tgs {
                service: req.service_name.as_str().into(),
                nonce: req.nonce,
                ticket: req.ticket.as_slice().into(),
                authenticator: req.authenticator.as_slice().into(),
            },
            KerberosRequest::AP(req) => RequestWire::Ap {
                action: req.action.as_str().into(),
                ticket: req.ticket.as_slice().into(),
                authenticator: req.authenticator.as_slice().into(),
            },
        };
        write_to_vec(&wire).and_then(check_size)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KrbError> {
        let msg_type = check_datagram(bytes)?;
        trace!(?msg_type);

        let wire: RequestWire = match msg_type {
            MessageType::AsReq | MessageType::TgsReq | MessageType::ApReq => {
                read_from_slice(bytes)?
            }
            _ => return Err(KrbError::InvalidMessageType),
        };

        let req = match wire {
            RequestWire::As { client, nonce } => KerberosRequest::AS(AuthenticationRequest {
                client_name: client.try_into()?,
                nonce,
            }),
            RequestWire::Tgs {
                service,
                nonce,
                ticket,
                authenticator,
            } => KerberosRequest::TGS(TicketGrantRequest {
                service_name: service.try_into()?,
                nonce,
                ticket: ticket.value,
                authenticator: authenticator.value,
            }),
            RequestWire::Ap {
                action,
                ticket,
                authenticator,
            } => KerberosRequest::AP(ApplicationRequest {
                action: action.try_into()?,
                ticket: ticket.value,
                authenticator: authenticator.value,
            }),
        };
        Ok(req)
    }
}

impl KerberosReply {
    pub fn message_type(&self) -> MessageType {
        match self {
            KerberosReply::AS(_) => MessageType::AsRep,
            KerberosReply::TGS(_) => MessageType::TgsRep,
            KerberosReply::AP(_) => MessageType::ApRep,
            KerberosReply::Reject => MessageType::Reject,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, KrbError> {
        let wire = match self {
            KerberosReply::AS(rep) => ReplyWire::As {
                enc_part: rep.enc_part.as_slice().into(),
                ticket: rep.ticket.as_slice().into(),
            },
            KerberosReply::TGS(rep) => ReplyWire::Tgs {
                enc_part: rep.enc_part.as_slice().into(),
                ticket: rep.ticket.as_slice().into(),
            },
            KerberosReply::AP(rep) => ReplyWire::Ap {
                granted: u8::from(rep.granted),
                enc_part: rep.enc_part.as_slice().into(),
            },
            KerberosReply::Reject => ReplyWire::Reject,
        };
        write_to_vec(&wire).and_then(check_size)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KrbError> {
        let msg_type = check_datagram(bytes)?;
        trace!(?msg_type);

        let wire: ReplyWire = match msg_type {
            MessageType::AsRep | MessageType::TgsRep | MessageType::ApRep | MessageType::Reject => {
                read_from_slice(bytes)?
            }
            _ => return Err(KrbError::InvalidMessageType),
        };

        let rep = match wire {
            ReplyWire::As { enc_part, ticket } => KerberosReply::AS(KdcReply {
                enc_part: enc_part.value,
                ticket: ticket.value,
            }),
            ReplyWire::Tgs { enc_part, ticket } => KerberosReply::TGS(KdcReply {
                enc_part: enc_part.value,
                ticket: ticket.value,
            }),
            ReplyWire::Ap { granted, enc_part } => {
                let granted = match granted {
                    0 => false,
                    1 => true,
                    _ => return Err(KrbError::InvalidMessageType),
                };
                KerberosReply::AP(ApplicationReply {
                    granted,
                    enc_part: enc_part.value,
                })
            }
            ReplyWire::Reject => KerberosReply::Reject,
        };
        Ok(rep)
    }
}
