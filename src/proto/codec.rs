//! Sealed structures: the ticket, the authenticator and the encrypted parts of each
//! reply.
//!
//! Every structure is encoded to a fixed big endian layout, encrypted under a key
//! usage specific to its purpose, and wrapped as `version | tag | len | ciphertext`.
//! Opening a structure either yields exactly the fields that were sealed, or fails.
//! There is no partial parse of anything that did not authenticate.

use binrw::io::Cursor;
use binrw::{binread, binwrite, BinRead, BinReaderExt, BinWrite, Endian};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{error, trace};

use super::keys::{DerivedKey, SessionKey};
use super::time::KerberosTime;
use crate::constants::{
    AES_256_KEY_LEN, KEY_USAGE_AP_REP_PART, KEY_USAGE_AS_REP_PART, KEY_USAGE_AUTHENTICATOR,
    KEY_USAGE_TGS_REP_PART, KEY_USAGE_TICKET, WIRE_VERSION,
};
use crate::error::KrbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StructureTag {
    Ticket = 1,
    Authenticator = 2,
    KdcReplyPart = 3,
    ApReplyPart = 4,
}

#[binwrite]
#[brw(big)]
#[binread]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Data {
    #[br(temp)]
    #[bw(try_calc(u16::try_from(value.len())))]
    value_len: u16,
    #[br(count = value_len)]
    pub(crate) value: Vec<u8>,
}

impl From<&[u8]> for Data {
    fn from(value: &[u8]) -> Self {
        Data {
            value: value.to_vec(),
        }
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data {
            value: value.as_bytes().to_vec(),
        }
    }
}

impl TryFrom<Data> for String {
    type Error = KrbError;

    fn try_from(data: Data) -> Result<Self, Self::Error> {
        String::from_utf8(data.value).map_err(|_| KrbError::InvalidPrincipalName)
    }
}

#[binwrite]
#[brw(big)]
#[binread]
#[derive(Debug)]
struct SealedData {
    version: u8,
    tag: u8,
    #[br(temp)]
    #[bw(try_calc(u16::try_from(ciphertext.len())))]
    ciphertext_len: u16,
    #[br(count = ciphertext_len)]
    ciphertext: Vec<u8>,
}

#[binwrite]
#[brw(big)]
#[binread]
struct TicketData {
    client: Data,
    server: Data,
    session_key: [u8; AES_256_KEY_LEN],
    issued: u64,
    expires: u64,
    nonce: u64,
}

#[binwrite]
#[brw(big)]
#[binread]
struct AuthenticatorData {
    client: Data,
    timestamp: u64,
    nonce: u64,
}

#[binwrite]
#[brw(big)]
#[binread]
struct KdcReplyData {
    session_key: [u8; AES_256_KEY_LEN],
    server: Data,
    address: Data,
    expires: u64,
    nonce: u64,
}

#[binwrite]
#[brw(big)]
#[binread]
struct ApReplyData {
    timestamp: u64,
}

/// The content of a ticket. Only the issuing server and the target server can
/// ever see this, the client relays it as opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketPart {
    pub client: String,
    pub server: String,
    pub session_key: SessionKey,
    pub issued: KerberosTime,
    pub expires: KerberosTime,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatorPart {
    pub client: String,
    pub timestamp: KerberosTime,
    pub nonce: u64,
}

/// What the AS and TGS tell the client about the ticket they just issued: the
/// session key to use with it, who it is for, and where that server lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdcReplyPart {
    pub session_key: SessionKey,
    pub server: String,
    pub address: String,
    pub expires: KerberosTime,
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApReplyPart {
    pub timestamp: KerberosTime,
}

impl From<&TicketPart> for TicketData {
    fn from(value: &TicketPart) -> Self {
        TicketData {
            client: value.client.as_str().into(),
            server: value.server.as_str().into(),
            session_key: *value.session_key.k(),
            issued: value.issued.to_unix_secs(),
            expires: value.expires.to_unix_secs(),
            nonce: value.nonce,
        }
    }
}

impl TryFrom<TicketData> for TicketPart {
    type Error = KrbError;

    fn try_from(value: TicketData) -> Result<Self, Self::Error> {
        Ok(TicketPart {
            client: value.client.try_into()?,
            server: value.server.try_into()?,
            session_key: SessionKey::from_bytes(value.session_key),
            issued: KerberosTime::from_unix_secs(value.issued),
            expires: KerberosTime::from_unix_secs(value.expires),
            nonce: value.nonce,
        })
    }
}

impl From<&AuthenticatorPart> for AuthenticatorData {
    fn from(value: &AuthenticatorPart) -> Self {
        AuthenticatorData {
            client: value.client.as_str().into(),
            timestamp: value.timestamp.to_unix_secs(),
            nonce: value.nonce,
        }
    }
}

impl TryFrom<AuthenticatorData> for AuthenticatorPart {
    type Error = KrbError;

    fn try_from(value: AuthenticatorData) -> Result<Self, Self::Error> {
        Ok(AuthenticatorPart {
            client: value.client.try_into()?,
            timestamp: KerberosTime::from_unix_secs(value.timestamp),
            nonce: value.nonce,
        })
    }
}

impl From<&KdcReplyPart> for KdcReplyData {
    fn from(value: &KdcReplyPart) -> Self {
        KdcReplyData {
            session_key: *value.session_key.k(),
            server: value.server.as_str().into(),
            address: value.address.as_str().into(),
            expires: value.expires.to_unix_secs(),
            nonce: value.nonce,
        }
    }
}

impl TryFrom<KdcReplyData> for KdcReplyPart {
    type Error = KrbError;

    fn try_from(value: KdcReplyData) -> Result<Self, Self::Error> {
        Ok(KdcReplyPart {
            session_key: SessionKey::from_bytes(value.session_key),
            server: value.server.try_into()?,
            address: value.address.try_into()?,
            expires: KerberosTime::from_unix_secs(value.expires),
            nonce: value.nonce,
        })
    }
}

pub(crate) fn write_to_vec<T>(value: &T) -> Result<Vec<u8>, KrbError>
where
    T: for<'a> BinWrite<Args<'a> = ()>,
{
    let mut c = Cursor::new(Vec::new());
    value.write_options(&mut c, Endian::Big, ())?;
    Ok(c.into_inner())
}

/// Decode exactly one `T` from `bytes`. Anything left over is an error, since a
/// well formed peer never sends it.
pub(crate) fn read_from_slice<T>(bytes: &[u8]) -> Result<T, KrbError>
where
    T: for<'a> BinRead<Args<'a> = ()>,
{
    let mut reader = Cursor::new(bytes);
    let value: T = reader.read_type(Endian::Big)?;
    if reader.position() != bytes.len() as u64 {
        trace!(
            consumed = %reader.position(),
            len = %bytes.len(),
            "trailing bytes after structure"
        );
        return Err(KrbError::TrailingData);
    }
    Ok(value)
}

fn seal(tag: StructureTag, ciphertext: Vec<u8>) -> Result<Vec<u8>, KrbError> {
    write_to_vec(&SealedData {
        version: WIRE_VERSION,
        tag: tag.into(),
        ciphertext,
    })
}

fn unseal(expected: StructureTag, bytes: &[u8]) -> Result<Vec<u8>, KrbError> {
    let sealed: SealedData = read_from_slice(bytes)?;

    if sealed.version != WIRE_VERSION {
        error!(version = %sealed.version, "unsupported structure version");
        return Err(KrbError::UnsupportedVersion);
    }

    let tag = StructureTag::try_from(sealed.tag).map_err(|_| {
        error!(tag = %sealed.tag, "unknown structure tag");
        KrbError::UnexpectedStructureTag
    })?;

    if tag != expected {
        error!(?tag, ?expected, "unexpected structure tag");
        return Err(KrbError::UnexpectedStructureTag);
    }

    Ok(sealed.ciphertext)
}

pub fn encrypt_ticket(key: &DerivedKey, ticket: &TicketPart) -> Result<Vec<u8>, KrbError> {
    let plaintext = write_to_vec(&TicketData::from(ticket))?;
    let ciphertext = key.encrypt(&plaintext, KEY_USAGE_TICKET)?;
    seal(StructureTag::Ticket, ciphertext)
}

pub fn decrypt_ticket(key: &DerivedKey, bytes: &[u8]) -> Result<TicketPart, KrbError> {
    let ciphertext = unseal(StructureTag::Ticket, bytes)?;
    let plaintext = key.decrypt(&ciphertext, KEY_USAGE_TICKET)?;
    let data: TicketData = read_from_slice(&plaintext)?;
    data.try_into()
}

pub fn encrypt_authenticator(
    key: &SessionKey,
    authenticator: &AuthenticatorPart,
) -> Result<Vec<u8>, KrbError> {
    let plaintext = write_to_vec(&AuthenticatorData::from(authenticator))?;
    let ciphertext = key.encrypt(&plaintext, KEY_USAGE_AUTHENTICATOR)?;
    seal(StructureTag::Authenticator, ciphertext)
}

pub fn decrypt_authenticator(
    key: &SessionKey,
    bytes: &[u8],
) -> Result<AuthenticatorPart, KrbError> {
    let ciphertext = unseal(StructureTag::Authenticator, bytes)?;
    let plaintext = key.decrypt(&ciphertext, KEY_USAGE_AUTHENTICATOR)?;
    let data: AuthenticatorData = read_from_slice(&plaintext)?;
    data.try_into()
}

/// The AS reply part is sealed under the client's long-term key.
pub fn encrypt_as_reply_part(key: &DerivedKey, part: &KdcReplyPart) -> Result<Vec<u8>, KrbError> {
    let plaintext = write_to_vec(&KdcReplyData::from(part))?;
    let ciphertext = key.encrypt(&plaintext, KEY_USAGE_AS_REP_PART)?;
    seal(StructureTag::KdcReplyPart, ciphertext)
}

pub fn decrypt_as_reply_part(key: &DerivedKey, bytes: &[u8]) -> Result<KdcReplyPart, KrbError> {
    let ciphertext = unseal(StructureTag::KdcReplyPart, bytes)?;
    let plaintext = key.decrypt(&ciphertext, KEY_USAGE_AS_REP_PART)?;
    let data: KdcReplyData = read_from_slice(&plaintext)?;
    data.try_into()
}

/// The TGS reply part is sealed under the session key from the presented TGT.
pub fn encrypt_tgs_reply_part(key: &SessionKey, part: &KdcReplyPart) -> Result<Vec<u8>, KrbError> {
    let plaintext = write_to_vec(&KdcReplyData::from(part))?;
    let ciphertext = key.encrypt(&plaintext, KEY_USAGE_TGS_REP_PART)?;
    seal(StructureTag::KdcReplyPart, ciphertext)
}

pub fn decrypt_tgs_reply_part(key: &SessionKey, bytes: &[u8]) -> Result<KdcReplyPart, KrbError> {
    let ciphertext = unseal(StructureTag::KdcReplyPart, bytes)?;
    let plaintext = key.decrypt(&ciphertext, KEY_USAGE_TGS_REP_PART)?;
    let data: KdcReplyData = read_from_slice(&plaintext)?;
    data.try_into()
}

pub fn encrypt_ap_reply_part(key: &SessionKey, part: &ApReplyPart) -> Result<Vec<u8>, KrbError> {
    let plaintext = write_to_vec(&ApReplyData {
        timestamp: part.timestamp.to_unix_secs(),
    })?;
    let ciphertext = key.encrypt(&plaintext, KEY_USAGE_AP_REP_PART)?;
    seal(StructureTag::ApReplyPart, ciphertext)
}

pub fn decrypt_ap_reply_part(key: &SessionKey, bytes: &[u8]) -> Result<ApReplyPart, KrbError> {
    let ciphertext = unseal(StructureTag::ApReplyPart, bytes)?;
    let plaintext = key.decrypt(&ciphertext, KEY_USAGE_AP_REP_PART)?;
    let data: ApReplyData = read_from_slice(&plaintext)?;
    Ok(ApReplyPart {
        timestamp: KerberosTime::from_unix_secs(data.timestamp),
    })
}
