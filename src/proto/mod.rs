mod codec;
mod keys;
mod messages;
mod time;

pub use self::codec::{
    decrypt_ap_reply_part, decrypt_as_reply_part, decrypt_authenticator, decrypt_tgs_reply_part,
    decrypt_ticket, encrypt_ap_reply_part, encrypt_as_reply_part, encrypt_authenticator,
    encrypt_tgs_reply_part, encrypt_ticket, ApReplyPart, AuthenticatorPart, KdcReplyPart,
    StructureTag, TicketPart,
};
pub use self::keys::{DerivedKey, SessionKey};
pub use self::messages::{
    ApplicationReply, ApplicationRequest, AuthenticationRequest, KdcReply, KerberosReply,
    KerberosRequest, MessageType, TicketGrantRequest,
};
pub use self::time::{check_ticket_validity, is_within_allowed_skew, KerberosTime, TicketTimeBound};

pub(crate) use self::codec::Data;
