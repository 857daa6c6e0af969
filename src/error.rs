use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KrbError {
    // =========================================================================================
    // IMPORTANT: Don't add variables to variants in this enum - it's a potential security risk
    // as you can leak internal state in an error, and these errors end up in logs and in
    // what the client orchestrator reports to its caller.
    //
    // If you want to debug the error, then use the error! macro at the error raise site to
    // report relevant information.
    //
    // The variant alone should already say a lot about the cause. Use `kind()` when you only
    // care about the coarse category.
    // =========================================================================================
    InvalidHmacSha1Key,
    MessageAuthenticationFailed,
    MessageEmpty,
    InsufficientData,
    PlaintextEmpty,
    CtsCiphertextInvalid,
    InsecurePassphrase,
    InvalidEncryptionKey,

    UnsupportedVersion,
    UnexpectedStructureTag,
    TrailingData,
    InvalidPrincipalName,
    InvalidMessageType,
    MessageTooLarge,
    BinRWError,

    UnknownPrincipal,
    TicketExpired,
    TicketWrongServer,
    TicketNeverValid,
    AuthenticatorClientMismatch,
    ClockSkew,
    ReplayDetected,
    UnknownServiceAddress,

    ReplyNonceMismatch,
    ReplyServerMismatch,
    InvalidAddress,
    UpstreamUnavailable,
    RequestRejected,
    MutualAuthFailed,

    KeytabFileError,
    ConfigInvalid,
    IoError,

    /// No really, do you have a time machine? How did you go back to before 1970?
    DoYouHaveATimeMachine,
}

/// The coarse categories a caller acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnknownPrincipal,
    DecodeError,
    TicketExpired,
    ClockSkew,
    ReplayDetected,
    InvalidRequest,
    UpstreamUnavailable,
    RequestRejected,
    MutualAuthFailed,
    Internal,
}

impl KrbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KrbError::InvalidHmacSha1Key
            | KrbError::MessageAuthenticationFailed
            | KrbError::MessageEmpty
            | KrbError::InsufficientData
            | KrbError::CtsCiphertextInvalid
            | KrbError::UnsupportedVersion
            | KrbError::UnexpectedStructureTag
            | KrbError::TrailingData
            | KrbError::InvalidPrincipalName
            | KrbError::InvalidMessageType
            | KrbError::MessageTooLarge
            | KrbError::BinRWError => ErrorKind::DecodeError,

            KrbError::UnknownPrincipal | KrbError::UnknownServiceAddress => {
                ErrorKind::UnknownPrincipal
            }
            KrbError::TicketExpired | KrbError::TicketNeverValid => ErrorKind::TicketExpired,
            KrbError::ClockSkew => ErrorKind::ClockSkew,
            KrbError::ReplayDetected => ErrorKind::ReplayDetected,

            KrbError::TicketWrongServer
            | KrbError::AuthenticatorClientMismatch
            | KrbError::ReplyNonceMismatch
            | KrbError::ReplyServerMismatch
            | KrbError::InvalidAddress => ErrorKind::InvalidRequest,

            KrbError::UpstreamUnavailable => ErrorKind::UpstreamUnavailable,
            KrbError::RequestRejected => ErrorKind::RequestRejected,
            KrbError::MutualAuthFailed => ErrorKind::MutualAuthFailed,

            KrbError::PlaintextEmpty
            | KrbError::InsecurePassphrase
            | KrbError::InvalidEncryptionKey
            | KrbError::KeytabFileError
            | KrbError::ConfigInvalid
            | KrbError::IoError
            | KrbError::DoYouHaveATimeMachine => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for KrbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:?})", self, self.kind())
    }
}

impl std::error::Error for KrbError {}

impl From<binrw::Error> for KrbError {
    fn from(value: binrw::Error) -> Self {
        tracing::trace!(?value, "binrw");
        KrbError::BinRWError
    }
}

impl From<std::io::Error> for KrbError {
    fn from(value: std::io::Error) -> Self {
        // The udp codecs carry our own errors inside io::Error.
        if value
            .get_ref()
            .is_some_and(|inner| inner.downcast_ref::<KrbError>().is_some())
        {
            if let Some(inner) = value
                .into_inner()
                .and_then(|inner| inner.downcast::<KrbError>().ok())
            {
                return *inner;
            }
            return KrbError::IoError;
        }
        tracing::debug!(?value, "io");
        KrbError::IoError
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, KrbError};
    use std::io;

    #[test]
    fn test_io_error_unwraps_codec_error() {
        let wrapped = io::Error::new(io::ErrorKind::InvalidData, KrbError::TrailingData);
        assert_eq!(KrbError::from(wrapped), KrbError::TrailingData);

        let plain = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(KrbError::from(plain), KrbError::IoError);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            KrbError::MessageAuthenticationFailed.kind(),
            ErrorKind::DecodeError
        );
        assert_eq!(KrbError::TicketExpired.kind(), ErrorKind::TicketExpired);
        assert_eq!(KrbError::ReplayDetected.kind(), ErrorKind::ReplayDetected);
        assert_eq!(KrbError::UnknownPrincipal.kind(), ErrorKind::UnknownPrincipal);
    }
}
