use std::time::Duration;

pub const AES_256_KEY_LEN: usize = 32;
pub const AES_BLOCK_SIZE: usize = 16;
pub const SHA1_HMAC_LEN: usize = 12;

pub const IV_ZERO: [u8; AES_BLOCK_SIZE] = [0u8; AES_BLOCK_SIZE];

/// The RFC3962 default. Only used to verify the published test vectors.
#[cfg(test)]
pub const RFC_PBKDF2_SHA1_ITER: u32 = 0x1000;
pub const PBKDF2_SHA1_ITER: u32 = 0x10000;
pub const PBKDF2_SHA1_ITER_MINIMUM: u32 = 0x8000;

pub const MINIMUM_PASSPHRASE_LEN: usize = 16;

/// Version byte prefixed to every sealed structure.
pub const WIRE_VERSION: u8 = 1;

/// One datagram is one message. Nothing we emit is anywhere near this.
pub const DEFAULT_IO_MAX_SIZE: usize = 4096;

// Key usage numbers, following rfc4120 section 7.5.1 where a matching usage exists.
pub const KEY_USAGE_TICKET: u32 = 2;
pub const KEY_USAGE_AS_REP_PART: u32 = 3;
pub const KEY_USAGE_AUTHENTICATOR: u32 = 7;
pub const KEY_USAGE_TGS_REP_PART: u32 = 8;
pub const KEY_USAGE_AP_REP_PART: u32 = 12;

pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(120);
pub const DEFAULT_TICKET_GRANTING_TICKET_LIFETIME: Duration = Duration::from_secs(900);
pub const DEFAULT_SERVICE_TICKET_LIFETIME: Duration = Duration::from_secs(3600);
pub const DEFAULT_HOP_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_TICKET_GRANTING_PRINCIPAL: &str = "krbtgt";

