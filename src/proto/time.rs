use crate::error::KrbError;
use std::cmp;
use std::fmt;
use std::time::{Duration, SystemTime};

use tracing::{error, trace};

/// Whole seconds since the unix epoch. This is the only time representation that
/// goes on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KerberosTime(u64);

impl KerberosTime {
    pub const fn from_unix_secs(secs: u64) -> Self {
        KerberosTime(secs)
    }

    pub fn now() -> Result<Self, KrbError> {
        Self::try_from(SystemTime::now())
    }

    pub fn to_unix_secs(self) -> u64 {
        self.0
    }

    pub fn to_system_time(self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(self.0)
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        KerberosTime(self.0.saturating_add(duration.as_secs()))
    }

    pub fn saturating_sub(self, duration: Duration) -> Self {
        KerberosTime(self.0.saturating_sub(duration.as_secs()))
    }

    /// The mutual authentication reply proves key possession by returning the
    /// client's timestamp incremented by one.
    pub fn next(self) -> Self {
        KerberosTime(self.0.wrapping_add(1))
    }
}

impl TryFrom<SystemTime> for KerberosTime {
    type Error = KrbError;

    fn try_from(value: SystemTime) -> Result<Self, Self::Error> {
        value
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| KerberosTime(d.as_secs()))
            .map_err(|_| KrbError::DoYouHaveATimeMachine)
    }
}

impl fmt::Debug for KerberosTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KerberosTime({})", self.0)
    }
}

impl fmt::Display for KerberosTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub fn is_within_allowed_skew(
    reference_time: KerberosTime,
    requested_time: KerberosTime,
    maximum_clock_skew: Duration,
) -> bool {
    let diff = reference_time.0.abs_diff(requested_time.0);
    diff <= maximum_clock_skew.as_secs()
}

/// A ticket is honoured from (issued - skew) until its expiry. Past expiry it is
/// always rejected, no matter how well it decrypted.
pub fn check_ticket_validity(
    current_time: KerberosTime,
    issued: KerberosTime,
    expires: KerberosTime,
    maximum_clock_skew: Duration,
) -> Result<(), KrbError> {
    if expires <= issued {
        error!(?issued, ?expires, "ticket expiry precedes issue time");
        return Err(KrbError::TicketNeverValid);
    }

    if expires < current_time {
        trace!(?expires, ?current_time, "ticket expired");
        return Err(KrbError::TicketExpired);
    }

    if issued.saturating_sub(maximum_clock_skew) > current_time {
        error!(?issued, ?current_time, "ticket issued in the future");
        return Err(KrbError::TicketNeverValid);
    }

    Ok(())
}

/// The issue and expiry time a server will write into a new ticket.
#[derive(Debug, Clone, Copy)]
pub struct TicketTimeBound {
    issued: KerberosTime,
    expires: KerberosTime,
}

impl TicketTimeBound {
    pub fn issued(&self) -> KerberosTime {
        self.issued
    }

    pub fn expires(&self) -> KerberosTime {
        self.expires
    }

    /// Tickets run from the current time for `lifetime`, but never past the
    /// expiry of the ticket they were derived from.
    pub fn new(
        current_time: KerberosTime,
        lifetime: Duration,
        parent_expires: Option<KerberosTime>,
    ) -> Result<Self, KrbError> {
        let issued = current_time;
        let mut expires = issued.saturating_add(lifetime);

        if let Some(parent_expires) = parent_expires {
            expires = cmp::min(expires, parent_expires);
        }

        if expires <= issued {
            return Err(KrbError::TicketNeverValid);
        }

        Ok(TicketTimeBound { issued, expires })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SKEW: Duration = Duration::from_secs(120);

    #[test]
    fn test_kerberos_time_from_system_time() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let kt = KerberosTime::try_from(t).unwrap();
        assert_eq!(kt.to_unix_secs(), 1_700_000_000);
        assert_eq!(kt.to_system_time(), t);

        let before_epoch = SystemTime::UNIX_EPOCH - Duration::from_secs(1);
        assert!(matches!(
            KerberosTime::try_from(before_epoch),
            Err(KrbError::DoYouHaveATimeMachine)
        ));
    }

    #[test]
    fn test_skew_window_is_inclusive() {
        let now = KerberosTime::from_unix_secs(10_000);
        assert!(is_within_allowed_skew(now, now, SKEW));
        assert!(is_within_allowed_skew(now, now.saturating_add(SKEW), SKEW));
        assert!(is_within_allowed_skew(now, now.saturating_sub(SKEW), SKEW));
        assert!(!is_within_allowed_skew(
            now,
            KerberosTime::from_unix_secs(10_121),
            SKEW
        ));
        assert!(!is_within_allowed_skew(
            now,
            KerberosTime::from_unix_secs(9_879),
            SKEW
        ));
    }

    #[test]
    fn test_ticket_validity() {
        let issued = KerberosTime::from_unix_secs(10_000);
        let expires = KerberosTime::from_unix_secs(10_900);

        assert!(check_ticket_validity(issued, issued, expires, SKEW).is_ok());
        assert!(check_ticket_validity(expires, issued, expires, SKEW).is_ok());

        assert!(matches!(
            check_ticket_validity(expires.saturating_add(Duration::from_secs(1)), issued, expires, SKEW),
            Err(KrbError::TicketExpired)
        ));

        // Postdated beyond what skew explains.
        assert!(matches!(
            check_ticket_validity(
                issued.saturating_sub(Duration::from_secs(500)),
                issued,
                expires,
                SKEW
            ),
            Err(KrbError::TicketNeverValid)
        ));

        assert!(matches!(
            check_ticket_validity(issued, expires, issued, SKEW),
            Err(KrbError::TicketNeverValid)
        ));
    }

    #[test]
    fn test_ticket_time_bound_capped_by_parent() {
        let now = KerberosTime::from_unix_secs(10_000);

        let tb = TicketTimeBound::new(now, Duration::from_secs(3600), None).unwrap();
        assert_eq!(tb.issued(), now);
        assert_eq!(tb.expires().to_unix_secs(), 13_600);

        let parent = KerberosTime::from_unix_secs(10_900);
        let tb = TicketTimeBound::new(now, Duration::from_secs(3600), Some(parent)).unwrap();
        assert_eq!(tb.expires(), parent);

        assert!(matches!(
            TicketTimeBound::new(now, Duration::from_secs(3600), Some(now)),
            Err(KrbError::TicketNeverValid)
        ));
        assert!(matches!(
            TicketTimeBound::new(now, Duration::ZERO, None),
            Err(KrbError::TicketNeverValid)
        ));
    }
}
