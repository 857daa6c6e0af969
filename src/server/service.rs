use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

use tracing::{error, info, instrument, trace};

use super::{KerberosService, TaskName};
use crate::error::KrbError;
use crate::proto::{
    check_ticket_validity, decrypt_authenticator, decrypt_ticket, encrypt_ap_reply_part,
    ApReplyPart, ApplicationReply, ApplicationRequest, DerivedKey, KerberosReply,
    KerberosRequest, KerberosTime,
};
use crate::replay::ReplayGuard;

/// Decides what an authenticated client may do. Only consulted once the ticket and
/// authenticator have both validated.
pub trait AccessPolicy: Send + Sync {
    fn is_permitted(&self, client: &str, action: &str) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn is_permitted(&self, _client: &str, _action: &str) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone)]
pub struct AllowList {
    clients: BTreeSet<String>,
}

impl AllowList {
    pub fn new<I, S>(clients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AllowList {
            clients: clients.into_iter().map(Into::into).collect(),
        }
    }
}

impl AccessPolicy for AllowList {
    fn is_permitted(&self, client: &str, _action: &str) -> bool {
        self.clients.contains(client)
    }
}

/// An application service that accepts service tickets for its own principal.
pub struct ApplicationService {
    principal: String,
    key: DerivedKey,
    policy: Box<dyn AccessPolicy>,
    replay: ReplayGuard,
}

impl ApplicationService {
    pub fn new(
        principal: &str,
        key: DerivedKey,
        policy: Box<dyn AccessPolicy>,
        maximum_clock_skew: Duration,
    ) -> Self {
        ApplicationService {
            principal: principal.to_string(),
            key,
            policy,
            replay: ReplayGuard::new(maximum_clock_skew),
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    #[instrument(level = "info", skip_all)]
    pub fn process_application_request(
        &self,
        ap_req: &ApplicationRequest,
        stime: SystemTime,
    ) -> Result<KerberosReply, KrbError> {
        let now = KerberosTime::try_from(stime)?;

        let ticket = decrypt_ticket(&self.key, &ap_req.ticket)?;
        trace!(client = %ticket.client, server = %ticket.server, expires = ?ticket.expires);

        if ticket.server != self.principal {
            error!(server = %ticket.server, "ticket is not for this service");
            return Err(KrbError::TicketWrongServer);
        }

        check_ticket_validity(
            now,
            ticket.issued,
            ticket.expires,
            self.replay.maximum_clock_skew(),
        )?;

        let authenticator = decrypt_authenticator(&ticket.session_key, &ap_req.authenticator)?;

        if authenticator.client != ticket.client {
            error!(
                ticket_client = %ticket.client,
                authenticator_client = %authenticator.client,
                "authenticator does not match ticket"
            );
            return Err(KrbError::AuthenticatorClientMismatch);
        }

        self.replay.check_and_record(
            &authenticator.client,
            authenticator.timestamp,
            authenticator.nonce,
            now,
        )?;

        let granted = self.policy.is_permitted(&ticket.client, &ap_req.action);

        // Proof that we hold the service key, sent whether or not access was
        // granted.
        let enc_part = encrypt_ap_reply_part(
            &ticket.session_key,
            &ApReplyPart {
                timestamp: authenticator.timestamp.next(),
            },
        )?;

        info!(
            client = %ticket.client,
            action = %ap_req.action,
            %granted,
            "access decision"
        );

        Ok(KerberosReply::AP(ApplicationReply { granted, enc_part }))
    }
}

impl KerberosService for ApplicationService {
    fn task_name(&self) -> TaskName {
        TaskName::ApplicationUdp(self.principal.clone())
    }

    fn handle(
        &self,
        request: KerberosRequest,
        stime: SystemTime,
    ) -> Result<KerberosReply, KrbError> {
        match request {
            KerberosRequest::AP(ap_req) => self.process_application_request(&ap_req, stime),
            other => {
                trace!(msg_type = ?other.message_type(), "not an application request");
                Err(KrbError::InvalidMessageType)
            }
        }
    }
}
