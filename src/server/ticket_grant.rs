use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{error, info, instrument, trace};

use super::{KerberosService, TaskName};
use crate::error::KrbError;
use crate::keystore::PrincipalStore;
use crate::proto::{
    check_ticket_validity, decrypt_authenticator, decrypt_ticket, encrypt_tgs_reply_part,
    encrypt_ticket, DerivedKey, KdcReply, KdcReplyPart, KerberosReply, KerberosRequest,
    KerberosTime, SessionKey, TicketGrantRequest, TicketPart, TicketTimeBound,
};
use crate::replay::ReplayGuard;

/// Exchanges a ticket granting ticket for a ticket to a named service.
pub struct TicketGrantServer {
    principal: String,
    key: DerivedKey,
    principals: Arc<dyn PrincipalStore>,
    // service principal -> address the client should contact it on
    services: BTreeMap<String, String>,
    service_ticket_lifetime: Duration,
    replay: ReplayGuard,
}

impl TicketGrantServer {
    /// The server's own key is resolved from `principals` once, up front.
    pub fn new(
        principal: &str,
        principals: Arc<dyn PrincipalStore>,
        services: BTreeMap<String, String>,
        service_ticket_lifetime: Duration,
        maximum_clock_skew: Duration,
    ) -> Result<Self, KrbError> {
        let key = principals.lookup(principal).map_err(|err| {
            error!(%principal, "no key for the ticket granting principal");
            err
        })?;

        Ok(TicketGrantServer {
            principal: principal.to_string(),
            key,
            principals,
            services,
            service_ticket_lifetime,
            replay: ReplayGuard::new(maximum_clock_skew),
        })
    }

    #[instrument(level = "info", skip_all)]
    pub fn process_ticket_grant(
        &self,
        tgs_req: &TicketGrantRequest,
        stime: SystemTime,
    ) -> Result<KerberosReply, KrbError> {
        let now = KerberosTime::try_from(stime)?;

        let tgt = decrypt_ticket(&self.key, &tgs_req.ticket)?;
        trace!(client = %tgt.client, server = %tgt.server, expires = ?tgt.expires);

        if tgt.server != self.principal {
            error!(server = %tgt.server, "ticket is not for this server");
            return Err(KrbError::TicketWrongServer);
        }

        check_ticket_validity(
            now,
            tgt.issued,
            tgt.expires,
            self.replay.maximum_clock_skew(),
        )?;

        let authenticator = decrypt_authenticator(&tgt.session_key, &tgs_req.authenticator)?;

        if authenticator.client != tgt.client {
            error!(
                ticket_client = %tgt.client,
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

        let service_key = self.principals.lookup(&tgs_req.service_name)?;

        let Some(service_address) = self.services.get(&tgs_req.service_name) else {
            error!(service = %tgs_req.service_name, "service has no known address");
            return Err(KrbError::UnknownServiceAddress);
        };

        let time_bound =
            TicketTimeBound::new(now, self.service_ticket_lifetime, Some(tgt.expires))?;

        let session_key = SessionKey::generate();

        let ticket = TicketPart {
            client: tgt.client.clone(),
            server: tgs_req.service_name.clone(),
            session_key: session_key.clone(),
            issued: time_bound.issued(),
            expires: time_bound.expires(),
            nonce: tgs_req.nonce,
        };

        let enc_part = KdcReplyPart {
            session_key,
            server: tgs_req.service_name.clone(),
            address: service_address.clone(),
            expires: time_bound.expires(),
            nonce: tgs_req.nonce,
        };

        let reply = KdcReply {
            enc_part: encrypt_tgs_reply_part(&tgt.session_key, &enc_part)?,
            ticket: encrypt_ticket(&service_key, &ticket)?,
        };

        info!(client = %tgt.client, service = %tgs_req.service_name, "issued service ticket");

        Ok(KerberosReply::TGS(reply))
    }
}

impl KerberosService for TicketGrantServer {
    fn task_name(&self) -> TaskName {
        TaskName::TicketGrantUdp
    }

    fn handle(
        &self,
        request: KerberosRequest,
        stime: SystemTime,
    ) -> Result<KerberosReply, KrbError> {
        match request {
            KerberosRequest::TGS(tgs_req) => self.process_ticket_grant(&tgs_req, stime),
            other => {
                trace!(msg_type = ?other.message_type(), "not a ticket grant request");
                Err(KrbError::InvalidMessageType)
            }
        }
    }
}
