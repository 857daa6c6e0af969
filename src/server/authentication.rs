use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{info, instrument, trace};

use super::{KerberosService, TaskName};
use crate::error::KrbError;
use crate::keystore::PrincipalStore;
use crate::proto::{
    encrypt_as_reply_part, encrypt_ticket, AuthenticationRequest, KdcReply, KdcReplyPart,
    KerberosReply, KerberosRequest, KerberosTime, SessionKey, TicketPart, TicketTimeBound,
};

/// Issues ticket granting tickets. Holds no state between requests.
pub struct AuthenticationServer {
    principals: Arc<dyn PrincipalStore>,
    ticket_granting_principal: String,
    ticket_granting_address: String,
    ticket_lifetime: Duration,
}

impl AuthenticationServer {
    pub fn new(
        principals: Arc<dyn PrincipalStore>,
        ticket_granting_principal: &str,
        ticket_granting_address: &str,
        ticket_lifetime: Duration,
    ) -> Self {
        AuthenticationServer {
            principals,
            ticket_granting_principal: ticket_granting_principal.to_string(),
            ticket_granting_address: ticket_granting_address.to_string(),
            ticket_lifetime,
        }
    }

    #[instrument(level = "info", skip_all)]
    pub fn process_authentication(
        &self,
        auth_req: &AuthenticationRequest,
        stime: SystemTime,
    ) -> Result<KerberosReply, KrbError> {
        let now = KerberosTime::try_from(stime)?;

        // The reply is sealed under the client's key, so the lookup is the whole
        // of the identity check here. Someone claiming to be alice gets nothing
        // they can open.
        let client_key = self.principals.lookup(&auth_req.client_name)?;

        let ticket_granting_key = self.principals.lookup(&self.ticket_granting_principal)?;

        let time_bound = TicketTimeBound::new(now, self.ticket_lifetime, None)?;

        let session_key = SessionKey::generate();

        let ticket = TicketPart {
            client: auth_req.client_name.clone(),
            server: self.ticket_granting_principal.clone(),
            session_key: session_key.clone(),
            issued: time_bound.issued(),
            expires: time_bound.expires(),
            nonce: auth_req.nonce,
        };

        let enc_part = KdcReplyPart {
            session_key,
            server: self.ticket_granting_principal.clone(),
            address: self.ticket_granting_address.clone(),
            expires: time_bound.expires(),
            nonce: auth_req.nonce,
        };

        trace!(client = %auth_req.client_name, ?time_bound);

        let reply = KdcReply {
            enc_part: encrypt_as_reply_part(&client_key, &enc_part)?,
            ticket: encrypt_ticket(&ticket_granting_key, &ticket)?,
        };

        info!(client = %auth_req.client_name, "issued ticket granting ticket");

        Ok(KerberosReply::AS(reply))
    }
}

impl KerberosService for AuthenticationServer {
    fn task_name(&self) -> TaskName {
        TaskName::AuthenticationUdp
    }

    fn handle(
        &self,
        request: KerberosRequest,
        stime: SystemTime,
    ) -> Result<KerberosReply, KrbError> {
        match request {
            KerberosRequest::AS(auth_req) => self.process_authentication(&auth_req, stime),
            other => {
                trace!(msg_type = ?other.message_type(), "not an authentication request");
                Err(KrbError::InvalidMessageType)
            }
        }
    }
}
