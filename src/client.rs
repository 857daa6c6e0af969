//! Drives the three hops of an authentication: AS, then TGS, then the service.
//!
//! Every hop is one datagram out and one datagram back on a fresh socket connected
//! to the hop's server, so replies from anyone else are dropped by the kernel. The
//! client only ever contacts the AS it was configured with, and after that the
//! address delivered in the most recent sealed reply.

use bytes::BytesMut;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::constants::{DEFAULT_HOP_TIMEOUT, DEFAULT_IO_MAX_SIZE};
use crate::error::KrbError;
use crate::proto::{
    decrypt_ap_reply_part, decrypt_as_reply_part, decrypt_tgs_reply_part,
    encrypt_authenticator, ApplicationRequest, AuthenticationRequest, AuthenticatorPart,
    DerivedKey, KdcReplyPart, KerberosReply, KerberosRequest, KerberosTime, SessionKey,
    TicketGrantRequest,
};
use crate::KerberosUdpCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOutcome {
    Granted,
    Denied,
}

impl fmt::Display for AccessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessOutcome::Granted => write!(f, "Access Granted"),
            AccessOutcome::Denied => write!(f, "Access Denied"),
        }
    }
}

/// A ticket the client can present but not read, with the session key and address
/// that came with it.
#[derive(Debug, Clone)]
struct Credential {
    ticket: Vec<u8>,
    session_key: SessionKey,
    server: String,
    address: SocketAddr,
    expires: KerberosTime,
}

impl TryFrom<(Vec<u8>, KdcReplyPart)> for Credential {
    type Error = KrbError;

    fn try_from((ticket, part): (Vec<u8>, KdcReplyPart)) -> Result<Self, Self::Error> {
        let address = part.address.parse::<SocketAddr>().map_err(|err| {
            error!(?err, address = %part.address, "reply carried an invalid address");
            KrbError::InvalidAddress
        })?;
        Ok(Credential {
            ticket,
            session_key: part.session_key,
            server: part.server,
            address,
            expires: part.expires,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TicketGrantingTicket(Credential);

#[derive(Debug, Clone)]
pub struct ServiceTicket(Credential);

macro_rules! credential_accessors {
    ($t:ty) => {
        impl $t {
            pub fn session_key(&self) -> &SessionKey {
                &self.0.session_key
            }

            pub fn server(&self) -> &str {
                &self.0.server
            }

            pub fn address(&self) -> SocketAddr {
                self.0.address
            }

            pub fn expires(&self) -> KerberosTime {
                self.0.expires
            }
        }
    };
}

credential_accessors!(TicketGrantingTicket);
credential_accessors!(ServiceTicket);

pub struct KerberosClient {
    client_name: String,
    key: DerivedKey,
    authentication_address: SocketAddr,
    hop_timeout: Duration,
    verify_mutual_auth: bool,
}

impl KerberosClient {
    pub fn new(client_name: &str, key: DerivedKey, authentication_address: SocketAddr) -> Self {
        KerberosClient {
            client_name: client_name.to_string(),
            key,
            authentication_address,
            hop_timeout: DEFAULT_HOP_TIMEOUT,
            verify_mutual_auth: true,
        }
    }

    /// The key is derived with the client's name as salt, the same way the key
    /// store derives it.
    pub fn with_passphrase(
        client_name: &str,
        passphrase: &str,
        authentication_address: SocketAddr,
    ) -> Result<Self, KrbError> {
        let key = DerivedKey::new_aes256_cts_hmac_sha1_96(passphrase, client_name, None)?;
        Ok(Self::new(client_name, key, authentication_address))
    }

    pub fn hop_timeout(mut self, hop_timeout: Duration) -> Self {
        self.hop_timeout = hop_timeout;
        self
    }

    pub fn verify_mutual_auth(mut self, verify: bool) -> Self {
        self.verify_mutual_auth = verify;
        self
    }

    async fn exchange(
        &self,
        address: SocketAddr,
        request: KerberosRequest,
    ) -> Result<KerberosReply, KrbError> {
        let bind_address = if address.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };

        let sock = UdpSocket::bind(bind_address).await?;
        sock.connect(address).await.map_err(|err| {
            error!(?err, %address, "unable to reach server");
            KrbError::UpstreamUnavailable
        })?;

        let mut codec = KerberosUdpCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(request, &mut buf)?;

        sock.send(&buf).await.map_err(|err| {
            error!(?err, %address, "unable to send request");
            KrbError::UpstreamUnavailable
        })?;

        // One byte larger than we accept, so an oversized reply is noticed rather
        // than silently truncated.
        let mut recv_buf = vec![0u8; DEFAULT_IO_MAX_SIZE + 1];
        let len = match tokio::time::timeout(self.hop_timeout, sock.recv(&mut recv_buf)).await {
            Ok(Ok(len)) => len,
            Ok(Err(err)) => {
                // Typically an icmp port unreachable reported on the connected socket.
                warn!(?err, %address, "no reply from server");
                return Err(KrbError::UpstreamUnavailable);
            }
            Err(_) => {
                warn!(%address, timeout = ?self.hop_timeout, "timed out waiting for reply");
                return Err(KrbError::UpstreamUnavailable);
            }
        };

        let mut reply_buf = BytesMut::from(&recv_buf[..len]);
        let reply = codec.decode(&mut reply_buf)?.ok_or(KrbError::InsufficientData)?;
        trace!(msg_type = ?reply.message_type(), %address);
        Ok(reply)
    }

    #[instrument(level = "info", skip_all, fields(client = %self.client_name))]
    pub async fn request_ticket_granting_ticket(&self) -> Result<TicketGrantingTicket, KrbError> {
        let nonce = rand::random::<u64>();

        let request = KerberosRequest::AS(AuthenticationRequest {
            client_name: self.client_name.clone(),
            nonce,
        });

        let reply = match self
            .exchange(self.authentication_address, request)
            .await?
        {
            KerberosReply::AS(reply) => reply,
            KerberosReply::Reject => {
                // The principal lookup is the only thing the AS checks that we control.
                debug!("authentication server rejected the request");
                return Err(KrbError::UnknownPrincipal);
            }
            other => {
                error!(msg_type = ?other.message_type(), "unexpected reply type");
                return Err(KrbError::InvalidMessageType);
            }
        };

        let part = decrypt_as_reply_part(&self.key, &reply.enc_part)?;

        if part.nonce != nonce {
            error!("reply nonce does not match request");
            return Err(KrbError::ReplyNonceMismatch);
        }

        let credential = Credential::try_from((reply.ticket, part))?;
        info!(server = %credential.server, address = %credential.address, "obtained ticket granting ticket");
        Ok(TicketGrantingTicket(credential))
    }

    fn authenticator(&self, session_key: &SessionKey) -> Result<(Vec<u8>, KerberosTime), KrbError> {
        let timestamp = KerberosTime::now()?;
        let authenticator = AuthenticatorPart {
            client: self.client_name.clone(),
            timestamp,
            nonce: rand::random::<u64>(),
        };
        encrypt_authenticator(session_key, &authenticator).map(|enc| (enc, timestamp))
    }

    #[instrument(level = "info", skip_all, fields(client = %self.client_name, %service))]
    pub async fn request_service_ticket(
        &self,
        tgt: &TicketGrantingTicket,
        service: &str,
    ) -> Result<ServiceTicket, KrbError> {
        let nonce = rand::random::<u64>();
        let (authenticator, _) = self.authenticator(tgt.session_key())?;

        let request = KerberosRequest::TGS(TicketGrantRequest {
            service_name: service.to_string(),
            nonce,
            ticket: tgt.0.ticket.clone(),
            authenticator,
        });

        let reply = match self.exchange(tgt.address(), request).await? {
            KerberosReply::TGS(reply) => reply,
            KerberosReply::Reject => {
                debug!("ticket granting server rejected the request");
                return Err(KrbError::RequestRejected);
            }
            other => {
                error!(msg_type = ?other.message_type(), "unexpected reply type");
                return Err(KrbError::InvalidMessageType);
            }
        };

        let part = decrypt_tgs_reply_part(tgt.session_key(), &reply.enc_part)?;

        if part.nonce != nonce {
            error!("reply nonce does not match request");
            return Err(KrbError::ReplyNonceMismatch);
        }

        if part.server != service {
            error!(server = %part.server, "reply is for a different service");
            return Err(KrbError::ReplyServerMismatch);
        }

        let credential = Credential::try_from((reply.ticket, part))?;
        info!(address = %credential.address, "obtained service ticket");
        Ok(ServiceTicket(credential))
    }

    #[instrument(level = "info", skip_all, fields(client = %self.client_name, service = %st.server()))]
    pub async fn request_access(
        &self,
        st: &ServiceTicket,
        action: &str,
    ) -> Result<AccessOutcome, KrbError> {
        let (authenticator, timestamp) = self.authenticator(st.session_key())?;

        let request = KerberosRequest::AP(ApplicationRequest {
            action: action.to_string(),
            ticket: st.0.ticket.clone(),
            authenticator,
        });

        let reply = match self.exchange(st.address(), request).await? {
            KerberosReply::AP(reply) => reply,
            KerberosReply::Reject => {
                debug!("service rejected the request");
                return Err(KrbError::RequestRejected);
            }
            other => {
                error!(msg_type = ?other.message_type(), "unexpected reply type");
                return Err(KrbError::InvalidMessageType);
            }
        };

        if self.verify_mutual_auth {
            let part = decrypt_ap_reply_part(st.session_key(), &reply.enc_part).map_err(|err| {
                error!(?err, "unable to open mutual authentication reply");
                KrbError::MutualAuthFailed
            })?;

            if part.timestamp != timestamp.next() {
                error!(
                    expected = ?timestamp.next(),
                    received = ?part.timestamp,
                    "mutual authentication timestamp mismatch"
                );
                return Err(KrbError::MutualAuthFailed);
            }
            trace!("service proved possession of its key");
        }

        let outcome = if reply.granted {
            AccessOutcome::Granted
        } else {
            AccessOutcome::Denied
        };

        info!(%outcome, %action);
        Ok(outcome)
    }

    /// All three hops in order. The first failure ends the exchange, nothing is
    /// retried.
    pub async fn authenticate(&self, service: &str, action: &str) -> Result<AccessOutcome, KrbError> {
        let st = {
            let tgt = self.request_ticket_granting_ticket().await?;
            self.request_service_ticket(&tgt, service).await?
        };
        self.request_access(&st, action).await
    }
}
