//! The three datagram servers and the loop that serves them.
//!
//! Each server is an independent value owning its keys and replay guard. The
//! acceptor reads one datagram at a time and hands each to its own task, so a slow
//! or malformed request never holds up the next one. Any failure is answered with
//! the same generic rejection, the reason only goes to the log.

pub mod authentication;
pub mod service;
pub mod ticket_grant;

pub use self::authentication::AuthenticationServer;
pub use self::service::{AccessPolicy, AllowAll, AllowList, ApplicationService};
pub use self::ticket_grant::TicketGrantServer;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio_util::codec::{BytesCodec, Decoder};
use tokio_util::udp::UdpFramed;
use tracing::{debug, error, info, trace, warn};

use crate::config::{Config, ServerState};
use crate::error::KrbError;
use crate::proto::{KerberosReply, KerberosRequest};
use crate::KdcUdpCodec;

pub trait KerberosService: Send + Sync + 'static {
    fn task_name(&self) -> TaskName;

    fn handle(&self, request: KerberosRequest, stime: SystemTime)
        -> Result<KerberosReply, KrbError>;

    /// Never fails. Whatever went wrong, the client only learns that it did.
    fn process(&self, request: KerberosRequest, stime: SystemTime) -> KerberosReply {
        match self.handle(request, stime) {
            Ok(reply) => reply,
            Err(KrbError::ReplayDetected) => {
                warn!(task = %self.task_name(), "rejecting replayed request");
                KerberosReply::Reject
            }
            Err(err) => {
                error!(?err, kind = ?err.kind(), task = %self.task_name(), "rejecting request");
                KerberosReply::Reject
            }
        }
    }
}

#[derive(Clone, Debug)]
pub enum CoreAction {
    Shutdown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskName {
    AuthenticationUdp,
    TicketGrantUdp,
    ApplicationUdp(String),
}

impl Display for TaskName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::AuthenticationUdp => write!(f, "Authentication Server (UDP)"),
            TaskName::TicketGrantUdp => write!(f, "Ticket Granting Server (UDP)"),
            TaskName::ApplicationUdp(principal) => write!(f, "Service {} (UDP)", principal),
        }
    }
}

async fn process_datagram<S: KerberosService>(
    server: Arc<S>,
    sock: Arc<UdpSocket>,
    client_address: SocketAddr,
    mut msg: BytesMut,
) {
    let mut codec = KdcUdpCodec::default();

    let reply = match codec.decode(&mut msg) {
        Ok(Some(request)) => {
            trace!(?request, ?client_address);
            server.process(request, SystemTime::now())
        }
        Ok(None) => {
            debug!(?client_address, "empty datagram");
            return;
        }
        Err(err) => {
            error!(?err, ?client_address, "Failed to decode");
            KerberosReply::Reject
        }
    };

    let mut udp_codec = UdpFramed::new(sock, codec);
    if let Err(err) = udp_codec.send((reply, client_address)).await {
        error!(?err, ?client_address, "Error sending response");
    }
}

async fn kdc_udp_acceptor<S: KerberosService>(
    sock: UdpSocket,
    server: Arc<S>,
    mut rx: broadcast::Receiver<CoreAction>,
) {
    let task_name = server.task_name();
    info!("Started task {}", task_name);

    let sock = Arc::new(sock);
    let mut codec = UdpFramed::new(sock.clone(), BytesCodec::new());

    loop {
        tokio::select! {
        Ok(action) = rx.recv() => {
            match action {
                CoreAction::Shutdown => break,
            }
        }
        frame = codec.next() => {
                match frame {
                    Some(Ok((msg, addr))) => {
                        tokio::spawn(process_datagram(server.clone(), sock.clone(), addr, msg));
                    }
                    Some(Err(err)) => {
                        error!(?err, "UDP receive error, continuing");
                    }
                    None => {
                        error!("UDP socket closed");
                        break;
                    }
                }
            }
        }
    }

    info!("Stopped task {}", task_name);
}

/// Bind `address` and serve `server` on it until a shutdown is broadcast. Returns
/// the bound address, which differs from `address` when port 0 was requested.
pub async fn create_udp_server<S: KerberosService>(
    address: SocketAddr,
    server: Arc<S>,
    rx: broadcast::Receiver<CoreAction>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), KrbError> {
    let sock = UdpSocket::bind(address).await.map_err(|err| {
        error!(?err, %address, "Could not bind to address");
        KrbError::IoError
    })?;

    let local_addr = sock.local_addr()?;

    let handle = tokio::spawn(kdc_udp_acceptor(sock, server, rx));

    Ok((local_addr, handle))
}

pub struct CoreHandle {
    clean_shutdown: bool,
    tx: broadcast::Sender<CoreAction>,
    handles: Vec<(TaskName, SocketAddr, tokio::task::JoinHandle<()>)>,
}

impl CoreHandle {
    pub fn new(tx: broadcast::Sender<CoreAction>) -> Self {
        CoreHandle {
            clean_shutdown: false,
            tx,
            handles: Vec::new(),
        }
    }

    pub async fn spawn<S: KerberosService>(
        &mut self,
        address: SocketAddr,
        server: Arc<S>,
    ) -> Result<SocketAddr, KrbError> {
        let task_name = server.task_name();
        let (local_addr, handle) = create_udp_server(address, server, self.tx.subscribe()).await?;
        self.handles.push((task_name, local_addr, handle));
        Ok(local_addr)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreAction> {
        self.tx.subscribe()
    }

    pub async fn shutdown(&mut self) {
        if self.handles.is_empty() {
            self.clean_shutdown = true;
            return;
        }

        if self.tx.send(CoreAction::Shutdown).is_err() {
            eprintln!("No receivers acked shutdown request. Treating as unclean.");
            return;
        }

        // Wait on the handles.
        while let Some((handle_name, address, handle)) = self.handles.pop() {
            if let Err(error) = handle.await {
                eprintln!("Task {handle_name} on {address} failed to finish: {error:?}");
            }
        }

        self.clean_shutdown = true;
    }
}

impl Drop for CoreHandle {
    fn drop(&mut self) {
        if !self.clean_shutdown {
            eprintln!("⚠️  UNCLEAN SHUTDOWN OCCURRED ⚠️ ");
        }
    }
}

/// Start every server the configuration describes. Servers without a section in
/// the configuration are not started.
pub async fn create_server_core(config: &Config) -> Result<CoreHandle, KrbError> {
    let (broadcast_tx, _broadcast_rx) = broadcast::channel(4);

    let server_state = ServerState::try_from(config).map_err(|err| {
        error!(?err, "Could not get server state from config");
        err
    })?;

    let mut core = CoreHandle::new(broadcast_tx);

    if let Err(err) = spawn_configured(&mut core, server_state).await {
        core.shutdown().await;
        return Err(err);
    }

    Ok(core)
}

async fn spawn_configured(core: &mut CoreHandle, server_state: ServerState) -> Result<(), KrbError> {
    for (address, service) in server_state.services {
        core.spawn(address, Arc::new(service)).await?;
    }

    if let Some((address, tgs)) = server_state.ticket_granting_server {
        core.spawn(address, Arc::new(tgs)).await?;
    } else {
        debug!("Ticket granting server disabled");
    }

    if let Some((address, auth)) = server_state.authentication_server {
        core.spawn(address, Arc::new(auth)).await?;
    } else {
        debug!("Authentication server disabled");
    }

    Ok(())
}
