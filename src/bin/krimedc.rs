use clap::{Parser, Subcommand};
use krimes_handshake::config::{
    AuthenticationServerConfig, Config, PrincipalConfig, ServiceConfig,
    TicketGrantingServerConfig,
};
use krimes_handshake::keystore::PrincipalStore;
use krimes_handshake::keytab::{Keytab, KeytabEntry};
use krimes_handshake::server::{create_server_core, CoreHandle};
use krimes_handshake::{KerberosClient, KrbError};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const DEMO_AS_ADDRESS: &str = "127.0.0.1:5000";
const DEMO_TGS_ADDRESS: &str = "127.0.0.1:5001";
const DEMO_SERVICE_ADDRESS: &str = "127.0.0.1:5002";
const DEMO_CLIENT: &str = "alice";
const DEMO_PASSWORD: &str = "alice's demonstration passphrase";
const DEMO_SERVICE: &str = "host/service";

#[derive(Debug, clap::Parser)]
#[clap(about = "A Ticket Granting Krime, If You Please")]
struct OptParser {
    #[clap(subcommand)]
    command: Opt,
}

#[derive(Debug, Subcommand)]
#[clap(about = "A Ticket Granting Krime, If You Please")]
enum Opt {
    /// Start every server the configuration describes.
    Run { config: PathBuf },
    /// Authenticate to a service through a running AS and TGS.
    Authenticate {
        #[clap(long, env = "KRIMES_AS_ADDRESS", default_value = DEMO_AS_ADDRESS)]
        address: SocketAddr,
        #[clap(long, env = "KRIMES_CLIENT")]
        client: String,
        #[clap(long, env = "KRIMES_PASSWORD", hide_env_values = true)]
        password: String,
        #[clap(long, env = "KRIMES_SERVICE")]
        service: String,
        #[clap(long, default_value = "access")]
        action: String,
        /// Seconds to wait for each reply.
        #[clap(long, default_value_t = 5)]
        timeout: u64,
    },
    /// Write the key of a configured principal to a keytab.
    Keytab {
        config: PathBuf,
        name: String,
        output: PathBuf,
    },
    /// Run all three servers and authenticate alice against them.
    Demo,
}

fn keytab_extract_run(name: &str, output: &Path, config: &Config) -> io::Result<()> {
    let key = config
        .key_store()
        .and_then(|store| store.lookup(name))
        .map_err(|err| {
            error!(?err, %name, "no matching principal");
            io::Error::new(io::ErrorKind::InvalidInput, "no matching principal")
        })?;

    let mut entries = if output.exists() {
        let Keytab::File(entries) = Keytab::load(output).map_err(|err| {
            error!(?err, "Failed to load keytab file at {}", output.display());
            io::Error::new(io::ErrorKind::InvalidInput, "keytab")
        })?;
        entries
    } else {
        Vec::new()
    };

    let kvno = entries
        .iter()
        .filter(|entry| entry.principal == name)
        .map(|entry| entry.kvno)
        .max()
        .unwrap_or(0)
        + 1;

    entries.push(KeytabEntry {
        principal: name.to_string(),
        key,
        kvno,
    });

    Keytab::File(entries)
        .store(output)
        .map_err(|_err| io::Error::new(io::ErrorKind::InvalidInput, "write"))?;

    info!(%name, %kvno, "Wrote keytab entry to {}", output.display());
    Ok(())
}

fn random_key() -> Option<Vec<u8>> {
    Some(rand::random::<[u8; 32]>().to_vec())
}

fn demo_config() -> Config {
    Config {
        clock_skew_seconds: 120,
        ticket_granting_principal: "krbtgt".to_string(),
        authentication_server: Some(AuthenticationServerConfig {
            address: DEMO_AS_ADDRESS.to_string(),
            ticket_granting_address: Some(DEMO_TGS_ADDRESS.to_string()),
            ticket_lifetime_seconds: 900,
        }),
        ticket_granting_server: Some(TicketGrantingServerConfig {
            address: DEMO_TGS_ADDRESS.to_string(),
            service_ticket_lifetime_seconds: 3600,
            services: BTreeMap::new(),
        }),
        service: vec![ServiceConfig {
            principal: DEMO_SERVICE.to_string(),
            address: DEMO_SERVICE_ADDRESS.to_string(),
            allow: None,
        }],
        principal: vec![
            PrincipalConfig {
                name: DEMO_CLIENT.to_string(),
                password: Some(DEMO_PASSWORD.to_string()),
                key: None,
            },
            PrincipalConfig {
                name: "krbtgt".to_string(),
                password: None,
                key: random_key(),
            },
            PrincipalConfig {
                name: DEMO_SERVICE.to_string(),
                password: None,
                key: random_key(),
            },
        ],
        keytab: None,
    }
}

async fn demo_run() -> Result<(), KrbError> {
    let mut sctx = create_server_core(&demo_config()).await?;

    let address: SocketAddr = DEMO_AS_ADDRESS.parse().map_err(|_| KrbError::InvalidAddress)?;
    let result = match KerberosClient::with_passphrase(DEMO_CLIENT, DEMO_PASSWORD, address) {
        Ok(client) => {
            client
                .hop_timeout(Duration::from_secs(2))
                .authenticate(DEMO_SERVICE, "access")
                .await
        }
        Err(err) => Err(err),
    };

    sctx.shutdown().await;

    let outcome = result?;
    println!("{outcome}");
    Ok(())
}

async fn wait_for_shutdown(sctx: &mut CoreHandle) {
    loop {
        let mut listener = sctx.subscribe();
        tokio::select! {
            Ok(()) = tokio::signal::ctrl_c() => {
                break
            }
            Some(()) = async move {
                let sigterm = tokio::signal::unix::SignalKind::terminate();
                #[allow(clippy::unwrap_used)]
                tokio::signal::unix::signal(sigterm).unwrap().recv().await
            } => {
                break
            }
            Some(()) = async move {
                let sighup = tokio::signal::unix::SignalKind::hangup();
                #[allow(clippy::unwrap_used)]
                tokio::signal::unix::signal(sighup).unwrap().recv().await
            } => {
                // Ignore
            }
            // we got a message on the broadcast from somewhere else
            Ok(msg) = async move {
                listener.recv().await
            } => {
                debug!("Main loop received message: {:?}", msg);
                break
            }
        }
    }
    info!("Signal received, shutting down");
    sctx.shutdown().await;
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), ()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opt = OptParser::parse();

    match opt.command {
        Opt::Run { config } => {
            let cfg = Config::parse(&config).map_err(|e| {
                error!("Could not parse config file {:?}: {:?}", config, e);
            })?;

            match create_server_core(&cfg).await {
                Ok(mut sctx) => wait_for_shutdown(&mut sctx).await,
                Err(err) => {
                    error!(?err, "Failed to start server core!");
                    return Err(());
                }
            }
        }
        Opt::Authenticate {
            address,
            client,
            password,
            service,
            action,
            timeout,
        } => {
            let client = KerberosClient::with_passphrase(&client, &password, address)
                .map_err(|err| {
                    error!(?err, "Could not derive client key");
                })?
                .hop_timeout(Duration::from_secs(timeout));

            match client.authenticate(&service, &action).await {
                Ok(outcome) => println!("{outcome}"),
                Err(err) => {
                    error!(?err, kind = ?err.kind(), %service, "Authentication failed");
                    return Err(());
                }
            }
        }
        Opt::Keytab {
            name,
            output,
            config,
        } => {
            let cfg = Config::parse(&config).map_err(|e| {
                error!("Could not parse config file {:?}: {:?}", config, e);
            })?;
            keytab_extract_run(&name, &output, &cfg).map_err(|e| {
                error!(
                    "Could not extract principal {:?} to keytab {:?}: {:?}",
                    name, output, e
                );
            })?
        }
        Opt::Demo => demo_run().await.map_err(|err| {
            error!(?err, kind = ?err.kind(), "Demo failed");
        })?,
    }

    Ok(())
}
