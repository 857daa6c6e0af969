use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::constants::{
    DEFAULT_CLOCK_SKEW, DEFAULT_SERVICE_TICKET_LIFETIME, DEFAULT_TICKET_GRANTING_PRINCIPAL,
    DEFAULT_TICKET_GRANTING_TICKET_LIFETIME,
};
use crate::error::KrbError;
use crate::keystore::{MemoryKeyStore, PrincipalStore};
use crate::keytab::Keytab;
use crate::proto::DerivedKey;
use crate::server::{
    AccessPolicy, AllowAll, AllowList, ApplicationService, AuthenticationServer,
    TicketGrantServer,
};

fn default_clock_skew_seconds() -> u64 {
    DEFAULT_CLOCK_SKEW.as_secs()
}

fn default_ticket_granting_principal() -> String {
    DEFAULT_TICKET_GRANTING_PRINCIPAL.to_string()
}

fn default_ticket_lifetime_seconds() -> u64 {
    DEFAULT_TICKET_GRANTING_TICKET_LIFETIME.as_secs()
}

fn default_service_ticket_lifetime_seconds() -> u64 {
    DEFAULT_SERVICE_TICKET_LIFETIME.as_secs()
}

fn deserialize_hex_key<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    hex::serde::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticationServerConfig {
    pub address: String,
    /// Where clients are told to find the ticket granting server. Defaults to the
    /// address the ticket granting server binds.
    pub ticket_granting_address: Option<String>,
    #[serde(default = "default_ticket_lifetime_seconds")]
    pub ticket_lifetime_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketGrantingServerConfig {
    pub address: String,
    #[serde(default = "default_service_ticket_lifetime_seconds")]
    pub service_ticket_lifetime_seconds: u64,
    /// Service principal to the address clients should contact it on. Takes
    /// precedence over the bind address of a `[[service]]` with the same name.
    #[serde(default)]
    pub services: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub principal: String,
    pub address: String,
    /// When present, only these clients are granted access.
    pub allow: Option<Vec<String>>,
}

#[derive(Clone, Deserialize)]
pub struct PrincipalConfig {
    pub name: String,
    pub password: Option<String>,
    #[serde(default, deserialize_with = "deserialize_hex_key")]
    pub key: Option<Vec<u8>>,
}

impl std::fmt::Debug for PrincipalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrincipalConfig")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_clock_skew_seconds")]
    pub clock_skew_seconds: u64,
    #[serde(default = "default_ticket_granting_principal")]
    pub ticket_granting_principal: String,
    pub authentication_server: Option<AuthenticationServerConfig>,
    pub ticket_granting_server: Option<TicketGrantingServerConfig>,
    #[serde(default)]
    pub service: Vec<ServiceConfig>,
    #[serde(default)]
    pub principal: Vec<PrincipalConfig>,
    pub keytab: Option<PathBuf>,
}

impl Config {
    pub fn parse<P: AsRef<Path>>(path: P) -> io::Result<Config> {
        let mut contents = String::new();
        let mut f = fs::File::open(&path)?;
        f.read_to_string(&mut contents)?;

        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> io::Result<Config> {
        toml::from_str(contents).map_err(|err| {
            error!(?err);
            io::Error::other("toml parse failure")
        })
    }

    /// Every principal and its long-term key: the keytab first, if any, then the
    /// inline principals, which replace keytab entries of the same name.
    pub fn key_store(&self) -> Result<MemoryKeyStore, KrbError> {
        let mut store = match &self.keytab {
            Some(path) => MemoryKeyStore::from_keytab(&Keytab::load(path)?),
            None => MemoryKeyStore::new(),
        };

        for PrincipalConfig {
            name,
            password,
            key,
        } in &self.principal
        {
            match (password, key) {
                (Some(password), None) => store.insert_passphrase(name, password)?,
                (None, Some(key)) => {
                    store.insert(name, DerivedKey::try_from(key.as_slice())?);
                }
                _ => {
                    error!(principal = %name, "exactly one of password or key is required");
                    return Err(KrbError::ConfigInvalid);
                }
            }
        }

        Ok(store)
    }
}

fn parse_address(address: &str) -> Result<SocketAddr, KrbError> {
    address.parse().map_err(|err| {
        error!(?err, %address, "invalid socket address");
        KrbError::ConfigInvalid
    })
}

/// Servers built from a [`Config`], each paired with the address it binds.
pub struct ServerState {
    pub principals: Arc<MemoryKeyStore>,
    pub authentication_server: Option<(SocketAddr, AuthenticationServer)>,
    pub ticket_granting_server: Option<(SocketAddr, TicketGrantServer)>,
    pub services: Vec<(SocketAddr, ApplicationService)>,
}

impl TryFrom<&Config> for ServerState {
    type Error = KrbError;

    fn try_from(cr: &Config) -> Result<Self, Self::Error> {
        let Config {
            clock_skew_seconds,
            ticket_granting_principal,
            authentication_server,
            ticket_granting_server,
            service,
            principal: _,
            keytab: _,
        } = cr;

        let maximum_clock_skew = Duration::from_secs(*clock_skew_seconds);
        let principals = Arc::new(cr.key_store()?);
        debug!(principals = principals.len(), "loaded key store");

        let services = service
            .iter()
            .map(
                |ServiceConfig {
                     principal,
                     address,
                     allow,
                 }| {
                    let address = parse_address(address)?;
                    let key = principals.lookup(principal).map_err(|err| {
                        error!(%principal, "service has no key");
                        err
                    })?;
                    let policy: Box<dyn AccessPolicy> = match allow {
                        Some(clients) => Box::new(AllowList::new(clients.iter().cloned())),
                        None => Box::new(AllowAll),
                    };

                    Ok::<_, KrbError>((
                        address,
                        ApplicationService::new(principal, key, policy, maximum_clock_skew),
                    ))
                },
            )
            .collect::<Result<Vec<_>, KrbError>>()?;

        let ticket_granting_server = ticket_granting_server
            .as_ref()
            .map(|tgs| {
                let address = parse_address(&tgs.address)?;

                let mut directory: BTreeMap<String, String> = service
                    .iter()
                    .map(|svc| (svc.principal.clone(), svc.address.clone()))
                    .collect();
                directory.extend(tgs.services.clone());

                for (name, service_address) in directory.iter() {
                    parse_address(service_address).map_err(|err| {
                        error!(service = %name, "service directory entry is invalid");
                        err
                    })?;
                }

                let server = TicketGrantServer::new(
                    ticket_granting_principal,
                    principals.clone(),
                    directory,
                    Duration::from_secs(tgs.service_ticket_lifetime_seconds),
                    maximum_clock_skew,
                )?;

                Ok::<_, KrbError>((address, server))
            })
            .transpose()?;

        let authentication_server = authentication_server
            .as_ref()
            .map(|auth| {
                let address = parse_address(&auth.address)?;

                let Some(ticket_granting_address) = auth
                    .ticket_granting_address
                    .clone()
                    .or_else(|| cr.ticket_granting_server.as_ref().map(|t| t.address.clone()))
                else {
                    error!("authentication server has no ticket granting address to hand out");
                    return Err(KrbError::ConfigInvalid);
                };
                parse_address(&ticket_granting_address)?;

                Ok::<_, KrbError>((
                    address,
                    AuthenticationServer::new(
                        principals.clone(),
                        ticket_granting_principal,
                        &ticket_granting_address,
                        Duration::from_secs(auth.ticket_lifetime_seconds),
                    ),
                ))
            })
            .transpose()?;

        Ok(ServerState {
            principals,
            authentication_server,
            ticket_granting_server,
            services,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ServerState};
    use crate::error::KrbError;
    use crate::keystore::PrincipalStore;
    use crate::keytab::{Keytab, KeytabEntry};
    use crate::proto::DerivedKey;
    use std::io::Write;

    const FULL: &str = r#"
clock_skew_seconds = 60

[authentication_server]
address = "127.0.0.1:5000"

[ticket_granting_server]
address = "127.0.0.1:5001"
services = { "host/mail" = "127.0.0.1:5003" }

[[service]]
principal = "host/files"
address = "127.0.0.1:5002"
allow = ["alice"]

[[principal]]
name = "alice"
password = "correct horse battery staple"

[[principal]]
name = "krbtgt"
key = "7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a"

[[principal]]
name = "host/files"
key = "5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e"

[[principal]]
name = "host/mail"
key = "5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f"
"#;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.clock_skew_seconds, 120);
        assert_eq!(config.ticket_granting_principal, "krbtgt");
        assert!(config.authentication_server.is_none());
        assert!(config.service.is_empty());

        let state = ServerState::try_from(&config).unwrap();
        assert!(state.principals.is_empty());
        assert!(state.authentication_server.is_none());
        assert!(state.ticket_granting_server.is_none());
    }

    #[test]
    fn test_full_config() {
        let _ = tracing_subscriber::fmt::try_init();
        let config = Config::from_toml(FULL).unwrap();

        let auth = config.authentication_server.as_ref().unwrap();
        assert_eq!(auth.ticket_lifetime_seconds, 900);
        assert_eq!(
            config
                .ticket_granting_server
                .as_ref()
                .unwrap()
                .service_ticket_lifetime_seconds,
            3600
        );

        let state = ServerState::try_from(&config).unwrap();
        assert_eq!(state.principals.len(), 4);
        assert_eq!(
            state.principals.lookup("krbtgt").unwrap(),
            DerivedKey::try_from([0x7Au8; 32].as_slice()).unwrap()
        );

        let (addr, _) = state.authentication_server.as_ref().unwrap();
        assert_eq!(addr.port(), 5000);
        let (addr, _) = state.ticket_granting_server.as_ref().unwrap();
        assert_eq!(addr.port(), 5001);

        assert_eq!(state.services.len(), 1);
        assert_eq!(state.services[0].0.port(), 5002);
        assert_eq!(state.services[0].1.principal(), "host/files");
    }

    #[test]
    fn test_principal_needs_exactly_one_secret() {
        let both = r#"
[[principal]]
name = "alice"
password = "correct horse battery staple"
key = "7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a"
"#;
        let config = Config::from_toml(both).unwrap();
        assert!(matches!(
            ServerState::try_from(&config),
            Err(KrbError::ConfigInvalid)
        ));

        let neither = "[[principal]]\nname = \"alice\"\n";
        let config = Config::from_toml(neither).unwrap();
        assert!(matches!(
            ServerState::try_from(&config),
            Err(KrbError::ConfigInvalid)
        ));
    }

    #[test]
    fn test_invalid_values() {
        assert!(Config::from_toml("[[principal]]\nname = \"a\"\nkey = \"zz\"\n").is_err());

        let config = Config::from_toml(
            "[[principal]]\nname = \"alice\"\npassword = \"short\"\n",
        )
        .unwrap();
        assert!(matches!(
            ServerState::try_from(&config),
            Err(KrbError::InsecurePassphrase)
        ));

        let bad_address = FULL.replace("127.0.0.1:5000", "localhost");
        let config = Config::from_toml(&bad_address).unwrap();
        assert!(matches!(
            ServerState::try_from(&config),
            Err(KrbError::ConfigInvalid)
        ));
    }

    #[test]
    fn test_service_without_key() {
        let config = Config::from_toml(
            "[[service]]\nprincipal = \"host/files\"\naddress = \"127.0.0.1:5002\"\n",
        )
        .unwrap();
        assert!(matches!(
            ServerState::try_from(&config),
            Err(KrbError::UnknownPrincipal)
        ));
    }

    #[test]
    fn test_authentication_server_needs_tgs_address() {
        let config = Config::from_toml("[authentication_server]\naddress = \"127.0.0.1:0\"\n")
            .unwrap();
        assert!(matches!(
            ServerState::try_from(&config),
            Err(KrbError::ConfigInvalid)
        ));
    }

    #[test]
    fn test_parse_with_keytab() {
        let dir = tempfile::tempdir().unwrap();

        let keytab_path = dir.path().join("krimedc.keytab");
        Keytab::File(vec![KeytabEntry {
            principal: "krbtgt".to_string(),
            key: DerivedKey::try_from([0x11u8; 32].as_slice()).unwrap(),
            kvno: 1,
        }])
        .store(&keytab_path)
        .unwrap();

        let config_path = dir.path().join("krimedc.toml");
        let mut f = std::fs::File::create(&config_path).unwrap();
        writeln!(f, "keytab = {:?}", keytab_path.display().to_string()).unwrap();
        writeln!(f, "[[principal]]\nname = \"alice\"\npassword = \"correct horse battery staple\"").unwrap();
        drop(f);

        let config = Config::parse(&config_path).unwrap();
        let store = config.key_store().unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.lookup("krbtgt").unwrap(),
            DerivedKey::try_from([0x11u8; 32].as_slice()).unwrap()
        );
    }
}
