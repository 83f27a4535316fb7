//! Authenticated SSH sessions to a cluster login host.
//!
//! A [`Connection`] only holds the host/user pair and the credential; every
//! call to [`Connection::connect`] opens exactly one new transport. There is
//! no retry here, callers decide whether to try again.

use std::fmt;
use std::sync::Arc;

use color_eyre::eyre::{Result, WrapErr};
use derive_getters::Getters;

use crate::config::ClusterSettings;
use crate::log::*;

pub mod cluster;
pub mod files;
pub mod host;
pub mod slurm;

use self::host::Host;

#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("authentication as {user} on {host} was rejected")]
    Authentication { user: String, host: String },
    #[error("host {host} is unreachable: {reason}")]
    Unreachable { host: String, reason: String },
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("ssh agent unavailable: {0}")]
    Agent(String),
}

/// How a session proves its identity.
#[derive(Clone)]
pub enum Credential {
    /// Key material decoded in memory for the lifetime of one request. Never
    /// written to disk.
    Key(Arc<thrussh_keys::key::KeyPair>),
    /// Identities offered by the local SSH agent (`$SSH_AUTH_SOCK`).
    Agent,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Key(_) => f.write_str("Credential::Key(<redacted>)"),
            Credential::Agent => f.write_str("Credential::Agent"),
        }
    }
}

impl Credential {
    /// Decode PEM/OpenSSH key material, optionally encrypted.
    pub fn from_key_material(key: &str, passphrase: Option<&str>) -> Result<Self, ConnectError> {
        thrussh_keys::decode_secret_key(key.trim(), passphrase)
            .map(|keypair| Credential::Key(Arc::new(keypair)))
            .map_err(|e| ConnectError::InvalidKey(e.to_string()))
    }
}

/// Connection descriptor: `{host, username, credential}`.
#[derive(Getters, Debug, Clone)]
pub struct Connection {
    host: Host,
    username: String,
    credential: Credential,
}

impl Connection {
    pub fn new<S: Into<String>>(host: Host, username: S, credential: Credential) -> Self {
        Self {
            host,
            username: username.into(),
            credential,
        }
    }

    /// Build the per-process connection from settings. Uses the configured
    /// key file when present (decrypting it with the passphrase from the
    /// configured env var), the SSH agent otherwise.
    #[tracing::instrument]
    pub async fn from_settings(settings: &ClusterSettings) -> Result<Self> {
        if settings.host().is_empty() || settings.username().is_empty() {
            return Err(eyre!("cluster.host and cluster.username must be set"));
        }
        let credential = match settings.key_path() {
            Some(path) => {
                let key = tokio::fs::read_to_string(path)
                    .await
                    .wrap_err_with(|| format!("reading ssh key {}", path.display()))?;
                let passphrase = std::env::var(settings.passphrase_env()).ok();
                Credential::from_key_material(&key, passphrase.as_deref())?
            }
            None => Credential::Agent,
        };
        Ok(Self::new(
            Host::new_with_port(settings.host().clone(), *settings.port()),
            settings.username().clone(),
            credential,
        ))
    }

    /// Open and authenticate one new session. The caller owns it and should
    /// [`Session::close`] it when done.
    #[tracing::instrument(skip(self), fields(host = %self.host.host(), user = %self.username))]
    pub async fn connect(&self) -> Result<Session, ConnectError> {
        let config = Arc::new(thrussh::client::Config::default());
        let addr = self.host.address();
        debug!("connecting to {}", &addr);
        let mut handle = thrussh::client::connect(config, addr.as_str(), SshClient)
            .await
            .map_err(|e| ConnectError::Unreachable {
                host: addr.clone(),
                reason: e.to_string(),
            })?;

        let authenticated = match &self.credential {
            Credential::Key(keypair) => handle
                .authenticate_publickey(self.username.as_str(), keypair.clone())
                .await
                .map_err(|e| ConnectError::Unreachable {
                    host: addr.clone(),
                    reason: e.to_string(),
                })?,
            Credential::Agent => self.authenticate_with_agent(&mut handle).await?,
        };

        if !authenticated {
            return Err(ConnectError::Authentication {
                user: self.username.clone(),
                host: addr,
            });
        }
        debug!("successfully authenticated!");
        Ok(Session {
            handle,
            host: addr,
        })
    }

    async fn authenticate_with_agent(
        &self,
        handle: &mut thrussh::client::Handle<SshClient>,
    ) -> Result<bool, ConnectError> {
        let mut agent = thrussh_keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|e| ConnectError::Agent(e.to_string()))?;
        let identities = agent
            .request_identities()
            .await
            .map_err(|e| ConnectError::Agent(e.to_string()))?;

        for key in identities {
            let (returned, result) = handle
                .authenticate_future(self.username.as_str(), key, agent)
                .await;
            agent = returned;
            match result {
                Ok(true) => return Ok(true),
                Ok(false) => continue,
                Err(e) => return Err(ConnectError::Agent(format!("{:?}", e))),
            }
        }
        Ok(false)
    }
}

/// A live, authenticated SSH transport.
pub struct Session {
    handle: thrussh::client::Handle<SshClient>,
    host: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("host", &self.host).finish()
    }
}

impl Session {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn open_channel(&mut self) -> Result<thrussh::client::Channel> {
        debug!("awaiting channel session open...");
        let channel = self
            .handle
            .channel_open_session()
            .await
            .wrap_err_with(|| format!("opening channel on {}", self.host))?;
        debug!("channel open!");
        Ok(channel)
    }

    /// Politely tear the transport down.
    pub async fn close(mut self) {
        if let Err(e) = self
            .handle
            .disconnect(thrussh::Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("error closing session to {}: {}", self.host, e);
        }
    }
}

pub(crate) struct SshClient;

impl thrussh::client::Handler for SshClient {
    type Error = color_eyre::eyre::Report;
    type FutureUnit = futures::future::Ready<Result<(Self, thrussh::client::Session), Self::Error>>;
    type FutureBool = futures::future::Ready<Result<(Self, bool), Self::Error>>;

    fn finished_bool(self, b: bool) -> Self::FutureBool {
        futures::future::ready(Ok((self, b)))
    }

    fn finished(self, session: thrussh::client::Session) -> Self::FutureUnit {
        futures::future::ready(Ok((self, session)))
    }

    // Login nodes are trusted the same way `ssh -o StrictHostKeyChecking=no`
    // would trust them.
    fn check_server_key(
        self,
        _server_public_key: &thrussh_keys::key::PublicKey,
    ) -> Self::FutureBool {
        self.finished_bool(true)
    }
}
