use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::{self, PrivateKeyWithHashAlg};
use russh::ChannelMsg;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::response::RawOutput;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default time to wait for the SSH connection to be established.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time to wait for a single command to return.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Known-hosts file kept separate from the user's OpenSSH one.
const KNOWN_HOSTS_FILE: &str = "xsf_known_hosts";

/// Connection configuration for one storage array.
///
/// This struct decouples the library from any configuration framework.
/// The service layer builds a `ConnectOptions` from its request secrets
/// and passes it to [`crate::client::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// IP address or host name of the array.
    pub host: String,

    /// SSH port of the array.
    pub port: u16,

    /// Login account.
    pub username: String,

    /// Password of the login account, or the passphrase unlocking the
    /// private key.
    pub password: Option<String>,

    /// In-memory private key (PEM or OpenSSH format).
    pub private_key: Option<String>,

    /// File containing the private key.
    pub private_key_file: Option<PathBuf>,

    /// Maximum time to wait for the connection to be established.
    pub connect_timeout: Duration,

    /// Maximum time to wait for each command to return.
    pub command_timeout: Duration,

    /// Accept and record unknown host keys.
    pub auto_add_host_keys: bool,

    /// Skip the known-hosts file entirely.
    pub ignore_known_hosts: bool,

    /// Known-hosts file; defaults to a home-relative private file.
    pub known_hosts_file: Option<PathBuf>,

    /// Expected device type of the array, e.g. "svc".
    pub device_type: Option<String>,

    /// Relax strict error checking in the spec parser and invocation.
    pub flexible: bool,

    /// Read the CLI specification from the array itself first.
    pub with_remote_spec: bool,

    /// Directory holding per-device/version fallback spec files.
    pub spec_dir: Option<PathBuf>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            host: String::new(),
            port: DEFAULT_SSH_PORT,
            username: String::new(),
            password: None,
            private_key: None,
            private_key_file: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            auto_add_host_keys: true,
            ignore_known_hosts: true,
            known_hosts_file: None,
            device_type: None,
            flexible: false,
            with_remote_spec: true,
            spec_dir: None,
        }
    }
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>) -> Self {
        ConnectOptions {
            host: host.into(),
            ..ConnectOptions::default()
        }
    }

    /// The known-hosts file in effect.
    pub fn known_hosts_path(&self) -> PathBuf {
        self.known_hosts_file.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(KNOWN_HOSTS_FILE)
        })
    }
}

/// One authenticated session against one array.
///
/// Implemented by [`SshTransport`]; test doubles stand in for it behind
/// the same trait.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&mut self) -> Result<()>;

    /// Execute one command on a fresh session channel.
    ///
    /// `timeout` overrides the configured command timeout for this call;
    /// `stdin` is written to the remote process and the write half closed.
    async fn send_command(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
        stdin: Option<&str>,
    ) -> Result<RawOutput>;

    /// Idempotent.
    async fn disconnect(&mut self);

    async fn reconnect(&mut self) -> Result<()> {
        self.disconnect().await;
        self.connect().await
    }

    /// Bookkeeping flag set by connect/disconnect.
    fn is_connected(&self) -> bool;

    /// Whether the underlying session is still alive.
    fn is_active(&self) -> bool;

    fn endpoint(&self) -> String;
}

// -- SSH implementation --------------------------------------------------------

/// Host-key verdict handler driven by the known-hosts policy.
struct HostKeyHandler {
    host: String,
    port: u16,
    auto_add: bool,
    ignore_known_hosts: bool,
    known_hosts_file: PathBuf,
    rejection: Arc<Mutex<Option<AgentError>>>,
}

impl client::Handler for HostKeyHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        if self.ignore_known_hosts {
            return Ok(true);
        }
        match keys::check_known_hosts_path(
            &self.host,
            self.port,
            server_public_key,
            &self.known_hosts_file,
        ) {
            Ok(true) => Ok(true),
            Ok(false) => {
                if self.auto_add {
                    if let Err(err) = keys::known_hosts::learn_known_hosts_path(
                        &self.host,
                        self.port,
                        server_public_key,
                        &self.known_hosts_file,
                    ) {
                        warn!(error = %err, "failed to record the host key");
                    }
                    Ok(true)
                } else {
                    self.reject();
                    Ok(false)
                }
            }
            Err(_) => {
                self.reject();
                Ok(false)
            }
        }
    }
}

impl HostKeyHandler {
    fn reject(&self) {
        *self.rejection.lock().unwrap() = Some(AgentError::BadHostFingerprint {
            hostname: self.host.clone(),
        });
    }
}

/// SSH transport over one authenticated session.
pub struct SshTransport {
    options: ConnectOptions,
    session: Option<client::Handle<HostKeyHandler>>,
    connected: bool,
}

impl SshTransport {
    pub fn new(options: ConnectOptions) -> SshTransport {
        SshTransport {
            options,
            session: None,
            connected: false,
        }
    }

    fn load_private_key(&self) -> Result<Option<keys::PrivateKey>> {
        let passphrase = self.options.password.as_deref();
        if let Some(data) = &self.options.private_key {
            return keys::decode_secret_key(data, passphrase)
                .map(Some)
                .map_err(map_key_error);
        }
        if let Some(path) = &self.options.private_key_file {
            return keys::load_secret_key(path, passphrase)
                .map(Some)
                .map_err(map_key_error);
        }
        Ok(None)
    }
}

fn map_key_error(err: keys::Error) -> AgentError {
    match err {
        keys::Error::KeyIsEncrypted => AgentError::PassphraseRequired,
        other => AgentError::IncorrectCredentials(format!("Private key incorrect: {other}")),
    }
}

fn map_connect_error(err: russh::Error, host: &str) -> AgentError {
    match err {
        russh::Error::UnknownKey => AgentError::BadHostFingerprint {
            hostname: host.to_string(),
        },
        other => AgentError::UnableToConnect {
            host: host.to_string(),
            detail: other.to_string(),
        },
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&mut self) -> Result<()> {
        let options = self.options.clone();
        let known_hosts = options.known_hosts_path();

        // Surface an unreadable known-hosts file before dialing.
        if !options.ignore_known_hosts && known_hosts.is_file() {
            std::fs::read(&known_hosts).map_err(|err| AgentError::FailedToLoadKnownHosts {
                path: known_hosts.clone(),
                source: err,
            })?;
        }

        let rejection = Arc::new(Mutex::new(None));
        let handler = HostKeyHandler {
            host: options.host.clone(),
            port: options.port,
            auto_add: options.auto_add_host_keys,
            ignore_known_hosts: options.ignore_known_hosts,
            known_hosts_file: known_hosts,
            rejection: Arc::clone(&rejection),
        };

        let addr = format!("{}:{}", options.host, options.port);
        let mut resolved = tokio::net::lookup_host(&addr)
            .await
            .map_err(|_| AgentError::HostDoesNotExist {
                hostname: options.host.clone(),
            })?;
        let Some(socket_addr) = resolved.next() else {
            return Err(AgentError::HostDoesNotExist {
                hostname: options.host.clone(),
            });
        };

        let config = Arc::new(client::Config::default());
        let connecting = client::connect(config, socket_addr, handler);
        let mut session = match tokio::time::timeout(options.connect_timeout, connecting).await {
            Err(_) => {
                return Err(AgentError::ConnectionTimedOut(
                    "Timed out when attempting to establish a ssh connection".to_string(),
                ))
            }
            Ok(Err(err)) => {
                if let Some(rejected) = rejection.lock().unwrap().take() {
                    return Err(rejected);
                }
                return Err(map_connect_error(err, &options.host));
            }
            Ok(Ok(session)) => session,
        };

        let auth = if let Some(key) = self.load_private_key()? {
            let hash_alg = session.best_supported_rsa_hash().await?.flatten();
            session
                .authenticate_publickey(
                    &options.username,
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                )
                .await?
        } else {
            session
                .authenticate_password(
                    &options.username,
                    options.password.clone().unwrap_or_default(),
                )
                .await?
        };

        match auth {
            client::AuthResult::Success => {}
            client::AuthResult::Failure {
                remaining_methods,
                partial_success,
                ..
            } => {
                let allowed = vec![format!("{remaining_methods:?}")];
                if partial_success {
                    return Err(AgentError::PartialAuthentication { allowed });
                }
                return Err(AgentError::IncorrectCredentials(
                    "Authentication failed".to_string(),
                ));
            }
        }

        debug!(endpoint = %self.endpoint(), "ssh transport connected");
        self.session = Some(session);
        self.connected = true;
        Ok(())
    }

    async fn send_command(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
        stdin: Option<&str>,
    ) -> Result<RawOutput> {
        let limit = timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.options.command_timeout);

        let outcome = {
            let session = self.session.as_ref().ok_or_else(|| {
                AgentError::InternalSystem("Transport is disconnected".to_string())
            })?;
            tokio::time::timeout(limit, exec_on_channel(session, command, stdin)).await
        };
        match outcome {
            Ok(result) => result,
            Err(_) => {
                // Reconnect so the in-flight remote command cannot outlive
                // the caller.
                if let Err(err) = self.reconnect().await {
                    warn!(error = %err, "reconnect after command timeout failed");
                }
                Err(AgentError::ConnectionTimedOut(
                    "Timed out when executing command through a ssh connection, \
                     possibly the command is interactive"
                        .to_string(),
                ))
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_active(&self) -> bool {
        self.session
            .as_ref()
            .map(|session| !session.is_closed())
            .unwrap_or(false)
    }

    fn endpoint(&self) -> String {
        if self.options.port == DEFAULT_SSH_PORT {
            self.options.host.clone()
        } else {
            format!("ssh://{}:{}", self.options.host, self.options.port)
        }
    }
}

/// Open a session channel, execute the command, and read both output
/// streams to completion.
async fn exec_on_channel(
    session: &client::Handle<HostKeyHandler>,
    command: &str,
    stdin: Option<&str>,
) -> Result<RawOutput> {
    let mut channel = session.channel_open_session().await?;
    channel.exec(true, command).await?;
    if let Some(input) = stdin {
        channel.data(input.as_bytes()).await?;
        channel.eof().await?;
    }
    let mut stdout: Vec<u8> = Vec::new();
    let mut stderr: Vec<u8> = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { ref data }) => stdout.extend_from_slice(data),
            Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => stderr.extend_from_slice(data),
            Some(_) => {}
            None => break,
        }
    }
    Ok(RawOutput {
        stdout: decode_utf8(stdout)?,
        stderr: decode_utf8(stderr)?,
    })
}

fn decode_utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|err| AgentError::ResponseParser(format!("remote output is not valid UTF-8: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_defaults() {
        let options = ConnectOptions::new("array1");
        assert_eq!(options.host, "array1");
        assert_eq!(options.port, DEFAULT_SSH_PORT);
        assert_eq!(options.connect_timeout, Duration::from_secs(30));
        assert_eq!(options.command_timeout, Duration::from_secs(60));
        assert!(options.auto_add_host_keys);
        assert!(options.ignore_known_hosts);
        assert!(options.with_remote_spec);
    }

    #[test]
    fn known_hosts_path_defaults_to_home_relative_file() {
        let options = ConnectOptions::new("array1");
        assert!(options
            .known_hosts_path()
            .ends_with(KNOWN_HOSTS_FILE));

        let explicit = ConnectOptions {
            known_hosts_file: Some(PathBuf::from("/tmp/kh")),
            ..ConnectOptions::new("array1")
        };
        assert_eq!(explicit.known_hosts_path(), PathBuf::from("/tmp/kh"));
    }

    #[test]
    fn endpoint_formatting() {
        let transport = SshTransport::new(ConnectOptions::new("array1"));
        assert_eq!(transport.endpoint(), "array1");

        let transport = SshTransport::new(ConnectOptions {
            port: 2222,
            ..ConnectOptions::new("array1")
        });
        assert_eq!(transport.endpoint(), "ssh://array1:2222");
    }

    #[tokio::test]
    async fn send_without_connect_is_an_internal_error() {
        let mut transport = SshTransport::new(ConnectOptions::new("array1"));
        let err = transport.send_command("svcinfo lshost", None, None).await.unwrap_err();
        assert!(matches!(err, AgentError::InternalSystem(_)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let mut transport = SshTransport::new(ConnectOptions::new("array1"));
        assert!(!transport.is_connected());
        assert!(!transport.is_active());
        transport.disconnect().await;
        transport.disconnect().await;
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn refused_connection_maps_to_unable_to_connect() {
        // Grab a port with no listener behind it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = SshTransport::new(ConnectOptions {
            port,
            connect_timeout: Duration::from_secs(5),
            ..ConnectOptions::new("127.0.0.1")
        });
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_connection_error(), "got: {err}");
        assert!(!transport.is_connected());
    }

    #[test]
    fn utf8_decode_errors_are_parser_errors() {
        let err = decode_utf8(vec![0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, AgentError::ResponseParser(_)));
    }
}
