use std::fmt;
use std::path::PathBuf;

/// All error types produced by the storage-agent library.
///
/// Variants are grouped the way callers classify them:
/// - credential errors (bad password, key trouble, host-key mismatch)
/// - connection errors (unreachable host, timeout, missing specification)
/// - specification errors (malformed spec XML, bad caller arguments)
/// - remote execution errors (vendor CLI failures, unparsable output)
#[derive(Debug)]
pub enum AgentError {
    // -- Credentials ----------------------------------------------------------
    /// Authentication was rejected by the array, or the presented key
    /// material is unusable.
    IncorrectCredentials(String),

    /// The server does not accept any of the authentication types we tried.
    BadAuthenticationType { allowed: Vec<String> },

    /// The host key presented by the array does not match the recorded one.
    BadHostFingerprint { hostname: String },

    /// Authentication partially succeeded; the server wants more.
    PartialAuthentication { allowed: Vec<String> },

    /// A passphrase is needed to unlock the private key.
    PassphraseRequired,

    /// The known-hosts file exists but could not be read.
    FailedToLoadKnownHosts { path: PathBuf, source: std::io::Error },

    /// The spec document advertises a compression scheme we do not speak.
    UnsupportedXmlCompression(String),

    // -- Connection -----------------------------------------------------------
    /// The SSH connection could not be established.
    UnableToConnect { host: String, detail: String },

    /// The host name could not be resolved.
    HostDoesNotExist { hostname: String },

    /// Connecting or executing a command timed out.
    ConnectionTimedOut(String),

    /// The remote endpoint does not speak the SSH protocol we expect.
    ProtocolMismatch(String),

    /// The array is not of the device type the caller asked for.
    IncorrectDeviceType { expected: String },

    /// No CLI specification could be obtained for the array.
    NoSpecification,

    // -- Specification / arguments --------------------------------------------
    /// The CLI specification is malformed, or the caller supplied arguments
    /// the command does not define.
    Spec(String),

    // -- Remote execution -----------------------------------------------------
    /// A remote command failed without a more specific classification.
    CommandFailed { command: String, response: String },

    /// The vendor CLI reported a failure. `message` preserves the original
    /// failure text verbatim so callers can pattern-match CMMVC codes.
    CliFailure { message: String, return_code: i32 },

    /// Remote output could not be parsed into records.
    ResponseParser(String),

    /// An internal invariant was violated while executing a command.
    InternalSystem(String),

    // -- Carriers -------------------------------------------------------------
    /// An I/O error (file read, network, etc.).
    Io(std::io::Error),

    /// An error from the underlying SSH library.
    Ssh(russh::Error),
}

impl AgentError {
    /// Build the canonical vendor-failure error.
    ///
    /// The message format is part of the contract; upstream observers grep
    /// for it.
    pub fn cli_failure(rc_field: &str, stderr: &str, return_code: i32) -> Self {
        AgentError::CliFailure {
            message: format!(
                "CLI failure. Return code is {rc_field}. Error message is \"{stderr}\""
            ),
            return_code,
        }
    }

    /// True for errors rooted in the presented credentials or host keys.
    pub fn is_credentials_error(&self) -> bool {
        matches!(
            self,
            AgentError::IncorrectCredentials(_)
                | AgentError::BadAuthenticationType { .. }
                | AgentError::BadHostFingerprint { .. }
                | AgentError::PartialAuthentication { .. }
                | AgentError::PassphraseRequired
                | AgentError::FailedToLoadKnownHosts { .. }
                | AgentError::UnsupportedXmlCompression(_)
        )
    }

    /// True for errors that mean the array could not be reached or used.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AgentError::UnableToConnect { .. }
                | AgentError::HostDoesNotExist { .. }
                | AgentError::ConnectionTimedOut(_)
                | AgentError::ProtocolMismatch(_)
                | AgentError::IncorrectDeviceType { .. }
                | AgentError::NoSpecification
        )
    }

    /// True for errors raised while executing a remote command.
    pub fn is_execution_error(&self) -> bool {
        matches!(
            self,
            AgentError::CommandFailed { .. }
                | AgentError::CliFailure { .. }
                | AgentError::ResponseParser(_)
                | AgentError::InternalSystem(_)
        )
    }

    /// The numeric return code carried by a vendor CLI failure.
    pub fn return_code(&self) -> Option<i32> {
        match self {
            AgentError::CliFailure { return_code, .. } => Some(*return_code),
            _ => None,
        }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::IncorrectCredentials(msg) => write!(f, "{msg}"),
            AgentError::BadAuthenticationType { allowed }
            | AgentError::PartialAuthentication { allowed } => {
                write!(f, "Allowed authentication types are: {}", allowed.join(", "))
            }
            AgentError::BadHostFingerprint { hostname } => write!(
                f,
                "Host finger print does not match when connecting to {hostname}. \
                 Add the correct host key to the known hosts file to get rid of this error."
            ),
            AgentError::PassphraseRequired => write!(
                f,
                "Check if a password was specified to unlock the private key file"
            ),
            AgentError::FailedToLoadKnownHosts { path, source } => {
                write!(f, "Failed to load known hosts file {}: {source}", path.display())
            }
            AgentError::UnsupportedXmlCompression(detail) => {
                write!(f, "Unsupported XML compression: {detail}")
            }
            AgentError::UnableToConnect { host, detail } => {
                write!(f, "Cannot establish ssh connection to {host}: {detail}")
            }
            AgentError::HostDoesNotExist { hostname } => write!(
                f,
                "Cannot establish the ssh connection to {hostname} due to unrecognizable host"
            ),
            AgentError::ConnectionTimedOut(msg) => write!(f, "{msg}"),
            AgentError::ProtocolMismatch(msg) => write!(f, "{msg}"),
            AgentError::IncorrectDeviceType { expected } => {
                write!(f, "The expected device {expected} is not found.")
            }
            AgentError::NoSpecification => {
                write!(f, "No CLI specification is found for the storage array")
            }
            AgentError::Spec(msg) => write!(f, "{msg}"),
            AgentError::CommandFailed { command, response } => {
                write!(f, "Storage array command <{command}> failed: {response}")
            }
            AgentError::CliFailure { message, .. } => write!(f, "{message}"),
            AgentError::ResponseParser(msg) => write!(f, "{msg}"),
            AgentError::InternalSystem(msg) => write!(f, "{msg}"),
            AgentError::Io(err) => write!(f, "I/O error: {err}"),
            AgentError::Ssh(err) => write!(f, "SSH error: {err}"),
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AgentError::FailedToLoadKnownHosts { source, .. } => Some(source),
            AgentError::Io(err) => Some(err),
            AgentError::Ssh(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Io(err)
    }
}

impl From<russh::Error> for AgentError {
    fn from(err: russh::Error) -> Self {
        AgentError::Ssh(err)
    }
}

/// Convenience type alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, AgentError>;
