//! Error kinds per spec section 7: each is either locally recovered (dial/EOF
//! retries, auth retries) or logged-and-closed at the connection boundary.
//! Only three kinds are ever fatal to the process: unreadable config on
//! initial load, Kerberos auth-retry exhaustion, and operator stop.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("credential required: {0}")]
    CredentialRequired(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Kerberos(#[from] KerberosError),

    #[error("PAC evaluation failed: {0}")]
    Pac(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Transport-level failures from the connection substrate (conn module).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("dial to {0} failed: {1}")]
    DialFailed(String, std::io::Error),

    #[error("operation timed out")]
    Timeout,
}

impl TransportError {
    /// Whether this failure is the kind that warrants a failover attempt
    /// against the next candidate upstream/host, mirrored on
    /// `control_plane::provider::errors::ApiError`'s `CouldRetry` in the
    /// reference proxy.
    pub fn could_retry(&self) -> bool {
        matches!(self, TransportError::DialFailed(..) | TransportError::Timeout)
    }
}

/// Errors from the HTTP header codec (section 4.2).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("header section exceeded {0} bytes")]
    OversizedHeader(usize),

    #[error("malformed request line: {0}")]
    MalformedRequestLine(String),

    #[error("malformed status line: {0}")]
    MalformedStatusLine(String),

    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    #[error("peer closed before a complete header was read")]
    Eof,
}

/// Errors from the Kerberos/SPNEGO authenticator (section 4.4).
#[derive(Debug, Error)]
pub enum KerberosError {
    #[error("login failed for {user}@{realm}: {source}")]
    Login {
        user: String,
        realm: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to produce SPNEGO token: {0}")]
    SpnegoToken(anyhow::Error),

    #[error("invalid krb5 configuration: {0}")]
    Config(String),

    #[error("native OS credentials are not available on this platform")]
    Native,

    #[error("authentication retry exhausted; shutting down to avoid account lockout")]
    RetryExhausted,
}
