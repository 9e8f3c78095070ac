//! Peer configuration.

use docsync_protocol::{DEFAULT_COOKIE_NAME, DEFAULT_MAX_FRAME_LEN};
use std::collections::HashMap;
use std::time::Duration;

/// Credentials and access rights of one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccess {
    /// Password for basic authentication.
    pub password: String,
    /// Channels the user may read and write (empty for all).
    pub channels: Vec<String>,
    /// Disabled users authenticate but are refused.
    pub disabled: bool,
}

impl UserAccess {
    /// Creates a user with access to every channel.
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            channels: Vec::new(),
            disabled: false,
        }
    }

    /// Restricts the user to the given channels.
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    /// Marks the account as disabled.
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

/// Configuration for a replication peer.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Name clients must ask for in their handshake (any name if unset).
    pub database_name: Option<String>,
    /// Whether clients must authenticate.
    pub require_auth: bool,
    /// Known users.
    pub users: HashMap<String, UserAccess>,
    /// Key for signing session cookies.
    pub session_secret: Vec<u8>,
    /// Lifetime of issued session cookies.
    pub session_expiry: Duration,
    /// Name of the session cookie.
    pub cookie_name: String,
    /// Whether pushed revisions may create conflicting branches.
    pub allow_conflicts: bool,
    /// Maximum number of changes per changes-feed reply.
    pub max_changes_batch: u32,
    /// Maximum number of revisions per push.
    pub max_push_batch: u32,
    /// Maximum frame payload size.
    pub max_frame_len: usize,
    /// Certificate presented to connecting clients (DER bytes).
    pub certificate: Option<Vec<u8>>,
    /// PKCS#8 DER private key for `certificate`. With both set the server
    /// speaks `wss`.
    pub private_key: Option<Vec<u8>>,
    /// Idle timeout for a connection.
    pub read_timeout: Option<Duration>,
}

impl PeerConfig {
    /// Creates a configuration that accepts anonymous clients.
    pub fn new() -> Self {
        Self {
            database_name: None,
            require_auth: false,
            users: HashMap::new(),
            session_secret: uuid::Uuid::new_v4().as_bytes().to_vec(),
            session_expiry: Duration::from_secs(24 * 60 * 60),
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            allow_conflicts: false,
            max_changes_batch: 200,
            max_push_batch: 200,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            certificate: None,
            private_key: None,
            read_timeout: Some(Duration::from_secs(60)),
        }
    }

    /// Requires clients to ask for this database name.
    pub fn with_database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = Some(name.into());
        self
    }

    /// Adds a user and turns authentication on.
    pub fn with_user(mut self, username: impl Into<String>, access: UserAccess) -> Self {
        self.require_auth = true;
        self.users.insert(username.into(), access);
        self
    }

    /// Sets the session signing key.
    pub fn with_session_secret(mut self, secret: Vec<u8>) -> Self {
        self.session_secret = secret;
        self
    }

    /// Sets the session lifetime.
    pub fn with_session_expiry(mut self, expiry: Duration) -> Self {
        self.session_expiry = expiry;
        self
    }

    /// Sets the session cookie name.
    pub fn with_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    /// Allows pushes to create conflicting branches.
    pub fn with_allow_conflicts(mut self, allow: bool) -> Self {
        self.allow_conflicts = allow;
        self
    }

    /// Sets the changes-feed window.
    pub fn with_max_changes_batch(mut self, size: u32) -> Self {
        self.max_changes_batch = size;
        self
    }

    /// Sets the push limit.
    pub fn with_max_push_batch(mut self, size: u32) -> Self {
        self.max_push_batch = size;
        self
    }

    /// Sets the certificate presented to clients.
    ///
    /// In-process connectors present it as is; [`PeerServer`](crate::PeerServer)
    /// also needs the private key, see [`PeerConfig::with_tls_identity`].
    pub fn with_certificate(mut self, der: Vec<u8>) -> Self {
        self.certificate = Some(der);
        self
    }

    /// Serves TLS with a DER certificate and its PKCS#8 DER private key.
    pub fn with_tls_identity(mut self, certificate: Vec<u8>, private_key: Vec<u8>) -> Self {
        self.certificate = Some(certificate);
        self.private_key = Some(private_key);
        self
    }

    /// True if the server side is configured for TLS.
    pub fn serves_tls(&self) -> bool {
        self.certificate.is_some() && self.private_key.is_some()
    }

    /// Sets the connection idle timeout.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = PeerConfig::default();
        assert!(!config.require_auth);
        assert!(!config.allow_conflicts);
        assert_eq!(config.cookie_name, "SyncGatewaySession");
        assert_eq!(config.session_secret.len(), 16);
    }

    #[test]
    fn config_builder() {
        let config = PeerConfig::new()
            .with_database_name("travel")
            .with_user("pupshaw", UserAccess::new("frank").with_channels(["a"]))
            .with_max_changes_batch(50)
            .with_allow_conflicts(true);

        assert!(config.require_auth);
        assert_eq!(config.database_name.as_deref(), Some("travel"));
        assert_eq!(config.users["pupshaw"].channels, vec!["a".to_string()]);
        assert_eq!(config.max_changes_batch, 50);
        assert!(config.allow_conflicts);
        assert!(!config.serves_tls());
    }

    #[test]
    fn tls_needs_certificate_and_key() {
        let presented = PeerConfig::new().with_certificate(b"cert".to_vec());
        assert!(!presented.serves_tls());
        let served = PeerConfig::new().with_tls_identity(b"cert".to_vec(), b"key".to_vec());
        assert!(served.serves_tls());
    }
}
