// ── Types ─────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};

// ── Serde default helpers ────────────────────────────────────────────────────

fn default_port() -> u16 {
    22
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_false() -> bool {
    false
}
fn default_file_mode() -> u32 {
    0o644
}

// ── Connection ───────────────────────────────────────────────────────────────

/// Configuration for connecting an upload client to one destination host.
///
/// The `host` string is also the admission-control partition key: it must be
/// registered with the [`LimiterRegistry`](crate::scp::LimiterRegistry)
/// before the first connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScpConnectConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    /// Path to the private-key identity file.
    pub identity_path: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_false")]
    pub compress: bool,
}

// ── Transfer request ─────────────────────────────────────────────────────────

/// One upload: a named byte payload bound for a remote directory.
///
/// `size` must match the number of bytes the source reader yields; a short
/// source aborts the transfer with [`ScpError::Protocol`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub file_name: String,
    pub size: u64,
    /// Permission bits for the created remote file.
    #[serde(default = "default_file_mode")]
    pub mode: u32,
    /// Remote directory the receiver writes into.
    pub destination: String,
    /// Run `mkdir -p` on the destination before streaming.
    #[serde(default = "default_false")]
    pub create_dirs: bool,
}

// ── Transfer outcome ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    pub bytes_sent: u64,
    pub duration_ms: u64,
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors produced by this crate. Nothing is retried internally; every
/// failure is returned to the immediate caller with its cause attached.
#[derive(Debug, thiserror::Error)]
pub enum ScpError {
    #[error("cannot read identity file '{path}': {source}")]
    CredentialRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("identity file '{path}' is not a usable private key: {reason}")]
    CredentialParse { path: String, reason: String },

    #[error("no limits registered for host '{0}'")]
    HostNotRegistered(String),

    #[error("failed to dial {host}: {reason}")]
    Dial { host: String, reason: String },

    #[error("failed to open a session channel on {host}: {reason}")]
    SessionOpen { host: String, reason: String },

    #[error("local file error for '{path}': {source}")]
    LocalFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid transfer request: {0}")]
    Protocol(String),

    #[error("sink stream failed: {0}")]
    Stream(String),

    #[error("remote receiver failed (exit status {status}): {message}")]
    RemoteCommand { status: i32, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_config_defaults() {
        let config: ScpConnectConfig = serde_json::from_str(
            r#"{"host":"build1","username":"deploy","identityPath":"/etc/keys/id_ed25519"}"#,
        )
        .unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.timeout_secs, 30);
        assert!(config.passphrase.is_none());
        assert!(!config.compress);
    }

    #[test]
    fn test_push_request_defaults() {
        let request: PushRequest = serde_json::from_str(
            r#"{"fileName":"app.tar.gz","size":1024,"destination":"/srv/releases"}"#,
        )
        .unwrap();
        assert_eq!(request.mode, 0o644);
        assert!(!request.create_dirs);
    }

    #[test]
    fn test_error_display_carries_cause() {
        let err = ScpError::Dial {
            host: "build1".into(),
            reason: "connection refused".into(),
        };
        let text = err.to_string();
        assert!(text.contains("build1"));
        assert!(text.contains("connection refused"));
    }

    #[test]
    fn test_remote_command_error_display() {
        let err = ScpError::RemoteCommand {
            status: 1,
            message: "scp: /srv/releases: No such file or directory".into(),
        };
        assert!(err.to_string().contains("exit status 1"));
    }
}
