// ── Transfer client – connect / send_file / close lifecycle ──────────────────

use crate::scp::auth;
use crate::scp::limits::{ConnectionPermit, HostLimits, LimiterRegistry};
use crate::scp::sink::shell_escape;
use crate::scp::types::{PushRequest, ScpConnectConfig, ScpError, TransferOutcome};
use base64::Engine;
use log::{debug, info};
use ssh2::Session;
use std::fs::File;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// An upload client bound to one destination host.
///
/// Construction blocks on a free connection slot for the host and holds it
/// until [`close`](ScpClient::close) (or drop); each transfer additionally
/// takes a session slot for the duration of its stream.
pub struct ScpClient {
    host: String,
    username: String,
    session: Session,
    // Keeps the socket alive for as long as the session uses it.
    _tcp: TcpStream,
    limits: Arc<HostLimits>,
    _permit: ConnectionPermit,
}

impl std::fmt::Debug for ScpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScpClient")
            .field("host", &self.host)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ScpClient {
    /// Connect to the host described by `config`.
    ///
    /// The identity file is loaded first, so credential errors never touch
    /// admission state. Any dial failure after the slot is acquired releases
    /// it before the error returns.
    pub async fn connect(
        registry: &LimiterRegistry,
        config: &ScpConnectConfig,
    ) -> Result<Self, ScpError> {
        let credential = auth::load_identity(&config.identity_path, config.passphrase.as_deref())?;
        let limits = registry.limits(&config.host)?;
        let permit = limits.acquire_connection().await;

        let addr = format!("{}:{}", config.host, config.port);
        info!("connecting to {} as {}", addr, config.username);

        let dial = |reason: String| ScpError::Dial {
            host: config.host.clone(),
            reason,
        };

        let sock_addr = addr
            .to_socket_addrs()
            .map_err(|e| dial(format!("cannot resolve '{}': {}", addr, e)))?
            .next()
            .ok_or_else(|| dial(format!("'{}' resolved to no addresses", addr)))?;

        let tcp = TcpStream::connect_timeout(&sock_addr, Duration::from_secs(config.timeout_secs))
            .map_err(|e| dial(format!("TCP connection to {} failed: {}", addr, e)))?;
        tcp.set_nonblocking(false)
            .map_err(|e| dial(format!("failed to set blocking mode: {}", e)))?;

        let mut session =
            Session::new().map_err(|e| dial(format!("failed to create SSH session: {}", e)))?;
        if config.compress {
            session.set_compress(true);
        }
        session.set_tcp_stream(
            tcp.try_clone()
                .map_err(|e| dial(format!("failed to clone socket: {}", e)))?,
        );
        session
            .handshake()
            .map_err(|e| dial(format!("SSH handshake failed: {}", e)))?;

        if let Some(banner) = session.banner() {
            debug!("server banner for {}: {}", addr, banner);
        }
        if let Some(hash) = session.host_key_hash(ssh2::HashType::Sha256) {
            info!("host key for {}: {}", addr, fingerprint_sha256(hash));
        }

        credential
            .authenticate(&session, &config.username)
            .map_err(|e| dial(format!("public key authentication failed: {}", e)))?;
        if !session.authenticated() {
            return Err(dial(
                "not authenticated after public key attempt".to_string(),
            ));
        }
        info!(
            "authenticated to {} as {} ({})",
            addr,
            config.username,
            credential.algorithm()
        );

        Ok(ScpClient {
            host: config.host.clone(),
            username: config.username.clone(),
            session,
            _tcp: tcp,
            limits,
            _permit: permit,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn limits(&self) -> &HostLimits {
        &self.limits
    }

    /// Upload a local file into a remote directory. The remote name is the
    /// path's base name; permission bits are taken from the local file.
    pub async fn send_file(
        &self,
        local_path: &str,
        destination: &str,
    ) -> Result<TransferOutcome, ScpError> {
        let (request, file) = local_request(local_path, destination)?;
        self.copy(request, file).await
    }

    /// Disconnect and release the connection slot. A client that is simply
    /// dropped releases its slot too, but skips the SSH goodbye.
    pub fn close(self) {
        info!("disconnecting from {}", self.host);
        let _ = self.session.disconnect(None, "client closing", None);
    }

    // ── Remote exec helpers ──────────────────────────────────────────────────

    pub(crate) fn exec_remote(&self, command: &str) -> Result<String, ScpError> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| ScpError::SessionOpen {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;

        channel.exec(command).map_err(|e| ScpError::RemoteCommand {
            status: -1,
            message: format!("failed to start '{}': {}", command, e),
        })?;

        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(|e| ScpError::Stream(format!("failed to read output of '{}': {}", command, e)))?;
        let mut stderr_output = String::new();
        let _ = channel.stderr().read_to_string(&mut stderr_output);
        channel.wait_close().ok();

        let status = channel
            .exit_status()
            .map_err(|e| ScpError::Stream(format!("failed to read exit status: {}", e)))?;
        if status != 0 {
            let stderr_output = stderr_output.trim();
            return Err(ScpError::RemoteCommand {
                status,
                message: if stderr_output.is_empty() {
                    format!("'{}' failed", command)
                } else {
                    stderr_output.to_string()
                },
            });
        }

        Ok(output.trim().to_string())
    }

    pub(crate) fn remote_mkdir_p(&self, path: &str) -> Result<(), ScpError> {
        self.exec_remote(&format!("mkdir -p {}", shell_escape(path)))?;
        Ok(())
    }
}

/// Build a request from a local file: open, stat size and permission bits,
/// derive the remote name from the base name. The returned handle closes on
/// drop, so every exit path of the transfer releases it.
pub(crate) fn local_request(
    local_path: &str,
    destination: &str,
) -> Result<(PushRequest, File), ScpError> {
    let local_err = |source: std::io::Error| ScpError::LocalFile {
        path: local_path.to_string(),
        source,
    };

    let file = File::open(local_path).map_err(local_err)?;
    let meta = file.metadata().map_err(local_err)?;
    if meta.is_dir() {
        return Err(local_err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "is a directory",
        )));
    }

    let file_name = Path::new(local_path)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            ScpError::Protocol(format!("cannot derive a file name from '{}'", local_path))
        })?;

    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o777
    };
    #[cfg(not(unix))]
    let mode = 0o644;

    Ok((
        PushRequest {
            file_name: file_name.to_string(),
            size: meta.len(),
            mode,
            destination: destination.to_string(),
            create_dirs: false,
        },
        file,
    ))
}

/// OpenSSH-style fingerprint rendering: the `SHA256:` label followed by the
/// base64 form, matching what `ssh-keygen -lf` prints.
fn fingerprint_sha256(hash: &[u8]) -> String {
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD.encode(hash)
    )
}
