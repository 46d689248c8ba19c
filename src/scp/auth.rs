// ── Credential loader – identity file → usable credential ────────────────────

use crate::scp::types::ScpError;
use log::debug;
use std::fmt;

/// A validated private-key credential.
///
/// Keeps the raw key text for the transport layer's in-memory public-key
/// auth, plus the algorithm and comment for logging. The key material never
/// appears in `Debug` output.
pub struct Credential {
    pem: String,
    passphrase: Option<String>,
    algorithm: String,
    comment: Option<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("algorithm", &self.algorithm)
            .field("comment", &self.comment)
            .field("encrypted", &self.passphrase.is_some())
            .finish_non_exhaustive()
    }
}

impl Credential {
    /// Algorithm name of the loaded key (e.g. `ssh-ed25519`).
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Authenticate an SSH session with this credential.
    pub(crate) fn authenticate(
        &self,
        session: &ssh2::Session,
        username: &str,
    ) -> Result<(), ssh2::Error> {
        session.userauth_pubkey_memory(username, None, &self.pem, self.passphrase.as_deref())
    }
}

/// Load and validate a private key from `path`. Re-reads and re-parses on
/// every call; nothing is cached.
pub fn load_identity(path: &str, passphrase: Option<&str>) -> Result<Credential, ScpError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ScpError::CredentialRead {
        path: path.to_string(),
        source,
    })?;

    let key = ssh_key::PrivateKey::from_openssh(&raw).map_err(|e| ScpError::CredentialParse {
        path: path.to_string(),
        reason: e.to_string(),
    })?;

    // Validate the passphrase up front so a bad one fails here instead of
    // mid-dial. The transport layer decrypts from the raw text itself.
    if key.is_encrypted() {
        match passphrase {
            Some(p) => {
                key.decrypt(p).map_err(|e| ScpError::CredentialParse {
                    path: path.to_string(),
                    reason: format!("cannot decrypt key: {}", e),
                })?;
            }
            None => {
                return Err(ScpError::CredentialParse {
                    path: path.to_string(),
                    reason: "key is encrypted and no passphrase was given".to_string(),
                });
            }
        }
    }

    let comment = key.comment().trim();
    let comment = if comment.is_empty() {
        None
    } else {
        Some(comment.to_string())
    };

    let algorithm = key.algorithm().to_string();
    debug!("loaded {} identity from '{}'", algorithm, path);

    Ok(Credential {
        pem: raw,
        passphrase: passphrase.map(str::to_string),
        algorithm,
        comment,
    })
}
