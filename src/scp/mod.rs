// ── scp-push / scp module ─────────────────────────────────────────────────────
//
// Admission-limited SCP upload client:
//   • Per-host limiter registry bounding concurrent connections and sessions
//   • Identity-file credential loading (OpenSSH private keys)
//   • Client lifecycle: connect → copy/send_file → close
//   • Sink-protocol framing (`Cmode size name\n` + payload + NUL) over
//     an exec'd `scp -t` receiver

pub mod auth;
pub mod client;
pub mod limits;
pub mod sink;
pub mod types;

pub use auth::Credential;
pub use client::ScpClient;
pub use limits::{ConnectionPermit, HostLimits, LimiterRegistry, SessionPermit};
pub use types::{PushRequest, ScpConnectConfig, ScpError, TransferOutcome};
