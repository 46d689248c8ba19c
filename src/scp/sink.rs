// ── Transfer session & sink protocol ─────────────────────────────────────────
//
// Wire contract produced here, byte for byte:
//
//   C<octal mode> <decimal size> <file name>\n
//   <size raw payload bytes>
//   \x00
//
// written to the stdin of a remote `scp -t <dir>` receiver. The receiver
// consumes bytes as they arrive, so the frame write runs concurrently with
// remote execution; libssh2's channel gives natural backpressure if the
// remote stalls.

use crate::scp::client::ScpClient;
use crate::scp::limits::SessionPermit;
use crate::scp::types::{PushRequest, ScpError, TransferOutcome};
use log::{debug, info};
use std::io::{self, Read, Write};
use std::time::Instant;

/// Remote receiver program, in sink ("to") mode. Kept as a single constant so
/// protocol compatibility is reviewable in one place.
pub(crate) const SINK_COMMAND: &str = "scp -t";

/// Full receiver invocation for a destination directory.
pub(crate) fn sink_command(destination: &str) -> String {
    format!("{} {}", SINK_COMMAND, shell_escape(destination))
}

/// Single-quote a path for the remote shell.
pub(crate) fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

// Go `%#o` semantics: a leading zero, then the natural octal digits.
fn octal_mode(mode: u32) -> String {
    if mode == 0 {
        "0".to_string()
    } else {
        format!("0{:o}", mode)
    }
}

/// The protocol header line for one file.
pub(crate) fn sink_header(mode: u32, size: u64, file_name: &str) -> String {
    format!("C{} {} {}\n", octal_mode(mode), size, file_name)
}

/// The header line is delimiter-framed, so the name must not be able to
/// break it. Names are plain basenames; path separators are rejected too.
pub(crate) fn validate_file_name(name: &str) -> Result<(), ScpError> {
    if name.is_empty() {
        return Err(ScpError::Protocol("file name is empty".to_string()));
    }
    if name.contains('/') {
        return Err(ScpError::Protocol(format!(
            "file name '{}' must not contain '/'",
            name
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(ScpError::Protocol(format!(
            "file name {:?} contains control characters",
            name
        )));
    }
    Ok(())
}

/// Write one complete sink frame: header, exactly `request.size` payload
/// bytes from `reader`, then the NUL terminator. A source that ends short of
/// the declared size aborts the frame; extra bytes are never read.
pub(crate) fn write_frame<W: Write, R: Read>(
    writer: &mut W,
    request: &PushRequest,
    reader: R,
) -> Result<u64, ScpError> {
    let header = sink_header(request.mode, request.size, &request.file_name);
    writer
        .write_all(header.as_bytes())
        .map_err(|e| ScpError::Stream(format!("failed to write header: {}", e)))?;

    let mut limited = reader.take(request.size);
    let copied = io::copy(&mut limited, writer)
        .map_err(|e| ScpError::Stream(format!("failed to stream payload: {}", e)))?;
    if copied != request.size {
        return Err(ScpError::Protocol(format!(
            "source for '{}' ended after {} of {} declared bytes",
            request.file_name, copied, request.size
        )));
    }

    writer
        .write_all(b"\x00")
        .map_err(|e| ScpError::Stream(format!("failed to write terminator: {}", e)))?;
    writer
        .flush()
        .map_err(|e| ScpError::Stream(format!("failed to flush sink stream: {}", e)))?;
    Ok(copied)
}

/// Pull a readable message out of the sink's status output. The receiver
/// reports problems as a `\x01` (error) or `\x02` (fatal) byte followed by a
/// single text line.
pub(crate) fn sink_error_message(output: &str) -> Option<&str> {
    let idx = output.find(['\u{1}', '\u{2}'])?;
    let message = output[idx + 1..].lines().next()?.trim();
    if message.is_empty() {
        None
    } else {
        Some(message)
    }
}

/// Map the receiver's exit status and drained output to a transfer result.
/// A sink-framed message wins over raw stderr; a bare non-zero status still
/// gets a stable fallback text.
pub(crate) fn receiver_result(
    status: i32,
    remote_output: &str,
    remote_stderr: &str,
) -> Result<(), ScpError> {
    if status == 0 {
        return Ok(());
    }
    let message = sink_error_message(remote_output)
        .map(str::to_string)
        .or_else(|| {
            let trimmed = remote_stderr.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .unwrap_or_else(|| "remote receiver reported failure".to_string());
    Err(ScpError::RemoteCommand { status, message })
}

/// Conclude a transfer whose stream is fully written: free the session slot,
/// then collect the receiver's verdict. The slot covers active transmission
/// only, so it is released before `verdict` runs — a receiver failure is
/// observed with the slot already back in the pool.
pub(crate) fn finish_session<F>(slot: SessionPermit, verdict: F) -> Result<(), ScpError>
where
    F: FnOnce() -> Result<(i32, String, String), ScpError>,
{
    drop(slot);
    let (status, remote_output, remote_stderr) = verdict()?;
    receiver_result(status, &remote_output, &remote_stderr)
}

impl ScpClient {
    /// Upload one frame from an arbitrary reader.
    ///
    /// Blocks on a free session slot, runs the remote receiver against
    /// `request.destination`, streams the frame, releases the slot once the
    /// stream is fully written, then waits for the receiver's exit status.
    pub async fn copy<R: Read>(
        &self,
        request: PushRequest,
        reader: R,
    ) -> Result<TransferOutcome, ScpError> {
        validate_file_name(&request.file_name)?;

        let started = Instant::now();
        let slot = self.limits().acquire_session().await;

        if request.create_dirs {
            self.remote_mkdir_p(&request.destination)?;
        }

        let mut channel = self
            .session()
            .channel_session()
            .map_err(|e| ScpError::SessionOpen {
                host: self.host().to_string(),
                reason: e.to_string(),
            })?;

        let command = sink_command(&request.destination);
        debug!("starting receiver on {}: {}", self.host(), command);
        channel.exec(&command).map_err(|e| ScpError::RemoteCommand {
            status: -1,
            message: format!("failed to start '{}': {}", command, e),
        })?;

        let bytes_sent = write_frame(&mut channel, &request, reader)?;
        channel
            .send_eof()
            .map_err(|e| ScpError::Stream(format!("failed to send EOF: {}", e)))?;

        finish_session(slot, || {
            let mut remote_output = String::new();
            let _ = channel.read_to_string(&mut remote_output);
            let mut remote_stderr = String::new();
            let _ = channel.stderr().read_to_string(&mut remote_stderr);

            channel.wait_eof().ok();
            channel.close().ok();
            channel
                .wait_close()
                .map_err(|e| ScpError::Stream(format!("failed waiting for receiver: {}", e)))?;

            let status = channel
                .exit_status()
                .map_err(|e| ScpError::Stream(format!("failed to read exit status: {}", e)))?;
            Ok((status, remote_output, remote_stderr))
        })?;

        let outcome = TransferOutcome {
            bytes_sent,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "sent '{}' ({} bytes) to {}:{} in {} ms",
            request.file_name, bytes_sent, self.host(), request.destination, outcome.duration_ms
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, size: u64, mode: u32) -> PushRequest {
        PushRequest {
            file_name: name.to_string(),
            size,
            mode,
            destination: "/tmp".to_string(),
            create_dirs: false,
        }
    }

    #[test]
    fn test_golden_frame() {
        let mut out = Vec::new();
        let sent = write_frame(&mut out, &request("a.txt", 5, 0o644), &b"hello"[..]).unwrap();
        assert_eq!(sent, 5);
        assert_eq!(out, b"C0644 5 a.txt\nhello\x00");
    }

    #[test]
    fn test_header_formatting() {
        assert_eq!(sink_header(0o644, 5, "a.txt"), "C0644 5 a.txt\n");
        assert_eq!(sink_header(0o755, 1234, "run.sh"), "C0755 1234 run.sh\n");
        assert_eq!(sink_header(0, 0, "empty"), "C0 0 empty\n");
    }

    #[test]
    fn test_short_source_aborts_frame() {
        let mut out = Vec::new();
        let err = write_frame(&mut out, &request("a.txt", 5, 0o644), &b"hel"[..]).unwrap_err();
        assert!(matches!(err, ScpError::Protocol(_)));
    }

    #[test]
    fn test_long_source_truncates_at_declared_size() {
        let mut out = Vec::new();
        let sent =
            write_frame(&mut out, &request("a.txt", 5, 0o644), &b"hello world"[..]).unwrap();
        assert_eq!(sent, 5);
        assert_eq!(out, b"C0644 5 a.txt\nhello\x00");
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut out = Vec::new();
        let sent = write_frame(&mut out, &request("empty", 0, 0o600), &b""[..]).unwrap();
        assert_eq!(sent, 0);
        assert_eq!(out, b"C0600 0 empty\n\x00");
    }

    #[test]
    fn test_file_name_validation() {
        assert!(validate_file_name("a.txt").is_ok());
        assert!(validate_file_name("with space.txt").is_ok());
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("dir/a.txt").is_err());
        assert!(validate_file_name("a\ntxt").is_err());
        assert!(validate_file_name("a\x00txt").is_err());
        assert!(validate_file_name("tab\there").is_err());
    }

    #[test]
    fn test_sink_command() {
        assert_eq!(sink_command("/srv/releases"), "scp -t '/srv/releases'");
        assert_eq!(sink_command("/tmp/my dir"), "scp -t '/tmp/my dir'");
        assert_eq!(sink_command("it's"), "scp -t 'it'\\''s'");
    }

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("/plain/path"), "'/plain/path'");
        assert_eq!(shell_escape("$HOME"), "'$HOME'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_receiver_result_success() {
        assert!(receiver_result(0, "\u{0}\u{0}", "").is_ok());
    }

    #[test]
    fn test_receiver_result_prefers_sink_framed_message() {
        let err =
            receiver_result(1, "\u{0}\u{1}scp: /srv: Permission denied\n", "noise").unwrap_err();
        match err {
            ScpError::RemoteCommand { status, message } => {
                assert_eq!(status, 1);
                assert_eq!(message, "scp: /srv: Permission denied");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_receiver_result_falls_back_to_stderr() {
        let err = receiver_result(127, "", "sh: scp: not found\n").unwrap_err();
        match err {
            ScpError::RemoteCommand { status, message } => {
                assert_eq!(status, 127);
                assert_eq!(message, "sh: scp: not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_receiver_result_without_any_message() {
        let err = receiver_result(1, "", "  ").unwrap_err();
        match err {
            ScpError::RemoteCommand { message, .. } => {
                assert_eq!(message, "remote receiver reported failure");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_session_slot_freed_before_receiver_verdict() {
        use crate::scp::limits::LimiterRegistry;

        let registry = LimiterRegistry::new();
        registry.register("build1", 1, 1);
        let limits = registry.limits("build1").unwrap();

        let slot = limits.acquire_session().await;
        assert_eq!(limits.available_sessions(), 0);

        let seen = limits.clone();
        let err = finish_session(slot, move || {
            // The slot is back in the pool while the receiver's verdict is
            // still pending.
            assert_eq!(seen.available_sessions(), 1);
            Ok((1, "\u{1}scp: denied\n".to_string(), String::new()))
        })
        .unwrap_err();

        match err {
            ScpError::RemoteCommand { status, message } => {
                assert_eq!(status, 1);
                assert_eq!(message, "scp: denied");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(limits.available_sessions(), 1);
    }

    #[test]
    fn test_sink_error_message() {
        assert_eq!(
            sink_error_message("\u{1}scp: /srv: No such file or directory\n"),
            Some("scp: /srv: No such file or directory")
        );
        assert_eq!(
            sink_error_message("\u{0}\u{2}lost connection\n"),
            Some("lost connection")
        );
        assert_eq!(sink_error_message("\u{0}\u{0}"), None);
        assert_eq!(sink_error_message(""), None);
    }
}
