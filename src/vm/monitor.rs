//! Text command channel to the emulator's monitor socket.
//!
//! The emulator listens on a Unix socket (`-monitor unix:<path>,server,nowait`)
//! and speaks a line-oriented human monitor protocol:
//!
//! ```text
//! <- QEMU 8.2.0 monitor - type 'help' for more information
//! <- (qemu)
//! -> info status
//! <- info status
//! <- VM status: running
//! <- (qemu)
//! ```
//!
//! Every [`ControlChannel::send`] opens a fresh connection, sends exactly one
//! command line and closes the connection once the reply prompt arrives, so
//! concurrent callers never share a session.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{Instant, timeout};
use tracing::debug;

/// Prompt printed by the monitor when it is ready for the next command.
pub const MONITOR_PROMPT: &str = "(qemu) ";

/// Upper bound on a single reply.
const MAX_REPLY_BYTES: usize = 1_048_576;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A command understood by the emulator monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Quit,
    Reset,
    Pause,
    Resume,
    Status,
    /// Write the guest framebuffer to a PPM file on the host.
    Screendump(PathBuf),
    /// Pass a host USB device through to the guest.
    UsbAttach { vendor_id: String, product_id: String },
    UsbDetach { vendor_id: String, product_id: String },
}

impl ControlCommand {
    /// The monitor line for this command, without the trailing newline.
    ///
    /// Fails for arguments that could smuggle a second command onto the line.
    pub fn to_line(&self) -> Result<String, ChannelError> {
        Ok(match self {
            ControlCommand::Quit => "quit".to_string(),
            ControlCommand::Reset => "system_reset".to_string(),
            ControlCommand::Pause => "stop".to_string(),
            ControlCommand::Resume => "cont".to_string(),
            ControlCommand::Status => "info status".to_string(),
            ControlCommand::Screendump(path) => {
                let path = path.to_str().filter(|p| !p.contains(['\n', '\r'])).ok_or_else(|| {
                    ChannelError::InvalidArgument(format!("screendump path {}", path.display()))
                })?;
                format!("screendump {path}")
            }
            ControlCommand::UsbAttach {
                vendor_id,
                product_id,
            } => {
                check_usb_id(vendor_id)?;
                check_usb_id(product_id)?;
                format!(
                    "device_add usb-host,vendorid=0x{vendor_id},productid=0x{product_id},id={}",
                    usb_device_id(vendor_id, product_id)
                )
            }
            ControlCommand::UsbDetach {
                vendor_id,
                product_id,
            } => {
                check_usb_id(vendor_id)?;
                check_usb_id(product_id)?;
                format!("device_del {}", usb_device_id(vendor_id, product_id))
            }
        })
    }

    /// Short name used in logs and API payloads.
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::Quit => "quit",
            ControlCommand::Reset => "reset",
            ControlCommand::Pause => "pause",
            ControlCommand::Resume => "resume",
            ControlCommand::Status => "status",
            ControlCommand::Screendump(_) => "screendump",
            ControlCommand::UsbAttach { .. } => "usb-attach",
            ControlCommand::UsbDetach { .. } => "usb-detach",
        }
    }
}

fn usb_device_id(vendor_id: &str, product_id: &str) -> String {
    format!("usbdev_{vendor_id}_{product_id}")
}

fn check_usb_id(id: &str) -> Result<(), ChannelError> {
    if id.len() == 4 && id.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ChannelError::InvalidArgument(format!("usb id {id:?}")))
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Nothing is listening on the endpoint; the instance is not running.
    #[error("monitor endpoint {0} unreachable")]
    Unreachable(PathBuf),

    #[error("monitor did not answer within {0:?}")]
    Timeout(Duration),

    /// The caller addressed an instance that has since been replaced.
    #[error("instance generation {expected} is stale (current: {current:?})")]
    Stale { expected: u64, current: Option<u64> },

    #[error("invalid command argument: {0}")]
    InvalidArgument(String),

    #[error("monitor i/o: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Connection parameters for one monitor endpoint.
#[derive(Debug, Clone)]
pub struct ControlChannel {
    endpoint: PathBuf,
    timeout: Duration,
}

impl ControlChannel {
    pub fn new(endpoint: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    async fn connect(&self) -> Result<UnixStream, ChannelError> {
        match UnixStream::connect(&self.endpoint).await {
            Ok(stream) => Ok(stream),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                ) =>
            {
                Err(ChannelError::Unreachable(self.endpoint.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns `true` when the endpoint accepts a connection.
    pub async fn probe(&self) -> bool {
        self.connect().await.is_ok()
    }

    /// Send one command and return the cleaned-up reply text.
    pub async fn send(&self, command: &ControlCommand) -> Result<String, ChannelError> {
        let line = command.to_line()?;
        let mut stream = self.connect().await?;

        let exchange = async {
            // Banner, up to the first prompt.
            read_until_prompt(&mut stream).await?;

            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await?;

            let raw = read_until_prompt(&mut stream).await?;
            Ok::<_, ChannelError>(raw)
        };

        let raw = match timeout(self.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => return Err(ChannelError::Timeout(self.timeout)),
        };

        let reply = clean_reply(&raw, &line);
        debug!(
            endpoint = %self.endpoint.display(),
            command = command.name(),
            reply_bytes = reply.len(),
            "monitor command sent"
        );
        Ok(reply)
    }
}

/// Read until the monitor prompt terminates the buffer, or EOF.
async fn read_until_prompt(stream: &mut UnixStream) -> Result<String, ChannelError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(text) = before_prompt(&buf) {
            return Ok(text);
        }
        if buf.len() > MAX_REPLY_BYTES {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "monitor reply exceeds 1 MiB",
            )));
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// The buffer's text minus a trailing prompt, if the prompt (possibly
/// followed by escape sequences) ends it.
fn before_prompt(buf: &[u8]) -> Option<String> {
    let text = strip_escapes(&String::from_utf8_lossy(buf));
    text.strip_suffix(MONITOR_PROMPT).map(str::to_string)
}

/// Strip terminal escape sequences, carriage returns and the echoed command.
pub fn clean_reply(raw: &str, sent: &str) -> String {
    let text = strip_escapes(raw).replace('\r', "");
    let mut lines: Vec<&str> = text.lines().collect();
    if lines.first().is_some_and(|l| l.trim() == sent) {
        lines.remove(0);
    }
    lines.join("\n").trim().to_string()
}

fn strip_escapes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'[') {
            chars.next();
            // CSI: parameters up to a final byte in '@'..='~'.
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        }
    }
    out
}

/// Wait until `path` exists and is non-empty, polling every 50 ms up to
/// `bound`. Returns `false` if it never appeared.
///
/// The emulator writes screendumps asynchronously after acknowledging the
/// command; this wait is best-effort.
pub async fn wait_for_file(path: &Path, bound: Duration) -> bool {
    let deadline = Instant::now() + bound;
    loop {
        if let Ok(meta) = tokio::fs::metadata(path).await {
            if meta.len() > 0 {
                return true;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixListener;

    #[test]
    fn command_lines() {
        assert_eq!(ControlCommand::Quit.to_line().unwrap(), "quit");
        assert_eq!(ControlCommand::Reset.to_line().unwrap(), "system_reset");
        assert_eq!(ControlCommand::Pause.to_line().unwrap(), "stop");
        assert_eq!(ControlCommand::Resume.to_line().unwrap(), "cont");
        assert_eq!(ControlCommand::Status.to_line().unwrap(), "info status");
        assert_eq!(
            ControlCommand::Screendump("/tmp/s.ppm".into()).to_line().unwrap(),
            "screendump /tmp/s.ppm"
        );
    }

    #[test]
    fn usb_commands_validate_ids() {
        let attach = ControlCommand::UsbAttach {
            vendor_id: "0a5c".into(),
            product_id: "4500".into(),
        };
        assert_eq!(
            attach.to_line().unwrap(),
            "device_add usb-host,vendorid=0x0a5c,productid=0x4500,id=usbdev_0a5c_4500"
        );

        let injected = ControlCommand::UsbDetach {
            vendor_id: "0a5c\nquit".into(),
            product_id: "4500".into(),
        };
        assert!(matches!(
            injected.to_line(),
            Err(ChannelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn screendump_path_with_newline_is_rejected() {
        let cmd = ControlCommand::Screendump("/tmp/a\nquit".into());
        assert!(cmd.to_line().is_err());
    }

    #[test]
    fn clean_reply_strips_echo_and_escapes() {
        let raw = "info status\r\n\u{1b}[KVM status: running\r\n";
        assert_eq!(clean_reply(raw, "info status"), "VM status: running");
    }

    #[test]
    fn clean_reply_keeps_multiline_output() {
        let raw = "info status\nline one\nline two\n";
        assert_eq!(clean_reply(raw, "info status"), "line one\nline two");
    }

    #[tokio::test]
    async fn send_to_missing_socket_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ControlChannel::new(dir.path().join("none.sock"), Duration::from_secs(1));
        assert!(!channel.probe().await);
        assert!(matches!(
            channel.send(&ControlCommand::Status).await,
            Err(ChannelError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn send_round_trips_against_fake_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            write
                .write_all(b"QEMU 8.2.0 monitor - type 'help' for more information\r\n(qemu) ")
                .await
                .unwrap();
            let mut lines = BufReader::new(read).lines();
            let cmd = lines.next_line().await.unwrap().unwrap();
            let reply = format!("{cmd}\r\nVM status: paused\r\n(qemu) ");
            write.write_all(reply.as_bytes()).await.unwrap();
            cmd
        });

        let channel = ControlChannel::new(&path, Duration::from_secs(2));
        let reply = channel.send(&ControlCommand::Status).await.unwrap();
        assert_eq!(reply, "VM status: paused");
        assert_eq!(server.await.unwrap(), "info status");
    }

    #[tokio::test]
    async fn silent_monitor_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let channel = ControlChannel::new(&path, Duration::from_millis(200));
        assert!(matches!(
            channel.send(&ControlCommand::Status).await,
            Err(ChannelError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn wait_for_file_sees_late_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.ppm");
        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::fs::write(writer_path, b"P6\n1 1\n255\n\0\0\0").await.unwrap();
        });
        assert!(wait_for_file(&path, Duration::from_secs(1)).await);
        assert!(!wait_for_file(&dir.path().join("never.ppm"), Duration::from_millis(100)).await);
    }
}
