//! One stateful NNTP connection
//!
//! Wraps a TCP (optionally TLS) socket with a buffered line reader. The
//! connection remembers the last joined group and whether the server rejected
//! authentication, so callers can tell unauthorised apart from transient
//! failures.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::TlsConnector;

use crate::config::ServerConfig;

use super::{LINE_MAX, NntpError, status_class};

type Result<T> = std::result::Result<T, NntpError>;

/// Lifecycle state of a pooled connection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No socket open
    #[default]
    Disconnected,
    /// Greeting read, ready for commands
    Connected,
    /// Cancelled mid-operation; must be disconnected before reuse
    Cancelled,
}

/// Maximum number of authentication challenges answered for a single command
/// before giving up. Defeats servers that loop on `480`.
const AUTH_CHALLENGE_MAX: u32 = 10;

/// A stateful NNTP client bound to one news server
pub struct NntpConnection {
    host: String,
    port: u16,
    tls: bool,
    username: Option<String>,
    password: Option<String>,
    io_timeout: Duration,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    reader: BufReader<Box<dyn AsyncRead + Unpin + Send>>,
    status: ConnectionStatus,
    current_group: Option<String>,
    auth_error: bool,
    bytes_read: u64,
}

impl NntpConnection {
    /// Open a socket to the server, perform the optional TLS handshake, and
    /// read the greeting. Succeeds iff the greeting starts with `2`.
    pub async fn connect(config: &ServerConfig, io_timeout: Duration) -> Result<Self> {
        let addr = (config.host.as_str(), config.port);
        // connect() on a (host, port) pair resolves both address families and
        // tries each resolved address in turn.
        let tcp = timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NntpError::Timeout {
                seconds: io_timeout.as_secs(),
            })?
            .map_err(|e| NntpError::ConnectionFailed {
                host: config.host.clone(),
                port: config.port,
                source: e,
            })?;
        tcp.set_nodelay(true).map_err(NntpError::Io)?;

        let (reader, writer): (
            Box<dyn AsyncRead + Unpin + Send>,
            Box<dyn AsyncWrite + Unpin + Send>,
        ) = if config.encryption {
            let native = native_tls::TlsConnector::builder()
                .build()
                .map_err(|e| NntpError::Tls(e.to_string()))?;
            let connector = Arc::new(TlsConnector::from(native));
            if config.cipher.is_some() {
                // The platform TLS backend selects the cipher suite itself;
                // the preference is carried in config for compatibility.
                tracing::debug!(host = %config.host, "cipher preference ignored by TLS backend");
            }
            let stream = timeout(io_timeout, connector.connect(&config.host, tcp))
                .await
                .map_err(|_| NntpError::Timeout {
                    seconds: io_timeout.as_secs(),
                })?
                .map_err(|e| NntpError::Tls(e.to_string()))?;
            let (read_half, write_half) = tokio::io::split(stream);
            (Box::new(read_half), Box::new(write_half))
        } else {
            let (read_half, write_half) = tokio::io::split(tcp);
            (Box::new(read_half), Box::new(write_half))
        };

        let mut conn = Self {
            host: config.host.clone(),
            port: config.port,
            tls: config.encryption,
            username: config.username.clone(),
            password: config.password.clone(),
            io_timeout,
            writer,
            reader: BufReader::with_capacity(64 * 1024, reader),
            status: ConnectionStatus::Disconnected,
            current_group: None,
            auth_error: false,
            bytes_read: 0,
        };

        let greeting = conn.read_response().await?;
        if status_class(&greeting) != Some(2) {
            return Err(NntpError::Greeting(greeting));
        }
        conn.status = ConnectionStatus::Connected;
        tracing::debug!(host = %conn.host, port = conn.port, tls = conn.tls, "NNTP connected");
        Ok(conn)
    }

    /// Current lifecycle state
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Whether the server rejected our credentials on this connection
    pub fn auth_error(&self) -> bool {
        self.auth_error
    }

    /// Take and reset the raw-byte read counter (for per-server volumes)
    pub fn fetch_bytes_read(&mut self) -> u64 {
        std::mem::take(&mut self.bytes_read)
    }

    /// Send `cmd` and read one response line, answering `480` authentication
    /// challenges by re-issuing the command after `AUTHINFO`.
    pub async fn request(&mut self, cmd: &str) -> Result<String> {
        let mut challenges = 0u32;
        loop {
            self.send_command(cmd).await?;
            let response = self.read_response().await?;
            if !response.starts_with("480") {
                return Ok(response);
            }
            challenges += 1;
            if challenges > AUTH_CHALLENGE_MAX {
                self.auth_error = true;
                return Ok(response);
            }
            if !self.authenticate().await? {
                return Ok(response);
            }
        }
    }

    /// Select a newsgroup, reusing the cached selection when possible.
    ///
    /// If `group` is already joined, a synthesised `211` reply is returned
    /// without any I/O.
    pub async fn join_group(&mut self, group: &str) -> Result<String> {
        if self.current_group.as_deref() == Some(group) {
            return Ok(format!("211 0 0 0 {group}"));
        }
        let response = self.request(&format!("GROUP {group}")).await?;
        if status_class(&response) == Some(2) {
            self.current_group = Some(group.to_string());
        }
        Ok(response)
    }

    /// Read one raw line (terminator included) into `buf`, which is cleared
    /// first. Returns the raw byte count. A line longer than the 10 KiB cap
    /// or an EOF mid-line is a connection-level error.
    pub async fn read_line(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        buf.clear();
        let read = timeout(
            self.io_timeout,
            (&mut self.reader).take(LINE_MAX as u64).read_until(b'\n', buf),
        )
        .await
        .map_err(|_| NntpError::Timeout {
            seconds: self.io_timeout.as_secs(),
        })?
        .map_err(NntpError::Io)?;

        if read == 0 {
            return Err(NntpError::UnexpectedEof);
        }
        if read == LINE_MAX && buf.last() != Some(&b'\n') {
            return Err(NntpError::LineTooLong);
        }
        self.bytes_read += read as u64;
        Ok(read)
    }

    /// Whether a raw line is the article body terminator (a lone `.`)
    pub fn is_body_end(line: &[u8]) -> bool {
        line == b".\r\n" || line == b".\n"
    }

    /// Un-escape a dot-stuffed line: a leading `..` becomes `.`.
    /// Returns the logical line as a subslice.
    pub fn unstuff(line: &[u8]) -> &[u8] {
        if line.starts_with(b"..") { &line[1..] } else { line }
    }

    /// Send `QUIT` if connected, drop the socket, and clear protocol state
    pub async fn disconnect(&mut self) {
        if self.status == ConnectionStatus::Connected {
            // Best-effort courtesy; the peer may already be gone.
            let _ = self.send_command("QUIT").await;
            let mut buf = Vec::new();
            let _ = timeout(Duration::from_secs(2), async {
                let _ = (&mut self.reader)
                    .take(LINE_MAX as u64)
                    .read_until(b'\n', &mut buf)
                    .await;
            })
            .await;
        }
        self.status = ConnectionStatus::Disconnected;
        self.current_group = None;
        tracing::debug!(host = %self.host, "NNTP disconnected");
    }

    /// Mark the connection cancelled so it is torn down instead of pooled
    pub fn cancel(&mut self) {
        self.status = ConnectionStatus::Cancelled;
    }

    async fn authenticate(&mut self) -> Result<bool> {
        let Some(username) = self.username.clone() else {
            self.auth_error = true;
            return Ok(false);
        };
        self.send_command(&format!("AUTHINFO USER {username}")).await?;
        let response = self.read_response().await?;

        if response.starts_with("381") {
            let password = self.password.clone().unwrap_or_default();
            self.send_command(&format!("AUTHINFO PASS {password}")).await?;
            let response = self.read_response().await?;
            if !response.starts_with("281") {
                self.auth_error = true;
                return Ok(false);
            }
        } else if !response.starts_with("281") {
            self.auth_error = true;
            return Ok(false);
        }
        Ok(true)
    }

    async fn send_command(&mut self, cmd: &str) -> Result<()> {
        let op = async {
            self.writer.write_all(cmd.as_bytes()).await?;
            self.writer.write_all(b"\r\n").await?;
            self.writer.flush().await
        };
        timeout(self.io_timeout, op)
            .await
            .map_err(|_| NntpError::Timeout {
                seconds: self.io_timeout.as_secs(),
            })?
            .map_err(NntpError::Io)
    }

    async fn read_response(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        self.read_line(&mut buf).await?;
        while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl std::fmt::Debug for NntpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NntpConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("status", &self.status)
            .field("group", &self.current_group)
            .finish()
    }
}
