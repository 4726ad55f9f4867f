//! Shared test fixtures: an in-process NNTP server with scriptable
//! per-article behaviour, plus yEnc article builders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// What the mock returns for one message id
#[derive(Clone)]
pub enum ArticleReply {
    /// `220` followed by the given payload (headers + body + terminator)
    Serve(Vec<u8>),
    /// `430 no such article`
    NotFound,
    /// A verbatim status line (e.g. `400 server unavailable`)
    Status(String),
    /// Send the `220` line and the headers, then stall until the peer
    /// disconnects
    Stall,
}

/// Scriptable behaviour, mutable while the server runs
#[derive(Default)]
pub struct Behavior {
    /// Replies per message id (with angle brackets)
    pub articles: HashMap<String, ArticleReply>,
    /// Consume one entry per ARTICLE request before the scripted reply is
    /// used; lets a server stall once and then serve normally.
    pub reply_overrides: Vec<ArticleReply>,
}

/// An in-process NNTP peer on a local TCP port
pub struct MockNntpServer {
    /// Bound port
    pub port: u16,
    article_requests: Arc<AtomicU32>,
}

impl MockNntpServer {
    /// Start the server with the given behaviour
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let port = listener.local_addr().expect("local addr").port();
        let behavior = Arc::new(Mutex::new(behavior));
        let article_requests = Arc::new(AtomicU32::new(0));

        let loop_requests = article_requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let behavior = behavior.clone();
                let requests = loop_requests.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(socket, behavior, requests).await;
                });
            }
        });

        Self {
            port,
            article_requests,
        }
    }

    /// Total ARTICLE requests seen so far
    pub fn article_requests(&self) -> u32 {
        self.article_requests.load(Ordering::Relaxed)
    }
}

async fn serve_connection(
    socket: tokio::net::TcpStream,
    behavior: Arc<Mutex<Behavior>>,
    requests: Arc<AtomicU32>,
) -> std::io::Result<()> {
    let (read_half, mut writer) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    writer.write_all(b"200 mock news server ready\r\n").await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end();

        if command.starts_with("AUTHINFO USER") {
            writer.write_all(b"381 password required\r\n").await?;
        } else if command.starts_with("AUTHINFO PASS") {
            writer.write_all(b"281 authentication accepted\r\n").await?;
        } else if let Some(group) = command.strip_prefix("GROUP ") {
            writer
                .write_all(format!("211 10 1 10 {group}\r\n").as_bytes())
                .await?;
        } else if let Some(message_id) = command.strip_prefix("ARTICLE ") {
            requests.fetch_add(1, Ordering::Relaxed);
            let reply = {
                let mut behavior = behavior.lock().expect("behavior lock");
                if behavior.reply_overrides.is_empty() {
                    behavior.articles.get(message_id).cloned()
                } else {
                    Some(behavior.reply_overrides.remove(0))
                }
            };
            match reply {
                Some(ArticleReply::Serve(payload)) => {
                    writer
                        .write_all(format!("220 0 {message_id} article follows\r\n").as_bytes())
                        .await?;
                    writer.write_all(&payload).await?;
                }
                Some(ArticleReply::Status(status)) => {
                    writer.write_all(format!("{status}\r\n").as_bytes()).await?;
                }
                Some(ArticleReply::Stall) => {
                    writer
                        .write_all(
                            format!(
                                "220 0 {message_id} article follows\r\nMessage-ID: {message_id}\r\n"
                            )
                            .as_bytes(),
                        )
                        .await?;
                    // Hold the connection open without further bytes; the
                    // client's hang reaper has to deal with us.
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    return Ok(());
                }
                Some(ArticleReply::NotFound) | None => {
                    writer.write_all(b"430 no such article\r\n").await?;
                }
            }
        } else if command == "QUIT" {
            writer.write_all(b"205 goodbye\r\n").await?;
            return Ok(());
        } else {
            writer.write_all(b"500 command not recognized\r\n").await?;
        }
    }
}

/// yEnc-encode `data` into wire lines (CRLF, escaping per the yEnc rules)
fn yenc_encode_lines(data: &[u8], line_length: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut line_pos = 0;
    for &byte in data {
        let encoded = byte.wrapping_add(42);
        if matches!(encoded, 0x00 | 0x0A | 0x0D | 0x3D) {
            out.push(b'=');
            out.push(encoded.wrapping_add(64));
            line_pos += 2;
        } else {
            out.push(encoded);
            line_pos += 1;
        }
        if line_pos >= line_length {
            out.extend_from_slice(b"\r\n");
            line_pos = 0;
        }
    }
    if line_pos > 0 {
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Build a complete single-part article payload: headers, blank line, yEnc
/// body and the dot terminator.
pub fn single_part_article(message_id: &str, filename: &str, data: &[u8]) -> Vec<u8> {
    article_with_crc(message_id, filename, data, crc32fast::hash(data))
}

/// Like [`single_part_article`] but with an explicit (possibly wrong)
/// trailer CRC.
pub fn article_with_crc(message_id: &str, filename: &str, data: &[u8], crc: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(format!("Message-ID: {message_id}\r\n").as_bytes());
    payload.extend_from_slice(b"Subject: test article\r\n\r\n");
    payload.extend_from_slice(
        format!("=ybegin line=128 size={} name={filename}\r\n", data.len()).as_bytes(),
    );
    payload.extend_from_slice(&yenc_encode_lines(data, 128));
    payload.extend_from_slice(format!("=yend size={} crc32={crc:08x}\r\n", data.len()).as_bytes());
    payload.extend_from_slice(b".\r\n");
    payload
}

/// Build one part of a multi-part yEnc article. `begin` is the 1-based
/// offset of `data` within the whole file of `total_size` bytes.
pub fn multi_part_article(
    message_id: &str,
    filename: &str,
    part: u32,
    begin: u64,
    total_size: u64,
    data: &[u8],
) -> Vec<u8> {
    let end = begin + data.len() as u64 - 1;
    let crc = crc32fast::hash(data);
    let mut payload = Vec::new();
    payload.extend_from_slice(format!("Message-ID: {message_id}\r\n").as_bytes());
    payload.extend_from_slice(b"Subject: test article\r\n\r\n");
    payload.extend_from_slice(
        format!("=ybegin part={part} line=128 size={total_size} name={filename}\r\n").as_bytes(),
    );
    payload.extend_from_slice(format!("=ypart begin={begin} end={end}\r\n").as_bytes());
    payload.extend_from_slice(&yenc_encode_lines(data, 128));
    payload.extend_from_slice(
        format!(
            "=yend size={} part={part} pcrc32={crc:08x}\r\n",
            data.len()
        )
        .as_bytes(),
    );
    payload.extend_from_slice(b".\r\n");
    payload
}

/// An NZB manifest for one file made of the given segments
pub fn nzb_manifest(name: &str, segments: &[(u32, u64, &str)]) -> Vec<u8> {
    let mut xml = String::from("<nzb>\n");
    xml.push_str(&format!(
        "  <file date=\"1400000000\" subject=\"{name} [1/1] - &quot;{name}&quot; yEnc (1/{})\">\n",
        segments.len()
    ));
    xml.push_str("    <groups><group>alt.binaries.test</group></groups>\n    <segments>\n");
    for (number, bytes, message_id) in segments {
        let id = message_id.trim_matches(['<', '>']);
        xml.push_str(&format!(
            "      <segment bytes=\"{bytes}\" number=\"{number}\">{id}</segment>\n"
        ));
    }
    xml.push_str("    </segments>\n  </file>\n</nzb>\n");
    xml.into_bytes()
}

/// Poll until `check` returns true or the timeout elapses
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
