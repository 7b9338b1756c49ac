//! NNTP line framing and article reading.
//!
//! RFC 3977-style text protocol: `\r\n`-delimited lines, three-digit status
//! codes, multiline blocks terminated by a lone `.` with leading dots
//! doubled ("dot-stuffing"). Every multiline read is capped by its
//! [`ReadKind`]; exceeding a cap is a protocol error and the caller closes
//! the connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

use crate::article::Article;
use crate::config::{
    LINES_CAP_ARTICLE, LINES_CAP_BODY, LINES_CAP_HEADERS, LINES_CAP_OTHER, MAX_ARTICLE_LINES,
    MAX_HEADER_LINES,
};
use crate::error::{Classify, ErrorClass};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by remote")]
    Closed,

    #[error("Multiline response exceeded {cap} lines")]
    TooLarge { cap: usize },

    #[error("Article exceeds header limit of {0} lines")]
    TooManyHeaders(usize),

    #[error("Article exceeds total limit of {0} lines")]
    TooManyLines(usize),

    #[error("Malformed status line: {0}")]
    BadStatus(String),
}

impl Classify for WireError {
    fn class(&self) -> ErrorClass {
        match self {
            WireError::Io(_) | WireError::Closed => ErrorClass::Transient,
            _ => ErrorClass::Protocol,
        }
    }
}

/// What a multiline read is for; selects the line cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    Article,
    Headers,
    Body,
    Other,
}

impl ReadKind {
    pub fn cap(self) -> usize {
        match self {
            ReadKind::Article => LINES_CAP_ARTICLE,
            ReadKind::Headers => LINES_CAP_HEADERS,
            ReadKind::Body => LINES_CAP_BODY,
            ReadKind::Other => LINES_CAP_OTHER,
        }
    }
}

/// Parsed NNTP status line: 3-digit code plus the rest of the line.
#[derive(Debug, Clone)]
pub struct Status {
    pub code: u16,
    pub text: String,
}

impl Status {
    pub fn parse(line: &str) -> Result<Self, WireError> {
        if line.len() < 3 {
            return Err(WireError::BadStatus(line.to_string()));
        }
        let code = line[..3]
            .parse()
            .map_err(|_| WireError::BadStatus(line.to_string()))?;
        let text = if line.len() > 4 {
            line[4..].to_string()
        } else {
            String::new()
        };
        Ok(Status { code, text })
    }
}

/// Buffered NNTP framing over any async byte stream.
pub struct NntpStream<S> {
    stream: BufStream<S>,
    line_buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> NntpStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
            line_buf: Vec::with_capacity(512),
        }
    }

    /// Read one line, stripping the trailing `\r\n`.
    pub async fn read_line(&mut self) -> Result<String, WireError> {
        self.line_buf.clear();
        loop {
            let byte = match self.stream.read_u8().await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(WireError::Closed)
                }
                Err(e) => return Err(WireError::Io(e)),
            };
            self.line_buf.push(byte);
            if self.line_buf.len() >= 2 && self.line_buf.ends_with(b"\r\n") {
                break;
            }
            // Tolerate bare LF from sloppy peers.
            if byte == b'\n' {
                break;
            }
        }
        let end = if self.line_buf.ends_with(b"\r\n") {
            self.line_buf.len() - 2
        } else if self.line_buf.ends_with(b"\n") {
            self.line_buf.len() - 1
        } else {
            self.line_buf.len()
        };
        Ok(String::from_utf8_lossy(&self.line_buf[..end]).to_string())
    }

    /// Read and parse a status line.
    pub async fn read_status(&mut self) -> Result<Status, WireError> {
        let line = self.read_line().await?;
        Status::parse(&line)
    }

    /// Write one raw line followed by CRLF and flush.
    pub async fn send_line(&mut self, line: &str) -> Result<(), WireError> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send a single-line response: `NNN message`.
    pub async fn send_response(&mut self, code: u16, message: &str) -> Result<(), WireError> {
        self.send_line(&format!("{} {}", code, message)).await
    }

    /// Send a status line followed by a dot-stuffed multiline block.
    pub async fn send_multiline<I, L>(
        &mut self,
        code: u16,
        message: &str,
        lines: I,
    ) -> Result<(), WireError>
    where
        I: IntoIterator<Item = L>,
        L: AsRef<str>,
    {
        self.stream
            .write_all(format!("{} {}\r\n", code, message).as_bytes())
            .await?;
        for line in lines {
            let line = line.as_ref();
            if line.starts_with('.') {
                self.stream.write_all(b".").await?;
            }
            self.stream.write_all(line.as_bytes()).await?;
            self.stream.write_all(b"\r\n").await?;
        }
        self.stream.write_all(b".\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read a multiline block until the lone-dot terminator, unstuffing
    /// leading `..`. Fails once the kind's line cap is exceeded.
    pub async fn read_multiline(&mut self, kind: ReadKind) -> Result<Vec<String>, WireError> {
        let cap = kind.cap();
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "." {
                return Ok(lines);
            }
            if lines.len() >= cap {
                return Err(WireError::TooLarge { cap });
            }
            if let Some(unstuffed) = line.strip_prefix('.') {
                lines.push(unstuffed.to_string());
            } else {
                lines.push(line);
            }
        }
    }

    /// Read a complete article: headers until the blank line, body until
    /// the lone dot. Folds continuation lines, drops `Xref`, and promotes
    /// the routing headers onto the returned `Article`.
    pub async fn read_article(&mut self) -> Result<Article, WireError> {
        let mut article = Article::default();
        let mut bytes: u64 = 0;
        let mut total_lines: usize = 0;
        let mut last_header: Option<String> = None;

        // Header section.
        loop {
            let line = self.read_line().await?;
            bytes += line.len() as u64 + 2;
            let line = if let Some(unstuffed) = line.strip_prefix('.') {
                if unstuffed.is_empty() {
                    // Lone dot inside headers: truncated article.
                    return Err(WireError::BadStatus("article ended in headers".into()));
                }
                unstuffed.to_string()
            } else {
                line
            };
            if line.is_empty() {
                break;
            }
            total_lines += 1;
            if article.head_lines.len() >= MAX_HEADER_LINES {
                return Err(WireError::TooManyHeaders(MAX_HEADER_LINES));
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                // Continuation of the previous header.
                if let Some(name) = &last_header {
                    if let Some(values) = article.headers.get_mut(name) {
                        if let Some(value) = values.last_mut() {
                            value.push(' ');
                            value.push_str(line.trim());
                        }
                    }
                    article.head_lines.push(line);
                }
                continue;
            }

            let Some((name, value)) = line.split_once(':') else {
                // Not a header; ignore the line but keep it for retransmit.
                article.head_lines.push(line);
                last_header = None;
                continue;
            };
            let key = name.trim().to_ascii_lowercase();
            if key == "xref" {
                last_header = None;
                continue;
            }
            article
                .headers
                .entry(key.clone())
                .or_insert_with(Vec::new)
                .push(value.trim().to_string());
            article.head_lines.push(line.clone());
            last_header = Some(key);
        }

        // Body section.
        loop {
            let line = self.read_line().await?;
            bytes += line.len() as u64 + 2;
            if line == "." {
                break;
            }
            total_lines += 1;
            if total_lines > MAX_ARTICLE_LINES {
                return Err(WireError::TooManyLines(MAX_ARTICLE_LINES));
            }
            if let Some(unstuffed) = line.strip_prefix('.') {
                article.body_lines.push(unstuffed.to_string());
            } else {
                article.body_lines.push(line);
            }
        }

        article.bytes = bytes;
        article.lines = article.body_lines.len() as u64;
        article.promote_headers();
        Ok(article)
    }

    /// Send the raw lines of an article section with dot-stuffing but no
    /// status line (the caller has already sent it).
    pub async fn send_lines_and_terminate<I, L>(&mut self, lines: I) -> Result<(), WireError>
    where
        I: IntoIterator<Item = L>,
        L: AsRef<str>,
    {
        for line in lines {
            let line = line.as_ref();
            if line.starts_with('.') {
                self.stream.write_all(b".").await?;
            }
            self.stream.write_all(line.as_bytes()).await?;
            self.stream.write_all(b"\r\n").await?;
        }
        self.stream.write_all(b".\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shut the underlying stream down.
    pub async fn shutdown(&mut self) -> Result<(), WireError> {
        self.stream.get_mut().shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (NntpStream<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(1 << 20);
        (NntpStream::new(a), b)
    }

    async fn feed(remote: &mut tokio::io::DuplexStream, text: &str) {
        remote.write_all(text.as_bytes()).await.unwrap();
    }

    // =============================================================================
    // Line framing
    // =============================================================================

    #[tokio::test]
    async fn test_read_line_strips_crlf() {
        let (mut wire, mut remote) = pair().await;
        feed(&mut remote, "200 hello\r\n").await;
        assert_eq!(wire.read_line().await.unwrap(), "200 hello");
    }

    #[tokio::test]
    async fn test_read_status_parses_code() {
        let (mut wire, mut remote) = pair().await;
        feed(&mut remote, "430 no such article\r\n").await;
        let status = wire.read_status().await.unwrap();
        assert_eq!(status.code, 430);
        assert_eq!(status.text, "no such article");
    }

    #[tokio::test]
    async fn test_eof_maps_to_closed() {
        let (mut wire, remote) = pair().await;
        drop(remote);
        assert!(matches!(wire.read_line().await, Err(WireError::Closed)));
    }

    // =============================================================================
    // Multiline + dot-stuffing
    // =============================================================================

    #[tokio::test]
    async fn test_multiline_round_trip_with_dot_stuffing() {
        let (mut wire, remote) = pair().await;
        let mut remote_wire = NntpStream::new(remote);

        let lines = vec![".leading dot", "plain", "..double", ""];
        wire.send_multiline(220, "article follows", lines.clone())
            .await
            .unwrap();

        let status = remote_wire.read_status().await.unwrap();
        assert_eq!(status.code, 220);
        let got = remote_wire.read_multiline(ReadKind::Other).await.unwrap();
        assert_eq!(got, lines);
    }

    #[tokio::test]
    async fn test_multiline_cap_enforced() {
        let (mut wire, mut remote) = pair().await;
        // HEADERS cap is 1024; feed 1025 lines without a terminator.
        let mut text = String::new();
        for i in 0..1025 {
            text.push_str(&format!("line {}\r\n", i));
        }
        feed(&mut remote, &text).await;
        let err = wire.read_multiline(ReadKind::Headers).await.unwrap_err();
        assert!(matches!(err, WireError::TooLarge { cap: 1024 }));
    }

    // =============================================================================
    // Article reading
    // =============================================================================

    fn sample_article_text() -> &'static str {
        "Message-ID: <a@example.org>\r\n\
         Newsgroups: comp.lang.rust,alt.test\r\n\
         Subject: folded\r\n\
         \tsubject line\r\n\
         From: alice <alice@example.org>\r\n\
         Xref: news.example.org comp.lang.rust:1\r\n\
         Date: Mon, 01 Jan 2024 10:00:00 +0000\r\n\
         \r\n\
         body one\r\n\
         ..stuffed\r\n\
         body two\r\n\
         .\r\n"
    }

    #[tokio::test]
    async fn test_read_article_promotes_and_unstuffs() {
        let (mut wire, mut remote) = pair().await;
        feed(&mut remote, sample_article_text()).await;

        let article = wire.read_article().await.unwrap();
        assert_eq!(article.message_id, "<a@example.org>");
        assert_eq!(article.newsgroups, vec!["comp.lang.rust", "alt.test"]);
        assert_eq!(article.subject, "folded subject line");
        assert_eq!(article.from, "alice <alice@example.org>");
        // Xref is dropped entirely.
        assert!(article.header("xref").is_none());
        assert_eq!(article.body_lines, vec!["body one", ".stuffed", "body two"]);
        assert_eq!(article.lines, 3);
        assert!(article.is_thread_root);
    }

    #[tokio::test]
    async fn test_read_article_line_limit() {
        let (mut wire, mut remote) = pair().await;
        let mut text = String::from("Message-ID: <big@x>\r\n\r\n");
        for _ in 0..16385 {
            text.push_str("x\r\n");
        }
        text.push_str(".\r\n");
        feed(&mut remote, &text).await;
        let err = wire.read_article().await.unwrap_err();
        assert!(matches!(err, WireError::TooManyLines(_)));
    }

    #[tokio::test]
    async fn test_send_response_format() {
        let (mut wire, remote) = pair().await;
        let mut remote_wire = NntpStream::new(remote);
        wire.send_response(205, "closing connection").await.unwrap();
        assert_eq!(
            remote_wire.read_line().await.unwrap(),
            "205 closing connection"
        );
    }

}
