//! One outbound NNTP session.
//!
//! A `ClientConnection` owns a single TCP, TLS or SOCKS-tunneled stream and
//! issues commands strictly sequentially (`&mut self` serializes callers;
//! the pool hands a connection to one task at a time). Status codes are
//! interpreted through a fixed table into typed errors so callers can
//! distinguish "no such article" from transport failure.
//!
//! Connection strategy mirrors the provider config: TLS when asked,
//! SOCKS5 when configured, and `.onion` hosts always dial through SOCKS.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::active::{ActiveEntry, ActiveFile};
use crate::article::{Article, OverviewRow};
use crate::config::{ProviderConfig, MAX_XOVER_BATCH};
use crate::error::{Classify, ErrorClass};

use super::wire::{NntpStream, ReadKind, Status, WireError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Article not found")]
    ArticleNotFound,

    #[error("Article removed")]
    ArticleRemoved,

    #[error("No such group: {0}")]
    NoSuchGroup(String),

    #[error("Article number out of range")]
    OutOfRange,

    #[error("Authentication failed with code {0}")]
    AuthFailed(u16),

    #[error("Unexpected status {code} for {command}: {text}")]
    UnexpectedStatus {
        command: &'static str,
        code: u16,
        text: String,
    },

    #[error("SOCKS proxy error: {0}")]
    Socks(String),

    #[error("Connect timeout to {0}")]
    ConnectTimeout(String),

    #[error("TLS error: {0}")]
    Tls(#[source] std::io::Error),
}

impl Classify for ClientError {
    fn class(&self) -> ErrorClass {
        match self {
            ClientError::ArticleNotFound | ClientError::NoSuchGroup(_) | ClientError::OutOfRange => {
                ErrorClass::NotFound
            }
            ClientError::ArticleRemoved => ErrorClass::Removed,
            ClientError::UnexpectedStatus { .. } => ErrorClass::Protocol,
            ClientError::Wire(e) => e.class(),
            _ => ErrorClass::Transient,
        }
    }
}

/// A plain or TLS-wrapped outbound stream.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Watermarks reported by GROUP.
#[derive(Debug, Clone, Copy)]
pub struct GroupStats {
    pub count: u64,
    pub low: u64,
    pub high: u64,
}

/// One outbound NNTP connection.
pub struct ClientConnection {
    wire: NntpStream<ClientStream>,
    provider: String,
    pub(crate) connected: bool,
    pub(crate) last_used: Instant,
}

impl ClientConnection {
    /// Dial, read the greeting, authenticate, and switch to reader mode.
    #[tracing::instrument(name = "nntp.client.connect", skip(config), fields(provider = %config.name))]
    pub async fn connect(config: &ProviderConfig) -> Result<Self, ClientError> {
        let connect_timeout = Duration::from_secs(config.timeout_seconds());
        let stream = tokio::time::timeout(connect_timeout, dial(config))
            .await
            .map_err(|_| ClientError::ConnectTimeout(format!("{}:{}", config.host, config.port)))??;

        let mut conn = Self {
            wire: NntpStream::new(stream),
            provider: config.name.clone(),
            connected: true,
            last_used: Instant::now(),
        };

        let greeting = conn.wire.read_status().await?;
        if greeting.code != 200 && greeting.code != 201 {
            return Err(ClientError::UnexpectedStatus {
                command: "greeting",
                code: greeting.code,
                text: greeting.text,
            });
        }
        tracing::debug!(code = greeting.code, "Connected to provider");

        if config.has_credentials() {
            let username = config.username.as_deref().unwrap_or_default();
            let password = config.password.as_deref().unwrap_or_default();
            conn.authenticate(username, password).await?;
        }

        // MODE READER before reader commands (RFC 3977 Section 5.3); some
        // transit servers demand it, the rest answer 200/201 again.
        let status = conn.command("MODE READER", "MODE READER").await?;
        if status.code != 200 && status.code != 201 {
            tracing::debug!(code = status.code, "MODE READER declined, continuing");
        }

        Ok(conn)
    }

    /// AUTHINFO USER/PASS. Failure closes the connection.
    async fn authenticate(&mut self, username: &str, password: &str) -> Result<(), ClientError> {
        let status = self
            .command(&format!("AUTHINFO USER {}", username), "AUTHINFO USER")
            .await?;
        match status.code {
            281 => return Ok(()),
            381 => {}
            code => {
                self.connected = false;
                return Err(ClientError::AuthFailed(code));
            }
        }
        let status = self
            .command(&format!("AUTHINFO PASS {}", password), "AUTHINFO PASS")
            .await?;
        if status.code != 281 {
            self.connected = false;
            return Err(ClientError::AuthFailed(status.code));
        }
        tracing::debug!(provider = %self.provider, "Authenticated");
        Ok(())
    }

    /// Issue one command and read the status line.
    async fn command(&mut self, line: &str, label: &'static str) -> Result<Status, ClientError> {
        self.last_used = Instant::now();
        if let Err(e) = self.wire.send_line(line).await {
            self.connected = false;
            return Err(e.into());
        }
        match self.wire.read_status().await {
            Ok(status) => Ok(status),
            Err(e) => {
                self.connected = false;
                tracing::debug!(provider = %self.provider, command = label, error = %e, "Command failed");
                Err(e.into())
            }
        }
    }

    fn article_error(command: &'static str, status: Status) -> ClientError {
        match status.code {
            430 => ClientError::ArticleNotFound,
            423 | 420 => ClientError::OutOfRange,
            451 => ClientError::ArticleRemoved,
            code => ClientError::UnexpectedStatus {
                command,
                code,
                text: status.text,
            },
        }
    }

    /// STAT: does the article exist upstream?
    pub async fn stat_article(&mut self, message_id: &str) -> Result<bool, ClientError> {
        let status = self
            .command(&format!("STAT {}", message_id), "STAT")
            .await?;
        match status.code {
            223 => Ok(true),
            430 | 423 | 420 => Ok(false),
            code => Err(ClientError::UnexpectedStatus {
                command: "STAT",
                code,
                text: status.text,
            }),
        }
    }

    /// ARTICLE by message-id, parsed.
    pub async fn get_article(&mut self, message_id: &str) -> Result<Article, ClientError> {
        let status = self
            .command(&format!("ARTICLE {}", message_id), "ARTICLE")
            .await?;
        if status.code != 220 {
            return Err(Self::article_error("ARTICLE", status));
        }
        Ok(self.wire.read_article().await?)
    }

    /// HEAD: raw header lines.
    pub async fn get_head(&mut self, message_id: &str) -> Result<Vec<String>, ClientError> {
        let status = self.command(&format!("HEAD {}", message_id), "HEAD").await?;
        if status.code != 221 {
            return Err(Self::article_error("HEAD", status));
        }
        Ok(self.wire.read_multiline(ReadKind::Headers).await?)
    }

    /// BODY: raw body lines.
    pub async fn get_body(&mut self, message_id: &str) -> Result<Vec<String>, ClientError> {
        let status = self.command(&format!("BODY {}", message_id), "BODY").await?;
        if status.code != 222 {
            return Err(Self::article_error("BODY", status));
        }
        Ok(self.wire.read_multiline(ReadKind::Body).await?)
    }

    /// LIST ACTIVE: every group the provider carries.
    pub async fn list_groups(&mut self) -> Result<ActiveFile, ClientError> {
        let status = self.command("LIST ACTIVE", "LIST").await?;
        if status.code != 215 {
            return Err(ClientError::UnexpectedStatus {
                command: "LIST",
                code: status.code,
                text: status.text,
            });
        }
        let lines = self.wire.read_multiline(ReadKind::Other).await?;
        let mut active = ActiveFile::new();
        for line in &lines {
            if let Some(entry) = ActiveEntry::parse(line) {
                active.insert(entry);
            }
        }
        Ok(active)
    }

    /// GROUP: select and return watermarks.
    pub async fn select_group(&mut self, group: &str) -> Result<GroupStats, ClientError> {
        let status = self.command(&format!("GROUP {}", group), "GROUP").await?;
        if status.code == 411 {
            return Err(ClientError::NoSuchGroup(group.to_string()));
        }
        if status.code != 211 {
            return Err(ClientError::UnexpectedStatus {
                command: "GROUP",
                code: status.code,
                text: status.text,
            });
        }
        // 211 count low high group
        let mut fields = status.text.split_whitespace();
        let count = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let low = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let high = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        Ok(GroupStats { count, low, high })
    }

    /// LISTGROUP: article numbers present in a group.
    pub async fn list_group(&mut self, group: &str) -> Result<Vec<u64>, ClientError> {
        let status = self
            .command(&format!("LISTGROUP {}", group), "LISTGROUP")
            .await?;
        if status.code == 411 {
            return Err(ClientError::NoSuchGroup(group.to_string()));
        }
        if status.code != 211 {
            return Err(ClientError::UnexpectedStatus {
                command: "LISTGROUP",
                code: status.code,
                text: status.text,
            });
        }
        let lines = self.wire.read_multiline(ReadKind::Other).await?;
        Ok(lines
            .iter()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    /// XOVER over an inclusive range. With `limit` set the range is
    /// clamped to the configured batch maximum.
    pub async fn xover(
        &mut self,
        start: u64,
        end: u64,
        limit: bool,
    ) -> Result<Vec<OverviewRow>, ClientError> {
        let end = clamp_range(start, end, limit);
        let status = self
            .command(&format!("XOVER {}-{}", start, end), "XOVER")
            .await?;
        if status.code != 224 {
            return Err(Self::article_error("XOVER", status));
        }
        let lines = self.wire.read_multiline(ReadKind::Other).await?;
        Ok(lines.iter().filter_map(|l| OverviewRow::parse(l)).collect())
    }

    /// XHDR one field over an inclusive range, returning
    /// `(article number, value)` pairs.
    pub async fn xhdr(
        &mut self,
        field: &str,
        start: u64,
        end: u64,
        limit: bool,
    ) -> Result<Vec<(u64, String)>, ClientError> {
        let end = clamp_range(start, end, limit);
        let status = self
            .command(&format!("XHDR {} {}-{}", field, start, end), "XHDR")
            .await?;
        if status.code != 221 {
            return Err(Self::article_error("XHDR", status));
        }
        let lines = self.wire.read_multiline(ReadKind::Other).await?;
        Ok(lines.iter().filter_map(|l| parse_xhdr_line(l)).collect())
    }

    /// Streaming XHDR: each `(number, value)` pair is yielded into `tx` as
    /// it arrives; the channel closes on terminator, EOF, or error. Returns
    /// the number of yielded lines.
    pub async fn xhdr_streamed(
        &mut self,
        field: &str,
        start: u64,
        end: u64,
        tx: async_channel::Sender<(u64, String)>,
    ) -> Result<u64, ClientError> {
        let status = self
            .command(&format!("XHDR {} {}-{}", field, start, end), "XHDR")
            .await?;
        if status.code != 221 {
            tx.close();
            return Err(Self::article_error("XHDR", status));
        }
        let mut yielded = 0;
        loop {
            let line = match self.wire.read_line().await {
                Ok(line) => line,
                Err(e) => {
                    self.connected = false;
                    tx.close();
                    return Err(e.into());
                }
            };
            if line == "." {
                break;
            }
            let payload = line.strip_prefix('.').unwrap_or(&line);
            if let Some(pair) = parse_xhdr_line(payload) {
                if tx.send(pair).await.is_err() {
                    // Consumer went away; drain the rest of the block so
                    // the connection stays usable.
                    loop {
                        match self.wire.read_line().await {
                            Ok(l) if l == "." => return Ok(yielded),
                            Ok(_) => continue,
                            Err(e) => {
                                self.connected = false;
                                return Err(e.into());
                            }
                        }
                    }
                }
                yielded += 1;
            }
        }
        tx.close();
        Ok(yielded)
    }

    /// QUIT and shut the stream down.
    pub async fn quit(&mut self) {
        let _ = self.wire.send_line("QUIT").await;
        let _ = self.wire.read_status().await;
        let _ = self.wire.shutdown().await;
        self.connected = false;
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

fn clamp_range(start: u64, end: u64, limit: bool) -> u64 {
    if limit && end.saturating_sub(start) + 1 > MAX_XOVER_BATCH {
        start + MAX_XOVER_BATCH - 1
    } else {
        end
    }
}

fn parse_xhdr_line(line: &str) -> Option<(u64, String)> {
    let (num, value) = line.split_once(' ')?;
    Some((num.trim().parse().ok()?, value.to_string()))
}

/// Dial a provider: direct TCP, TLS, or through SOCKS5. `.onion` hosts
/// must go through the proxy.
async fn dial(config: &ProviderConfig) -> Result<ClientStream, ClientError> {
    let tcp = match &config.socks {
        Some(socks) => {
            let mut proxy = TcpStream::connect((socks.host.as_str(), socks.port))
                .await
                .map_err(|e| ClientError::Socks(e.to_string()))?;
            let auth = match (&socks.username, &socks.password) {
                (Some(username), Some(password)) => Some(async_socks5::Auth {
                    username: username.clone(),
                    password: password.clone(),
                }),
                _ => None,
            };
            async_socks5::connect(&mut proxy, (config.host.clone(), config.port), auth)
                .await
                .map_err(|e| ClientError::Socks(e.to_string()))?;
            proxy
        }
        None => TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| ClientError::Wire(WireError::Io(e)))?,
    };

    if !config.tls {
        return Ok(ClientStream::Plain(tcp));
    }

    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = rustls_pki_types::ServerName::try_from(config.host.clone())
        .map_err(|e| ClientError::Tls(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(ClientError::Tls)?;
    Ok(ClientStream::Tls(Box::new(tls)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_range_applies_only_with_limit() {
        assert_eq!(clamp_range(901, 1400, true), 1000);
        assert_eq!(clamp_range(901, 1400, false), 1400);
        assert_eq!(clamp_range(901, 950, true), 950);
        // Exactly at the cap is untouched.
        assert_eq!(clamp_range(901, 1000, true), 1000);
    }

    #[test]
    fn test_parse_xhdr_line() {
        assert_eq!(
            parse_xhdr_line("123 <a@b>"),
            Some((123, "<a@b>".to_string()))
        );
        assert_eq!(
            parse_xhdr_line("7 Re: subject with spaces"),
            Some((7, "Re: subject with spaces".to_string()))
        );
        assert!(parse_xhdr_line("nospace").is_none());
        assert!(parse_xhdr_line("abc def").is_none());
    }

    #[test]
    fn test_article_error_table() {
        let make = |code| Status {
            code,
            text: String::new(),
        };
        assert!(matches!(
            ClientConnection::article_error("ARTICLE", make(430)),
            ClientError::ArticleNotFound
        ));
        assert!(matches!(
            ClientConnection::article_error("ARTICLE", make(451)),
            ClientError::ArticleRemoved
        ));
        assert!(matches!(
            ClientConnection::article_error("ARTICLE", make(423)),
            ClientError::OutOfRange
        ));
        assert!(matches!(
            ClientConnection::article_error("ARTICLE", make(999)),
            ClientError::UnexpectedStatus { .. }
        ));
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(ClientError::ArticleNotFound.class(), ErrorClass::NotFound);
        assert_eq!(ClientError::ArticleRemoved.class(), ErrorClass::Removed);
        assert_eq!(
            ClientError::UnexpectedStatus {
                command: "X",
                code: 599,
                text: String::new()
            }
            .class(),
            ErrorClass::Protocol
        );
    }
}
