//! Inbound NNTP session state machine.
//!
//! One `Session` per accepted connection. The session tracks the
//! authentication exchange, the currently selected group and article
//! pointer, and dispatches the reader and transit command set. Every error
//! response is preceded by a short delay to resist probing, and the socket
//! carries a rolling read deadline so dead peers cannot pin a task.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::article::{valid_message_id, Article, ArticleRange, OverviewRow};
use crate::config::{ServerConfig, SESSION_READ_DEADLINE_SECS};
use crate::error::Classify;
use crate::feed::peers::{PeerRecord, PeerRegistry};
use crate::group::{GroupName, GroupRegistry};
use crate::history::{History, Verdict};
use crate::ingest::processor::{ProcessError, ProcessOutcome, Processor};
use crate::msgid::{Local430, MsgIdCache};
use crate::store::GroupStore;

use super::codes;
use super::wire::{NntpStream, WireError};

/// Dependencies shared by every session.
pub struct ServerCtx {
    pub server: ServerConfig,
    pub groups: Arc<GroupRegistry>,
    pub msgids: Arc<MsgIdCache>,
    pub local430: Arc<Local430>,
    pub history: Arc<History>,
    pub store: Arc<dyn GroupStore>,
    pub processor: Arc<Processor>,
    pub peers: Arc<PeerRegistry>,
    /// Delay before error responses; tests set 0.
    pub error_delay_ms: u64,
}

/// How an article-addressing argument resolved.
enum Addressed {
    ByNumber(GroupName, u64),
    NotFound,
    NoGroupSelected,
    NoCurrentArticle,
    Syntax,
}

/// Which parts of an article a retrieval command emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retrieval {
    Article,
    Head,
    Body,
    Stat,
}

/// Per-connection protocol state.
pub struct Session<S> {
    wire: NntpStream<S>,
    ctx: Arc<ServerCtx>,
    peer: Option<Arc<PeerRecord>>,
    authenticated: bool,
    pending_user: Option<String>,
    current_group: Option<GroupName>,
    current_article: u64,
    articles_received: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(stream: S, ctx: Arc<ServerCtx>, peer: Option<Arc<PeerRecord>>) -> Self {
        Self {
            wire: NntpStream::new(stream),
            ctx,
            peer,
            authenticated: false,
            pending_user: None,
            current_group: None,
            current_article: 0,
            articles_received: 0,
        }
    }

    /// Serve the connection until QUIT, error, or deadline.
    pub async fn run(mut self) {
        let greeting_code = if self.ctx.server.posting_enabled {
            codes::GREETING_POSTING
        } else {
            codes::GREETING_NO_POSTING
        };
        let hostname = self.ctx.server.hostname.clone();
        if self
            .wire
            .send_response(greeting_code, &format!("{} ready", hostname))
            .await
            .is_err()
        {
            return;
        }

        loop {
            let deadline = Duration::from_secs(SESSION_READ_DEADLINE_SECS);
            let line = match tokio::time::timeout(deadline, self.wire.read_line()).await {
                Ok(Ok(line)) => line,
                Ok(Err(_)) => return,
                Err(_) => {
                    tracing::debug!("Session read deadline expired");
                    let _ = self.wire.send_response(codes::CLOSING, "timeout").await;
                    return;
                }
            };
            match self.dispatch(&line).await {
                Ok(true) => continue,
                Ok(false) => return,
                Err(_) => return,
            }
        }
    }

    /// Handle one command line. Returns false when the session must end.
    async fn dispatch(&mut self, line: &str) -> Result<bool, WireError> {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            self.error(codes::UNKNOWN_COMMAND, "command not recognized")
                .await?;
            return Ok(true);
        };
        let args: Vec<&str> = parts.collect();
        let command = command.to_ascii_uppercase();

        tracing::trace!(command = %command, args = args.len(), "Dispatching");
        match command.as_str() {
            "CAPABILITIES" => self.cmd_capabilities().await?,
            "MODE" => self.cmd_mode(&args).await?,
            "AUTHINFO" => self.cmd_authinfo(&args).await?,
            "QUIT" => {
                self.wire
                    .send_response(codes::CLOSING, "closing connection")
                    .await?;
                return Ok(false);
            }
            "HELP" => self.cmd_help().await?,
            "LIST" => self.cmd_list(&args).await?,
            "GROUP" => self.cmd_group(&args).await?,
            "LISTGROUP" => self.cmd_listgroup(&args).await?,
            "STAT" => self.cmd_retrieve(Retrieval::Stat, &args).await?,
            "HEAD" => self.cmd_retrieve(Retrieval::Head, &args).await?,
            "BODY" => self.cmd_retrieve(Retrieval::Body, &args).await?,
            "ARTICLE" => self.cmd_retrieve(Retrieval::Article, &args).await?,
            "XOVER" | "OVER" => self.cmd_xover(&args).await?,
            "XHDR" | "HDR" => self.cmd_xhdr(&args).await?,
            "POST" => return self.cmd_post().await,
            "IHAVE" => return self.cmd_ihave(&args).await,
            "TAKETHIS" => return self.cmd_takethis(&args).await,
            _ => {
                self.error(codes::UNKNOWN_COMMAND, "command not recognized")
                    .await?;
            }
        }
        Ok(true)
    }

    /// Error responses are rate-limit delayed.
    async fn error(&mut self, code: u16, message: &str) -> Result<(), WireError> {
        if self.ctx.error_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.ctx.error_delay_ms)).await;
        }
        self.wire.send_response(code, message).await
    }

    // =========================================================================
    // Connection-level commands
    // =========================================================================

    async fn cmd_capabilities(&mut self) -> Result<(), WireError> {
        let mut caps = vec![
            "VERSION 2".to_string(),
            "READER".to_string(),
            "AUTHINFO USER".to_string(),
            "LIST ACTIVE NEWSGROUPS".to_string(),
            "XOVER".to_string(),
            "XHDR".to_string(),
            "MODE-READER".to_string(),
        ];
        if self.ctx.server.posting_enabled {
            caps.push("POST".to_string());
            caps.push("IHAVE".to_string());
            caps.push("TAKETHIS".to_string());
        }
        self.wire
            .send_multiline(codes::CAPABILITIES_FOLLOW, "capability list follows", &caps)
            .await
    }

    async fn cmd_mode(&mut self, args: &[&str]) -> Result<(), WireError> {
        match args.first().map(|a| a.to_ascii_uppercase()).as_deref() {
            Some("READER") => {
                let code = if self.ctx.server.posting_enabled {
                    codes::GREETING_POSTING
                } else {
                    codes::GREETING_NO_POSTING
                };
                self.wire.send_response(code, "reader mode").await
            }
            _ => self.error(codes::SYNTAX_ERROR, "unknown mode").await,
        }
    }

    async fn cmd_authinfo(&mut self, args: &[&str]) -> Result<(), WireError> {
        match args {
            [subcommand, value, ..] if subcommand.eq_ignore_ascii_case("USER") => {
                self.pending_user = Some(value.to_string());
                self.wire
                    .send_response(codes::AUTH_CONTINUE, "password required")
                    .await
            }
            [subcommand, value, ..] if subcommand.eq_ignore_ascii_case("PASS") => {
                let Some(user) = self.pending_user.take() else {
                    return self
                        .error(codes::AUTH_OUT_OF_SEQUENCE, "AUTHINFO USER first")
                        .await;
                };
                let ok = self
                    .ctx
                    .server
                    .users
                    .get(&user)
                    .is_some_and(|p| p.as_str() == *value);
                if ok {
                    self.authenticated = true;
                    tracing::debug!(%user, "Session authenticated");
                    self.wire
                        .send_response(codes::AUTH_ACCEPTED, "authentication accepted")
                        .await
                } else {
                    self.error(codes::AUTH_REJECTED, "authentication failed")
                        .await
                }
            }
            _ => self.error(codes::SYNTAX_ERROR, "AUTHINFO USER|PASS expected").await,
        }
    }

    async fn cmd_help(&mut self) -> Result<(), WireError> {
        let lines = [
            "CAPABILITIES",
            "MODE READER",
            "AUTHINFO USER|PASS",
            "LIST [ACTIVE|NEWSGROUPS]",
            "GROUP <name>",
            "LISTGROUP [<name>]",
            "STAT|HEAD|BODY|ARTICLE [<message-id>|<number>]",
            "XOVER [range]",
            "XHDR <field> [range]",
            "POST",
            "IHAVE <message-id>",
            "TAKETHIS <message-id>",
            "QUIT",
        ];
        self.wire
            .send_multiline(codes::HELP_FOLLOWS, "help text follows", lines)
            .await
    }

    // =========================================================================
    // Group selection and listings
    // =========================================================================

    async fn cmd_list(&mut self, args: &[&str]) -> Result<(), WireError> {
        if self.ctx.server.auth_required_for_list && !self.authenticated {
            return self.error(codes::AUTH_REQUIRED, "authentication required").await;
        }
        let variant = args
            .first()
            .map(|a| a.to_ascii_uppercase())
            .unwrap_or_else(|| "ACTIVE".to_string());
        let groups = self.ctx.store.list_groups().await;
        match variant.as_str() {
            "ACTIVE" => {
                let lines: Vec<String> = groups
                    .iter()
                    .map(|g| {
                        format!(
                            "{} {} {} {}",
                            g.name,
                            g.high,
                            g.low,
                            g.status.as_char()
                        )
                    })
                    .collect();
                self.wire
                    .send_multiline(codes::LIST_FOLLOWS, "list of newsgroups follows", &lines)
                    .await
            }
            "NEWSGROUPS" => {
                let lines: Vec<String> =
                    groups.iter().map(|g| format!("{} ", g.name)).collect();
                self.wire
                    .send_multiline(codes::LIST_FOLLOWS, "list of newsgroups follows", &lines)
                    .await
            }
            _ => self.error(codes::FEATURE_UNAVAILABLE, "list variant not available").await,
        }
    }

    async fn cmd_group(&mut self, args: &[&str]) -> Result<(), WireError> {
        let Some(name) = args.first() else {
            return self.error(codes::SYNTAX_ERROR, "group name required").await;
        };
        let group = self.ctx.groups.intern(name);
        let Some(info) = self.ctx.store.get_group(&group).await else {
            return self.error(codes::NO_SUCH_GROUP, "no such newsgroup").await;
        };
        self.current_group = Some(group);
        self.current_article = info.low;
        self.wire
            .send_response(
                codes::GROUP_SELECTED,
                &format!("{} {} {} {}", info.count, info.low, info.high, info.name),
            )
            .await
    }

    async fn cmd_listgroup(&mut self, args: &[&str]) -> Result<(), WireError> {
        let group = match args.first() {
            Some(name) => self.ctx.groups.intern(name),
            None => match &self.current_group {
                Some(group) => group.clone(),
                None => {
                    return self
                        .error(codes::NO_GROUP_SELECTED, "no newsgroup selected")
                        .await
                }
            },
        };
        let Some(info) = self.ctx.store.get_group(&group).await else {
            return self.error(codes::NO_SUCH_GROUP, "no such newsgroup").await;
        };
        let numbers = self
            .ctx
            .store
            .article_numbers(&group, info.low, info.high)
            .await
            .unwrap_or_default();
        self.current_group = Some(group);
        self.current_article = info.low;
        let lines: Vec<String> = numbers.iter().map(|n| n.to_string()).collect();
        self.wire
            .send_multiline(
                codes::GROUP_SELECTED,
                &format!("{} {} {} {}", info.count, info.low, info.high, info.name),
                &lines,
            )
            .await
    }

    // =========================================================================
    // Article retrieval
    // =========================================================================

    /// Resolve STAT/HEAD/BODY/ARTICLE addressing into (group, number).
    async fn resolve_address(&mut self, args: &[&str]) -> Addressed {
        match args.first() {
            None => match &self.current_group {
                None => Addressed::NoGroupSelected,
                Some(group) => {
                    if self.current_article == 0 {
                        Addressed::NoCurrentArticle
                    } else {
                        Addressed::ByNumber(group.clone(), self.current_article)
                    }
                }
            },
            Some(arg) if arg.starts_with('<') => self.resolve_message_id(arg).await,
            Some(arg) => match arg.parse::<u64>() {
                Err(_) => Addressed::Syntax,
                Ok(number) => match &self.current_group {
                    None => Addressed::NoGroupSelected,
                    Some(group) => Addressed::ByNumber(group.clone(), number),
                },
            },
        }
    }

    /// Message-id addressing goes through the negative cache and history.
    async fn resolve_message_id(&mut self, message_id: &str) -> Addressed {
        if !valid_message_id(message_id) {
            return Addressed::Syntax;
        }
        if self.ctx.local430.contains(message_id) {
            return Addressed::NotFound;
        }
        let record = self.ctx.msgids.get_or_create(message_id);
        match self.ctx.history.lookup_async(record.clone()).await {
            Ok(Verdict::Duplicate) => {
                let token = record.lock().storage_token.clone();
                if let Some((group_name, number)) = crate::article::parse_storage_token(&token) {
                    let group = self.ctx.groups.intern(group_name);
                    return Addressed::ByNumber(group, number);
                }
                Addressed::NotFound
            }
            Ok(Verdict::Retry) => Addressed::NotFound,
            Ok(Verdict::Pass) => {
                self.ctx.local430.insert(message_id);
                Addressed::NotFound
            }
            Err(e) => {
                tracing::warn!(error = %e, "History lookup failed during retrieval");
                Addressed::NotFound
            }
        }
    }

    async fn cmd_retrieve(&mut self, kind: Retrieval, args: &[&str]) -> Result<(), WireError> {
        let (group, number) = match self.resolve_address(args).await {
            Addressed::ByNumber(group, number) => (group, number),
            Addressed::NotFound => {
                return self.error(codes::NO_SUCH_ARTICLE, "no such article").await
            }
            Addressed::NoGroupSelected => {
                return self
                    .error(codes::NO_GROUP_SELECTED, "no newsgroup selected")
                    .await
            }
            Addressed::NoCurrentArticle => {
                return self
                    .error(codes::NO_CURRENT_ARTICLE, "no current article")
                    .await
            }
            Addressed::Syntax => {
                return self.error(codes::SYNTAX_ERROR, "bad article address").await
            }
        };

        let article = match self.ctx.store.get_article(&group, number).await {
            Ok(article) => article,
            Err(_) => {
                let code = if args.first().map_or(false, |a| a.starts_with('<')) {
                    codes::NO_SUCH_ARTICLE
                } else {
                    codes::NO_SUCH_ARTICLE_NUMBER
                };
                return self.error(code, "no such article").await;
            }
        };

        if self.current_group.as_ref() == Some(&group) {
            self.current_article = number;
        }
        let location = format!("{} {}", number, article.message_id);

        match kind {
            Retrieval::Stat => {
                self.wire
                    .send_response(codes::ARTICLE_EXISTS, &location)
                    .await
            }
            Retrieval::Head => {
                self.wire
                    .send_response(codes::HEAD_FOLLOWS, &format!("{} head", location))
                    .await?;
                self.wire
                    .send_lines_and_terminate(article.head_lines.iter())
                    .await
            }
            Retrieval::Body => {
                self.wire
                    .send_response(codes::BODY_FOLLOWS, &format!("{} body", location))
                    .await?;
                self.wire
                    .send_lines_and_terminate(article.body_lines.iter())
                    .await
            }
            Retrieval::Article => {
                self.wire
                    .send_response(codes::ARTICLE_FOLLOWS, &format!("{} article", location))
                    .await?;
                let lines: Vec<&str> = article
                    .head_lines
                    .iter()
                    .map(|s| s.as_str())
                    .chain(std::iter::once(""))
                    .chain(article.body_lines.iter().map(|s| s.as_str()))
                    .collect();
                self.wire.send_lines_and_terminate(lines).await
            }
        }
    }

    // =========================================================================
    // Overview and header queries
    // =========================================================================

    fn range_from_args(&self, args: &[&str]) -> Option<(u64, u64)> {
        match args.first() {
            None => {
                if self.current_article == 0 {
                    None
                } else {
                    Some((self.current_article, self.current_article))
                }
            }
            Some(arg) => ArticleRange::parse(arg).map(|range| range.bounds(u64::MAX)),
        }
    }

    async fn cmd_xover(&mut self, args: &[&str]) -> Result<(), WireError> {
        let Some(group) = self.current_group.clone() else {
            return self
                .error(codes::NO_GROUP_SELECTED, "no newsgroup selected")
                .await;
        };
        let Some((start, mut end)) = self.range_from_args(args) else {
            return self
                .error(codes::NO_CURRENT_ARTICLE, "no current article")
                .await;
        };
        if end == u64::MAX {
            end = self
                .ctx
                .store
                .get_group(&group)
                .await
                .map(|info| info.high)
                .unwrap_or(start);
        }
        let rows: Vec<OverviewRow> = self
            .ctx
            .store
            .overview_range(&group, start, end)
            .await
            .unwrap_or_default();
        let lines: Vec<String> = rows.iter().map(|row| row.to_wire()).collect();
        self.wire
            .send_multiline(codes::OVERVIEW_FOLLOWS, "overview information follows", &lines)
            .await
    }

    async fn cmd_xhdr(&mut self, args: &[&str]) -> Result<(), WireError> {
        let Some(field) = args.first().copied() else {
            return self.error(codes::SYNTAX_ERROR, "header field required").await;
        };
        let Some(group) = self.current_group.clone() else {
            return self
                .error(codes::NO_GROUP_SELECTED, "no newsgroup selected")
                .await;
        };
        let Some((start, mut end)) = self.range_from_args(&args[1..]) else {
            return self
                .error(codes::NO_CURRENT_ARTICLE, "no current article")
                .await;
        };
        if end == u64::MAX {
            end = self
                .ctx
                .store
                .get_group(&group)
                .await
                .map(|info| info.high)
                .unwrap_or(start);
        }
        let values = self
            .ctx
            .store
            .header_range(&group, field, start, end)
            .await
            .unwrap_or_default();
        let lines: Vec<String> = values
            .iter()
            .map(|(num, value)| format!("{} {}", num, value))
            .collect();
        self.wire
            .send_multiline(codes::HEAD_FOLLOWS, "header data follows", &lines)
            .await
    }

    // =========================================================================
    // Article reception: POST / IHAVE / TAKETHIS
    // =========================================================================

    /// Shared receive-and-process step for POST/IHAVE/TAKETHIS.
    async fn receive_article(
        &mut self,
    ) -> Result<Result<ProcessOutcome, ProcessError>, WireError> {
        let article: Article = match self.wire.read_article().await {
            Ok(article) => article,
            Err(e) => return Err(e),
        };
        if let Some(peer) = &self.peer {
            peer.counters.record_received(article.bytes);
        }
        self.articles_received += 1;

        let primary = match article.newsgroups.first() {
            Some(name) => self.ctx.groups.intern(name),
            None => self.ctx.groups.intern("junk"),
        };
        Ok(self
            .ctx
            .processor
            .process_article(article, &primary, false)
            .await)
    }

    fn over_peer_session_limit(&self) -> bool {
        self.peer
            .as_ref()
            .map(|peer| {
                peer.max_articles_per_session > 0
                    && self.articles_received >= peer.max_articles_per_session
            })
            .unwrap_or(false)
    }

    async fn cmd_post(&mut self) -> Result<bool, WireError> {
        if !self.ctx.server.posting_enabled {
            self.error(codes::PERMISSION_DENIED, "posting not permitted")
                .await?;
            return Ok(true);
        }
        if self.ctx.server.auth_required_for_post && !self.authenticated {
            self.error(codes::AUTH_REQUIRED, "authentication required")
                .await?;
            return Ok(true);
        }
        self.wire
            .send_response(codes::POST_SEND, "send article to be posted")
            .await?;

        match self.receive_article().await {
            Err(WireError::TooManyLines(_)) | Err(WireError::TooManyHeaders(_)) => {
                // Oversized posts kill the connection.
                self.error(codes::POST_FAILED, "article too large").await?;
                let _ = self.wire.shutdown().await;
                Ok(false)
            }
            Err(e) => Err(e),
            Ok(Ok(ProcessOutcome::Filed(_))) => {
                self.wire
                    .send_response(codes::POST_ACCEPTED, "article received")
                    .await?;
                Ok(true)
            }
            Ok(Ok(ProcessOutcome::Duplicate)) => {
                self.error(codes::POST_FAILED, "duplicate article").await?;
                Ok(true)
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "POST rejected");
                self.error(codes::POST_FAILED, "posting failed").await?;
                Ok(true)
            }
        }
    }

    async fn cmd_ihave(&mut self, args: &[&str]) -> Result<bool, WireError> {
        if !self.ctx.server.posting_enabled {
            self.error(codes::FEATURE_UNAVAILABLE, "transit not available")
                .await?;
            return Ok(true);
        }
        let Some(message_id) = args.first().copied() else {
            self.error(codes::SYNTAX_ERROR, "message-id required").await?;
            return Ok(true);
        };
        if !valid_message_id(message_id) {
            self.error(codes::SYNTAX_ERROR, "bad message-id").await?;
            return Ok(true);
        }
        if self.over_peer_session_limit() {
            self.error(codes::IHAVE_RETRY_LATER, "session article limit reached")
                .await?;
            return Ok(true);
        }

        // Duplicate check happens BEFORE asking for the body.
        let record = self.ctx.msgids.get_or_create(message_id);
        match self.ctx.history.lookup_async(record).await {
            Ok(Verdict::Duplicate) => {
                self.error(codes::IHAVE_NOT_WANTED, "duplicate").await?;
                return Ok(true);
            }
            Ok(Verdict::Retry) => {
                self.error(codes::IHAVE_RETRY_LATER, "try again later").await?;
                return Ok(true);
            }
            Ok(Verdict::Pass) => {}
            Err(e) => {
                tracing::warn!(error = %e, "History lookup failed on IHAVE");
                self.error(codes::IHAVE_RETRY_LATER, "try again later").await?;
                return Ok(true);
            }
        }

        self.wire
            .send_response(codes::IHAVE_SEND, "send article to be transferred")
            .await?;

        match self.receive_article().await {
            Err(WireError::TooManyLines(_)) | Err(WireError::TooManyHeaders(_)) => {
                self.error(codes::IHAVE_NOT_WANTED, "article too large").await?;
                let _ = self.wire.shutdown().await;
                Ok(false)
            }
            Err(e) => Err(e),
            Ok(Ok(ProcessOutcome::Filed(_))) => {
                self.wire
                    .send_response(codes::IHAVE_ACCEPTED, "article transferred ok")
                    .await?;
                Ok(true)
            }
            Ok(Ok(ProcessOutcome::Duplicate)) => {
                self.error(codes::IHAVE_NOT_WANTED, "duplicate").await?;
                Ok(true)
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "IHAVE transfer failed");
                self.error(e.class().ihave_code(), "transfer failed").await?;
                Ok(true)
            }
        }
    }

    async fn cmd_takethis(&mut self, args: &[&str]) -> Result<bool, WireError> {
        let Some(message_id) = args.first().copied() else {
            // TAKETHIS is streaming: the article follows no matter what, so
            // it must be drained before the rejection.
            let _ = self.wire.read_article().await;
            self.error(codes::TAKETHIS_REJECTED, "message-id required")
                .await?;
            return Ok(true);
        };
        let message_id = message_id.to_string();

        // Streaming mode: read first, judge after. The session limit is
        // sampled before this article counts against it.
        let over_limit = self.over_peer_session_limit();
        let outcome = self.receive_article().await;
        if over_limit {
            self.error(
                codes::TAKETHIS_REJECTED,
                &format!("{} session article limit reached", message_id),
            )
            .await?;
            return Ok(true);
        }
        match outcome {
            Err(WireError::TooManyLines(_)) | Err(WireError::TooManyHeaders(_)) => {
                self.error(
                    codes::TAKETHIS_REJECTED,
                    &format!("{} article too large", message_id),
                )
                .await?;
                let _ = self.wire.shutdown().await;
                Ok(false)
            }
            Err(e) => Err(e),
            Ok(Ok(ProcessOutcome::Filed(_))) => {
                self.wire
                    .send_response(codes::TAKETHIS_ACCEPTED, &message_id)
                    .await?;
                Ok(true)
            }
            Ok(Ok(ProcessOutcome::Duplicate)) | Ok(Err(_)) => {
                self.error(codes::TAKETHIS_REJECTED, &message_id).await?;
                Ok(true)
            }
        }
    }
}

