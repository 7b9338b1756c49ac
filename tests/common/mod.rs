//! Shared fixtures for the integration suites: an in-process server
//! context wired to temp-dir stores, and a scriptable mock NNTP upstream.

use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};

use newspool::config::{DnsConfig, HistoryConfig, ServerConfig};
use newspool::feed::peers::PeerRegistry;
use newspool::group::GroupRegistry;
use newspool::history::History;
use newspool::ingest::batch::BatchScheduler;
use newspool::ingest::processor::Processor;
use newspool::msgid::{Local430, MembershipCache, MsgIdCache};
use newspool::nntp::session::ServerCtx;
use newspool::store::MemGroupStore;

/// Everything a server-session test needs, with fast error delays.
pub struct Fixture {
    pub _dir: TempDir,
    pub ctx: Arc<ServerCtx>,
    pub groups: Arc<GroupRegistry>,
    pub msgids: Arc<MsgIdCache>,
    pub store: Arc<MemGroupStore>,
    pub history: Arc<History>,
}

pub fn fixture(posting_enabled: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let history = Arc::new(
        History::open(&HistoryConfig {
            dir: dir.path().join("history"),
            use_short_hash_len: 7,
            flush_batch: 1,
            flush_interval_ms: 5,
        })
        .unwrap(),
    );
    let groups = Arc::new(GroupRegistry::new());
    let msgids = Arc::new(MsgIdCache::new());
    let membership = Arc::new(MembershipCache::new());
    let store = Arc::new(MemGroupStore::new());
    let scheduler = Arc::new(BatchScheduler::new(store.clone(), 100));
    let processor = Arc::new(Processor::new(
        "news.example.org".to_string(),
        10,
        groups.clone(),
        msgids.clone(),
        membership,
        history.clone(),
        store.clone(),
        scheduler,
    ));
    let peers = Arc::new(PeerRegistry::from_config(&[], &DnsConfig::default()).unwrap());

    let ctx = Arc::new(ServerCtx {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            hostname: "news.example.org".to_string(),
            posting_enabled,
            auth_required_for_post: false,
            auth_required_for_list: false,
            users: [("alice".to_string(), "secret".to_string())]
                .into_iter()
                .collect(),
        },
        groups: groups.clone(),
        msgids: msgids.clone(),
        local430: Arc::new(Local430::new()),
        history: history.clone(),
        store: store.clone(),
        processor,
        peers,
        error_delay_ms: 0,
    });

    Fixture {
        _dir: dir,
        ctx,
        groups,
        msgids,
        store,
        history,
    }
}

/// A mock upstream NNTP server carrying one synthetic group.
///
/// Articles are numbered `low..=high` with message-ids `<aN@mock.example>`.
pub struct MockUpstream {
    pub addr: std::net::SocketAddr,
    pub group: String,
    pub low: u64,
    pub high: u64,
}

impl MockUpstream {
    pub async fn start(group: &str, low: u64, high: u64) -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mock = Arc::new(Self {
            addr,
            group: group.to_string(),
            low,
            high,
        });
        let server = mock.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let server = server.clone();
                tokio::spawn(async move {
                    server.serve(stream).await;
                });
            }
        });
        mock
    }

    pub fn message_id(num: u64) -> String {
        format!("<a{}@mock.example>", num)
    }

    fn article_number(message_id: &str) -> Option<u64> {
        message_id
            .strip_prefix("<a")?
            .strip_suffix("@mock.example>")?
            .parse()
            .ok()
    }

    async fn serve(&self, stream: TcpStream) {
        let mut stream = BufStream::new(stream);
        if stream.write_all(b"200 mock ready\r\n").await.is_err() {
            return;
        }
        let _ = stream.flush().await;

        let mut line = String::new();
        loop {
            line.clear();
            match stream.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let trimmed = line.trim_end();
            let mut parts = trimmed.split_whitespace();
            let command = parts.next().unwrap_or("").to_ascii_uppercase();
            let response = match command.as_str() {
                "MODE" => "200 reader\r\n".to_string(),
                "AUTHINFO" => "281 ok\r\n".to_string(),
                "QUIT" => {
                    let _ = stream.write_all(b"205 bye\r\n").await;
                    let _ = stream.flush().await;
                    return;
                }
                "GROUP" => {
                    let name = parts.next().unwrap_or("");
                    if name == self.group {
                        format!(
                            "211 {} {} {} {}\r\n",
                            self.high - self.low + 1,
                            self.low,
                            self.high,
                            self.group
                        )
                    } else {
                        "411 no such newsgroup\r\n".to_string()
                    }
                }
                "LISTGROUP" => {
                    let name = parts.next().unwrap_or("");
                    if name == self.group {
                        let mut out = format!(
                            "211 {} {} {} {}\r\n",
                            self.high - self.low + 1,
                            self.low,
                            self.high,
                            self.group
                        );
                        for num in self.low..=self.high {
                            out.push_str(&format!("{}\r\n", num));
                        }
                        out.push_str(".\r\n");
                        out
                    } else {
                        "411 no such newsgroup\r\n".to_string()
                    }
                }
                "XOVER" => {
                    let range = parts.next().unwrap_or("");
                    let (start, end) = parse_range(range, self.high);
                    let mut out = String::from("224 overview information follows\r\n");
                    for num in start.max(self.low)..=end.min(self.high) {
                        out.push_str(&format!(
                            "{}\tsubject {}\tmock <mock@mock.example>\t\
                             Mon, 01 Jan 2024 10:00:00 +0000\t{}\t\t100\t1\r\n",
                            num,
                            num,
                            Self::message_id(num)
                        ));
                    }
                    out.push_str(".\r\n");
                    out
                }
                "XHDR" => {
                    let field = parts.next().unwrap_or("").to_ascii_lowercase();
                    let range = parts.next().unwrap_or("");
                    let (start, end) = parse_range(range, self.high);
                    let mut out = String::from("221 header data follows\r\n");
                    for num in start.max(self.low)..=end.min(self.high) {
                        let value = match field.as_str() {
                            "message-id" => Self::message_id(num),
                            "date" => "Mon, 01 Jan 2024 10:00:00 +0000".to_string(),
                            _ => format!("value-{}", num),
                        };
                        out.push_str(&format!("{} {}\r\n", num, value));
                    }
                    out.push_str(".\r\n");
                    out
                }
                "ARTICLE" => {
                    let spec = parts.next().unwrap_or("");
                    match Self::article_number(spec) {
                        Some(num) if (self.low..=self.high).contains(&num) => format!(
                            "220 {} {} article\r\n\
                             Message-ID: {}\r\n\
                             Newsgroups: {}\r\n\
                             Subject: subject {}\r\n\
                             From: mock <mock@mock.example>\r\n\
                             Date: Mon, 01 Jan 2024 10:00:00 +0000\r\n\
                             \r\n\
                             body of article {}\r\n\
                             .\r\n",
                            num,
                            Self::message_id(num),
                            Self::message_id(num),
                            self.group,
                            num,
                            num
                        ),
                        _ => "430 no such article\r\n".to_string(),
                    }
                }
                "HEAD" => {
                    let spec = parts.next().unwrap_or("");
                    match Self::article_number(spec) {
                        Some(num) if (self.low..=self.high).contains(&num) => format!(
                            "221 {} {} head\r\n\
                             Message-ID: {}\r\n\
                             Newsgroups: {}\r\n\
                             Subject: subject {}\r\n\
                             From: mock <mock@mock.example>\r\n\
                             Date: Mon, 01 Jan 2024 10:00:00 +0000\r\n\
                             .\r\n",
                            num,
                            Self::message_id(num),
                            Self::message_id(num),
                            self.group,
                            num
                        ),
                        _ => "430 no such article\r\n".to_string(),
                    }
                }
                "BODY" => {
                    let spec = parts.next().unwrap_or("");
                    match Self::article_number(spec) {
                        Some(num) if (self.low..=self.high).contains(&num) => format!(
                            "222 {} {} body\r\n\
                             body of article {}\r\n\
                             ..stuffed line\r\n\
                             .\r\n",
                            num,
                            Self::message_id(num),
                            num
                        ),
                        _ => "430 no such article\r\n".to_string(),
                    }
                }
                "STAT" => {
                    let spec = parts.next().unwrap_or("");
                    match Self::article_number(spec) {
                        Some(num) if (self.low..=self.high).contains(&num) => {
                            format!("223 {} {}\r\n", num, spec)
                        }
                        _ => "430 no such article\r\n".to_string(),
                    }
                }
                _ => "500 what\r\n".to_string(),
            };
            if stream.write_all(response.as_bytes()).await.is_err() {
                return;
            }
            let _ = stream.flush().await;
        }
    }
}

fn parse_range(range: &str, high: u64) -> (u64, u64) {
    match range.split_once('-') {
        None => {
            let n = range.parse().unwrap_or(0);
            (n, n)
        }
        Some((start, "")) => (start.parse().unwrap_or(0), high),
        Some((start, end)) => (start.parse().unwrap_or(0), end.parse().unwrap_or(0)),
    }
}
