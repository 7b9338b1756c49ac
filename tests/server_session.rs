//! Inbound session acceptance tests, driven over in-memory duplex pipes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use newspool::article::Article;
use newspool::msgid::MsgIdState;
use newspool::nntp::session::{ServerCtx, Session};
use newspool::nntp::wire::{NntpStream, ReadKind};
use newspool::store::GroupStore;

use common::{fixture, Fixture};

/// Spawn a session over a duplex pipe and return the client side with the
/// greeting already consumed.
async fn connect(ctx: Arc<ServerCtx>) -> (NntpStream<tokio::io::DuplexStream>, u16) {
    let (client, server) = tokio::io::duplex(1 << 20);
    tokio::spawn(Session::new(server, ctx, None).run());
    let mut wire = NntpStream::new(client);
    let greeting = wire.read_status().await.unwrap();
    (wire, greeting.code)
}

fn sample_article(id: &str, group: &str, subject: &str) -> Article {
    let head_lines = vec![
        format!("Message-ID: {}", id),
        format!("Newsgroups: {}", group),
        format!("Subject: {}", subject),
        "From: alice <alice@example.org>".to_string(),
        "Date: Mon, 01 Jan 2024 10:00:00 +0000".to_string(),
    ];
    let mut article = Article {
        message_id: id.to_string(),
        newsgroups: vec![group.to_string()],
        subject: subject.to_string(),
        from: "alice <alice@example.org>".to_string(),
        date: "Mon, 01 Jan 2024 10:00:00 +0000".to_string(),
        head_lines,
        body_lines: vec!["first body line".to_string(), ".leading dot".to_string()],
        ..Default::default()
    };
    for line in article.head_lines.clone() {
        if let Some((name, value)) = line.split_once(':') {
            article
                .headers
                .entry(name.trim().to_ascii_lowercase())
                .or_default()
                .push(value.trim().to_string());
        }
    }
    article.bytes = 300;
    article.lines = article.body_lines.len() as u64;
    article.is_thread_root = true;
    article
}

/// File an article through the full processor path and wait for the
/// history commit.
async fn file_article(fx: &Fixture, id: &str, group: &str) {
    let primary = fx.groups.intern(group);
    fx.ctx
        .processor
        .process_article(sample_article(id, group, "seeded"), &primary, false)
        .await
        .unwrap();
    let record = fx.msgids.get_or_create(id);
    assert_eq!(
        record.wait_written(Duration::from_secs(5)).await,
        MsgIdState::Written
    );
}

// =============================================================================
// Connection basics
// =============================================================================

#[tokio::test]
async fn test_greeting_and_quit() {
    let fx = fixture(false);
    let (mut wire, greeting) = connect(fx.ctx.clone()).await;
    assert_eq!(greeting, 201);

    wire.send_line("QUIT").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 205);
}

#[tokio::test]
async fn test_posting_greeting_is_200() {
    let fx = fixture(true);
    let (_wire, greeting) = connect(fx.ctx.clone()).await;
    assert_eq!(greeting, 200);
}

#[tokio::test]
async fn test_capabilities_reflect_posting() {
    let fx = fixture(true);
    let (mut wire, _) = connect(fx.ctx.clone()).await;

    wire.send_line("CAPABILITIES").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 101);
    let caps = wire.read_multiline(ReadKind::Other).await.unwrap();
    assert!(caps.iter().any(|c| c == "VERSION 2"));
    assert!(caps.iter().any(|c| c == "READER"));
    assert!(caps.iter().any(|c| c == "XOVER"));
    assert!(caps.iter().any(|c| c == "IHAVE"));
    assert!(caps.iter().any(|c| c == "TAKETHIS"));

    let fx = fixture(false);
    let (mut wire, _) = connect(fx.ctx.clone()).await;
    wire.send_line("CAPABILITIES").await.unwrap();
    wire.read_status().await.unwrap();
    let caps = wire.read_multiline(ReadKind::Other).await.unwrap();
    assert!(!caps.iter().any(|c| c == "POST"));
}

#[tokio::test]
async fn test_unknown_command_gets_500() {
    let fx = fixture(false);
    let (mut wire, _) = connect(fx.ctx.clone()).await;
    wire.send_line("FLOOP").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 500);
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_authinfo_user_pass_flow() {
    let fx = fixture(false);
    let (mut wire, _) = connect(fx.ctx.clone()).await;

    wire.send_line("AUTHINFO USER alice").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 381);
    wire.send_line("AUTHINFO PASS secret").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 281);
}

#[tokio::test]
async fn test_authinfo_bad_password_rejected() {
    let fx = fixture(false);
    let (mut wire, _) = connect(fx.ctx.clone()).await;

    wire.send_line("AUTHINFO USER alice").await.unwrap();
    wire.read_status().await.unwrap();
    wire.send_line("AUTHINFO PASS wrong").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 481);
}

#[tokio::test]
async fn test_authinfo_pass_without_user_is_482() {
    let fx = fixture(false);
    let (mut wire, _) = connect(fx.ctx.clone()).await;
    wire.send_line("AUTHINFO PASS secret").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 482);
}

// =============================================================================
// Group selection and retrieval
// =============================================================================

#[tokio::test]
async fn test_group_selection_and_numeric_article() {
    let fx = fixture(false);
    file_article(&fx, "<n1@example.org>", "comp.lang.rust").await;
    let (mut wire, _) = connect(fx.ctx.clone()).await;

    wire.send_line("GROUP comp.lang.rust").await.unwrap();
    let status = wire.read_status().await.unwrap();
    assert_eq!(status.code, 211);
    assert!(status.text.ends_with("comp.lang.rust"));

    wire.send_line("ARTICLE 1").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 220);
    let lines = wire.read_multiline(ReadKind::Article).await.unwrap();
    assert!(lines.iter().any(|l| l.starts_with("Message-ID:")));
    // Blank separator then the dot-stuffed body line round-trips.
    assert!(lines.iter().any(|l| l == ".leading dot"));
}

#[tokio::test]
async fn test_numeric_address_without_group_is_412() {
    let fx = fixture(false);
    let (mut wire, _) = connect(fx.ctx.clone()).await;
    wire.send_line("ARTICLE 1").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 412);
}

#[tokio::test]
async fn test_missing_number_is_423() {
    let fx = fixture(false);
    file_article(&fx, "<n1@example.org>", "comp.lang.rust").await;
    let (mut wire, _) = connect(fx.ctx.clone()).await;
    wire.send_line("GROUP comp.lang.rust").await.unwrap();
    wire.read_status().await.unwrap();
    wire.send_line("STAT 999").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 423);
}

#[tokio::test]
async fn test_unknown_group_is_411() {
    let fx = fixture(false);
    let (mut wire, _) = connect(fx.ctx.clone()).await;
    wire.send_line("GROUP no.such.group").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 411);
}

#[tokio::test]
async fn test_article_by_message_id_resolves_through_history() {
    let fx = fixture(false);
    file_article(&fx, "<byid@example.org>", "comp.lang.rust").await;
    let (mut wire, _) = connect(fx.ctx.clone()).await;

    // No group selected: message-id addressing still works.
    wire.send_line("ARTICLE <byid@example.org>").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 220);
    let lines = wire.read_multiline(ReadKind::Article).await.unwrap();
    assert!(lines.iter().any(|l| l.contains("<byid@example.org>")));
}

#[tokio::test]
async fn test_unknown_message_id_is_430_and_cached() {
    let fx = fixture(false);
    let (mut wire, _) = connect(fx.ctx.clone()).await;

    wire.send_line("ARTICLE <gone@example.org>").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 430);
    assert!(fx.ctx.local430.contains("<gone@example.org>"));

    // Second probe answers from the negative cache.
    wire.send_line("STAT <gone@example.org>").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 430);
}

#[tokio::test]
async fn test_head_and_body_variants() {
    let fx = fixture(false);
    file_article(&fx, "<hb@example.org>", "comp.lang.rust").await;
    let (mut wire, _) = connect(fx.ctx.clone()).await;
    wire.send_line("GROUP comp.lang.rust").await.unwrap();
    wire.read_status().await.unwrap();

    wire.send_line("HEAD 1").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 221);
    let head = wire.read_multiline(ReadKind::Headers).await.unwrap();
    assert!(head.iter().all(|l| !l.contains("first body line")));

    wire.send_line("BODY 1").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 222);
    let body = wire.read_multiline(ReadKind::Body).await.unwrap();
    assert_eq!(body, vec!["first body line", ".leading dot"]);

    wire.send_line("STAT 1").await.unwrap();
    let status = wire.read_status().await.unwrap();
    assert_eq!(status.code, 223);
    assert!(status.text.contains("<hb@example.org>"));
}

// =============================================================================
// Overview
// =============================================================================

#[tokio::test]
async fn test_xover_serves_range() {
    let fx = fixture(false);
    for i in 1..=5 {
        file_article(&fx, &format!("<ov{}@example.org>", i), "alt.test").await;
    }
    let (mut wire, _) = connect(fx.ctx.clone()).await;
    wire.send_line("GROUP alt.test").await.unwrap();
    wire.read_status().await.unwrap();

    wire.send_line("XOVER 2-4").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 224);
    let rows = wire.read_multiline(ReadKind::Other).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows[0].starts_with("2\t"));

    wire.send_line("XHDR Subject 1-2").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 221);
    let headers = wire.read_multiline(ReadKind::Other).await.unwrap();
    assert_eq!(headers.len(), 2);
}

#[tokio::test]
async fn test_xover_without_group_is_412() {
    let fx = fixture(false);
    let (mut wire, _) = connect(fx.ctx.clone()).await;
    wire.send_line("XOVER 1-5").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 412);
}

// =============================================================================
// LIST
// =============================================================================

#[tokio::test]
async fn test_list_active_format() {
    let fx = fixture(false);
    file_article(&fx, "<l1@example.org>", "comp.lang.rust").await;
    let (mut wire, _) = connect(fx.ctx.clone()).await;

    wire.send_line("LIST").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 215);
    let lines = wire.read_multiline(ReadKind::Other).await.unwrap();
    assert!(lines.iter().any(|l| {
        let mut fields = l.split_whitespace();
        fields.next() == Some("comp.lang.rust")
            && fields.clone().count() == 3
            && fields.nth(2) == Some("y")
    }));
}

// =============================================================================
// IHAVE (scenario: duplicate refused before the body is read)
// =============================================================================

#[tokio::test]
async fn test_ihave_duplicate_refused_without_reading_body() {
    let fx = fixture(true);
    file_article(&fx, "<dup@example.org>", "comp.lang.rust").await;
    let (mut wire, _) = connect(fx.ctx.clone()).await;

    // Only the IHAVE line is sent; if the server tried to read an article
    // body this would deadlock rather than answer.
    wire.send_line("IHAVE <dup@example.org>").await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(5), wire.read_status())
        .await
        .expect("server must answer without a body")
        .unwrap();
    assert_eq!(status.code, 435);
}

#[tokio::test]
async fn test_ihave_accepts_fresh_article() {
    let fx = fixture(true);
    let (mut wire, _) = connect(fx.ctx.clone()).await;

    wire.send_line("IHAVE <fresh@example.org>").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 335);

    for line in [
        "Message-ID: <fresh@example.org>",
        "Newsgroups: comp.lang.rust",
        "Subject: incoming",
        "From: bob <bob@example.org>",
        "Date: Mon, 01 Jan 2024 11:00:00 +0000",
        "",
        "transferred body",
        ".",
    ] {
        wire.send_line(line).await.unwrap();
    }
    assert_eq!(wire.read_status().await.unwrap().code, 235);

    let group = fx.groups.intern("comp.lang.rust");
    assert!(fx.store.has_article(&group, "<fresh@example.org>").await);
}

#[tokio::test]
async fn test_ihave_bad_message_id_is_501() {
    let fx = fixture(true);
    let (mut wire, _) = connect(fx.ctx.clone()).await;
    wire.send_line("IHAVE not-an-id").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 501);
}

// =============================================================================
// TAKETHIS (streaming: read first, judge after)
// =============================================================================

#[tokio::test]
async fn test_takethis_accepts_and_rejects() {
    let fx = fixture(true);
    let (mut wire, _) = connect(fx.ctx.clone()).await;

    wire.send_line("TAKETHIS <take1@example.org>").await.unwrap();
    for line in [
        "Message-ID: <take1@example.org>",
        "Newsgroups: alt.test",
        "Subject: streamed",
        "From: bob <bob@example.org>",
        "Date: Mon, 01 Jan 2024 11:00:00 +0000",
        "",
        "streamed body",
        ".",
    ] {
        wire.send_line(line).await.unwrap();
    }
    let status = wire.read_status().await.unwrap();
    assert_eq!(status.code, 239);
    assert!(status.text.contains("<take1@example.org>"));

    // Same article again: the full body must still be consumed, then 439.
    wire.send_line("TAKETHIS <take1@example.org>").await.unwrap();
    for line in [
        "Message-ID: <take1@example.org>",
        "Newsgroups: alt.test",
        "Subject: streamed",
        "From: bob <bob@example.org>",
        "Date: Mon, 01 Jan 2024 11:00:00 +0000",
        "",
        "streamed body",
        ".",
    ] {
        wire.send_line(line).await.unwrap();
    }
    let status = wire.read_status().await.unwrap();
    assert_eq!(status.code, 439);
}

// =============================================================================
// POST
// =============================================================================

#[tokio::test]
async fn test_post_disabled_is_refused() {
    let fx = fixture(false);
    let (mut wire, _) = connect(fx.ctx.clone()).await;
    wire.send_line("POST").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 502);
}

#[tokio::test]
async fn test_post_files_article() {
    let fx = fixture(true);
    let (mut wire, _) = connect(fx.ctx.clone()).await;

    wire.send_line("POST").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 340);
    for line in [
        "Message-ID: <posted@example.org>",
        "Newsgroups: alt.test",
        "Subject: hello",
        "From: carol <carol@example.org>",
        "Date: Mon, 01 Jan 2024 12:00:00 +0000",
        "",
        "posted body",
        ".",
    ] {
        wire.send_line(line).await.unwrap();
    }
    assert_eq!(wire.read_status().await.unwrap().code, 240);

    let group = fx.groups.intern("alt.test");
    assert!(fx.store.has_article(&group, "<posted@example.org>").await);
}

#[tokio::test]
async fn test_oversized_post_is_441_and_closes() {
    let fx = fixture(true);
    let (mut wire, _) = connect(fx.ctx.clone()).await;

    wire.send_line("POST").await.unwrap();
    assert_eq!(wire.read_status().await.unwrap().code, 340);

    // Feed headers, then enough body lines to cross the total-line limit.
    let mut lines = vec![
        "Message-ID: <big@example.org>".to_string(),
        "Newsgroups: alt.test".to_string(),
        "Subject: big".to_string(),
        "From: d <d@example.org>".to_string(),
        "Date: Mon, 01 Jan 2024 12:00:00 +0000".to_string(),
        String::new(),
    ];
    lines.extend((0..16385).map(|_| "x".to_string()));
    for line in &lines {
        if wire.send_line(line).await.is_err() {
            break;
        }
    }

    // 441 arrives, then the connection is gone.
    let mut saw_441 = false;
    loop {
        match wire.read_status().await {
            Ok(status) if status.code == 441 => {
                saw_441 = true;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    assert!(saw_441);
}
