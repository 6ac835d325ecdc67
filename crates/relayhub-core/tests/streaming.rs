mod support;

use std::time::Duration;

use relayhub_common::RelayConfig;
use support::*;

const CHAT: &str = "/v1/chat/completions";

fn stream_config(retry_times: u32, heartbeat_interval_secs: u64) -> RelayConfig {
    RelayConfig {
        retry_times,
        heartbeat_interval_secs,
        ..RelayConfig::default()
    }
}

#[tokio::test]
async fn mid_stream_failure_ends_with_terminal_event() {
    // Roughly 200 bytes of real output before the upstream breaks off.
    let frames = vec![
        content_frame("The quick brown fox jumps over the lazy dog. "),
        content_frame("Pack my box with five dozen liquor jugs. "),
    ];
    let upstream = FakeUpstream::new()
        .on("a", Behavior::stream_then_fail(frames.clone()))
        .on("b", Behavior::stream(vec![content_frame("unused"), DONE_FRAME.to_string()]));
    let h = harness(
        stream_config(2, 15),
        vec![channel(1, "a"), channel(2, "b")],
        upstream,
    )
    .await;

    let (reply, task) = h.engine.spawn(request(CHAT, chat_body(true)));
    let text = collect(reply).await.stream();
    let outcome = task.await.unwrap();

    assert!(text.starts_with(&frames.concat()));
    let tail = &text[frames.concat().len()..];
    assert!(tail.starts_with("data: {\"error\":{"), "tail was {tail}");
    assert!(tail.contains("upstream_transport_error"));
    assert!(tail.ends_with("\n\n"));

    // Output already reached the caller, so no other channel is tried.
    assert_eq!(outcome.attempts, 1);
    assert_eq!(h.upstream.hosts(), vec!["a"]);
    let stats = h.ledger.stats();
    assert_eq!((stats.releases, stats.settlements), (1, 0));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_keeps_slow_stream_alive() {
    let upstream = FakeUpstream::new().on(
        "a",
        Behavior::stream(vec![
            content_frame("Hello"),
            usage_frame(9, 1),
            DONE_FRAME.to_string(),
        ])
        .after(Duration::from_millis(2500)),
    );
    let h = harness(stream_config(0, 1), vec![channel(1, "a")], upstream).await;

    let (reply, task) = h.engine.spawn(request(CHAT, chat_body(true)));
    let text = collect(reply).await.stream();
    let outcome = task.await.unwrap();

    let keepalive = ": keep-alive\n\n";
    assert!(
        text.starts_with(&format!("{keepalive}{keepalive}data: ")),
        "stream was {text:?}"
    );
    assert!(text.ends_with(DONE_FRAME));
    assert_eq!(outcome.status, 200);

    let logs = h.ledger.logs();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].is_stream);
    assert_eq!((logs[0].prompt_tokens, logs[0].completion_tokens), (9, 1));
    assert_eq!(logs[0].first_response_ms, Some(2500));
}

#[tokio::test(start_paused = true)]
async fn failure_after_only_keepalives_retries() {
    let upstream = FakeUpstream::new()
        .on(
            "a",
            Behavior::stream_then_fail(Vec::new()).after(Duration::from_millis(1500)),
        )
        .on(
            "b",
            Behavior::stream(vec![content_frame("from b"), DONE_FRAME.to_string()]),
        );
    let h = harness(
        stream_config(1, 1),
        vec![channel(1, "a"), channel(2, "b")],
        upstream,
    )
    .await;

    let (reply, task) = h.engine.spawn(request(CHAT, chat_body(true)));
    let text = collect(reply).await.stream();
    let outcome = task.await.unwrap();

    assert!(text.starts_with(": keep-alive\n\n"));
    assert!(text.contains(&content_frame("from b")));
    assert!(!text.contains("\"error\""));
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.channel_id, Some(2));
}

#[tokio::test]
async fn early_failure_is_plain_json() {
    let upstream = FakeUpstream::new().on("a", Behavior::error(500, "server_error", "boom"));
    let h = harness(stream_config(0, 15), vec![channel(1, "a")], upstream).await;

    let (reply, task) = h.engine.spawn(request(CHAT, chat_body(true)));
    let (status, body) = collect(reply).await.json();
    task.await.unwrap();

    assert_eq!(status, 500);
    assert_eq!(body["error"]["message"], "boom");
}

#[tokio::test]
async fn streamed_text_is_counted_without_reported_usage() {
    let upstream = FakeUpstream::new().on(
        "a",
        Behavior::stream(vec![
            content_frame("Hello"),
            content_frame(" world"),
            DONE_FRAME.to_string(),
        ]),
    );
    let h = harness(stream_config(0, 15), vec![channel(1, "a")], upstream).await;

    let (reply, task) = h.engine.spawn(request(CHAT, chat_body(true)));
    collect(reply).await.stream();
    task.await.unwrap();

    let calls = h.upstream.calls();
    assert_eq!(calls[0].body["stream_options"]["include_usage"], true);
    let logs = h.ledger.logs();
    assert!(logs[0].completion_tokens > 0);
    assert!(logs[0].prompt_tokens > 0);
}

#[tokio::test]
async fn frames_split_across_chunks_are_forwarded_whole() {
    let frame = content_frame("split me");
    let (head, tail) = frame.split_at(10);
    let upstream = FakeUpstream::new().on(
        "a",
        Behavior::stream(vec![
            head.to_string(),
            tail.to_string(),
            DONE_FRAME.to_string(),
        ]),
    );
    let h = harness(stream_config(0, 15), vec![channel(1, "a")], upstream).await;

    let (reply, task) = h.engine.spawn(request(CHAT, chat_body(true)));
    let text = collect(reply).await.stream();
    task.await.unwrap();

    assert_eq!(text, format!("{frame}{DONE_FRAME}"));
    assert_eq!(h.ledger.logs().len(), 1);
}

#[tokio::test]
async fn empty_upstream_stream_still_opens_the_stream() {
    let upstream = FakeUpstream::new().on("a", Behavior::stream(Vec::new()));
    let h = harness(stream_config(0, 15), vec![channel(1, "a")], upstream).await;

    let (reply, task) = h.engine.spawn(request(CHAT, chat_body(true)));
    let text = collect(reply).await.stream();
    let outcome = task.await.unwrap();

    assert_eq!(text, "");
    assert_eq!(outcome.status, 200);
    let stats = h.ledger.stats();
    assert_eq!((stats.releases, stats.settlements), (0, 1));
}

#[tokio::test(start_paused = true)]
async fn json_body_after_keepalive_is_framed_as_an_event() {
    let upstream = FakeUpstream::new().on(
        "a",
        Behavior::ok_with_usage("hi", 4, 2).after(Duration::from_millis(1500)),
    );
    let h = harness(stream_config(0, 1), vec![channel(1, "a")], upstream).await;

    let (reply, task) = h.engine.spawn(request(CHAT, chat_body(true)));
    let text = collect(reply).await.stream();
    let outcome = task.await.unwrap();

    let body = text
        .strip_prefix(": keep-alive\n\n")
        .unwrap_or_else(|| panic!("stream was {text:?}"));
    assert!(body.starts_with("data: {\"id\":\"x\""), "body was {body:?}");
    assert!(body.ends_with("\n\n"));
    assert_eq!(outcome.status, 200);

    let logs = h.ledger.logs();
    assert_eq!((logs[0].prompt_tokens, logs[0].completion_tokens), (4, 2));
}
