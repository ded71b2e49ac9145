use std::sync::Arc;
use std::time::Duration;

use aweme_client::endpoints::{post_detail, self_user_id};
use aweme_client::testing::{FixedSigner, ManualClock, ScriptedSession};
use aweme_client::transport::params;
use aweme_client::{FetchError, PostWalk, RetryPolicy, RetryingTransport, TransportError};
use aweme_common::{SessionId, Source, UserRef};
use serde_json::json;

fn transport(clock: Arc<ManualClock>, signer: Arc<FixedSigner>) -> RetryingTransport {
    RetryingTransport::new(signer, clock, RetryPolicy::metadata())
}

const API: &str = "https://www.douyin.com/aweme/v1/web/aweme/post/";

#[tokio::test]
async fn always_500_fails_after_ceiling() {
    let clock = Arc::new(ManualClock::default());
    let t = transport(clock.clone(), Arc::new(FixedSigner::new()));
    let (mut session, port) = ScriptedSession::new()
        .always("/aweme/post/", 500, b"oops")
        .into_session(SessionId::Main);

    let err = t.get(&mut session, API, &[]).await.unwrap_err();

    match err {
        FetchError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 10),
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(port.requests().len(), 10);
    // First visit on a session is not paced, so every sleep is a cooldown.
    let sleeps = clock.sleeps();
    assert_eq!(sleeps.len(), 9);
    assert_eq!(sleeps[0], Duration::from_secs(60));
    assert_eq!(sleeps[1], Duration::from_secs(120));
    assert!(sleeps.iter().all(|d| *d <= Duration::from_secs(600)));
}

#[tokio::test]
async fn connectivity_loss_is_waited_out() {
    let clock = Arc::new(ManualClock::default());
    let t = transport(clock.clone(), Arc::new(FixedSigner::new()));
    let (mut session, port) = ScriptedSession::new()
        .on_error("/aweme/post/", TransportError::Connect("refused".into()))
        .on_error("/aweme/post/", TransportError::Timeout("slow".into()))
        .on_error("/aweme/post/", TransportError::PoolExhausted("pool".into()))
        .on_json("/aweme/post/", json!({"status_code": 0}))
        .into_session(SessionId::Alt);

    let resp = t.get(&mut session, API, &[]).await.unwrap();

    assert_eq!(resp.status, 200);
    assert_eq!(port.requests().len(), 4);
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(10); 3]);
}

#[tokio::test]
async fn rejected_session_is_not_retried() {
    let clock = Arc::new(ManualClock::default());
    let t = transport(clock.clone(), Arc::new(FixedSigner::new()));
    let (mut session, port) = ScriptedSession::new()
        .always("/aweme/post/", 403, b"denied")
        .into_session(SessionId::Alt);

    let err = t.get(&mut session, API, &[]).await.unwrap_err();

    assert!(matches!(
        err,
        FetchError::SessionInvalid {
            session: SessionId::Alt,
            status: 403,
            ..
        }
    ));
    assert_eq!(port.requests().len(), 1);
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn non_200_success_is_unexpected() {
    let clock = Arc::new(ManualClock::default());
    let t = transport(clock, Arc::new(FixedSigner::new()));
    let (mut session, _) = ScriptedSession::new()
        .on_status("/aweme/post/", 204, b"")
        .into_session(SessionId::Main);

    let err = t.get(&mut session, API, &[]).await.unwrap_err();
    assert!(matches!(err, FetchError::Unexpected { status: 204, .. }));
}

#[tokio::test]
async fn query_is_merged_and_resigned() {
    let clock = Arc::new(ManualClock::default());
    let signer = Arc::new(FixedSigner::new());
    let t = transport(clock, signer.clone());
    let (mut session, port) = ScriptedSession::new()
        .on_json("/aweme/post/", json!({"status_code": 0}))
        .into_session(SessionId::Main);

    let url = format!("{API}?aid=1&X-Bogus=stale");
    t.get(
        &mut session,
        &url,
        &params(&[("aid", "6383"), ("count", "18")]),
    )
    .await
    .unwrap();

    assert_eq!(signer.signed(), vec!["aid=6383&count=18".to_string()]);
    let sent = &port.requests()[0];
    let bogus: Vec<_> = sent
        .query_pairs()
        .filter(|(k, _)| k == "X-Bogus")
        .map(|(_, v)| v.into_owned())
        .collect();
    assert_eq!(bogus, vec![FixedSigner::TOKEN.to_string()]);
    assert_eq!(sent.query(), Some("aid=6383&count=18&X-Bogus=SIGNED"));
}

#[tokio::test]
async fn consecutive_requests_are_paced() {
    let clock = Arc::new(ManualClock::default());
    let t = transport(clock.clone(), Arc::new(FixedSigner::new()));
    let (mut session, _) = ScriptedSession::new()
        .always("/query/user/", 200, br#"{"user_uid": "777"}"#)
        .into_session(SessionId::Main);

    assert_eq!(self_user_id(&t, &mut session).await.unwrap(), 777);
    assert_eq!(self_user_id(&t, &mut session).await.unwrap(), 777);

    let sleeps = clock.sleeps();
    assert_eq!(sleeps.len(), 1);
    assert!(sleeps[0] >= Duration::from_secs(3) && sleeps[0] <= Duration::from_secs(5));
    assert_eq!(session.pacing().visit_count, 2);
    assert_eq!(session.pacing().total_visits, 2);
}

#[tokio::test]
async fn nonzero_status_code_is_fatal() {
    let clock = Arc::new(ManualClock::default());
    let t = transport(clock, Arc::new(FixedSigner::new()));
    let (mut session, _) = ScriptedSession::new()
        .on_json("/aweme/post/", json!({"status_code": 8, "status_msg": "banned"}))
        .into_session(SessionId::Main);

    let err = t.get_envelope(&mut session, API, &[]).await.unwrap_err();
    assert!(matches!(err, FetchError::Envelope { .. }));
}

#[tokio::test]
async fn post_detail_returns_page_item() {
    let clock = Arc::new(ManualClock::default());
    let t = transport(clock, Arc::new(FixedSigner::new()));
    let (mut session, port) = ScriptedSession::new()
        .on_json(
            "aweme_id=7301",
            json!({
                "status_code": 0,
                "log_pb": {"impr_id": "x"},
                "aweme_detail": {"aweme_id": "7301", "desc": "hi"},
            }),
        )
        .into_session(SessionId::Main);

    let item = post_detail(&t, &mut session, 7301).await.unwrap();

    assert_eq!(item.id, 7301);
    assert_eq!(item.source, Source::Page);
    assert!(port.requests()[0].as_str().contains("/aweme/detail/"));
}

#[tokio::test]
async fn post_walk_follows_cursor() {
    let clock = Arc::new(ManualClock::default());
    let t = transport(clock, Arc::new(FixedSigner::new()));
    let (mut session, port) = ScriptedSession::new()
        .on_json(
            "/aweme/post/",
            json!({
                "status_code": 0,
                "has_more": 1,
                "max_cursor": 2000,
                "aweme_list": [{"aweme_id": "20", "create_time": 20, "is_top": 0}],
            }),
        )
        .on_json(
            "/aweme/post/",
            json!({
                "status_code": 0,
                "has_more": 0,
                "max_cursor": 1000,
                "aweme_list": [{"aweme_id": "10", "create_time": 10, "is_top": 0}],
            }),
        )
        .into_session(SessionId::Alt);

    let mut walk = PostWalk::new(&UserRef::SecUid("MS4w".into()));
    let mut ids = Vec::new();
    while let Some(page) = walk.next_page(&t, &mut session).await.unwrap() {
        ids.extend(page.into_iter().map(|i| i.id));
    }

    assert_eq!(ids, vec![20, 10]);
    let requests = port.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].as_str().contains("sec_user_id=MS4w"));
    assert!(!requests[0].as_str().contains("max_cursor"));
    assert!(requests[1].as_str().contains("max_cursor=2000"));
}
