use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flow_auth::error::{Error, ErrorKind, OAuthErrorKind};
use flow_auth::oauth::{
    AuthorizationRequestContext, Builder, ClientAuthMethod, ClientConfig, DeviceGrantHandle,
    FlowVariant,
};
use flow_auth::polling::{
    Coordinator, GrantPoll, PollOutcome, PollState, Pollable, TimeoutReason,
};
use flow_auth::providers::Endpoints;
use flow_auth::token::{ExchangeOutcome, Exchanger, Grant, TokenEndpoint, TokenSet};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;

/// Token endpoint that answers `authorization_pending` until `approve_after`
/// requests have been made.
struct PendingThenApproved {
    calls: AtomicU32,
    approve_after: Option<u32>,
}

impl PendingThenApproved {
    fn new(approve_after: Option<u32>) -> Self {
        Self {
            calls: AtomicU32::new(0),
            approve_after,
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenEndpoint for PendingThenApproved {
    async fn exchange(&self, grant: Grant) -> Result<ExchangeOutcome, Error> {
        assert_eq!(grant.grant_type(), "urn:ietf:params:oauth:grant-type:device_code");
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.approve_after {
            Some(n) if call >= n => Ok(ExchangeOutcome::Tokens(
                TokenSet::new("device-at", Some(3600), Utc::now()).with_refresh_token("device-rt"),
            )),
            _ => Err(Error {
                source: None,
                error_kind: ErrorKind::OAuth(OAuthErrorKind::AuthorizationPending),
            }),
        }
    }
}

fn device_handle(now: DateTime<Utc>, expires_in: i64, interval: u64) -> DeviceGrantHandle {
    DeviceGrantHandle {
        device_code: "device-code".to_string(),
        user_code: "WDJB-MJHT".to_string(),
        verification_uri: "https://auth.example/activate".to_string(),
        verification_uri_complete: None,
        expires_at: now + chrono::Duration::seconds(expires_in),
        interval: Duration::from_secs(interval),
    }
}

#[tokio::test(start_paused = true)]
async fn device_flow_is_authorized_on_third_poll() {
    let endpoint = Arc::new(PendingThenApproved::new(Some(3)));
    let (grant, schedule) = {
        let now = Utc::now();
        device_handle(now, 10, 5).poll_plan(now)
    };
    let source = GrantPoll::new(endpoint.clone(), grant);

    let report = Coordinator::new()
        .run(&source, schedule, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        report.transitions,
        vec![
            PollState::Started,
            PollState::Polling,
            PollState::Polling,
            PollState::Polling,
            PollState::Authorized,
        ]
    );
    assert!(report.elapsed >= Duration::from_secs(10));
    assert_eq!(endpoint.calls(), 3);

    let tokens = report.into_tokens().unwrap();
    assert_eq!(tokens.access_token.expose_secret(), "device-at");
    assert_eq!(tokens.refresh_token_str(), Some("device-rt"));
}

#[tokio::test(start_paused = true)]
async fn polling_stops_when_grant_expires() {
    let endpoint = Arc::new(PendingThenApproved::new(None));
    let (grant, schedule) = {
        let now = Utc::now();
        device_handle(now, 5, 1).poll_plan(now)
    };
    let source = GrantPoll::new(endpoint.clone(), grant);

    let report = Coordinator::new()
        .run(&source, schedule, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, PollState::Expired);
    assert!(report.elapsed <= Duration::from_secs(6));
    let polls = endpoint.calls();
    assert!((5..=6).contains(&polls), "polled {polls} times");
    assert_eq!(
        report.into_tokens().unwrap_err().error_kind,
        ErrorKind::OAuth(OAuthErrorKind::ExpiredToken)
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_polling() {
    let endpoint = Arc::new(PendingThenApproved::new(None));
    let (grant, schedule) = {
        let now = Utc::now();
        device_handle(now, 600, 5).poll_plan(now)
    };
    let source = Arc::new(GrantPoll::new(endpoint.clone(), grant));
    let cancel = CancellationToken::new();

    let task = {
        let source = source.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { Coordinator::new().run(source.as_ref(), schedule, &cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(12)).await;
    cancel.cancel();
    let report = task.await.unwrap().unwrap();

    assert!(matches!(
        report.outcome,
        PollOutcome::TimedOut(TimeoutReason::Cancelled)
    ));
    // Polls at 0s, 5s and 10s; nothing after the cancel.
    assert_eq!(endpoint.calls(), 3);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(endpoint.calls(), 3);
}

#[tokio::test]
async fn device_flow_against_server() {
    let mut server = mockito::Server::new_async().await;
    let start = server
        .mock("POST", "/env/as/device_authorization")
        .with_status(200)
        .with_body(
            r#"{"device_code":"dc-1","user_code":"ABCD-EFGH","verification_uri":"https://auth.example/activate","expires_in":600,"interval":1}"#,
        )
        .create_async()
        .await;
    let token = server
        .mock("POST", "/env/as/token")
        .match_body(mockito::Matcher::UrlEncoded(
            "device_code".into(),
            "dc-1".into(),
        ))
        .with_status(200)
        .with_body(r#"{"access_token":"at-1","token_type":"Bearer","expires_in":3600}"#)
        .create_async()
        .await;

    let endpoints = Endpoints::from_base(&server.url(), "env").unwrap();
    let client = ClientConfig::confidential("tv-app", "shh", ClientAuthMethod::ClientSecretPost);
    let builder = Builder::new(endpoints.clone(), reqwest::Client::new());
    let ctx = AuthorizationRequestContext::new("env", client.clone(), FlowVariant::DeviceCode);

    let handle = builder.start_device(&ctx).await.unwrap();
    assert_eq!(handle.user_code, "ABCD-EFGH");
    assert_eq!(handle.interval, Duration::from_secs(1));

    let exchanger = Arc::new(Exchanger::new(endpoints, client, reqwest::Client::new()));
    let (grant, schedule) = handle.poll_plan(Utc::now());
    let report = Coordinator::new()
        .run(
            &GrantPoll::new(exchanger, grant),
            schedule,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.state, PollState::Authorized);
    assert_eq!(report.attempts, 1);
    start.assert_async().await;
    token.assert_async().await;
}
