//! Polling coordinator for device, CIBA and redirectless grants.
//!
//! The coordinator polls once immediately and then sleeps the effective interval
//! between ticks. Cancellation is raced against both the in-flight request and
//! the sleep, so nothing is sent after the token fires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{oauth_error, Error, ErrorKind, HttpErrorKind, OAuthErrorKind};
use crate::oauth::{CibaGrantHandle, DeviceGrantHandle, RedirectlessStart};
use crate::token::{ExchangeOutcome, Grant, TokenEndpoint, TokenSet};

/// Added to the interval on every `slow_down` (RFC 8628 §3.5).
pub const SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Started,
    Polling,
    Authorized,
    Denied,
    Expired,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    /// The caller's own time budget ran out.
    Deadline,
    Cancelled,
}

/// What one poll learned.
#[derive(Debug, Clone)]
pub enum PollTick {
    Pending,
    SlowDown,
    Complete(ExchangeOutcome),
    Denied,
    Expired,
}

#[derive(Debug, Clone)]
pub enum PollOutcome {
    Authorized(ExchangeOutcome),
    Denied,
    Expired,
    TimedOut(TimeoutReason),
}

impl PollOutcome {
    fn state(&self) -> PollState {
        match self {
            PollOutcome::Authorized(_) => PollState::Authorized,
            PollOutcome::Denied => PollState::Denied,
            PollOutcome::Expired => PollState::Expired,
            PollOutcome::TimedOut(_) => PollState::TimedOut,
        }
    }
}

/// Something that can be polled until the user finishes authorizing.
#[async_trait]
pub trait PollSource: Send + Sync {
    async fn poll(&self) -> Result<PollTick, Error>;
}

/// Timing for one polling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    /// Remaining lifetime of the grant, measured from the start of the run.
    pub lifetime: Duration,
    pub slow_down_increment: Duration,
}

impl PollSchedule {
    pub fn new(interval: Duration, lifetime: Duration) -> Self {
        Self {
            interval,
            lifetime,
            slow_down_increment: SLOW_DOWN_INCREMENT,
        }
    }

    /// Schedule for a grant that expires at `expires_at`.
    pub fn until(interval: Duration, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let lifetime = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
        Self::new(interval, lifetime)
    }
}

#[derive(Debug, Clone)]
pub struct PollReport {
    pub state: PollState,
    pub outcome: PollOutcome,
    pub transitions: Vec<PollState>,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl PollReport {
    /// Collapse the report into tokens, turning every non-success into an error.
    pub fn into_tokens(self) -> Result<TokenSet, Error> {
        match self.outcome {
            PollOutcome::Authorized(outcome) => outcome.into_tokens(),
            PollOutcome::Denied => Err(oauth_error(
                OAuthErrorKind::AccessDenied,
                "the user denied the authorization request",
            )),
            PollOutcome::Expired => Err(oauth_error(
                OAuthErrorKind::ExpiredToken,
                "the grant expired before the user authorized it",
            )),
            PollOutcome::TimedOut(reason) => Err(Error {
                source: Some(format!("polling stopped: {:?}", reason).into()),
                error_kind: ErrorKind::Http(HttpErrorKind::Timeout),
            }),
        }
    }
}

/// Drives a [`PollSource`] to a terminal state.
#[derive(Debug, Clone, Default)]
pub struct Coordinator {
    timeout: Option<Duration>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up with `TimedOut(Deadline)` once `timeout` has passed, even if the
    /// grant itself is still alive.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn run(
        &self,
        source: &dyn PollSource,
        schedule: PollSchedule,
        cancel: &CancellationToken,
    ) -> Result<PollReport, Error> {
        let started = Instant::now();
        // `None` means the deadline lies beyond what the clock can represent.
        let expires_at = started.checked_add(schedule.lifetime);
        let give_up_at = self.timeout.and_then(|timeout| started.checked_add(timeout));
        let mut interval = schedule.interval;
        let mut transitions = vec![PollState::Started];
        let mut attempts = 0u32;

        let outcome = loop {
            if cancel.is_cancelled() {
                break PollOutcome::TimedOut(TimeoutReason::Cancelled);
            }
            let now = Instant::now();
            if expires_at.map_or(false, |at| now > at) {
                break PollOutcome::Expired;
            }
            if give_up_at.map_or(false, |at| now > at) {
                break PollOutcome::TimedOut(TimeoutReason::Deadline);
            }

            transitions.push(PollState::Polling);
            attempts += 1;
            let tick = tokio::select! {
                biased;
                _ = cancel.cancelled() => break PollOutcome::TimedOut(TimeoutReason::Cancelled),
                tick = source.poll() => tick,
            };

            match tick {
                Ok(PollTick::Pending) => {}
                Ok(PollTick::SlowDown) => {
                    interval += schedule.slow_down_increment;
                    debug!("Server asked to slow down, interval now {:?}", interval);
                }
                Ok(PollTick::Complete(outcome)) => break PollOutcome::Authorized(outcome),
                Ok(PollTick::Denied) => break PollOutcome::Denied,
                Ok(PollTick::Expired) => break PollOutcome::Expired,
                Err(e) if e.is_transient() => {
                    warn!("Transient error while polling, will retry: {}", e);
                }
                Err(e) => return Err(e),
            }

            let Some(next) = Instant::now().checked_add(interval) else {
                break PollOutcome::Expired;
            };
            // A tick exactly at expiry is still allowed.
            if expires_at.map_or(false, |at| next > at) {
                break PollOutcome::Expired;
            }
            if give_up_at.map_or(false, |at| next > at) {
                break PollOutcome::TimedOut(TimeoutReason::Deadline);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break PollOutcome::TimedOut(TimeoutReason::Cancelled),
                _ = sleep_until(next) => {}
            }
        };

        let state = outcome.state();
        transitions.push(state);
        let elapsed = started.elapsed();
        info!(
            "Polling finished in state {:?} after {} attempts ({:?})",
            state, attempts, elapsed
        );

        Ok(PollReport {
            state,
            outcome,
            transitions,
            attempts,
            elapsed,
        })
    }
}

/// Polls the token endpoint with a fixed grant.
pub struct GrantPoll {
    endpoint: Arc<dyn TokenEndpoint>,
    grant: Grant,
}

impl GrantPoll {
    pub fn new(endpoint: Arc<dyn TokenEndpoint>, grant: Grant) -> Self {
        Self { endpoint, grant }
    }
}

#[async_trait]
impl PollSource for GrantPoll {
    async fn poll(&self) -> Result<PollTick, Error> {
        match self.endpoint.exchange(self.grant.clone()).await {
            Ok(outcome) => Ok(PollTick::Complete(outcome)),
            Err(e) => match &e.error_kind {
                ErrorKind::OAuth(OAuthErrorKind::AuthorizationPending) => Ok(PollTick::Pending),
                ErrorKind::OAuth(OAuthErrorKind::SlowDown) => Ok(PollTick::SlowDown),
                ErrorKind::OAuth(OAuthErrorKind::AccessDenied) => Ok(PollTick::Denied),
                ErrorKind::OAuth(OAuthErrorKind::ExpiredToken) => Ok(PollTick::Expired),
                _ => Err(e),
            },
        }
    }
}

/// Grant handles that can be polled to completion.
pub trait Pollable {
    fn poll_plan(&self, now: DateTime<Utc>) -> (Grant, PollSchedule);
}

impl Pollable for DeviceGrantHandle {
    fn poll_plan(&self, now: DateTime<Utc>) -> (Grant, PollSchedule) {
        (
            Grant::DeviceCode {
                device_code: self.device_code.clone(),
            },
            PollSchedule::until(self.interval, self.expires_at, now),
        )
    }
}

impl Pollable for CibaGrantHandle {
    fn poll_plan(&self, now: DateTime<Utc>) -> (Grant, PollSchedule) {
        (
            Grant::Ciba {
                auth_req_id: self.auth_req_id.clone(),
            },
            PollSchedule::until(self.interval, self.expires_at, now),
        )
    }
}

impl Pollable for RedirectlessStart {
    fn poll_plan(&self, now: DateTime<Utc>) -> (Grant, PollSchedule) {
        (
            Grant::RedirectlessResume {
                resume_url: self.handle.resume_url.clone(),
                flow_id: self.handle.flow_id.clone(),
                state: self.state.clone(),
                code_verifier: Some(self.pkce.verifier.clone()),
                redirect_uri: self.redirect_uri.clone(),
            },
            PollSchedule::until(self.handle.interval, self.handle.expires_at, now),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HttpErrorKind, ProtocolErrorKind};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted ticks, repeating the last one forever.
    struct Scripted {
        ticks: Mutex<VecDeque<Result<PollTick, Error>>>,
        last: fn() -> Result<PollTick, Error>,
        calls: std::sync::atomic::AtomicU32,
    }

    impl Scripted {
        fn new(ticks: Vec<Result<PollTick, Error>>, last: fn() -> Result<PollTick, Error>) -> Self {
            Self {
                ticks: Mutex::new(ticks.into()),
                last,
                calls: std::sync::atomic::AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PollSource for Scripted {
        async fn poll(&self) -> Result<PollTick, Error> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let next = self.ticks.lock().unwrap().pop_front();
            next.unwrap_or_else(self.last)
        }
    }

    fn pending() -> Result<PollTick, Error> {
        Ok(PollTick::Pending)
    }

    fn tokens() -> Result<PollTick, Error> {
        Ok(PollTick::Complete(ExchangeOutcome::Tokens(TokenSet::new(
            "at",
            Some(3600),
            Utc::now(),
        ))))
    }

    fn network_error() -> Error {
        Error {
            source: None,
            error_kind: ErrorKind::Http(HttpErrorKind::Network),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_authorized_on_third_poll() {
        let source = Scripted::new(vec![pending(), pending()], tokens);
        let schedule = PollSchedule::new(Duration::from_secs(5), Duration::from_secs(10));

        let report = Coordinator::new()
            .run(&source, schedule, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.state, PollState::Authorized);
        assert_eq!(
            report.transitions,
            vec![
                PollState::Started,
                PollState::Polling,
                PollState::Polling,
                PollState::Polling,
                PollState::Authorized
            ]
        );
        assert_eq!(report.attempts, 3);
        assert!(report.elapsed >= Duration::from_secs(10));
        assert!(report.into_tokens().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_without_polling_past_deadline() {
        let source = Scripted::new(vec![], pending);
        let schedule = PollSchedule::new(Duration::from_secs(1), Duration::from_secs(5));

        let report = Coordinator::new()
            .run(&source, schedule, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.state, PollState::Expired);
        assert!(report.elapsed >= Duration::from_secs(5));
        assert!(report.elapsed <= Duration::from_secs(6));
        assert_eq!(source.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_down_widens_interval() {
        let source = Scripted::new(vec![Ok(PollTick::SlowDown), pending()], tokens);
        let schedule = PollSchedule::new(Duration::from_secs(1), Duration::from_secs(60));

        let report = Coordinator::new()
            .run(&source, schedule, &CancellationToken::new())
            .await
            .unwrap();

        // t=0 slow_down, t=6 pending, t=12 authorized
        assert_eq!(report.state, PollState::Authorized);
        assert!(report.elapsed >= Duration::from_secs(12));
        assert!(report.elapsed < Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_and_server_expiry() {
        let denied = Scripted::new(vec![pending()], || Ok(PollTick::Denied));
        let schedule = PollSchedule::new(Duration::from_secs(1), Duration::from_secs(30));
        let report = Coordinator::new()
            .run(&denied, schedule, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.state, PollState::Denied);
        assert_eq!(
            report.into_tokens().unwrap_err().error_kind,
            ErrorKind::OAuth(OAuthErrorKind::AccessDenied)
        );

        let expired = Scripted::new(vec![], || Ok(PollTick::Expired));
        let report = Coordinator::new()
            .run(&expired, schedule, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.state, PollState::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_count_as_pending() {
        let source = Scripted::new(vec![Err(network_error()), Err(network_error())], tokens);
        let schedule = PollSchedule::new(Duration::from_secs(2), Duration::from_secs(30));

        let report = Coordinator::new()
            .run(&source, schedule, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.state, PollState::Authorized);
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_errors_stop_polling() {
        let source = Scripted::new(vec![pending()], || {
            Err(crate::error::protocol_error(
                ProtocolErrorKind::MalformedResponse,
                "garbage",
            ))
        });
        let schedule = PollSchedule::new(Duration::from_secs(1), Duration::from_secs(30));

        let err = Coordinator::new()
            .run(&source, schedule, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Protocol(ProtocolErrorKind::MalformedResponse)
        );
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep_sends_nothing_more() {
        let source = Arc::new(Scripted::new(vec![], pending));
        let cancel = CancellationToken::new();
        let schedule = PollSchedule::new(Duration::from_secs(5), Duration::from_secs(300));

        let task = {
            let source = source.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                Coordinator::new()
                    .run(source.as_ref(), schedule, &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(7)).await;
        cancel.cancel();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.outcome.state(), PollState::TimedOut);
        assert!(matches!(
            report.outcome,
            PollOutcome::TimedOut(TimeoutReason::Cancelled)
        ));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_timeout() {
        let source = Scripted::new(vec![], pending);
        let schedule = PollSchedule::new(Duration::from_secs(1), Duration::from_secs(300));

        let report = Coordinator::new()
            .with_timeout(Duration::from_secs(3))
            .run(&source, schedule, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            report.outcome,
            PollOutcome::TimedOut(TimeoutReason::Deadline)
        ));
        assert_eq!(
            report.into_tokens().unwrap_err().error_kind,
            ErrorKind::Http(HttpErrorKind::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_outage_counts_as_pending() {
        use crate::oauth::response::error_from_body;
        use crate::oauth::ClientAuthMethod;

        let gateway = error_from_body(503, "<html>maintenance</html>", ClientAuthMethod::None);
        let busy = error_from_body(
            400,
            r#"{"error":"temporarily_unavailable"}"#,
            ClientAuthMethod::None,
        );
        let source = Scripted::new(vec![Err(gateway), Err(busy)], tokens);
        let schedule = PollSchedule::new(Duration::from_secs(1), Duration::from_secs(30));

        let report = Coordinator::new()
            .run(&source, schedule, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.state, PollState::Authorized);
        assert_eq!(report.attempts, 3);
    }

    #[test]
    fn test_redirectless_plan_carries_issued_state() {
        let now = Utc::now();
        let start = RedirectlessStart {
            handle: crate::oauth::RedirectlessGrantHandle {
                resume_url: "https://auth.example/env/as/resume?flowId=f1".to_string(),
                flow_id: "f1".to_string(),
                status: "USERNAME_PASSWORD_REQUIRED".to_string(),
                expires_at: now + chrono::Duration::seconds(1800),
                interval: Duration::from_secs(2),
            },
            state: "issued-state".to_string(),
            pkce: crate::oauth::PkcePair::generate().unwrap(),
            redirect_uri: Some("https://app.example/cb".to_string()),
        };

        match start.poll_plan(now).0 {
            Grant::RedirectlessResume { state, flow_id, .. } => {
                assert_eq!(state, "issued-state");
                assert_eq!(flow_id, "f1");
            }
            other => panic!("unexpected grant: {other:?}"),
        }
    }

    #[test]
    fn test_schedule_from_handle() {
        let now = Utc::now();
        let handle = DeviceGrantHandle {
            device_code: "dc".to_string(),
            user_code: "UC".to_string(),
            verification_uri: "https://x".to_string(),
            verification_uri_complete: None,
            expires_at: now + chrono::Duration::seconds(600),
            interval: Duration::from_secs(5),
        };
        let (grant, schedule) = handle.poll_plan(now);
        assert_eq!(
            grant,
            Grant::DeviceCode {
                device_code: "dc".to_string()
            }
        );
        assert_eq!(schedule.lifetime, Duration::from_secs(600));

        let (_, expired) = handle.poll_plan(now + chrono::Duration::seconds(601));
        assert_eq!(expired.lifetime, Duration::ZERO);
    }
}
