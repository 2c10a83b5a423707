//! Server lease renewal.
//!
//! One renewer runs for the lifetime of each dispatched job. It keeps the
//! server-side lock alive, signals the executor once the first renewal has
//! succeeded (nothing may be sent to the worker before that), and gives up
//! cleanly in exactly two situations: the server says the job is gone, or
//! errors persist past the lease's grace window.
//!
//! The renewer never decides a job's outcome. It returning without being
//! cancelled is the signal; the executor translates that into `Abandoned`.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::rpc::{ConnectionKind, OrchestrationClient};

/// Interval between successful renewals.
pub const RENEW_INTERVAL: Duration = Duration::from_secs(60);

/// Attempt budget before the first successful renewal.
pub const FIRST_RENEWAL_ATTEMPTS: u32 = 5;

/// Grace past `locked_until` before the renewer concedes the lease.
pub const LEASE_LOSS_SLACK: Duration = Duration::from_secs(5 * 60);

/// Error count past which the backoff stretches out.
const SLOW_BACKOFF_THRESHOLD: u32 = 5;

/// Connection timeout while renewals are failing.
const DEGRADED_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection timeout once renewals recover.
const HEALTHY_TIMEOUT: Duration = Duration::from_secs(60);

/// Renews the server-side lock on one job request.
pub struct LeaseRenewer {
    client: Arc<dyn OrchestrationClient>,
    pool_id: u64,
    request_id: u64,
    lock_token: Uuid,
}

impl LeaseRenewer {
    /// Creates a renewer for one request.
    #[must_use]
    pub fn new(
        client: Arc<dyn OrchestrationClient>,
        pool_id: u64,
        request_id: u64,
        lock_token: Uuid,
    ) -> Self {
        Self {
            client,
            pool_id,
            request_id,
            lock_token,
        }
    }

    /// Runs the renewal loop until cancelled, the job is gone, or the
    /// lease is irrecoverable.
    ///
    /// `first_renewed` is fulfilled exactly once, on the first successful
    /// renewal. If the renewer returns without fulfilling it, the job must
    /// not be started.
    pub async fn run(self, first_renewed: oneshot::Sender<()>, cancel: CancellationToken) {
        let mut first_renewed = Some(first_renewed);
        let mut error_count: u32 = 0;
        // Monotonic instant past which a failing lease is declared lost;
        // refreshed from `locked_until` on every successful renewal.
        let mut lease_deadline: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            match self
                .client
                .renew_job_request(self.pool_id, self.request_id, self.lock_token)
                .await
            {
                Ok(lease) => {
                    let ttl = (lease.locked_until - Utc::now()).to_std().unwrap_or_default();
                    lease_deadline = Some(Instant::now() + ttl + LEASE_LOSS_SLACK);

                    if error_count > 0 {
                        debug!(request_id = self.request_id, "lease renewal recovered");
                        self.client
                            .set_connection_timeout(ConnectionKind::JobServer, HEALTHY_TIMEOUT);
                        error_count = 0;
                    }
                    if let Some(tx) = first_renewed.take() {
                        let _ = tx.send(());
                    }
                    debug!(
                        request_id = self.request_id,
                        locked_until = %lease.locked_until,
                        "job request lease renewed"
                    );

                    if !idle(&cancel, RENEW_INTERVAL).await {
                        return;
                    }
                }

                Err(err) if err.is_terminal() => {
                    info!(
                        request_id = self.request_id,
                        %err,
                        "job request is gone; stopping lease renewal"
                    );
                    return;
                }

                Err(err) => {
                    error_count += 1;
                    warn!(
                        request_id = self.request_id,
                        %err,
                        error_count,
                        "lease renewal failed"
                    );

                    // Reset the connection and keep its timeout short while
                    // degraded; restored on the next success.
                    if let Err(refresh_err) = self
                        .client
                        .refresh_connection(ConnectionKind::JobServer, DEGRADED_TIMEOUT)
                        .await
                    {
                        warn!(%refresh_err, "job server connection refresh failed");
                    }

                    let delay = match (&first_renewed, lease_deadline) {
                        // Still chasing the first renewal: a small fixed
                        // attempt budget.
                        (Some(_), _) => {
                            if error_count >= FIRST_RENEWAL_ATTEMPTS {
                                warn!(
                                    request_id = self.request_id,
                                    attempts = error_count,
                                    "first lease renewal never succeeded; giving up"
                                );
                                return;
                            }
                            random_backoff(1..=10)
                        }

                        // Renewed before: hold on until the lease plus its
                        // grace window has truly run out.
                        (None, Some(deadline)) => {
                            if Instant::now() >= deadline {
                                warn!(
                                    request_id = self.request_id,
                                    "lease grace window exhausted; the job is lost"
                                );
                                return;
                            }
                            if error_count <= SLOW_BACKOFF_THRESHOLD {
                                random_backoff(5..=15)
                            } else {
                                random_backoff(15..=30)
                            }
                        }

                        // A success always records a deadline.
                        (None, None) => return,
                    };

                    if !idle(&cancel, delay).await {
                        return;
                    }
                }
            }
        }
    }
}

/// Uniformly random backoff, in whole seconds.
fn random_backoff(seconds: RangeInclusive<u64>) -> Duration {
    Duration::from_secs(rand::thread_rng().gen_range(seconds))
}

/// Cancellation-aware sleep. Returns `false` if `cancel` fired first.
async fn idle(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use drover_core::Outcome;

    use super::*;
    use crate::rpc::{JobIssue, RequestLease, RequestStatus, ServerError};

    /// Minimal scripted client: renewals pop from a queue; once the queue
    /// is dry every renewal fails with a transient error.
    struct ScriptedClient {
        renewals: Mutex<Vec<Result<RequestLease, ServerError>>>,
        renew_calls: Mutex<u32>,
        timeouts: Mutex<Vec<Duration>>,
        refreshes: Mutex<u32>,
    }

    impl ScriptedClient {
        fn new(renewals: Vec<Result<RequestLease, ServerError>>) -> Arc<Self> {
            Arc::new(Self {
                renewals: Mutex::new(renewals),
                renew_calls: Mutex::new(0),
                timeouts: Mutex::new(Vec::new()),
                refreshes: Mutex::new(0),
            })
        }

        fn renew_calls(&self) -> u32 {
            *self.renew_calls.lock().unwrap()
        }
    }

    fn lease(locked_until: DateTime<Utc>) -> Result<RequestLease, ServerError> {
        Ok(RequestLease { locked_until })
    }

    #[async_trait]
    impl OrchestrationClient for ScriptedClient {
        async fn renew_job_request(
            &self,
            _pool_id: u64,
            _request_id: u64,
            _lock_token: Uuid,
        ) -> Result<RequestLease, ServerError> {
            *self.renew_calls.lock().unwrap() += 1;
            let mut renewals = self.renewals.lock().unwrap();
            if renewals.is_empty() {
                Err(ServerError::Transient("connection refused".to_string()))
            } else {
                renewals.remove(0)
            }
        }

        async fn finish_job_request(
            &self,
            _pool_id: u64,
            _request_id: u64,
            _lock_token: Uuid,
            _result: Outcome,
            _finished_at: DateTime<Utc>,
        ) -> Result<(), ServerError> {
            Ok(())
        }

        async fn get_job_request(
            &self,
            _pool_id: u64,
            _request_id: u64,
        ) -> Result<RequestStatus, ServerError> {
            Ok(RequestStatus::default())
        }

        async fn refresh_connection(
            &self,
            _kind: ConnectionKind,
            _timeout: Duration,
        ) -> Result<(), ServerError> {
            *self.refreshes.lock().unwrap() += 1;
            Ok(())
        }

        fn set_connection_timeout(&self, _kind: ConnectionKind, timeout: Duration) {
            self.timeouts.lock().unwrap().push(timeout);
        }

        async fn append_job_issue(
            &self,
            _pool_id: u64,
            _job_id: Uuid,
            _issue: JobIssue,
        ) -> Result<(), ServerError> {
            Ok(())
        }
    }

    fn renewer(client: Arc<ScriptedClient>) -> LeaseRenewer {
        LeaseRenewer::new(client, 1, 7, Uuid::new_v4())
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_renewal_signals_once() {
        let client = ScriptedClient::new(vec![
            lease(Utc::now() + chrono::Duration::minutes(10)),
            lease(Utc::now() + chrono::Duration::minutes(10)),
        ]);
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        let task = tokio::spawn(renewer(Arc::clone(&client)).run(tx, cancel.clone()));

        rx.await.expect("first renewal must be signalled");

        cancel.cancel();
        task.await.unwrap();
        assert!(client.renew_calls() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_first_renewal_budget() {
        let client = ScriptedClient::new(vec![]);
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        renewer(Arc::clone(&client)).run(tx, cancel).await;

        // Renewer returned without fulfilling the signal.
        assert!(rx.await.is_err());
        assert_eq!(client.renew_calls(), FIRST_RENEWAL_ATTEMPTS);
        // Every failure reset the connection.
        assert_eq!(*client.refreshes.lock().unwrap(), FIRST_RENEWAL_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_stops_quietly() {
        let client = ScriptedClient::new(vec![Err(ServerError::JobNotFound(7))]);
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        renewer(Arc::clone(&client)).run(tx, cancel).await;

        assert!(rx.await.is_err());
        assert_eq!(client.renew_calls(), 1);
        // No backoff dance for a terminal answer.
        assert_eq!(*client.refreshes.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_expiry_after_success_stops_quietly() {
        let client = ScriptedClient::new(vec![
            lease(Utc::now() + chrono::Duration::minutes(10)),
            Err(ServerError::JobTokenExpired(7)),
        ]);
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        renewer(Arc::clone(&client)).run(tx, cancel).await;

        rx.await.expect("first renewal succeeded");
        assert_eq!(client.renew_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_holds_on_until_lease_grace_exhausted() {
        // One success with a 90 second lease, then permanent failure. The
        // renewer must keep retrying for the lease TTL plus the five
        // minute grace, then return.
        let client = ScriptedClient::new(vec![lease(Utc::now() + chrono::Duration::seconds(90))]);
        let cancel = CancellationToken::new();
        let (tx, _rx) = oneshot::channel();

        let started = Instant::now();
        renewer(Arc::clone(&client)).run(tx, cancel).await;
        let held_for = started.elapsed();

        let expected = Duration::from_secs(90) + LEASE_LOSS_SLACK;
        assert!(
            held_for >= expected,
            "gave up after {held_for:?}, before the grace window"
        );
        // Backoffs are at most 30s, so it cannot have overshot by much.
        assert!(held_for < expected + Duration::from_secs(31));
        // Connection timeout was raised back after... never recovered, so
        // only the degraded refreshes happened.
        assert!(*client.refreshes.lock().unwrap() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_restores_connection_timeout() {
        let client = ScriptedClient::new(vec![
            lease(Utc::now() + chrono::Duration::minutes(10)),
            Err(ServerError::Transient("blip".to_string())),
            lease(Utc::now() + chrono::Duration::minutes(10)),
            Err(ServerError::JobNotFound(7)),
        ]);
        let cancel = CancellationToken::new();
        let (tx, _rx) = oneshot::channel();

        renewer(Arc::clone(&client)).run(tx, cancel).await;

        assert_eq!(
            client.timeouts.lock().unwrap().as_slice(),
            &[HEALTHY_TIMEOUT]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let client = ScriptedClient::new(vec![lease(Utc::now() + chrono::Duration::minutes(10))]);
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        let task = tokio::spawn(renewer(Arc::clone(&client)).run(tx, cancel.clone()));
        rx.await.expect("first renewal succeeded");

        // The renewer is now inside its 60s interval sleep; cancellation
        // must end it promptly, not at the next tick.
        let started = Instant::now();
        cancel.cancel();
        task.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
