//! Shared fakes for the dispatch scenario tests.
//!
//! The orchestration client and the worker seam are both scripted: tests
//! declare the server's answers and the worker's behavior up front, run
//! the dispatcher against them under a paused clock, and assert on the
//! recorded interactions.

#![allow(dead_code)] // Each test binary exercises a subset of the fakes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use drover_agent::config::DispatchConfig;
use drover_agent::rpc::{
    ConnectionKind, JobIssue, OrchestrationClient, RequestLease, RequestStatus, ServerError,
};
use drover_agent::services::{
    DispatchServices, FeatureFlagProvider, FlagState, NotificationSink, TelemetryEvent,
    TelemetryPublisher,
};
use drover_agent::worker::{Worker, WorkerLauncher};
use drover_agent::JobDispatcher;
use drover_core::channel::{ChannelError, MessageType};
use drover_core::process::ExitWatch;
use drover_core::{JobRequest, Outcome, PlanDescriptor, ServiceEndpoint};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// =============================================================================
// Orchestration client fake
// =============================================================================

#[derive(Debug)]
pub struct ClientState {
    /// Scripted renewal answers, popped in order.
    pub renewals: VecDeque<Result<RequestLease, ServerError>>,
    /// When the renewal script is exhausted: fail transiently (`true`) or
    /// keep granting ten-minute leases (`false`).
    pub renew_exhausted_fails: bool,
    /// Delay applied to every renewal answer.
    pub renew_delay: Duration,
    /// Scripted `get_job_request` answers, popped in order.
    pub gets: VecDeque<Result<RequestStatus, ServerError>>,
    /// Delay applied to every status query answer.
    pub get_delay: Duration,
    /// Scripted finish failures, popped before the call succeeds.
    pub finish_failures: VecDeque<ServerError>,

    pub renew_calls: u32,
    pub get_calls: u32,
    pub refresh_calls: u32,
    pub set_timeouts: Vec<Duration>,
    pub finishes: Vec<(u64, Outcome)>,
    pub issues: Vec<(Uuid, JobIssue)>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            renewals: VecDeque::new(),
            renew_exhausted_fails: false,
            renew_delay: Duration::ZERO,
            gets: VecDeque::new(),
            get_delay: Duration::ZERO,
            finish_failures: VecDeque::new(),
            renew_calls: 0,
            get_calls: 0,
            refresh_calls: 0,
            set_timeouts: Vec::new(),
            finishes: Vec::new(),
            issues: Vec::new(),
        }
    }
}

pub struct FakeClient {
    state: Mutex<ClientState>,
}

impl FakeClient {
    pub fn new() -> Arc<Self> {
        Self::configure(|_| {})
    }

    pub fn configure(f: impl FnOnce(&mut ClientState)) -> Arc<Self> {
        let mut state = ClientState::default();
        f(&mut state);
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut ClientState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn finishes(&self) -> Vec<(u64, Outcome)> {
        self.state.lock().unwrap().finishes.clone()
    }

    pub fn issues(&self) -> Vec<(Uuid, JobIssue)> {
        self.state.lock().unwrap().issues.clone()
    }

    pub fn renew_calls(&self) -> u32 {
        self.state.lock().unwrap().renew_calls
    }

    pub fn get_calls(&self) -> u32 {
        self.state.lock().unwrap().get_calls
    }
}

fn ten_minute_lease() -> RequestLease {
    RequestLease {
        locked_until: Utc::now() + chrono::Duration::minutes(10),
    }
}

#[async_trait]
impl OrchestrationClient for FakeClient {
    async fn renew_job_request(
        &self,
        _pool_id: u64,
        _request_id: u64,
        _lock_token: Uuid,
    ) -> Result<RequestLease, ServerError> {
        let (delay, answer) = {
            let mut state = self.state.lock().unwrap();
            state.renew_calls += 1;
            let answer = match state.renewals.pop_front() {
                Some(answer) => answer,
                None if state.renew_exhausted_fails => {
                    Err(ServerError::Transient("renewal unavailable".to_string()))
                }
                None => Ok(ten_minute_lease()),
            };
            (state.renew_delay, answer)
        };
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        answer
    }

    async fn finish_job_request(
        &self,
        _pool_id: u64,
        request_id: u64,
        _lock_token: Uuid,
        result: Outcome,
        _finished_at: DateTime<Utc>,
    ) -> Result<(), ServerError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.finish_failures.pop_front() {
            return Err(err);
        }
        state.finishes.push((request_id, result));
        Ok(())
    }

    async fn get_job_request(
        &self,
        _pool_id: u64,
        _request_id: u64,
    ) -> Result<RequestStatus, ServerError> {
        let (delay, answer) = {
            let mut state = self.state.lock().unwrap();
            state.get_calls += 1;
            let answer = state
                .gets
                .pop_front()
                .unwrap_or(Ok(RequestStatus { result: None }));
            (state.get_delay, answer)
        };
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        answer
    }

    async fn refresh_connection(
        &self,
        _kind: ConnectionKind,
        _timeout: Duration,
    ) -> Result<(), ServerError> {
        self.state.lock().unwrap().refresh_calls += 1;
        Ok(())
    }

    fn set_connection_timeout(&self, _kind: ConnectionKind, timeout: Duration) {
        self.state.lock().unwrap().set_timeouts.push(timeout);
    }

    async fn append_job_issue(
        &self,
        _pool_id: u64,
        job_id: Uuid,
        issue: JobIssue,
    ) -> Result<(), ServerError> {
        self.state.lock().unwrap().issues.push((job_id, issue));
        Ok(())
    }
}

// =============================================================================
// Scripted worker
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    Timeout,
    Closed,
}

/// Declarative behavior for one scripted worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerScript {
    /// Exit naturally with this code after this delay.
    pub exit_after: Option<(Duration, i32)>,
    /// Exit with this code this long after receiving a cancel-family
    /// message.
    pub exit_on_cancel: Option<(Duration, i32)>,
    /// Sends of these message types fail.
    pub fail_sends: Vec<(MessageType, SendFailure)>,
    /// Ignore the process-tree kill (a truly stuck worker).
    pub ignore_kill: bool,
    /// Captured stdio the worker leaves behind.
    pub output: Vec<String>,
}

impl WorkerScript {
    pub fn exits(delay: Duration, code: i32) -> Self {
        Self {
            exit_after: Some((delay, code)),
            ..Self::default()
        }
    }

    pub fn acks_cancel(delay: Duration, code: i32) -> Self {
        Self {
            exit_on_cancel: Some((delay, code)),
            ..Self::default()
        }
    }

    pub fn runs_until_killed() -> Self {
        Self::default()
    }
}

/// Exit code a scripted worker reports when killed.
pub const KILLED_EXIT_CODE: i32 = 137;

/// Everything a test can observe about one launched worker.
#[derive(Clone)]
pub struct LaunchRecord {
    pub request: JobRequest,
    sent: Arc<Mutex<Vec<(MessageType, Instant)>>>,
    killed_at: Arc<Mutex<Option<Instant>>>,
    exited_at: Arc<Mutex<Option<Instant>>>,
}

impl LaunchRecord {
    pub fn sent_kinds(&self) -> Vec<MessageType> {
        self.sent.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }

    pub fn sent_at(&self, kind: MessageType) -> Option<Instant> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, at)| *at)
    }

    pub fn killed_at(&self) -> Option<Instant> {
        *self.killed_at.lock().unwrap()
    }

    pub fn exited_at(&self) -> Option<Instant> {
        *self.exited_at.lock().unwrap()
    }
}

struct ScriptedWorker {
    script: WorkerScript,
    record: LaunchRecord,
    exit_tx: Arc<watch::Sender<Option<i32>>>,
    exit: ExitWatch,
}

fn publish_exit(
    tx: &watch::Sender<Option<i32>>,
    exited_at: &Arc<Mutex<Option<Instant>>>,
    code: i32,
) {
    let published = tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(code);
            true
        } else {
            false
        }
    });
    if published {
        *exited_at.lock().unwrap() = Some(Instant::now());
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn send(
        &mut self,
        kind: MessageType,
        _body: Bytes,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        if let Some((_, failure)) = self.script.fail_sends.iter().find(|(k, _)| *k == kind) {
            return match failure {
                SendFailure::Timeout => Err(ChannelError::Timeout { timeout }),
                SendFailure::Closed => Err(ChannelError::Closed),
            };
        }

        self.record.sent.lock().unwrap().push((kind, Instant::now()));

        if kind.is_cancel_family() {
            if let Some((delay, code)) = self.script.exit_on_cancel {
                let tx = Arc::clone(&self.exit_tx);
                let exited_at = Arc::clone(&self.record.exited_at);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    publish_exit(&tx, &exited_at, code);
                });
            }
        }
        Ok(())
    }

    fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    fn captured_output(&self) -> String {
        self.script.output.join("\n")
    }
}

/// Launcher handing out scripted workers; scripts are consumed in order
/// with the default used once the queue is dry.
pub struct ScriptedLauncher {
    scripts: Mutex<VecDeque<WorkerScript>>,
    default: WorkerScript,
    launches: Mutex<Vec<LaunchRecord>>,
}

impl ScriptedLauncher {
    pub fn new(default: WorkerScript) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            default,
            launches: Mutex::new(Vec::new()),
        })
    }

    pub fn queue_script(&self, script: WorkerScript) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.launches.lock().unwrap().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }
}

#[async_trait]
impl WorkerLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        request: &JobRequest,
        kill: CancellationToken,
    ) -> Result<Box<dyn Worker>, ChannelError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        let (exit_tx, exit) = ExitWatch::channel();
        let exit_tx = Arc::new(exit_tx);
        let record = LaunchRecord {
            request: request.clone(),
            sent: Arc::new(Mutex::new(Vec::new())),
            killed_at: Arc::new(Mutex::new(None)),
            exited_at: Arc::new(Mutex::new(None)),
        };

        if let Some((delay, code)) = script.exit_after {
            let tx = Arc::clone(&exit_tx);
            let exited_at = Arc::clone(&record.exited_at);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                publish_exit(&tx, &exited_at, code);
            });
        }

        {
            let tx = Arc::clone(&exit_tx);
            let killed_at = Arc::clone(&record.killed_at);
            let exited_at = Arc::clone(&record.exited_at);
            let ignore_kill = script.ignore_kill;
            tokio::spawn(async move {
                kill.cancelled().await;
                *killed_at.lock().unwrap() = Some(Instant::now());
                if !ignore_kill {
                    publish_exit(&tx, &exited_at, KILLED_EXIT_CODE);
                }
            });
        }

        self.launches.lock().unwrap().push(record.clone());

        Ok(Box::new(ScriptedWorker {
            script,
            record,
            exit_tx,
            exit,
        }))
    }
}

// =============================================================================
// Flags, notifications, telemetry
// =============================================================================

#[derive(Default)]
pub struct FakeFlags {
    flags: Mutex<HashMap<String, FlagState>>,
}

impl FakeFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, name: &str, state: FlagState) {
        self.flags.lock().unwrap().insert(name.to_string(), state);
    }
}

#[async_trait]
impl FeatureFlagProvider for FakeFlags {
    async fn get(&self, name: &str) -> Option<FlagState> {
        self.flags.lock().unwrap().get(name).copied()
    }
}

#[derive(Default)]
pub struct RecordingSink {
    started: Mutex<Vec<(Uuid, String)>>,
    completed: Mutex<Vec<Uuid>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started(&self) -> Vec<(Uuid, String)> {
        self.started.lock().unwrap().clone()
    }

    pub fn completed(&self) -> Vec<Uuid> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn job_started(&self, job_id: Uuid, job_name: &str) {
        self.started
            .lock()
            .unwrap()
            .push((job_id, job_name.to_string()));
    }

    async fn job_completed(&self, job_id: Uuid) {
        self.completed.lock().unwrap().push(job_id);
    }
}

#[derive(Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl TelemetryPublisher for RecordingTelemetry {
    fn publish(&self, event: TelemetryEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub dispatcher: JobDispatcher,
    pub client: Arc<FakeClient>,
    pub launcher: Arc<ScriptedLauncher>,
    pub flags: Arc<FakeFlags>,
    pub sink: Arc<RecordingSink>,
    pub telemetry: Arc<RecordingTelemetry>,
}

impl Harness {
    pub fn new(default_script: WorkerScript) -> Self {
        Self::with_client(default_script, FakeClient::new())
    }

    pub fn with_client(default_script: WorkerScript, client: Arc<FakeClient>) -> Self {
        let launcher = ScriptedLauncher::new(default_script);
        let flags = FakeFlags::new();
        let sink = RecordingSink::new();
        let telemetry = RecordingTelemetry::new();

        let dispatcher = JobDispatcher::new(
            DispatchConfig {
                pool_id: 1,
                ..DispatchConfig::default()
            },
            DispatchServices {
                client: Arc::clone(&client) as Arc<dyn OrchestrationClient>,
                launcher: Arc::clone(&launcher) as Arc<dyn WorkerLauncher>,
                features: Arc::clone(&flags) as Arc<dyn FeatureFlagProvider>,
                notifications: Arc::clone(&sink) as Arc<dyn NotificationSink>,
                telemetry: Arc::clone(&telemetry) as Arc<dyn TelemetryPublisher>,
            },
        );

        Self {
            dispatcher,
            client,
            launcher,
            flags,
            sink,
            telemetry,
        }
    }
}

/// Builds a request with a fresh job id.
pub fn request(request_id: u64) -> JobRequest {
    JobRequest {
        job_id: Uuid::new_v4(),
        request_id,
        lock_token: Uuid::new_v4(),
        job_name: format!("job-{request_id}"),
        plan: PlanDescriptor {
            plan_type: "build".to_string(),
            version: 14,
            features: Default::default(),
        },
        variables: BTreeMap::new(),
        endpoints: vec![ServiceEndpoint {
            name: drover_core::job::SYSTEM_ENDPOINT.to_string(),
            url: "https://orchestrator.example.test".to_string(),
            token: Some("token".to_string()),
        }],
    }
}

/// Lets the spawned executor make progress up to its next timer.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
