// Fan-out of publishing sessions under a concurrency cap.
use fleetwatch_client::Connector;
use fleetwatch_common::ConfigError;
use fleetwatch_common::ids::RunId;
use fleetwatch_common::shutdown;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::{self, JoinError, JoinHandle, JoinSet};

use crate::LoadPlan;
use crate::payload::PayloadFactory;
use crate::session::{Session, SessionOutcome, SessionState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFailure {
    pub index: usize,
    pub client_id: String,
    pub reason: String,
}

/// Aggregate result of one load run.
///
/// `spawned == completed + failed + cancelled` once `run` returns, and
/// `spawned + not_started == plan.session_count`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub run_id: String,
    pub spawned: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub not_started: usize,
    pub published: u64,
    pub failures: Vec<SessionFailure>,
    #[serde(rename = "elapsedMs", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl LoadReport {
    pub fn publish_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.published as f64 / secs
        } else {
            0.0
        }
    }

    fn record(&mut self, outcome: SessionOutcome) {
        self.published += outcome.published;
        match outcome.state {
            SessionState::Completed => self.completed += 1,
            SessionState::Cancelled => self.cancelled += 1,
            _ => {
                self.failed += 1;
                self.failures.push(SessionFailure {
                    index: outcome.index,
                    client_id: outcome.client_id,
                    reason: outcome
                        .error
                        .map(|err| err.to_string())
                        .unwrap_or_else(|| "session ended early".to_string()),
                });
            }
        }
    }

    fn record_join_error(&mut self, index: usize, client_id: String, err: JoinError) {
        self.failed += 1;
        self.failures.push(SessionFailure {
            index,
            client_id,
            reason: format!("session task aborted: {err}"),
        });
    }

    fn reap(
        &mut self,
        joined: Result<(task::Id, SessionOutcome), JoinError>,
        running: &mut HashMap<task::Id, (usize, String)>,
    ) {
        match joined {
            Ok((id, outcome)) => {
                running.remove(&id);
                self.record(outcome);
            }
            Err(err) => {
                let (index, client_id) = running.remove(&err.id()).unwrap_or_default();
                self.record_join_error(index, client_id, err);
            }
        }
    }
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
}

#[derive(Clone)]
pub struct LoadGenerator {
    connector: Arc<dyn Connector>,
    factory: Arc<dyn PayloadFactory>,
    cancel: watch::Receiver<bool>,
}

impl std::fmt::Debug for LoadGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadGenerator")
            .field("endpoint", &self.connector.endpoint())
            .finish_non_exhaustive()
    }
}

impl LoadGenerator {
    pub fn new(connector: Arc<dyn Connector>, factory: Arc<dyn PayloadFactory>) -> Self {
        // Sender dropped immediately: the run is only bounded by the plan.
        let (_, cancel) = watch::channel(false);
        Self {
            connector,
            factory,
            cancel,
        }
    }

    /// Stop the run once `cancel` flips to `true`.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the plan to completion on a background task.
    pub fn spawn(self, plan: LoadPlan) -> JoinHandle<Result<LoadReport, ConfigError>> {
        tokio::spawn(async move { self.run(&plan).await })
    }

    /// Start every session in the plan and wait for all of them.
    ///
    /// A permit is taken before a session task is created, so at most
    /// `max_concurrent_sessions` tasks (and connections) exist at once.
    /// Cancellation stops new sessions from starting; running sessions
    /// observe the same signal and disconnect.
    pub async fn run(&self, plan: &LoadPlan) -> Result<LoadReport, ConfigError> {
        plan.validate()?;
        let run_id = RunId::new();
        let started = Instant::now();
        let plan = Arc::new(plan.clone());
        let permits = Arc::new(Semaphore::new(plan.max_concurrent_sessions));
        let mut cancel = self.cancel.clone();
        let mut tasks = JoinSet::new();
        let mut running = HashMap::new();
        let mut report = LoadReport {
            run_id: run_id.to_string(),
            ..LoadReport::default()
        };
        tracing::info!(
            run_id = %run_id,
            endpoint = %self.connector.endpoint(),
            sessions = plan.session_count,
            messages_per_session = plan.messages_per_session,
            max_concurrent = plan.max_concurrent_sessions,
            topic = %plan.topic,
            "load run starting"
        );

        for index in 0..plan.session_count {
            if shutdown::is_cancelled(&cancel) {
                report.not_started = plan.session_count - index;
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = shutdown::cancelled(&mut cancel) => None,
                permit = Arc::clone(&permits).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                report.not_started = plan.session_count - index;
                break;
            };

            let session = Session::new(&run_id, index);
            let client_id = session.client_id().to_string();
            let connector = Arc::clone(&self.connector);
            let factory = Arc::clone(&self.factory);
            let plan = Arc::clone(&plan);
            let session_cancel = self.cancel.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                session
                    .run(connector.as_ref(), &plan, factory.as_ref(), session_cancel)
                    .await
            });
            running.insert(handle.id(), (index, client_id));
            report.spawned += 1;

            // Reap finished sessions so the join set does not grow with the run.
            while let Some(joined) = tasks.try_join_next_with_id() {
                report.reap(joined, &mut running);
            }
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            report.reap(joined, &mut running);
        }

        report.failures.sort_by_key(|failure| failure.index);
        report.elapsed = started.elapsed();
        tracing::info!(
            run_id = %run_id,
            spawned = report.spawned,
            completed = report.completed,
            failed = report.failed,
            cancelled = report.cancelled,
            not_started = report.not_started,
            published = report.published,
            elapsed = format!("{:.2}s", report.elapsed.as_secs_f64()),
            rate = format!("{:.2} msg/s", report.publish_rate()),
            "load run finished"
        );
        Ok(report)
    }
}
