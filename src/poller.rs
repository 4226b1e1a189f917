use futures::{future, stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::JobClient,
    extract, labels,
    metrics::{MetricRegistry, PollOutcome},
    models::{ExtractionMode, JobResult, QueryJob, QuerySpec, ResolvedSample, Row},
    ExporterError, Result,
};

/// What a failing job does to the rest of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Any job error stops the loop.
    #[default]
    Fatal,
    /// Only transport and credential failures stop the loop. Expired jobs
    /// are resubmitted; other failures skip the job for the pass.
    Isolate,
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub concurrency: usize,
    pub cancel_timeout: Duration,
    pub policy: FailurePolicy,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            concurrency: 4,
            cancel_timeout: Duration::from_secs(10),
            policy: FailurePolicy::Fatal,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub completed: usize,
    pub pending: usize,
    pub samples: usize,
    pub failed: usize,
    pub resubmitted: usize,
}

pub struct PollLoop<C: JobClient + ?Sized> {
    client: Arc<C>,
    registry: Arc<MetricRegistry>,
    jobs: Vec<QueryJob>,
    settings: PollSettings,
}

impl<C: JobClient + ?Sized> PollLoop<C> {
    /// Submits a job for every query. If one submission fails the jobs
    /// already started are cancelled before the error is returned.
    ///
    /// Cancelling `token` stops submitting and returns the jobs started so
    /// far; `run` then cancels them without polling.
    pub async fn start(
        client: Arc<C>,
        registry: Arc<MetricRegistry>,
        queries: &[QuerySpec],
        settings: PollSettings,
        token: &CancellationToken,
    ) -> Result<Self> {
        let mut jobs = Vec::with_capacity(queries.len());
        for spec in queries {
            let submitted = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                submitted = client.submit(spec) => Some(submitted),
            };
            let Some(submitted) = submitted else {
                info!(submitted = jobs.len(), "Cancelled while starting query jobs");
                break;
            };
            match submitted {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    cancel_jobs(client.as_ref(), &jobs, settings.cancel_timeout).await;
                    return Err(e);
                }
            }
        }

        Ok(Self {
            client,
            registry,
            jobs,
            settings,
        })
    }

    pub fn jobs(&self) -> &[QueryJob] {
        &self.jobs
    }

    /// Polls every job once and publishes the completed results.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let (mut report, expired) = self.poll_jobs().await?;
        self.resubmit(expired, &mut report).await?;
        Ok(report)
    }

    /// Polling half of a pass. Returns the indexes of expired jobs that
    /// still have to be resubmitted.
    async fn poll_jobs(&self) -> Result<(TickReport, Vec<usize>)> {
        let client = self.client.as_ref();
        let polls: Vec<(usize, Result<JobResult>)> = stream::iter(self.jobs.iter().enumerate())
            .map(|(index, job)| async move { (index, client.poll(job).await) })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut report = TickReport::default();
        let mut expired = Vec::new();

        for (index, polled) in polls {
            let job = &self.jobs[index];
            let outcome = match polled {
                Ok(result) => self.apply(job, &result),
                Err(e) => {
                    self.registry.record_poll(PollOutcome::Error);
                    Err(e)
                }
            };
            match outcome {
                Ok(Some(samples)) => {
                    report.completed += 1;
                    report.samples += samples;
                }
                Ok(None) => report.pending += 1,
                Err(e) => {
                    if self.settings.policy == FailurePolicy::Fatal || e.is_service_fatal() {
                        return Err(e);
                    }
                    report.failed += 1;
                    if matches!(e, ExporterError::JobNotFound(_)) {
                        warn!(job_id = %job.id, metric = %job.metric_name(), "Query job expired; resubmitting");
                        expired.push(index);
                    } else {
                        warn!(job_id = %job.id, metric = %job.metric_name(), "Skipping query job this pass: {}", e);
                    }
                }
            }
        }

        Ok((report, expired))
    }

    /// Replaces expired jobs. Once a submission is sent the returned job
    /// must be recorded, so this half of a pass is never interrupted.
    async fn resubmit(&mut self, expired: Vec<usize>, report: &mut TickReport) -> Result<()> {
        for index in expired {
            let resubmitted = self.client.submit(&self.jobs[index].spec).await;
            match resubmitted {
                Ok(job) => {
                    self.jobs[index] = job;
                    report.resubmitted += 1;
                }
                Err(e) if e.is_service_fatal() => return Err(e),
                Err(e) => warn!(
                    metric = %self.jobs[index].metric_name(),
                    "Failed to resubmit query job: {}", e
                ),
            }
        }

        Ok(())
    }

    /// Publishes a completed result. `None` means the job is still running.
    fn apply(&self, job: &QueryJob, result: &JobResult) -> Result<Option<usize>> {
        if !result.done {
            self.registry.record_poll(PollOutcome::Pending);
            debug!(job_id = %job.id, metric = %job.metric_name(), "Skipped value because query isn't done");
            return Ok(None);
        }
        self.registry.record_poll(PollOutcome::Done);

        let samples = match job.spec.extraction_mode() {
            ExtractionMode::SingleRow => match extract::single_row_value(&result.events)? {
                Some(value) => {
                    self.publish(job, None, value)?;
                    1
                }
                None => {
                    info!(job_id = %job.id, metric = %job.metric_name(), "No value in query result");
                    0
                }
            },
            ExtractionMode::Table => {
                let (values, skipped) = extract::table_values(&result.events);
                self.registry.record_skipped_rows(skipped);
                for (row, value) in &values {
                    self.publish(job, Some(*row), *value)?;
                }
                values.len()
            }
        };

        Ok(Some(samples))
    }

    fn publish(&self, job: &QueryJob, row: Option<&Row>, value: f64) -> Result<()> {
        let sample = ResolvedSample {
            metric_name: job.metric_name().to_string(),
            labels: labels::resolve(&job.spec, row),
            value,
        };
        self.registry.set(&sample)
    }

    /// Ticks until `token` is cancelled or a pass fails, then cancels
    /// every active job. `Ok` means the loop was cancelled.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let outcome = self.drive(&token).await;
        self.shutdown().await;
        outcome
    }

    async fn drive(&mut self, token: &CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            jobs = self.jobs.len(),
            interval = ?self.settings.interval,
            "Polling query jobs"
        );

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let (mut report, expired) = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                polled = self.poll_jobs() => polled?,
            };
            self.resubmit(expired, &mut report).await?;
            debug!(
                completed = report.completed,
                pending = report.pending,
                samples = report.samples,
                failed = report.failed,
                resubmitted = report.resubmitted,
                "Finished polling pass"
            );
        }
    }

    pub async fn shutdown(&self) {
        cancel_jobs(self.client.as_ref(), &self.jobs, self.settings.cancel_timeout).await;
    }
}

async fn cancel_jobs<C: JobClient + ?Sized>(client: &C, jobs: &[QueryJob], timeout: Duration) {
    if jobs.is_empty() {
        return;
    }
    let cancels = future::join_all(jobs.iter().map(|job| client.cancel(job)));
    if tokio::time::timeout(timeout, cancels).await.is_err() {
        warn!(jobs = jobs.len(), "Timed out stopping query jobs");
    }
}
