//! Capture jobs – one per trigger, run off the broker's receive path.
//!
//! By default (`JOB_WORKERS=0`) every trigger gets its own task and nothing
//! is capped.  Setting `JOB_WORKERS` above zero opts into a fixed set of
//! workers that drain a bounded queue; `JOB_OVERFLOW` then decides what
//! happens when it is full.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{error, info, warn};

use snapper_common::config::{JobConfig, OverflowPolicy};
use snapper_common::protocol::{CaptureOutcome, CaptureRequest, StatusPayload};

use crate::capture::CaptureStrategy;
use crate::publisher::StatusPublisher;

/// Everything a running job needs.
struct JobContext {
    capture: Arc<dyn CaptureStrategy>,
    publisher: Arc<StatusPublisher>,
}

enum Scheduling {
    Unbounded,
    Pool {
        queue: Arc<JobQueue>,
        overflow: OverflowPolicy,
    },
}

pub struct JobDispatcher {
    ctx: Arc<JobContext>,
    scheduling: Scheduling,
}

impl JobDispatcher {
    /// Must be called inside the tokio runtime: pool workers start here.
    pub fn new(
        capture: Arc<dyn CaptureStrategy>,
        publisher: Arc<StatusPublisher>,
        jobs: JobConfig,
    ) -> Self {
        let ctx = Arc::new(JobContext { capture, publisher });

        let scheduling = if jobs.workers == 0 {
            info!("Job dispatch: one task per trigger (unbounded)");
            Scheduling::Unbounded
        } else {
            let queue = Arc::new(JobQueue::new(jobs.queue_size));
            for _ in 0..jobs.workers {
                let queue = queue.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    loop {
                        let payload = queue.pop().await;
                        run_job(ctx.clone(), payload).await;
                    }
                });
            }
            info!(
                "Job dispatch: {} worker(s), queue of {}, overflow={:?}",
                jobs.workers, jobs.queue_size, jobs.overflow
            );
            Scheduling::Pool {
                queue,
                overflow: jobs.overflow,
            }
        };

        JobDispatcher { ctx, scheduling }
    }

    /// Schedule a capture for a trigger whose payload decoded to `payload`.
    ///
    /// Returns without waiting for the capture, except under
    /// [`OverflowPolicy::Block`] with a full queue.
    pub async fn submit(&self, payload: String) {
        let (queue, overflow) = match &self.scheduling {
            Scheduling::Unbounded => {
                tokio::spawn(run_job(self.ctx.clone(), payload));
                return;
            }
            Scheduling::Pool { queue, overflow } => (queue, *overflow),
        };

        match queue.push(payload, overflow).await {
            Admission::Queued => {}
            Admission::Rejected(payload) => {
                warn!("Job queue full – dropping trigger {payload:?}");
            }
            Admission::Evicted(oldest) => {
                warn!("Job queue full – evicting oldest trigger {oldest:?}");
                let outcome = CaptureOutcome::failed("dropped: job queue full");
                self.ctx
                    .publisher
                    .publish(&StatusPayload::new(&outcome, Some(oldest)));
            }
        }
    }
}

/// Capture, then report.  Exactly one status publish per call.
async fn run_job(ctx: Arc<JobContext>, payload: String) {
    let request = CaptureRequest::from_payload(&payload);
    let capture = ctx.capture.clone();

    // A separate task turns a panicking capture into a JoinError.
    let outcome = match tokio::spawn(async move { capture.capture(&request).await }).await {
        Ok(Ok(path)) => CaptureOutcome::saved(&path),
        Ok(Err(e)) => {
            error!("Failed to take snapshot: {e}");
            CaptureOutcome::failed(e.to_string())
        }
        Err(e) => {
            error!("Capture task failed: {e}");
            CaptureOutcome::failed(format!("capture task failed: {e}"))
        }
    };

    ctx.publisher
        .publish(&StatusPayload::new(&outcome, Some(payload)));
}

// ── bounded queue ────────────────────────────────────────────────────────

enum Admission {
    Queued,
    Rejected(String),
    Evicted(String),
}

struct JobQueue {
    jobs: Mutex<VecDeque<String>>,
    capacity: usize,
    /// Signalled when a job is pushed.
    ready: Notify,
    /// Signalled when a job is popped.
    space: Notify,
}

impl JobQueue {
    fn new(capacity: usize) -> Self {
        JobQueue {
            jobs: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn push(&self, job: String, overflow: OverflowPolicy) -> Admission {
        loop {
            {
                let mut jobs = self.lock();
                if jobs.len() < self.capacity {
                    jobs.push_back(job);
                    drop(jobs);
                    self.ready.notify_one();
                    return Admission::Queued;
                }
                match overflow {
                    OverflowPolicy::Reject => return Admission::Rejected(job),
                    OverflowPolicy::DropOldest => {
                        let oldest = jobs.pop_front();
                        jobs.push_back(job);
                        drop(jobs);
                        self.ready.notify_one();
                        return match oldest {
                            Some(oldest) => Admission::Evicted(oldest),
                            None => Admission::Queued,
                        };
                    }
                    OverflowPolicy::Block => {}
                }
            }
            self.space.notified().await;
        }
    }

    async fn pop(&self) -> String {
        loop {
            let next = self.lock().pop_front();
            if let Some(job) = next {
                self.space.notify_one();
                return job;
            }
            self.ready.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use rumqttc::QoS;
    use tokio::sync::Semaphore;

    use snapper_common::snapshot;

    use crate::capture::CaptureError;
    use crate::connection::tests::{connected_handle, MemoryChannel};
    use crate::connection::ChannelHandle;

    /// Names the file the way the real strategies do, without touching disk.
    struct NamingCapture {
        dir: PathBuf,
    }

    #[async_trait]
    impl CaptureStrategy for NamingCapture {
        fn name(&self) -> &'static str {
            "naming"
        }

        async fn capture(&self, request: &CaptureRequest) -> Result<PathBuf, CaptureError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(snapshot::output_path(&self.dir, &request.prefix))
        }
    }

    /// Holds every capture until permits are added to `gate`.
    struct GatedCapture {
        started: AtomicUsize,
        gate: Semaphore,
    }

    #[async_trait]
    impl CaptureStrategy for GatedCapture {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn capture(&self, request: &CaptureRequest) -> Result<PathBuf, CaptureError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await;
            Ok(PathBuf::from(format!("/snap/{}.jpg", request.prefix)))
        }
    }

    struct PanickingCapture;

    #[async_trait]
    impl CaptureStrategy for PanickingCapture {
        fn name(&self) -> &'static str {
            "panics"
        }

        async fn capture(&self, _request: &CaptureRequest) -> Result<PathBuf, CaptureError> {
            panic!("camera driver exploded");
        }
    }

    struct FailingCapture;

    #[async_trait]
    impl CaptureStrategy for FailingCapture {
        fn name(&self) -> &'static str {
            "fails"
        }

        async fn capture(&self, _request: &CaptureRequest) -> Result<PathBuf, CaptureError> {
            Err(CaptureError::StreamNotConfigured)
        }
    }

    struct Harness {
        channel: Arc<MemoryChannel>,
        _state: tokio::sync::watch::Sender<crate::connection::ConnectionState>,
        dispatcher: JobDispatcher,
    }

    fn harness(capture: Arc<dyn CaptureStrategy>, jobs: JobConfig) -> Harness {
        let channel = Arc::new(MemoryChannel::default());
        let (handle, state): (ChannelHandle, _) = connected_handle(channel.clone());
        let publisher = Arc::new(StatusPublisher::new(handle, "cam/status", QoS::AtLeastOnce));
        Harness {
            channel,
            _state: state,
            dispatcher: JobDispatcher::new(capture, publisher, jobs),
        }
    }

    fn statuses(channel: &MemoryChannel) -> Vec<StatusPayload> {
        channel
            .published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| serde_json::from_slice(body).unwrap())
            .collect()
    }

    async fn wait_for_count(channel: &MemoryChannel, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while channel.published.lock().unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for status messages");
    }

    async fn wait_for_started(capture: &GatedCapture, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while capture.started.load(Ordering::SeqCst) < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for captures to start");
    }

    fn file_name(info: &str) -> String {
        Path::new(info)
            .file_name()
            .unwrap()
            .to_string_lossy()
            .to_string()
    }

    fn pool() -> JobConfig {
        JobConfig {
            workers: 4,
            ..JobConfig::default()
        }
    }

    #[tokio::test]
    async fn test_prefix_from_trigger_names_the_file() {
        let h = harness(
            Arc::new(NamingCapture {
                dir: PathBuf::from("/data"),
            }),
            JobConfig::default(),
        );

        h.dispatcher.submit(r#"{"prefix": "porch"}"#.into()).await;
        wait_for_count(&h.channel, 1).await;

        let status = &statuses(&h.channel)[0];
        assert!(status.success);
        assert!(file_name(&status.info).starts_with("porch_"));
        assert_eq!(status.request_payload.as_deref(), Some(r#"{"prefix": "porch"}"#));
    }

    #[tokio::test]
    async fn test_other_payloads_use_default_prefix() {
        let h = harness(
            Arc::new(NamingCapture {
                dir: PathBuf::from("/data"),
            }),
            JobConfig::default(),
        );
        let payloads = ["", "snap now", "[\"prefix\"]", "{\"prefix\": null}", "{broken"];
        for p in payloads {
            h.dispatcher.submit(p.to_string()).await;
        }
        wait_for_count(&h.channel, payloads.len()).await;

        for status in statuses(&h.channel) {
            assert!(file_name(&status.info).starts_with("snapshot_"), "{status:?}");
        }
    }

    #[tokio::test]
    async fn test_one_status_per_trigger() {
        for jobs in [JobConfig::default(), pool()] {
            let h = harness(
                Arc::new(NamingCapture {
                    dir: PathBuf::from("/data"),
                }),
                jobs,
            );
            for i in 0..10 {
                h.dispatcher.submit(format!(r#"{{"prefix": "t{i}"}}"#)).await;
            }
            wait_for_count(&h.channel, 10).await;
            // Give stragglers a chance to show up as duplicates.
            tokio::time::sleep(Duration::from_millis(50)).await;

            let mut payloads: Vec<String> = statuses(&h.channel)
                .into_iter()
                .map(|s| s.request_payload.unwrap())
                .collect();
            payloads.sort();
            payloads.dedup();
            assert_eq!(payloads.len(), 10);
            assert_eq!(h.channel.published.lock().unwrap().len(), 10);
        }
    }

    #[tokio::test]
    async fn test_overlapping_triggers_each_get_one_status() {
        // More triggers than a small pool plus its queue could hold, all
        // arriving while every capture is still in flight.
        const TRIGGERS: usize = 40;
        let capture = gated();
        let h = harness(capture.clone(), JobConfig::default());

        for i in 0..TRIGGERS {
            h.dispatcher.submit(format!("burst-{i}")).await;
        }
        wait_for_started(&capture, TRIGGERS).await;
        assert!(h.channel.published.lock().unwrap().is_empty());

        capture.gate.add_permits(TRIGGERS);
        wait_for_count(&h.channel, TRIGGERS).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let all = statuses(&h.channel);
        assert_eq!(all.len(), TRIGGERS);
        assert!(all.iter().all(|s| s.success));
        let mut payloads: Vec<String> = all.into_iter().map(|s| s.request_payload.unwrap()).collect();
        payloads.sort();
        payloads.dedup();
        assert_eq!(payloads.len(), TRIGGERS);
    }

    #[tokio::test]
    async fn test_capture_error_is_reported() {
        let h = harness(Arc::new(FailingCapture), JobConfig::default());
        h.dispatcher.submit(String::new()).await;
        wait_for_count(&h.channel, 1).await;

        let status = &statuses(&h.channel)[0];
        assert!(!status.success);
        assert!(status.info.contains("not configured"));
    }

    #[tokio::test]
    async fn test_panicking_capture_still_reports() {
        let h = harness(Arc::new(PanickingCapture), JobConfig::default());
        h.dispatcher.submit("first".into()).await;
        h.dispatcher.submit("second".into()).await;
        wait_for_count(&h.channel, 2).await;

        for status in statuses(&h.channel) {
            assert!(!status.success);
            assert!(status.info.starts_with("capture task failed"), "{}", status.info);
        }
    }

    fn gated() -> Arc<GatedCapture> {
        Arc::new(GatedCapture {
            started: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        })
    }

    fn one_slot(overflow: OverflowPolicy) -> JobConfig {
        JobConfig {
            workers: 1,
            queue_size: 1,
            overflow,
        }
    }

    #[tokio::test]
    async fn test_overflow_reject() {
        let capture = gated();
        let h = harness(capture.clone(), one_slot(OverflowPolicy::Reject));

        h.dispatcher.submit("1".into()).await;
        wait_for_started(&capture, 1).await;
        h.dispatcher.submit("2".into()).await; // queued
        h.dispatcher.submit("3".into()).await; // rejected
        capture.gate.add_permits(10);

        wait_for_count(&h.channel, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let payloads: Vec<String> = statuses(&h.channel)
            .into_iter()
            .map(|s| s.request_payload.unwrap())
            .collect();
        assert_eq!(payloads, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn test_overflow_drop_oldest() {
        let capture = gated();
        let h = harness(capture.clone(), one_slot(OverflowPolicy::DropOldest));

        h.dispatcher.submit("1".into()).await;
        wait_for_started(&capture, 1).await;
        h.dispatcher.submit("2".into()).await; // queued
        h.dispatcher.submit("3".into()).await; // evicts "2"

        // The evicted job is reported right away.
        wait_for_count(&h.channel, 1).await;
        let evicted = &statuses(&h.channel)[0];
        assert!(!evicted.success);
        assert_eq!(evicted.request_payload.as_deref(), Some("2"));

        capture.gate.add_permits(10);
        wait_for_count(&h.channel, 3).await;
        let ok: Vec<String> = statuses(&h.channel)
            .into_iter()
            .filter(|s| s.success)
            .map(|s| s.request_payload.unwrap())
            .collect();
        assert_eq!(ok, vec!["1".to_string(), "3".to_string()]);
    }

    #[tokio::test]
    async fn test_overflow_block_waits_for_space() {
        let capture = gated();
        let h = Arc::new(harness(capture.clone(), one_slot(OverflowPolicy::Block)));

        h.dispatcher.submit("1".into()).await;
        wait_for_started(&capture, 1).await;
        h.dispatcher.submit("2".into()).await;

        let blocked = {
            let h = h.clone();
            tokio::spawn(async move { h.dispatcher.submit("3".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        capture.gate.add_permits(10);
        blocked.await.unwrap();
        wait_for_count(&h.channel, 3).await;
    }
}
