use crate::config::WorkerConfig;
use crate::models::SegmentationResult;
use crate::nifti;
use crate::services::SessionStore;
use crate::workers::segmenter::{SegmentationRequest, Segmenter};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct SegmentationJob {
    pub request: SegmentationRequest,
    pub reply: oneshot::Sender<Result<SegmentationResult, AppError>>,
}

/// Handle used by request handlers to submit work and wait for its result.
#[derive(Clone)]
pub struct JobQueue {
    job_tx: mpsc::Sender<SegmentationJob>,
    sessions: Arc<dyn SessionStore>,
}

impl JobQueue {
    /// Enqueues the request and waits for a worker to finish it.
    ///
    /// A full queue is rejected immediately rather than waited on. Once a job
    /// is accepted the worker pool settles its session, marking it segmented
    /// or discarding it, even if the caller stops waiting.
    pub async fn submit(
        &self,
        request: SegmentationRequest,
    ) -> Result<SegmentationResult, AppError> {
        let session_id = request.session_id;
        let (reply, result) = oneshot::channel();

        if let Err(e) = self.job_tx.try_send(SegmentationJob { request, reply }) {
            self.sessions.discard(&session_id).await;
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!(session_id = %session_id, "Segmentation queue full");
                    AppError::ServiceUnavailable(
                        "Segmentation queue is full, retry later".to_string(),
                    )
                }
                mpsc::error::TrySendError::Closed(_) => AppError::ServiceUnavailable(
                    "Segmentation workers are not running".to_string(),
                ),
            });
        }

        tracing::info!(session_id = %session_id, "Segmentation job enqueued");

        match result.await {
            Ok(result) => result,
            Err(_) => {
                // pool stopped with the job still queued
                self.sessions.discard(&session_id).await;
                Err(AppError::ServiceUnavailable(
                    "Segmentation workers stopped before the job ran".to_string(),
                ))
            }
        }
    }

    pub fn is_open(&self) -> bool {
        !self.job_tx.is_closed()
    }
}

pub struct WorkerOrchestrator {
    config: WorkerConfig,
    segmenter: Arc<dyn Segmenter>,
    sessions: Arc<dyn SessionStore>,
    job_rx: mpsc::Receiver<SegmentationJob>,
    shutdown_token: CancellationToken,
}

impl WorkerOrchestrator {
    pub fn new(
        config: WorkerConfig,
        segmenter: Arc<dyn Segmenter>,
        sessions: Arc<dyn SessionStore>,
        shutdown_token: CancellationToken,
    ) -> (Self, JobQueue) {
        let (job_tx, job_rx) = mpsc::channel(config.queue_size);

        let queue = JobQueue {
            job_tx,
            sessions: sessions.clone(),
        };
        let orchestrator = Self {
            config,
            segmenter,
            sessions,
            job_rx,
            shutdown_token,
        };

        (orchestrator, queue)
    }

    /// Drains the queue, running at most `worker_count` jobs at a time.
    pub async fn start(self) {
        let WorkerOrchestrator {
            config,
            segmenter,
            sessions,
            mut job_rx,
            shutdown_token,
        } = self;

        tracing::info!(
            worker_count = config.worker_count,
            queue_size = config.queue_size,
            "Starting segmentation worker pool"
        );

        let permits = Arc::new(Semaphore::new(config.worker_count));

        loop {
            // Wait for a free worker before pulling the next job so that
            // backlog stays in the bounded channel.
            let permit = tokio::select! {
                _ = shutdown_token.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = tokio::select! {
                _ = shutdown_token.cancelled() => break,
                job = job_rx.recv() => match job {
                    Some(job) => job,
                    None => {
                        tracing::info!("Job channel closed, worker pool exiting");
                        break;
                    }
                },
            };

            let segmenter = segmenter.clone();
            let sessions = sessions.clone();
            tokio::spawn(async move {
                let _permit = permit;
                run_job(segmenter.as_ref(), sessions.as_ref(), job).await;
            });
        }

        // Stop accepting work; queued jobs are answered by dropping their senders.
        job_rx.close();
        tracing::info!("Segmentation worker pool stopped");
    }
}

async fn segment(
    segmenter: &dyn Segmenter,
    request: &SegmentationRequest,
) -> Result<SegmentationResult, AppError> {
    let artifact = segmenter.segment(request).await?;

    let label_map = match nifti::read_label_map(&artifact).await {
        Ok(labels) => labels,
        Err(e) => {
            tracing::warn!(
                session_id = %request.session_id,
                error = %e,
                "Could not read label map from segmentation"
            );
            None
        }
    };

    Ok(SegmentationResult {
        artifact,
        label_map,
    })
}

async fn run_job(segmenter: &dyn Segmenter, sessions: &dyn SessionStore, job: SegmentationJob) {
    let SegmentationJob { request, mut reply } = job;
    let session_id = request.session_id;
    let modality = request.modality.as_str();

    if reply.is_closed() {
        tracing::info!(session_id = %session_id, "Requester went away while queued, skipping job");
        sessions.discard(&session_id).await;
        return;
    }

    let start = Instant::now();
    metrics::counter!("segmentation_jobs_total", "modality" => modality).increment(1);

    // Dropping the segmentation future kills the external process.
    let outcome = tokio::select! {
        outcome = segment(segmenter, &request) => outcome,
        _ = reply.closed() => {
            metrics::counter!("segmentation_jobs_abandoned", "modality" => modality).increment(1);
            tracing::warn!(
                session_id = %session_id,
                "Requester went away during segmentation, discarding session"
            );
            sessions.discard(&session_id).await;
            return;
        }
    };

    let result = match outcome {
        Ok(output) => match sessions.mark_segmented(&session_id).await {
            Ok(()) => Ok(output),
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    "Session disappeared before segmentation finished"
                );
                Err(e)
            }
        },
        Err(e) => {
            sessions.discard(&session_id).await;
            Err(e)
        }
    };

    match &result {
        Ok(output) => {
            metrics::counter!("segmentation_jobs_succeeded", "modality" => modality).increment(1);
            metrics::histogram!("segmentation_duration_seconds", "modality" => modality)
                .record(start.elapsed().as_secs_f64());
            tracing::info!(
                session_id = %session_id,
                artifact = ?output.artifact,
                duration_ms = start.elapsed().as_millis() as u64,
                labels = output.label_map.as_ref().map(|m| m.len()).unwrap_or(0),
                "Segmentation succeeded"
            );
        }
        Err(e) => {
            metrics::counter!("segmentation_jobs_failed", "modality" => modality).increment(1);
            tracing::error!(
                session_id = %session_id,
                error = %e,
                "Segmentation failed"
            );
        }
    }

    if let Err(unsent) = reply.send(result) {
        if unsent.is_ok() {
            tracing::warn!(
                session_id = %session_id,
                "Requester went away before the result was delivered, discarding session"
            );
            sessions.discard(&session_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Modality, SessionId, SessionStatus};
    use crate::services::LocalSessionStore;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Holds each call for `delay` and tracks peak concurrency.
    struct SlowSegmenter {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        started: AtomicUsize,
        finished: AtomicUsize,
        fail: bool,
    }

    impl SlowSegmenter {
        fn new(delay: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                delay,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                started: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl Segmenter for SlowSegmenter {
        async fn segment(&self, request: &SegmentationRequest) -> Result<PathBuf, AppError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);

            if self.fail {
                Err(AppError::ProcessingFailed("unsupported image".into()))
            } else {
                Ok(request.output.clone())
            }
        }
    }

    struct Pool {
        queue: JobQueue,
        store: Arc<LocalSessionStore>,
        token: CancellationToken,
    }

    impl Pool {
        async fn start(
            segmenter: Arc<dyn Segmenter>,
            worker_count: usize,
            queue_size: usize,
        ) -> Self {
            let store = Arc::new(
                LocalSessionStore::new(format!("target/test-sessions-{}", uuid::Uuid::new_v4()))
                    .await
                    .unwrap(),
            );
            let token = CancellationToken::new();
            let (orchestrator, queue) = WorkerOrchestrator::new(
                WorkerConfig {
                    worker_count,
                    queue_size,
                },
                segmenter,
                store.clone(),
                token.clone(),
            );
            tokio::spawn(orchestrator.start());
            Self {
                queue,
                store,
                token,
            }
        }

        async fn request(&self) -> SegmentationRequest {
            let session = self.store.create().await.unwrap();
            SegmentationRequest {
                session_id: session.id,
                input: session.input_path(false),
                output: session.artifact_path(),
                modality: Modality::Mr,
            }
        }

        async fn status(&self, id: &SessionId) -> Option<SessionStatus> {
            self.store.get(id).await.map(|s| s.status)
        }

        async fn stop(self) {
            self.token.cancel();
            self.store.clear().await.unwrap();
        }
    }

    #[tokio::test]
    async fn result_is_returned_and_session_marked_segmented() {
        let segmenter = SlowSegmenter::new(Duration::from_millis(1), false);
        let pool = Pool::start(segmenter, 1, 4).await;

        let req = pool.request().await;
        let result = pool.queue.submit(req.clone()).await.unwrap();
        // artifact is not on disk, so no labels can be read
        assert_eq!(result.artifact, req.output);
        assert!(result.label_map.is_none());
        assert_eq!(
            pool.status(&req.session_id).await,
            Some(SessionStatus::Segmented)
        );

        pool.stop().await;
    }

    #[tokio::test]
    async fn failures_are_surfaced_and_session_discarded() {
        let segmenter = SlowSegmenter::new(Duration::from_millis(1), true);
        let pool = Pool::start(segmenter, 1, 4).await;

        let req = pool.request().await;
        let err = pool.queue.submit(req.clone()).await.unwrap_err();
        assert!(matches!(err, AppError::ProcessingFailed(_)));
        assert!(pool.status(&req.session_id).await.is_none());
        assert!(!req.output.parent().unwrap().exists());

        pool.stop().await;
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_worker_count() {
        let segmenter = SlowSegmenter::new(Duration::from_millis(50), false);
        let pool = Pool::start(segmenter.clone(), 2, 16).await;

        let mut jobs = Vec::new();
        for _ in 0..6 {
            let queue = pool.queue.clone();
            let req = pool.request().await;
            jobs.push(tokio::spawn(async move { queue.submit(req).await }));
        }
        for job in jobs {
            job.await.unwrap().unwrap();
        }

        assert_eq!(segmenter.peak.load(Ordering::SeqCst), 2);
        pool.stop().await;
    }

    #[tokio::test]
    async fn full_queue_is_rejected_and_session_discarded() {
        let segmenter = SlowSegmenter::new(Duration::from_millis(300), false);
        let pool = Pool::start(segmenter, 1, 1).await;

        // one running, one queued, the rest bounce
        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = pool.queue.clone();
            let req = pool.request().await;
            let id = req.session_id;
            handles.push((id, tokio::spawn(async move { queue.submit(req).await })));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut rejected = 0;
        for (id, handle) in handles {
            match handle.await.unwrap() {
                Err(AppError::ServiceUnavailable(_)) => {
                    rejected += 1;
                    assert!(pool.status(&id).await.is_none());
                }
                Ok(_) => assert_eq!(pool.status(&id).await, Some(SessionStatus::Segmented)),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(rejected >= 1);

        pool.stop().await;
    }

    #[tokio::test]
    async fn stopped_pool_rejects_work() {
        let segmenter = SlowSegmenter::new(Duration::from_millis(1), false);
        let pool = Pool::start(segmenter, 1, 4).await;

        pool.token.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.queue.is_open() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pool did not close");

        let req = pool.request().await;
        assert!(matches!(
            pool.queue.submit(req.clone()).await,
            Err(AppError::ServiceUnavailable(_))
        ));
        assert!(pool.status(&req.session_id).await.is_none());

        pool.stop().await;
    }

    #[tokio::test]
    async fn abandoned_running_job_is_cancelled_and_discarded() {
        let segmenter = SlowSegmenter::new(Duration::from_millis(300), false);
        let pool = Pool::start(segmenter.clone(), 1, 4).await;

        let req = pool.request().await;
        let dir = req.output.parent().unwrap().to_path_buf();
        let queue = pool.queue.clone();
        let waiter = tokio::spawn({
            let req = req.clone();
            async move { queue.submit(req).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(segmenter.started.load(Ordering::SeqCst), 1);
        waiter.abort();

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(segmenter.finished.load(Ordering::SeqCst), 0);
        assert!(pool.status(&req.session_id).await.is_none());
        assert!(!dir.exists());

        pool.stop().await;
    }

    #[tokio::test]
    async fn abandoned_queued_job_never_runs() {
        let segmenter = SlowSegmenter::new(Duration::from_millis(200), false);
        let pool = Pool::start(segmenter.clone(), 1, 4).await;

        let first = pool.request().await;
        let running = tokio::spawn({
            let queue = pool.queue.clone();
            async move { queue.submit(first).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let queued = pool.request().await;
        let queued_id = queued.session_id;
        let waiter = tokio::spawn({
            let queue = pool.queue.clone();
            async move { queue.submit(queued).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();

        running.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(segmenter.started.load(Ordering::SeqCst), 1);
        assert!(pool.status(&queued_id).await.is_none());

        pool.stop().await;
    }
}
