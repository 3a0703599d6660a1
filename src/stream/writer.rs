//! Stream writer and its background flush loop
//!
//! Request handlers enqueue records through [`StreamWriter`]; a single task
//! collects them and appends them to the sink in batches, flushing when a
//! batch is full or the flush interval elapses.

use async_trait::async_trait;
use std::iter::Map;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    classify, Buffer, Disposition, EnqueueError, ErrorLog, LifecycleState, Record, RecordStream,
    ShutdownError, WriterError,
};
use crate::config::WriterConfig;
use crate::sink::{Sink, SinkError, SinkErrorKind};

/// Handle to a running batch writer.
///
/// `shutdown` is meant to be called once, after the last producer is done.
pub struct StreamWriter {
    tx: mpsc::Sender<Record>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    errors: Arc<ErrorLog>,
    sink: Arc<dyn Sink>,
    state: watch::Receiver<LifecycleState>,
}

impl StreamWriter {
    /// Spawn the flush loop and return the handle producers push through.
    pub fn start(sink: Arc<dyn Sink>, config: &WriterConfig) -> Self {
        let config = config.clone().with_defaults();
        let (tx, rx) = mpsc::channel(config.channel_size);
        let cancel = CancellationToken::new();
        let errors = Arc::new(ErrorLog::new());
        let (state_tx, state_rx) = watch::channel(LifecycleState::Running);

        let flush_loop = FlushLoop {
            rx,
            sink: sink.clone(),
            buffer: Buffer::new(config.batch_size),
            cancel: cancel.clone(),
            errors: errors.clone(),
            state: state_tx,
            flush_interval: config.flush_interval(),
            append_timeout: config.append_timeout(),
            max_attempts: config.max_append_attempts,
            initial_backoff: config.retry_initial_backoff(),
            max_backoff: config.retry_max_backoff(),
            backoff: backoff_strategy(config.retry_initial_backoff(), config.retry_max_backoff()),
            failures: 0,
            retry_at: None,
            halted: false,
        };

        info!(
            "Stream writer started (batch_size={}, channel_size={}, flush_interval={}ms)",
            config.batch_size, config.channel_size, config.flush_interval_ms
        );

        Self {
            tx,
            cancel,
            task: Mutex::new(Some(tokio::spawn(flush_loop.run()))),
            errors,
            sink,
            state: state_rx,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Stop intake, drain what is left through a final flush and wait for
    /// the flush loop to exit. Appends fail from the moment this is called.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Flush loop terminated abnormally: {}", e);
                self.errors.record(WriterError::Loop(e.to_string()));
            }
        }
    }

    /// Release the sink. Independent of `stop`.
    pub async fn close(&self) -> Result<(), SinkError> {
        self.sink.close().await
    }

    /// `stop`, then `close`, then report every error seen since `start`.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.stop().await;
        let close_result = self.close().await;

        let mut errors = self.errors.take();
        if let Err(err) = close_result {
            errors.push(WriterError::Close(err));
        }

        match ShutdownError::from_errors(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RecordStream for StreamWriter {
    async fn append(&self, record: Record) -> Result<(), EnqueueError> {
        // The channel only closes once the loop reaches drain
        if self.cancel.is_cancelled() {
            return Err(EnqueueError::Closed);
        }
        self.tx.send(record).await.map_err(|_| EnqueueError::Closed)
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

type Backoff = Map<ExponentialBackoff, fn(Duration) -> Duration>;

/// Exponential backoff starting at `initial`, doubling, capped at `max`.
fn backoff_strategy(initial: Duration, max: Duration) -> Backoff {
    // Base 2 starts at twice the factor, so every delay is halved
    ExponentialBackoff::from_millis(2)
        .factor(initial.as_millis() as u64)
        .max_delay(max.saturating_mul(2))
        .map(halve as fn(Duration) -> Duration)
}

fn halve(delay: Duration) -> Duration {
    delay / 2
}

/// State owned by the background task. Nothing here is shared except the
/// error log and the cancellation token.
struct FlushLoop {
    rx: mpsc::Receiver<Record>,
    sink: Arc<dyn Sink>,
    buffer: Buffer,
    cancel: CancellationToken,
    errors: Arc<ErrorLog>,
    state: watch::Sender<LifecycleState>,
    flush_interval: Duration,
    append_timeout: Duration,
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff: Backoff,
    /// Consecutive failed appends of the batch at the front of the buffer
    failures: u32,
    retry_at: Option<Instant>,
    /// Set after a fatal error; the sink is never called again
    halted: bool,
}

impl FlushLoop {
    async fn run(mut self) {
        let mut ticker = time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut state = LifecycleState::Running;
        loop {
            let next = match state {
                LifecycleState::Running => self.poll_running(&mut ticker).await,
                LifecycleState::Draining => {
                    self.drain().await;
                    LifecycleState::Stopped
                }
                LifecycleState::Stopped => break,
            };

            if next != state {
                info!("Stream writer {} -> {}", state, next);
                self.state.send_replace(next);
                state = next;
            }
        }
    }

    /// One wait in the running state: cancellation, the end of a retry
    /// backoff, the flush timer, or the next record. Intake pauses while a
    /// full batch is waiting out a retry backoff, which pushes backpressure
    /// onto the channel.
    async fn poll_running(&mut self, ticker: &mut Interval) -> LifecycleState {
        let accepting = !self.buffer.is_full();
        let retry_at = self.retry_at.filter(|_| !self.halted);

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return LifecycleState::Draining,
            _ = time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                self.flush_due().await
            }
            _ = ticker.tick() => self.flush_due().await,
            record = self.rx.recv(), if accepting => match record {
                Some(record) => {
                    self.buffer.push(record);
                    if self.buffer.is_full() {
                        self.flush_due().await;
                    }
                }
                // Every sender is gone
                None => return LifecycleState::Draining,
            },
        }

        LifecycleState::Running
    }

    /// Close intake and push everything still queued through the sink.
    async fn drain(&mut self) {
        self.rx.close();

        let mut discarded = 0;
        while let Some(record) = self.rx.recv().await {
            if self.halted {
                discarded += 1;
                continue;
            }
            self.buffer.push(record);
            if self.buffer.is_full() {
                self.settle(false).await;
            }
        }

        // Final flush
        self.settle(true).await;

        // Only non-empty when a fatal error halted the sink
        discarded += self.buffer.clear();
        if discarded > 0 {
            error!("Discarding {} records after fatal sink error", discarded);
            self.errors.record(WriterError::Discarded { records: discarded });
        }
    }

    /// Flush whatever is due unless a retry backoff is pending. Keeps going
    /// while a full batch remains buffered.
    async fn flush_due(&mut self) {
        loop {
            if self.halted || self.buffer.is_empty() || self.backing_off() {
                return;
            }
            self.flush_once().await;
            if !self.buffer.is_full() {
                return;
            }
        }
    }

    /// Flush until the buffer is empty (`all`) or holds less than a batch,
    /// sleeping through backoff. Terminates because attempts are bounded.
    async fn settle(&mut self, all: bool) {
        while !self.halted && !self.buffer.is_empty() && (all || self.buffer.is_full()) {
            if let Some(at) = self.retry_at {
                time::sleep_until(at).await;
            }
            self.flush_once().await;
        }
    }

    fn backing_off(&self) -> bool {
        self.retry_at.is_some_and(|at| Instant::now() < at)
    }

    async fn flush_once(&mut self) {
        let batch = self.buffer.take_batch();
        if batch.is_empty() {
            return;
        }
        let records = batch.len();

        let result = match time::timeout(self.append_timeout, self.sink.append(batch.records())).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::new(
                SinkErrorKind::DeadlineExceeded,
                format!("append timed out after {:?}", self.append_timeout),
            )),
        };

        let err = match result {
            Ok(()) => {
                debug!("Flushed {} records", records);
                self.reset_retry();
                return;
            }
            Err(err) => err,
        };

        match classify(&err) {
            Disposition::Fatal => {
                error!("Fatal sink error, halting intake ({} records): {}", records, err);
                self.errors.record(WriterError::Fatal {
                    records,
                    source: err,
                });
                self.halted = true;
                self.cancel.cancel();
            }
            Disposition::Retryable => {
                self.failures += 1;
                if self.failures >= self.max_attempts {
                    error!(
                        "Dropping {} records after {} failed appends: {}",
                        records, self.failures, err
                    );
                    self.errors.record(WriterError::RetriesExhausted {
                        records,
                        attempts: self.failures,
                        source: err,
                    });
                    self.reset_retry();
                } else {
                    let delay = self.backoff.next().map(jitter).unwrap_or(self.max_backoff);
                    warn!(
                        "Append of {} records failed (attempt {}), retrying in {:?}: {}",
                        records, self.failures, delay, err
                    );
                    self.errors.record(WriterError::Retryable {
                        records,
                        source: err,
                    });
                    self.buffer.requeue_front(batch);
                    self.retry_at = Some(Instant::now() + delay);
                }
            }
        }
    }

    fn reset_retry(&mut self) {
        self.failures = 0;
        self.retry_at = None;
        self.backoff = backoff_strategy(self.initial_backoff, self.max_backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    enum Step {
        Fail(SinkError),
        /// Hang longer than the append timeout, then succeed
        Stall(Duration),
    }

    /// Sink that records every batch it sees and plays back scripted
    /// failures before succeeding.
    #[derive(Default)]
    struct MockSink {
        script: StdMutex<VecDeque<Step>>,
        batches: StdMutex<Vec<Vec<Record>>>,
        close_error: Option<SinkError>,
    }

    impl MockSink {
        fn scripted(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(steps.into()),
                ..Default::default()
            })
        }

        fn batches(&self) -> Vec<Vec<Record>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sink for MockSink {
        async fn append(&self, batch: &[Record]) -> Result<(), SinkError> {
            self.batches.lock().unwrap().push(batch.to_vec());
            let step = self.script.lock().unwrap().pop_front();
            match step {
                None => Ok(()),
                Some(Step::Fail(err)) => Err(err),
                Some(Step::Stall(d)) => {
                    time::sleep(d).await;
                    Ok(())
                }
            }
        }

        async fn close(&self) -> Result<(), SinkError> {
            match &self.close_error {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    fn rec(s: &str) -> Record {
        Bytes::from(s.to_string())
    }

    fn config(batch_size: usize, flush_interval_ms: u64) -> WriterConfig {
        WriterConfig {
            batch_size,
            flush_interval_ms,
            ..WriterConfig::default()
        }
    }

    fn unavailable() -> SinkError {
        SinkError::new(SinkErrorKind::Unavailable, "sink unavailable")
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_then_final_flush() {
        let sink = Arc::new(MockSink::default());
        let writer = StreamWriter::start(sink.clone(), &config(3, 3_600_000));

        for i in 0..5 {
            writer.append(rec(&format!("r{i}"))).await.unwrap();
        }
        writer.shutdown().await.unwrap();

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![rec("r0"), rec("r1"), rec("r2")]);
        assert_eq!(batches[1], vec![rec("r3"), rec("r4")]);
        assert_eq!(writer.state(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_partial_batch() {
        let sink = Arc::new(MockSink::default());
        let writer = StreamWriter::start(sink.clone(), &config(500, 50));

        writer.append(rec("a")).await.unwrap();
        writer.append(rec("b")).await.unwrap();
        assert!(sink.batches().is_empty());

        time::sleep(Duration::from_millis(120)).await;
        assert_eq!(sink.batches(), vec![vec![rec("a"), rec("b")]]);
        assert_eq!(writer.state(), LifecycleState::Running);

        writer.shutdown().await.unwrap();
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_never_exceed_batch_size() {
        let sink = Arc::new(MockSink::default());
        let writer = StreamWriter::start(sink.clone(), &config(4, 50));

        for i in 0..19 {
            writer.append(rec(&format!("r{i}"))).await.unwrap();
        }
        writer.shutdown().await.unwrap();

        let batches = sink.batches();
        assert!(batches.iter().all(|b| b.len() <= 4));
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 19);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_retries_same_batch_first() {
        let sink = MockSink::scripted(vec![Step::Fail(unavailable())]);
        let writer = StreamWriter::start(sink.clone(), &config(2, 50));

        writer.append(rec("a")).await.unwrap();
        writer.append(rec("b")).await.unwrap();
        writer.append(rec("c")).await.unwrap();
        time::sleep(Duration::from_secs(1)).await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], vec![rec("a"), rec("b")]);
        assert_eq!(batches[1], batches[0]);
        assert_eq!(batches[2], vec![rec("c")]);

        let err = writer.shutdown().await.unwrap_err();
        assert_eq!(err.errors().len(), 1);
        assert!(matches!(
            err.errors()[0],
            WriterError::Retryable { records: 2, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_fires_when_backoff_ends() {
        let sink = MockSink::scripted(vec![Step::Fail(unavailable())]);
        // The flush timer alone would not fire again for an hour
        let writer = StreamWriter::start(sink.clone(), &config(2, 3_600_000));

        writer.append(rec("a")).await.unwrap();
        writer.append(rec("b")).await.unwrap();
        time::sleep(Duration::from_secs(5)).await;

        assert_eq!(
            sink.batches(),
            vec![vec![rec("a"), rec("b")], vec![rec("a"), rec("b")]]
        );

        // Intake resumed once the retry went through
        writer.append(rec("c")).await.unwrap();
        writer.append(rec("d")).await.unwrap();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.batches().len(), 3);
        assert_eq!(sink.batches()[2], vec![rec("c"), rec("d")]);

        let err = writer.shutdown().await.unwrap_err();
        assert_eq!(err.errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_rejects_appends_while_flush_in_flight() {
        let sink = MockSink::scripted(vec![Step::Stall(Duration::from_secs(60))]);
        let writer = Arc::new(StreamWriter::start(sink.clone(), &config(1, 50)));

        writer.append(rec("a")).await.unwrap();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.batches().len(), 1);

        let stopping = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.stop().await })
        };
        time::sleep(Duration::from_millis(1)).await;

        // The loop is still waiting on the sink, yet intake is already shut
        assert_eq!(writer.state(), LifecycleState::Running);
        assert!(writer.is_closed());
        assert!(matches!(
            writer.append(rec("b")).await,
            Err(EnqueueError::Closed)
        ));

        stopping.await.unwrap();
        assert_eq!(writer.state(), LifecycleState::Stopped);
        assert!(sink.batches().iter().all(|batch| batch == &vec![rec("a")]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_halts_intake() {
        let denied = SinkError::new(SinkErrorKind::PermissionDenied, "no write access");
        let sink = MockSink::scripted(vec![Step::Fail(denied)]);
        let writer = StreamWriter::start(sink.clone(), &config(2, 50));

        writer.append(rec("a")).await.unwrap();
        writer.append(rec("b")).await.unwrap();
        time::sleep(Duration::from_millis(200)).await;

        assert_eq!(writer.state(), LifecycleState::Stopped);
        assert!(writer.is_closed());
        assert!(matches!(
            writer.append(rec("c")).await,
            Err(EnqueueError::Closed)
        ));

        let err = writer.shutdown().await.unwrap_err();
        assert_eq!(sink.batches().len(), 1);
        assert_eq!(err.errors().len(), 1);
        match &err.errors()[0] {
            WriterError::Fatal { records, source } => {
                assert_eq!(*records, 2);
                assert_eq!(source.kind(), SinkErrorKind::PermissionDenied);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_accounts_for_queued_records() {
        let invalid = SinkError::new(SinkErrorKind::InvalidArgument, "schema mismatch");
        let sink = MockSink::scripted(vec![Step::Fail(invalid)]);
        let writer = StreamWriter::start(sink.clone(), &config(2, 50));

        for s in ["a", "b", "c", "d"] {
            writer.append(rec(s)).await.unwrap();
        }
        time::sleep(Duration::from_millis(200)).await;

        let err = writer.shutdown().await.unwrap_err();
        assert_eq!(sink.batches().len(), 1);
        assert!(matches!(err.errors()[0], WriterError::Fatal { records: 2, .. }));
        assert!(matches!(err.errors()[1], WriterError::Discarded { records: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let sink = MockSink::scripted(vec![
            Step::Fail(unavailable()),
            Step::Fail(unavailable()),
            Step::Fail(unavailable()),
        ]);
        let mut cfg = config(1, 50);
        cfg.max_append_attempts = 3;
        let writer = StreamWriter::start(sink.clone(), &cfg);

        writer.append(rec("a")).await.unwrap();
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.batches().len(), 3);

        // The writer keeps running after giving up on a batch
        writer.append(rec("b")).await.unwrap();
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.batches().last().unwrap(), &vec![rec("b")]);

        let err = writer.shutdown().await.unwrap_err();
        let errors = err.errors();
        assert_eq!(errors.len(), 3);
        assert!(matches!(errors[0], WriterError::Retryable { .. }));
        assert!(matches!(errors[1], WriterError::Retryable { .. }));
        assert!(matches!(
            errors[2],
            WriterError::RetriesExhausted {
                records: 1,
                attempts: 3,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_timeout_is_retryable() {
        let sink = MockSink::scripted(vec![Step::Stall(Duration::from_secs(60))]);
        let mut cfg = config(1, 50);
        cfg.append_timeout_ms = 100;
        let writer = StreamWriter::start(sink.clone(), &cfg);

        writer.append(rec("a")).await.unwrap();
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.batches(), vec![vec![rec("a")], vec![rec("a")]]);

        let err = writer.shutdown().await.unwrap_err();
        match &err.errors()[0] {
            WriterError::Retryable { source, .. } => {
                assert_eq!(source.kind(), SinkErrorKind::DeadlineExceeded)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_retries_pending_batch_before_exit() {
        let sink = MockSink::scripted(vec![Step::Fail(unavailable())]);
        let writer = StreamWriter::start(sink.clone(), &config(500, 50));

        writer.append(rec("a")).await.unwrap();
        time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sink.batches().len(), 1);

        // The failed batch is still backing off; shutdown must wait it out
        let err = writer.shutdown().await.unwrap_err();
        assert_eq!(sink.batches(), vec![vec![rec("a")], vec![rec("a")]]);
        assert_eq!(err.errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_error_is_aggregated() {
        let sink = Arc::new(MockSink {
            close_error: Some(SinkError::new(SinkErrorKind::Internal, "close failed")),
            ..Default::default()
        });
        let writer = StreamWriter::start(sink.clone(), &config(10, 50));
        writer.append(rec("a")).await.unwrap();

        let err = writer.shutdown().await.unwrap_err();
        assert_eq!(sink.batches(), vec![vec![rec("a")]]);
        assert_eq!(err.errors().len(), 1);
        assert!(matches!(err.errors()[0], WriterError::Close(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_passes_through_draining() {
        let sink = Arc::new(MockSink::default());
        let writer = StreamWriter::start(sink.clone(), &config(10, 50));
        let mut states = writer.state.clone();
        assert_eq!(writer.state(), LifecycleState::Running);

        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while states.changed().await.is_ok() {
                seen.push(*states.borrow_and_update());
            }
            seen
        });

        writer.shutdown().await.unwrap();
        let seen = observer.await.unwrap();

        // A watch receiver may coalesce updates, but it can never see
        // Stopped before Draining.
        assert_eq!(seen.last(), Some(&LifecycleState::Stopped));
        if let Some(i) = seen.iter().position(|s| *s == LifecycleState::Draining) {
            assert!(seen[i..].contains(&LifecycleState::Stopped));
        }
        assert!(!seen.contains(&LifecycleState::Running));
    }

    #[test]
    fn test_backoff_doubles_from_initial() {
        let delays: Vec<Duration> =
            backoff_strategy(Duration::from_millis(100), Duration::from_millis(500))
                .take(4)
                .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
            ]
        );
    }

    #[test]
    fn test_backoff_starts_at_odd_initial_delay() {
        let delays: Vec<Duration> =
            backoff_strategy(Duration::from_millis(101), Duration::from_secs(5))
                .take(3)
                .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(101),
                Duration::from_millis(202),
                Duration::from_millis(404),
            ]
        );

        let first = backoff_strategy(Duration::from_millis(1), Duration::from_secs(5)).next();
        assert_eq!(first, Some(Duration::from_millis(1)));
    }
}
