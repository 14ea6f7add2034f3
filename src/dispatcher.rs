use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::Result;
use chrono::Utc;
use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    build_config::BuildConfig,
    event::KafkaEvent,
    executors::RegionalExecutors,
    message::{BuildMessage, Job},
    recovery,
    tracking::{BuildStats, TrackerFactory},
};

/// What happened to one record. Only ever logged.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Skipped(String),
    Started { location: String },
    Stopped,
    Failed(String),
    Panicked,
}

struct Counter {
    remaining: AtomicUsize,
    done: Notify,
}

/// Outstanding-work counter for one partition.
pub struct Completion(Arc<Counter>);

/// Signals one unit of work as complete when dropped, on every exit path
/// including unwinding.
pub struct CompletionGuard(Arc<Counter>);

impl Completion {
    /// Counter seeded with `count`, plus one guard per unit of work.
    pub fn seeded(count: usize) -> (Completion, Vec<CompletionGuard>) {
        let counter = Arc::new(Counter {
            remaining: AtomicUsize::new(count),
            done: Notify::new(),
        });
        let guards = (0..count).map(|_| CompletionGuard(counter.clone())).collect();
        (Completion(counter), guards)
    }

    pub fn remaining(&self) -> usize {
        self.0.remaining.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let done = self.0.done.notified();
            if self.remaining() == 0 {
                return;
            }
            done.await;
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.0.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.done.notify_waiters();
        }
    }
}

/// Handles a single record: decode, resolve, dispatch, report.
#[derive(Clone)]
pub struct Processor {
    executors: Arc<RegionalExecutors>,
    trackers: Arc<dyn TrackerFactory>,
    stacktrace_dir: Arc<Path>,
}

impl Processor {
    pub fn new(
        executors: RegionalExecutors,
        trackers: impl TrackerFactory + 'static,
        stacktrace_dir: PathBuf,
    ) -> Self {
        Processor {
            executors: Arc::new(executors),
            trackers: Arc::new(trackers),
            stacktrace_dir: Arc::from(stacktrace_dir),
        }
    }

    /// Never panics: a panic while handling the record is logged, its trace
    /// written next to the other stack traces, and reported as
    /// [`Outcome::Panicked`].
    pub async fn process(&self, label: &str, value: &str, cancel: &CancellationToken) -> Outcome {
        match AssertUnwindSafe(self.handle(label, value, cancel))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(payload) => {
                recovery::report_panic(&self.stacktrace_dir, label, &*payload);
                Outcome::Panicked
            }
        }
    }

    async fn handle(&self, label: &str, value: &str, cancel: &CancellationToken) -> Outcome {
        let message = match BuildMessage::decode(value) {
            Ok(message) => message,
            Err(e) => {
                error!("{}: failed to decode build message: {}", label, e);
                return Outcome::Skipped(format!("undecodable: {}", e));
            }
        };

        if !message.is_actionable() {
            debug!("{}: message has no job or executorType, skipping", label);
            return Outcome::Skipped("missing job or executorType".to_string());
        }
        info!(
            "{}: job {}, executor {}",
            label, message.job, message.executor_type
        );

        let Some(job) = Job::parse(&message.job) else {
            warn!("{}: unrecognised job '{}', skipping", label, message.job);
            return Outcome::Skipped(format!("unrecognised job '{}'", message.job));
        };

        let region = match message.build_config.build_region() {
            Ok(region) => region,
            Err(e) => {
                error!("{}: unable to determine build region: {}", label, e);
                return Outcome::Skipped(e.to_string());
            }
        };

        let registry = match self.executors.for_region(&region).await {
            Ok(registry) => registry,
            Err(e) => {
                error!(
                    "{}: failed to initialise executors for region {}: {:#}",
                    label, region, e
                );
                return Outcome::Failed(e.to_string());
            }
        };
        let Some(executor) = registry.resolve(&message.executor_type) else {
            error!(
                "{}: no executor named '{}' in region {}",
                label, message.executor_type, region
            );
            return Outcome::Skipped(format!("unknown executor '{}'", message.executor_type));
        };

        if cancel.is_cancelled() {
            warn!("{}: shutting down, not dispatching {}", label, message.job);
            return Outcome::Skipped("cancelled".to_string());
        }

        let config = &message.build_config;
        match job {
            Job::Start => match executor.start(config).await {
                Ok(location) => {
                    info!("{}: start build successful", label);
                    if !location.is_empty() {
                        if let Err(e) = self.report(config, &location).await {
                            warn!("{}: updating build stats: {:#}", label, e);
                        }
                    }
                    Outcome::Started { location }
                }
                Err(e) => {
                    error!("{}: failed to start build: {}", label, e);
                    Outcome::Failed(e.to_string())
                }
            },
            Job::Stop => match executor.stop(config).await {
                Ok(()) => {
                    info!("{}: stop build successful", label);
                    Outcome::Stopped
                }
                Err(e) => {
                    error!("{}: failed to stop build: {}", label, e);
                    Outcome::Failed(e.to_string())
                }
            },
        }
    }

    async fn report(&self, config: &BuildConfig, location: &str) -> Result<()> {
        let tracker = self
            .trackers
            .connect(config.str("apiUri")?, config.str("token")?)?;
        let stats = BuildStats {
            hostname: location.to_string(),
            image_pull_start_time: Utc::now(),
        };
        tracker
            .update_build(&stats, config.int("buildId")?, None)
            .await?;
        Ok(())
    }
}

fn summary(total: usize) -> String {
    format!("Finished processing messages: {}", total)
}

/// Last line of defence around a whole batch: a panic is written to stderr
/// and the summary still reflects the records counted so far.
async fn guard_batch<F: Future<Output = ()>>(total: &AtomicUsize, batch: F) -> String {
    if let Err(payload) = AssertUnwindSafe(batch).catch_unwind().await {
        last_resort(&*payload);
    }
    summary(total.load(Ordering::SeqCst))
}

fn last_resort(payload: &(dyn Any + Send)) {
    eprintln!("ERROR: Something terrible has happened. Please file a ticket with this info:");
    eprintln!(
        "ERROR: {}\n{}",
        recovery::panic_message(payload),
        recovery::take_trace()
    );
}

/// Fans each partition of a batch out to one worker per record.
pub struct Dispatcher {
    processor: Processor,
}

impl Dispatcher {
    pub fn new(processor: Processor) -> Self {
        Dispatcher { processor }
    }

    /// Process every record of `event` and return the summary line.
    ///
    /// Partitions run one after another; records within a partition run
    /// concurrently with no ordering between them. Per-record failures only
    /// show up in the logs.
    pub async fn handle(&self, event: &KafkaEvent, cancel: &CancellationToken) -> String {
        let total = AtomicUsize::new(0);
        let summary = guard_batch(&total, self.dispatch(event, cancel, &total)).await;
        info!("Finished processing {} records", total.load(Ordering::SeqCst));
        summary
    }

    async fn dispatch(&self, event: &KafkaEvent, cancel: &CancellationToken, total: &AtomicUsize) {
        for (key, records) in &event.records {
            info!("Received {} records for key {}", records.len(), key);
            total.fetch_add(records.len(), Ordering::SeqCst);

            let (completion, guards) = Completion::seeded(records.len());
            for ((index, record), guard) in records.iter().enumerate().zip(guards) {
                debug!(
                    "Record {}: topic {} partition {} offset {}",
                    index, record.topic, record.partition, record.offset
                );
                let processor = self.processor.clone();
                let label = format!("{}[{}]", key, index);
                let value = record.value.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    let outcome = processor.process(&label, &value, &cancel).await;
                    debug!("{}: {:?}", label, outcome);
                });
            }
            completion.wait().await;
        }
    }
}
