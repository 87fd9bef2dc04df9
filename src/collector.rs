//! Collection orchestrator: wires the target source, worker pool, probe
//! worker, and run store into one measurement run.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::enrich::Enricher;
use crate::error::{CollectError, ConfigError};
use crate::probes::dns::{DnsTransport, QueryType};
use crate::probes::{ProbeResult, ProbeSettings, ProbeWorker};
use crate::run::{ConfigSnapshot, OutcomeCounts, RunId, RunStatus, RunTally};
use crate::scheduler::WorkerPool;
use crate::storage::RunRecorder;
use crate::targets::{ExclusionFilter, ExclusionList, TargetSource};

/// Consecutive append failures after which storage is considered down and
/// the run is cancelled.
const MAX_CONSECUTIVE_STORAGE_FAILURES: u64 = 25;

/// Immutable parameters of one collection.
#[derive(Debug, Clone)]
pub struct CollectConfig {
    pub input_path: PathBuf,
    pub exclusion_path: Option<PathBuf>,
    pub dns_servers: Vec<SocketAddr>,
    pub concurrency: usize,
    pub query_timeout: Duration,
    pub query_type: QueryType,
    pub channel_factor: usize,
    pub debug: bool,
    pub verbose: bool,
    pub drop_database: bool,
}

impl CollectConfig {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let run = &config.run;
        Ok(Self {
            input_path: run.input_path.clone(),
            exclusion_path: run.exclusion_path.clone(),
            dns_servers: run.servers()?,
            concurrency: run.concurrency,
            query_timeout: run.query_timeout(),
            query_type: run.query_type()?,
            channel_factor: run.channel_factor,
            debug: run.debug,
            verbose: run.verbose,
            drop_database: run.drop_database,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dns_servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(self.concurrency));
        }
        if self.query_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "query timeout must be greater than zero".to_string(),
            ));
        }
        if self.channel_factor == 0 {
            return Err(ConfigError::Invalid(
                "channel_factor must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn snapshot(&self, enrichment: bool) -> ConfigSnapshot {
        ConfigSnapshot {
            input_path: self.input_path.display().to_string(),
            exclusion_path: self.exclusion_path.as_ref().map(|p| p.display().to_string()),
            dns_servers: self.dns_servers.iter().map(|s| s.to_string()).collect(),
            concurrency: self.concurrency,
            query_timeout_ms: self.query_timeout.as_millis() as u64,
            query_type: self.query_type.as_str().to_string(),
            debug: self.debug,
            verbose: self.verbose,
            enrichment,
        }
    }
}

/// What a finished (or failed) run looked like.
#[derive(Debug, Clone)]
pub struct CollectOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub tally: RunTally,
    /// Why the run was marked failed, if it was.
    pub failure: Option<String>,
}

#[derive(Debug, Default)]
struct PersistTally {
    written: u64,
    failed: u64,
    outcomes: OutcomeCounts,
    fatal: Option<String>,
}

/// Runs collections. Collaborators are injected so each one can be replaced
/// independently.
pub struct Collector {
    config: CollectConfig,
    recorder: Arc<dyn RunRecorder>,
    transport: Arc<dyn DnsTransport>,
    exclusion: Arc<dyn ExclusionFilter>,
    enricher: Option<Arc<dyn Enricher>>,
    cancel: CancellationToken,
}

impl Collector {
    pub fn new(
        config: CollectConfig,
        recorder: Arc<dyn RunRecorder>,
        transport: Arc<dyn DnsTransport>,
    ) -> Self {
        Self {
            config,
            recorder,
            transport,
            exclusion: Arc::new(ExclusionList::empty()),
            enricher: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_exclusion(mut self, exclusion: Arc<dyn ExclusionFilter>) -> Self {
        self.exclusion = exclusion;
        self
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Share an externally owned token (e.g. a Ctrl-C handler).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts the run: no new targets are taken, in-flight probes
    /// finish, and the run is closed as `failed`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute one run. Errors before the run exists (including an enricher
    /// that cannot answer) are returned as `Err`;
    /// once it exists its id is always reported, in the outcome or in
    /// [`CollectError::Finish`].
    pub async fn collect(&self) -> Result<CollectOutcome, CollectError> {
        let cfg = &self.config;
        cfg.validate()?;
        let pool = WorkerPool::new(cfg.concurrency)?.with_cancellation(self.cancel.clone());
        if let Some(enricher) = &self.enricher {
            enricher.check()?;
        }

        let source = TargetSource::open(&cfg.input_path, Arc::clone(&self.exclusion))?;
        let source_stats = source.stats();

        if cfg.drop_database {
            let dropped = self.recorder.reset()?;
            warn!(dropped, "drop_database set; previous runs destroyed");
        }

        let run_id = self
            .recorder
            .begin(&cfg.snapshot(self.enricher.is_some()))?;
        info!(
            run_id,
            servers = cfg.dns_servers.len(),
            concurrency = cfg.concurrency,
            input = %cfg.input_path.display(),
            "collection started"
        );

        let worker = Arc::new(ProbeWorker::new(
            Arc::clone(&self.transport),
            self.enricher.clone(),
            ProbeSettings {
                servers: cfg.dns_servers.clone().into(),
                timeout: cfg.query_timeout,
                query_type: cfg.query_type,
                debug: cfg.debug,
                verbose: cfg.verbose,
            },
        ));

        let (tx, rx) = mpsc::channel::<ProbeResult>(cfg.concurrency * cfg.channel_factor);
        let persister = self.spawn_persister(run_id, rx);

        let stats = pool
            .run(
                source,
                move |target| {
                    let worker = Arc::clone(&worker);
                    async move { worker.probe(&target).await }
                },
                tx,
            )
            .await;

        let persisted = match persister.await {
            Ok(p) => p,
            Err(e) => PersistTally {
                fatal: Some(format!("persistence task failed: {e}")),
                ..PersistTally::default()
            },
        };
        let source_counts = source_stats.snapshot();

        let failure = persisted
            .fatal
            .clone()
            .or(source_counts.read_error.clone())
            .or_else(|| (stats.panicked > 0).then(|| format!("{} task(s) panicked", stats.panicked)))
            .or_else(|| stats.cancelled.then(|| "run cancelled".to_string()));
        let status = if failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        let tally = RunTally {
            targets_probed: stats.completed,
            targets_skipped: source_counts.skipped,
            targets_excluded: source_counts.excluded,
            results_written: persisted.written,
            results_failed: persisted.failed,
            outcomes: persisted.outcomes,
        };

        self.recorder
            .finish(run_id, status, &tally)
            .map_err(|source| CollectError::Finish { run_id, source })?;

        match &failure {
            Some(reason) => warn!(run_id, %reason, "collection failed"),
            None => info!(
                run_id,
                probed = tally.targets_probed,
                results = tally.results_written,
                errors = tally.outcomes.errors(),
                "collection completed"
            ),
        }

        Ok(CollectOutcome {
            run_id,
            status,
            tally,
            failure,
        })
    }

    /// Single consumer writing results as they arrive. Append failures are
    /// counted; a long streak of them, or a closed run, cancels the pool.
    fn spawn_persister(
        &self,
        run_id: RunId,
        mut rx: mpsc::Receiver<ProbeResult>,
    ) -> tokio::task::JoinHandle<PersistTally> {
        let recorder = Arc::clone(&self.recorder);
        let cancel = self.cancel.clone();

        tokio::task::spawn_blocking(move || {
            let mut tally = PersistTally::default();
            let mut streak = 0u64;

            while let Some(result) = rx.blocking_recv() {
                match recorder.append(run_id, &result) {
                    Ok(()) => {
                        tally.written += 1;
                        tally.outcomes.record(result.outcome);
                        streak = 0;
                    }
                    Err(e) => {
                        tally.failed += 1;
                        streak += 1;
                        error!(run_id, target = %result.target, server = %result.server, error = %e, "failed to store result");

                        let closed = matches!(e, crate::error::StorageError::RunClosed { .. });
                        if tally.fatal.is_none() && (closed || streak >= MAX_CONSECUTIVE_STORAGE_FAILURES) {
                            tally.fatal = Some(format!("storage unavailable: {e}"));
                            cancel.cancel();
                        }
                    }
                }
            }
            tally
        })
    }
}
