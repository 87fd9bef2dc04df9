//! dnscensus -- DNS resolution census.
//!
//! Probes every target of a list against a set of DNS servers, classifies
//! what each server answered, enriches returned addresses with country and
//! ASN data, and stores the results under one identifiable run.

pub mod collector;
pub mod config;
pub mod enrich;
pub mod error;
pub mod probes;
pub mod run;
pub mod scheduler;
pub mod storage;
pub mod targets;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use collector::{CollectConfig, CollectOutcome, Collector};
pub use error::CollectError;

/// Build every collaborator from `config` and execute one run.
pub async fn collect(
    config: &config::Config,
    cancel: CancellationToken,
) -> Result<CollectOutcome, CollectError> {
    let collect_config = CollectConfig::from_config(config)?;

    // 1. Inputs that must load before anything is written
    let exclusion =
        targets::ExclusionList::load_optional(config.run.exclusion_path.as_deref())?;
    let enricher = config
        .geoip
        .as_ref()
        .map(enrich::MaxMindEnricher::open)
        .transpose()?;

    // 2. Storage
    tracing::info!(path = %config.database.path.display(), "opening run store");
    let recorder = storage::SqliteRecorder::open(&config.database.path)?;

    // 3. Orchestrator
    let mut collector = Collector::new(
        collect_config,
        Arc::new(recorder),
        Arc::new(probes::dns::UdpTransport),
    )
    .with_exclusion(Arc::new(exclusion))
    .with_cancellation(cancel);
    if let Some(enricher) = enricher {
        collector = collector.with_enricher(Arc::new(enricher));
    }

    collector.collect().await
}
