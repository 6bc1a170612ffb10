//! Clean, dedup and store the records of one crawl.

use voc_core::{CrawlStats, NewDiscard, Source};
use voc_crawler::RawRecord;
use voc_db::{DbError, Store};

use crate::cleaner::Cleaner;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub stats: CrawlStats,
    /// Ids of feedback rows created by this call, in record order.
    pub feedback_ids: Vec<i64>,
}

/// Run every record through the cleaner and insert the survivors.
///
/// Discards are recorded with their reason; exact duplicates (same source and
/// fingerprint) are counted and skipped. Order does not matter: the store's
/// uniqueness constraint decides which copy wins.
///
/// # Errors
///
/// Returns [`DbError`] only when the store itself fails.
pub async fn ingest_records(
    store: &dyn Store,
    cleaner: &Cleaner,
    source: &Source,
    crawl_run_id: Option<i64>,
    records: &[RawRecord],
) -> Result<IngestOutcome, DbError> {
    let mut outcome = IngestOutcome::default();
    let platform = source.platform();

    for record in records {
        outcome.stats.fetched += 1;

        let mut feedback = match cleaner.prepare(source.id, crawl_run_id, record) {
            Ok(feedback) => feedback,
            Err(err) => {
                let reason = err.reason();
                tracing::debug!(
                    source_id = source.id,
                    external_id = %record.external_id,
                    reason = %reason,
                    "ingest: record discarded"
                );
                store
                    .record_discard(&NewDiscard {
                        source_id: source.id,
                        crawl_run_id,
                        external_id: Some(record.external_id.trim().to_string())
                            .filter(|id| !id.is_empty()),
                        reason,
                    })
                    .await?;
                outcome.stats.record_discard(reason);
                continue;
            }
        };

        if let Some(meta) = feedback.metadata.as_object_mut() {
            meta.insert("platform".to_string(), platform.as_str().into());
        } else {
            feedback.metadata = serde_json::json!({ "platform": platform.as_str() });
        }

        match store.insert_feedback(&feedback).await? {
            Some(id) => {
                outcome.stats.stored += 1;
                outcome.feedback_ids.push(id);
            }
            None => {
                tracing::debug!(
                    source_id = source.id,
                    external_id = %feedback.external_id,
                    "ingest: exact duplicate skipped"
                );
                outcome.stats.duplicates += 1;
            }
        }
    }

    tracing::info!(
        source_id = source.id,
        crawl_run_id,
        fetched = outcome.stats.fetched,
        stored = outcome.stats.stored,
        duplicates = outcome.stats.duplicates,
        discarded = outcome.stats.discarded,
        "ingest: records processed"
    );
    Ok(outcome)
}
