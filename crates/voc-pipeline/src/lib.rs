//! Processing stages of the voice-of-customer pipeline.
//!
//! Crawled records flow through [`ingest`] (cleaning and dedup), the
//! [`extractor`] (LLM insights), the [`classifier`] (themes) and the
//! [`alerts`] evaluator before [`notify`] fans alert events out to their
//! channels. [`scheduler`] decides when sources are crawled and [`worker`]
//! drains the job queues that connect the stages.

pub mod alerts;
pub mod classifier;
pub mod cleaner;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod jobs;
pub mod llm;
pub mod notify;
pub mod prompts;
pub mod scheduler;
pub mod schema;
pub mod worker;

pub use alerts::{evaluate_rule, AlertEvaluator, CycleReport, Firing};
pub use classifier::{Classification, ClassifierConfig, Taxonomy, ThemeClassifier};
pub use cleaner::{fingerprint, Cleaner, CleaningOptions};
pub use embeddings::{Embedder, TeiClient};
pub use error::{
    ClassificationError, CleaningError, DeliveryError, EmbeddingError, ExtractionError, JobError,
    LlmError, SchedulerError, TaxonomyError,
};
pub use extractor::{ExtractionReport, ExtractorConfig, InsightExtractor};
pub use ingest::{ingest_records, IngestOutcome};
pub use jobs::{Job, JobContext, JobOutcome};
pub use llm::{Completion, CompletionClient, CompletionRequest, OpenAiClient};
pub use notify::{AlertNotice, DispatchReport, NotificationChannel, NotificationDispatcher};
pub use scheduler::{CrawlScheduler, SchedulerConfig, TickReport, TriggeredCrawl};
pub use worker::{process_next, spawn_pool, Processed, WorkerConfig};
