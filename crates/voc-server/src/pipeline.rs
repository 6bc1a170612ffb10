//! Wires the pipeline stages from [`AppConfig`].

use std::sync::Arc;

use voc_core::AppConfig;
use voc_crawler::{default_registry, PoliteClient};
use voc_db::{JobQueue, Store};
use voc_pipeline::{
    AlertEvaluator, ClassifierConfig, Cleaner, CleaningOptions, Embedder, ExtractorConfig,
    InsightExtractor, JobContext, NotificationDispatcher, OpenAiClient, Taxonomy, TeiClient,
    ThemeClassifier,
};

const EMBEDDING_TIMEOUT_SECS: u64 = 30;

/// Build the handler context shared by every worker.
///
/// # Errors
///
/// Fails if an HTTP client cannot be built, the taxonomy file is unreadable
/// or invalid, or the SMTP sender address is malformed.
pub fn build_context(
    config: &AppConfig,
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
) -> anyhow::Result<JobContext> {
    let http = Arc::new(PoliteClient::new(
        config.crawl_request_timeout_secs,
        &config.crawl_user_agent,
    )?);
    let registry = default_registry(&http, config.twitter_bearer_token.clone());
    if config.twitter_bearer_token.is_none() {
        tracing::warn!("VOC_TWITTER_BEARER_TOKEN not set; twitter sources will fail as blocked");
    }
    tracing::info!(platforms = ?registry.platforms(), "crawler adapters registered");

    let llm = OpenAiClient::new(
        &config.llm_base_url,
        config.llm_api_key.as_deref(),
        &config.llm_model,
        config.llm_timeout_secs,
    )?;
    if config.llm_api_key.is_none() {
        tracing::warn!("VOC_LLM_API_KEY not set; extraction calls will be unauthenticated");
    }
    let extractor = InsightExtractor::new(
        Arc::clone(&store),
        Arc::new(llm),
        ExtractorConfig::from_app_config(config),
    );

    let embedder = match &config.embedding_url {
        Some(url) => Some(Arc::new(TeiClient::new(url, EMBEDDING_TIMEOUT_SECS)?) as Arc<dyn Embedder>),
        None => {
            tracing::info!("VOC_EMBEDDING_URL not set; themes are assigned by keyword rules only");
            None
        }
    };
    let taxonomy = Taxonomy::load(config.taxonomy_path.as_deref())?;
    let classifier = ThemeClassifier::new(
        Arc::clone(&store),
        embedder,
        &taxonomy,
        ClassifierConfig::from_app_config(config),
    )?;

    let dispatcher = NotificationDispatcher::from_app_config(Arc::clone(&store), config)?;

    Ok(JobContext {
        registry: Arc::new(registry),
        cleaner: Cleaner::new(CleaningOptions {
            min_content_chars: config.min_content_chars,
            ..CleaningOptions::default()
        }),
        extractor: Arc::new(extractor),
        classifier: Arc::new(classifier),
        evaluator: Arc::new(AlertEvaluator::new(Arc::clone(&store))),
        dispatcher: Arc::new(dispatcher),
        fetch_limit: config.crawl_fetch_limit,
        store,
        queue,
    })
}
