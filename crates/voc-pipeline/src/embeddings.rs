//! Text embeddings for theme classification.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::EmbeddingError;

/// Maximum number of texts per /embed call.
const BATCH_SIZE: usize = 64;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Client for a TEI-compatible (Text Embeddings Inference) `/embed` endpoint.
pub struct TeiClient {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [&'a str],
    truncate: bool,
}

impl TeiClient {
    /// # Errors
    ///
    /// Returns [`EmbeddingError::Request`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: format!("{}/embed", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Embedder for TeiClient {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut all_embeddings = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(BATCH_SIZE) {
            let response = self
                .client
                .post(&self.url)
                .json(&EmbedRequest {
                    inputs: chunk,
                    truncate: true,
                })
                .send()
                .await
                .map_err(|e| EmbeddingError::Request(e.to_string()))?;

            if !response.status().is_success() {
                return Err(EmbeddingError::Status(response.status().as_u16()));
            }

            let embeddings: Vec<Vec<f32>> = response
                .json()
                .await
                .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

            if embeddings.len() != chunk.len() {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "{} embeddings for {} inputs",
                    embeddings.len(),
                    chunk.len()
                )));
            }

            all_embeddings.extend(embeddings);
        }

        Ok(all_embeddings)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn embeds_in_chunks_of_sixty_four() {
        let server = MockServer::start().await;
        let full: Vec<Vec<f32>> = (0..64).map(|i| vec![i as f32, 1.0]).collect();
        Mock::given(method("POST"))
            .and(path("/embed"))
            .and(body_partial_json(json!({ "truncate": true })))
            .respond_with(ResponseTemplate::new(200).set_body_json(&full))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([[9.0, 9.0]])))
            .expect(1)
            .mount(&server)
            .await;

        let texts: Vec<String> = (0..65).map(|i| format!("text {i}")).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let client = TeiClient::new(&server.uri(), 5).unwrap();

        let vectors = client.embed(&refs).await.unwrap();

        assert_eq!(vectors.len(), 65);
        assert_eq!(vectors[64], vec![9.0, 9.0]);
    }

    #[tokio::test]
    async fn count_mismatch_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([[1.0]])))
            .mount(&server)
            .await;

        let client = TeiClient::new(&server.uri(), 5).unwrap();
        let err = client.embed(&["a", "b"]).await.unwrap_err();

        assert!(matches!(err, EmbeddingError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn server_error_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = TeiClient::new(&server.uri(), 5).unwrap();
        let err = client.embed(&["a"]).await.unwrap_err();

        assert_eq!(err, EmbeddingError::Status(503));
    }
}
