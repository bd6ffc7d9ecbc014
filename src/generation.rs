//! Answer generation backends.
//!
//! The composer builds a [`Prompt`] from retrieved passages and hands it to a
//! [`Generator`]. The HTTP providers send the system and user messages to a
//! chat model; [`ExtractiveGenerator`] answers offline by quoting the
//! passage sentences that best match the question.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::embedding::{post_with_retry, tokenize};
use crate::error::PipelineError;

/// Sentences quoted by the extractive generator.
const EXTRACTIVE_MAX_SENTENCES: usize = 3;

/// Everything a backend may need to answer one question.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    /// Question plus formatted context, for chat models.
    pub user: String,
    pub question: String,
    /// Context passages in rank order.
    pub passages: Vec<String>,
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;
    /// Returns the answer text; an empty string means "nothing to say".
    async fn generate(&self, prompt: &Prompt) -> crate::error::Result<String>;
}

// ============ Extractive ============

pub struct ExtractiveGenerator;

#[async_trait]
impl Generator for ExtractiveGenerator {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn generate(&self, prompt: &Prompt) -> crate::error::Result<String> {
        Ok(extract_answer(&prompt.question, &prompt.passages))
    }
}

/// The passage sentences sharing the most terms with the question, in
/// their original order.
pub fn extract_answer(question: &str, passages: &[String]) -> String {
    let terms: HashSet<String> = tokenize(question).collect();
    if terms.is_empty() {
        return String::new();
    }

    let mut seen = HashSet::new();
    let mut scored: Vec<(usize, usize, &str)> = Vec::new();
    for sentence in passages.iter().flat_map(|p| split_sentences(p)) {
        // Overlapping chunks repeat sentences.
        if !seen.insert(sentence) {
            continue;
        }
        let sentence_terms: HashSet<String> = tokenize(sentence).collect();
        let score = terms.intersection(&sentence_terms).count();
        if score > 0 {
            scored.push((score, scored.len(), sentence));
        }
    }

    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    scored.truncate(EXTRACTIVE_MAX_SENTENCES);
    scored.sort_by_key(|(_, order, _)| *order);
    scored
        .into_iter()
        .map(|(_, _, s)| s)
        .collect::<Vec<_>>()
        .join(" ")
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        let boundary = match b {
            b'\n' => true,
            b'.' | b'!' | b'?' => bytes.get(i + 1).map_or(true, |n| n.is_ascii_whitespace()),
            _ => false,
        };
        if boundary {
            let end = if b == b'\n' { i } else { i + 1 };
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = i + 1;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

// ============ OpenAI ============

pub struct OpenAIGenerator {
    model: String,
    api_key: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &Prompt) -> crate::error::Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
        });
        let request = || {
            self.client
                .post("https://api.openai.com/v1/chat/completions")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
        };
        let json =
            post_with_retry("OpenAI", request, self.max_retries, PipelineError::Generation).await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|c| c.trim().to_string())
            .ok_or_else(|| {
                PipelineError::Generation("Invalid OpenAI response: missing content".to_string())
            })
    }
}

// ============ Ollama ============

pub struct OllamaGenerator {
    model: String,
    url: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            url,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &Prompt) -> crate::error::Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "system": prompt.system,
            "prompt": prompt.user,
            "stream": false,
            "options": { "temperature": self.temperature },
        });
        let endpoint = format!("{}/api/generate", self.url.trim_end_matches('/'));
        let request = || self.client.post(&endpoint).json(&body);
        let json =
            post_with_retry("Ollama", request, self.max_retries, PipelineError::Generation).await?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(|r| r.trim().to_string())
            .ok_or_else(|| {
                PipelineError::Generation("Invalid Ollama response: missing response".to_string())
            })
    }
}

/// Create the generator selected by `generation.provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "extractive" => Ok(Arc::new(ExtractiveGenerator)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
