//! Retrieval and answer composition.
//!
//! [`Composer::answer`] embeds the question with the indexing embedder,
//! retrieves the nearest chunks and keeps those above the relevance
//! threshold. The survivors are reranked by a blend of vector similarity and
//! query-term coverage, cut to `rerank_top_k`, then trimmed to at most a few
//! per document within a character budget. The [`Generator`] answers from
//! that context and the response lists the source files of the chunks
//! actually used.
//!
//! When no chunk clears the threshold, or the model declines, the response
//! is the explicit "no grounded answer" message with `grounded = false`.
//! The whole request runs under a deadline.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::RetrievalConfig;
use crate::embedding::{embed_query, tokenize, Embedder};
use crate::error::PipelineError;
use crate::generation::{Generator, Prompt};
use crate::index::{SearchHit, VectorIndex};
use crate::models::Category;

const FRENCH_MARKERS: &[&str] = &[
    "le", "la", "les", "des", "du", "au", "aux", "est", "sont", "quel", "quelle", "quels",
    "quelles", "comment", "pourquoi", "combien", "qui", "que", "une", "pour", "dans", "sur",
    "avec", "était", "chiffre", "affaires",
];
/// Weight of vector similarity in the rerank score; the rest is term coverage.
const RERANK_VECTOR_WEIGHT: f32 = 0.6;

const ENGLISH_MARKERS: &[&str] = &[
    "the", "what", "is", "was", "were", "how", "which", "who", "when", "where", "why", "of",
    "and", "in", "does", "did", "are", "for", "with",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "en")]
    English,
    #[serde(rename = "fr")]
    French,
}

impl Language {
    pub fn code(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::French => "fr",
        }
    }

    pub fn from_code(code: &str) -> Option<Language> {
        match code.to_ascii_lowercase().as_str() {
            "en" | "english" => Some(Language::English),
            "fr" | "french" | "français" => Some(Language::French),
            _ => None,
        }
    }

    /// Guess the language of a question from function words and accents.
    /// Ties go to `fallback`.
    pub fn detect(query: &str, fallback: Language) -> Language {
        let lower = query.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let mut french = words.iter().filter(|w| FRENCH_MARKERS.contains(w)).count();
        let english = words.iter().filter(|w| ENGLISH_MARKERS.contains(w)).count();
        if lower.contains(['é', 'è', 'ê', 'à', 'ç', 'ù', 'ô', 'î']) || lower.contains("qu'") {
            french += 1;
        }
        match french.cmp(&english) {
            std::cmp::Ordering::Greater => Language::French,
            std::cmp::Ordering::Less => Language::English,
            std::cmp::Ordering::Equal => fallback,
        }
    }

    pub fn no_answer(&self) -> &'static str {
        match self {
            Language::English => {
                "I could not find a grounded answer to this question in the knowledge base."
            }
            Language::French => {
                "Je n'ai pas trouvé de réponse fondée sur la base de connaissances pour cette question."
            }
        }
    }

    fn system_prompt(&self) -> String {
        match self {
            Language::English => format!(
                "You answer questions for an organisation using only the context passages provided. \
                 Quote figures exactly as written. If the context does not contain the answer, reply \
                 exactly: \"{}\" Answer in English.",
                self.no_answer()
            ),
            Language::French => format!(
                "Tu réponds aux questions d'une organisation en utilisant uniquement les extraits \
                 fournis. Reprends les chiffres tels qu'ils sont écrits. Si le contexte ne contient \
                 pas la réponse, réponds exactement : \"{}\" Réponds en français.",
                self.no_answer()
            ),
        }
    }

    fn labels(&self) -> (&'static str, &'static str, &'static str) {
        match self {
            Language::English => ("Context", "Question", "Answer"),
            Language::French => ("Contexte", "Question", "Réponse"),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub language: Option<Language>,
    /// Overrides `retrieval.query_timeout_secs`.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    /// File names of the documents whose chunks were used, first use first.
    pub sources: Vec<String>,
    pub chunk_ids: Vec<String>,
    pub grounded: bool,
    pub language: Language,
}

/// Per-request trace: what was retrieved, what was used, what came out.
/// Logged, never stored.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub query: String,
    pub language: Language,
    pub retrieved: Vec<SearchHit>,
    pub reranked: Vec<SearchHit>,
    pub used: Vec<SearchHit>,
    pub answer: String,
    pub citations: Vec<String>,
}

#[derive(Error, Debug)]
pub enum AnswerError {
    #[error("query must not be empty")]
    EmptyQuery,
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Clone)]
pub struct Composer {
    index: VectorIndex,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    config: RetrievalConfig,
}

impl Composer {
    pub fn new(
        index: VectorIndex,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            generator,
            config,
        }
    }

    pub async fn answer(&self, request: QueryRequest) -> Result<QueryResponse, AnswerError> {
        if request.query.trim().is_empty() {
            return Err(AnswerError::EmptyQuery);
        }

        let deadline = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_secs(self.config.query_timeout_secs));

        match tokio::time::timeout(deadline, self.compose(&request)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::RetrievalTimeout(deadline.as_millis() as u64).into()),
        }
    }

    async fn compose(&self, request: &QueryRequest) -> Result<QueryResponse, AnswerError> {
        let started = Instant::now();
        let fallback = Language::from_code(&self.config.default_language).unwrap_or(Language::English);
        let language = request
            .language
            .unwrap_or_else(|| Language::detect(&request.query, fallback));

        let query_vec = embed_query(self.embedder.as_ref(), &request.query).await?;
        let retrieved = self
            .index
            .search(
                &query_vec,
                self.embedder.model_name(),
                self.config.top_k,
                request.category,
            )
            .await?;
        let candidates: Vec<SearchHit> = retrieved
            .iter()
            .filter(|h| h.score >= self.config.min_relevance)
            .cloned()
            .collect();
        let reranked = rerank(&request.query, candidates, self.config.rerank_top_k);
        let used = select_context(&reranked, &self.config);

        let mut ctx = QueryContext {
            query: request.query.clone(),
            language,
            retrieved,
            reranked,
            used,
            answer: String::new(),
            citations: Vec::new(),
        };

        let response = if ctx.used.is_empty() {
            no_grounded_answer(language)
        } else {
            let prompt = build_prompt(language, &request.query, &ctx.used);
            let text = self.generator.generate(&prompt).await?;
            let text = text.trim();
            if text.is_empty() || text.contains(language.no_answer()) {
                no_grounded_answer(language)
            } else {
                QueryResponse {
                    answer: text.to_string(),
                    sources: citations(&ctx.used),
                    chunk_ids: ctx.used.iter().map(|h| h.chunk_id.clone()).collect(),
                    grounded: true,
                    language,
                }
            }
        };

        ctx.answer = response.answer.clone();
        ctx.citations = response.sources.clone();
        info!(
            language = language.code(),
            retrieved = ctx.retrieved.len(),
            reranked = ctx.reranked.len(),
            used = ctx.used.len(),
            grounded = response.grounded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query answered"
        );
        debug!(context = ?ctx, "query context");

        Ok(response)
    }
}

fn no_grounded_answer(language: Language) -> QueryResponse {
    QueryResponse {
        answer: language.no_answer().to_string(),
        sources: Vec::new(),
        chunk_ids: Vec::new(),
        grounded: false,
        language,
    }
}

/// Reorder threshold-passing hits by relevance to the query and keep the
/// best `keep` (all of them when `keep` is 0).
///
/// The rerank score blends the vector similarity with the share of distinct
/// query terms the chunk contains, which favours passages that mention the
/// asked-about figure or name over merely topical ones. Ties keep the
/// retrieval order.
pub fn rerank(query: &str, hits: Vec<SearchHit>, keep: usize) -> Vec<SearchHit> {
    let terms: HashSet<String> = tokenize(query).collect();
    let mut scored: Vec<(f32, SearchHit)> = hits
        .into_iter()
        .map(|hit| {
            let coverage = if terms.is_empty() {
                0.0
            } else {
                let chunk_terms: HashSet<String> = tokenize(&hit.text).collect();
                terms.intersection(&chunk_terms).count() as f32 / terms.len() as f32
            };
            let relevance =
                RERANK_VECTOR_WEIGHT * hit.score + (1.0 - RERANK_VECTOR_WEIGHT) * coverage;
            (relevance, hit)
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    if keep > 0 {
        scored.truncate(keep);
    }
    scored.into_iter().map(|(_, hit)| hit).collect()
}

/// Choose the chunks that go into the prompt, given hits in descending
/// relevance order.
///
/// Hits below `min_relevance` are dropped; each document contributes at most
/// `max_chunks_per_doc` of its best chunks; the lowest-ranked chunks are
/// dropped until the total text fits `max_context_chars`. The result keeps
/// the relevance order.
pub fn select_context(hits: &[SearchHit], config: &RetrievalConfig) -> Vec<SearchHit> {
    let mut per_doc: HashMap<&str, usize> = HashMap::new();
    let mut used: Vec<SearchHit> = Vec::new();
    let mut budget = config.max_context_chars;

    for hit in hits.iter().filter(|h| h.score >= config.min_relevance) {
        let count = per_doc.entry(hit.document_id.as_str()).or_insert(0);
        if *count >= config.max_chunks_per_doc {
            continue;
        }
        let len = hit.text.chars().count();
        if len > budget {
            if used.is_empty() {
                // The best chunk alone overflows: keep a truncated copy.
                let mut truncated = hit.clone();
                truncated.text = hit.text.chars().take(budget).collect();
                used.push(truncated);
            }
            break;
        }
        budget -= len;
        *count += 1;
        used.push(hit.clone());
    }
    used
}

/// One entry per cited document, in order of first use. Entries show the
/// file name, or the document id when two cited files share a name.
pub fn citations(used: &[SearchHit]) -> Vec<String> {
    let mut documents: Vec<(&str, &str)> = Vec::new();
    for hit in used {
        if !documents.iter().any(|(id, _)| *id == hit.document_id) {
            documents.push((hit.document_id.as_str(), hit.file_name.as_str()));
        }
    }
    documents
        .iter()
        .map(|(id, name)| {
            let shared = documents.iter().filter(|(_, other)| other == name).count() > 1;
            if shared {
                id.to_string()
            } else {
                name.to_string()
            }
        })
        .collect()
}

pub fn build_prompt(language: Language, query: &str, used: &[SearchHit]) -> Prompt {
    let (context_label, question_label, answer_label) = language.labels();
    let mut user = format!("{}:\n", context_label);
    for (i, hit) in used.iter().enumerate() {
        user.push_str(&format!("[{}] ({})\n{}\n\n", i + 1, hit.file_name, hit.text));
    }
    user.push_str(&format!("{}: {}\n{}:", question_label, query, answer_label));

    Prompt {
        system: language.system_prompt(),
        user,
        question: query.to_string(),
        passages: used.iter().map(|h| h.text.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(doc: &str, index: i64, score: f32, text: &str) -> SearchHit {
        SearchHit {
            chunk_id: format!("{}#{}", doc, index),
            document_id: doc.to_string(),
            category: Category::Internal,
            file_name: doc.rsplit('/').next().unwrap_or(doc).to_string(),
            chunk_index: index,
            text: text.to_string(),
            score,
        }
    }

    fn config() -> RetrievalConfig {
        RetrievalConfig {
            min_relevance: 0.3,
            max_chunks_per_doc: 2,
            max_context_chars: 100,
            ..RetrievalConfig::default()
        }
    }

    #[test]
    fn detect_language() {
        assert_eq!(
            Language::detect("What was the annual revenue?", Language::French),
            Language::English
        );
        assert_eq!(
            Language::detect("Quel était le chiffre d'affaires annuel ?", Language::English),
            Language::French
        );
        assert_eq!(Language::detect("revenue 2024", Language::French), Language::French);
    }

    #[test]
    fn threshold_and_per_document_cap() {
        let hits = vec![
            hit("internal/a.txt", 3, 0.9, "a3"),
            hit("internal/a.txt", 1, 0.8, "a1"),
            hit("internal/b.txt", 0, 0.7, "b0"),
            hit("internal/a.txt", 2, 0.6, "a2"),
            hit("internal/c.txt", 0, 0.1, "c0"),
        ];
        let used = select_context(&hits, &config());
        let ids: Vec<&str> = used.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["internal/a.txt#3", "internal/a.txt#1", "internal/b.txt#0"]);
    }

    #[test]
    fn context_budget_drops_lowest_ranked() {
        let hits = vec![
            hit("internal/a.txt", 0, 0.9, &"x".repeat(60)),
            hit("internal/b.txt", 0, 0.8, &"y".repeat(30)),
            hit("internal/c.txt", 0, 0.7, &"z".repeat(30)),
        ];
        let used = select_context(&hits, &config());
        let docs: Vec<&str> = used.iter().map(|h| h.document_id.as_str()).collect();
        assert_eq!(docs, vec!["internal/a.txt", "internal/b.txt"]);
    }

    #[test]
    fn context_keeps_descending_relevance_across_documents() {
        let hits = vec![
            hit("internal/a.txt", 5, 0.9, "a5"),
            hit("internal/b.txt", 0, 0.85, "b0"),
            hit("internal/a.txt", 0, 0.8, "a0"),
        ];
        let used = select_context(&hits, &config());
        let scores: Vec<f32> = used.iter().map(|h| h.score).collect();
        assert_eq!(scores, vec![0.9, 0.85, 0.8]);
    }

    #[test]
    fn rerank_prefers_chunks_covering_the_question() {
        let hits = vec![
            hit("internal/a.txt", 0, 0.62, "Acme designs warehouse robots for retailers."),
            hit("internal/b.txt", 0, 0.58, "Annual revenue was $4.2M in 2024."),
            hit("internal/c.txt", 0, 0.5, "The office is in Lyon."),
        ];
        let ranked = rerank("What was the annual revenue?", hits, 2);
        let docs: Vec<&str> = ranked.iter().map(|h| h.document_id.as_str()).collect();
        assert_eq!(docs, vec!["internal/b.txt", "internal/a.txt"]);
    }

    #[test]
    fn rerank_without_limit_keeps_everything() {
        let hits = vec![
            hit("internal/a.txt", 0, 0.9, "alpha"),
            hit("internal/b.txt", 0, 0.8, "beta"),
        ];
        assert_eq!(rerank("gamma", hits, 0).len(), 2);
    }

    #[test]
    fn nothing_above_threshold_selects_nothing() {
        let hits = vec![hit("internal/a.txt", 0, 0.1, "weak")];
        assert!(select_context(&hits, &config()).is_empty());
    }

    #[test]
    fn citations_are_deduplicated_in_order() {
        let used = vec![
            hit("internal/b.txt", 0, 0.9, "b"),
            hit("internal/b.txt", 1, 0.8, "b"),
            hit("external/a.txt", 0, 0.7, "a"),
        ];
        assert_eq!(citations(&used), vec!["b.txt", "a.txt"]);
    }

    #[test]
    fn same_file_name_in_both_roots_is_cited_twice() {
        let used = vec![
            hit("internal/report.txt", 0, 0.9, "internal figures"),
            hit("external/report.txt", 0, 0.8, "public figures"),
            hit("external/faq.md", 0, 0.7, "questions"),
        ];
        assert_eq!(
            citations(&used),
            vec!["internal/report.txt", "external/report.txt", "faq.md"]
        );
    }

    #[test]
    fn prompt_is_localized() {
        let used = vec![hit("internal/a.txt", 0, 0.9, "Le chiffre d'affaires était de 4,2 M€.")];
        let prompt = build_prompt(Language::French, "Quel chiffre ?", &used);
        assert!(prompt.user.starts_with("Contexte:"));
        assert!(prompt.user.contains("[1] (a.txt)"));
        assert!(prompt.system.contains(Language::French.no_answer()));
    }
}
