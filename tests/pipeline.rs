use async_trait::async_trait;
use ragloop::blob_fs::FileBlobStore;
use ragloop::config::Config;
use ragloop::ingest;
use ragloop::service::RagService;
use ragloop_core::embedding::Embedder;
use ragloop_core::evaluation::FALLBACK_ANSWER;
use ragloop_core::feedback::FeedbackOutcome;
use ragloop_core::generation::Generator;
use ragloop_core::state::EntityKind;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const VOCABULARY: [&str; 10] = [
    "rust",
    "systems",
    "language",
    "cargo",
    "crates",
    "deploy",
    "kubernetes",
    "docker",
    "python",
    "memory",
];

/// Bag-of-words over a fixed vocabulary. Text without vocabulary words
/// embeds to the zero vector.
struct VocabEmbedder;

#[async_trait]
impl Embedder for VocabEmbedder {
    fn model_name(&self) -> &str {
        "vocab"
    }

    fn dims(&self) -> usize {
        VOCABULARY.len()
    }

    async fn embed_batch(&self, texts: &[String]) -> ragloop_core::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; VOCABULARY.len()];
                for token in text
                    .to_lowercase()
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|t| !t.is_empty())
                {
                    if let Some(i) = VOCABULARY.iter().position(|w| *w == token) {
                        v[i] += 1.0;
                    }
                }
                v
            })
            .collect())
    }
}

/// Returns a fixed answer and counts calls.
struct ScriptedGenerator {
    answer: String,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    fn new(answer: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: answer.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &str) -> ragloop_core::Result<String> {
        assert!(prompt.contains("Context:"));
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer.clone())
    }
}

fn config_for(root: &Path) -> Config {
    let mut config = Config::with_root(root.join("data"));
    config.retrieval.top_k = 1;
    config.retrieval.rerank_k = 1;
    config
}

fn open_service(root: &Path, generator: Arc<ScriptedGenerator>) -> RagService {
    let config = config_for(root);
    let blobs = Arc::new(FileBlobStore::open(&config.storage.root).unwrap());
    RagService::with_components(config, blobs, Arc::new(VocabEmbedder), generator).unwrap()
}

fn write_docs(root: &Path) -> std::path::PathBuf {
    let docs = root.join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(docs.join("rust.md"), "Rust is a systems language.").unwrap();
    docs
}

#[tokio::test]
async fn test_fallback_answer_scores_full_relevance_and_groundedness() {
    let tmp = TempDir::new().unwrap();
    let docs = write_docs(tmp.path());
    let generator = ScriptedGenerator::new(FALLBACK_ANSWER);
    let service = open_service(tmp.path(), generator.clone());

    let report = ingest::ingest_path(&service, &docs, "general", None).await.unwrap();
    assert_eq!(report.documents_added, 1);
    assert_eq!(report.chunks_written, 1);
    let index_id = report.index_id.unwrap();

    // No vocabulary overlap with the chunk: the question is orthogonal to it.
    let response = service.ask("How do I deploy to kubernetes?").await.unwrap();
    assert_eq!(response.answer, FALLBACK_ANSWER);
    assert_eq!(response.sources.len(), 1);
    assert_eq!(generator.calls(), 1);

    let metrics = response.metrics.unwrap();
    assert_eq!(metrics.relevance, 1.0);
    assert_eq!(metrics.groundedness, 1.0);
    assert_eq!(metrics.answerability, 0.2);

    let feedback_id = response.feedback_id.unwrap();
    let evaluation = service.evaluations().load(&feedback_id).unwrap().unwrap();
    assert_eq!(evaluation.chunks.len(), 1);
    assert_eq!(evaluation.chunks[0].relevance, 0.0);
    assert!(service.feedback().load(&feedback_id).unwrap().is_some());

    let index_state = service.state().index_state(&index_id).unwrap().unwrap();
    assert_eq!(index_state.usage_count, 1);
    assert_eq!(service.state().list(EntityKind::Chunk).unwrap().len(), 1);
}

#[tokio::test]
async fn test_feedback_applies_once() {
    let tmp = TempDir::new().unwrap();
    let docs = write_docs(tmp.path());
    let generator = ScriptedGenerator::new("Rust is a systems language with cargo.");
    let service = open_service(tmp.path(), generator);
    ingest::ingest_path(&service, &docs, "general", None).await.unwrap();

    let response = service.ask("What is Rust?").await.unwrap();
    let feedback_id = response.feedback_id.unwrap();
    let before = service.state().snapshot().unwrap();

    assert_eq!(
        service.submit_feedback(&feedback_id, 1, "great").unwrap(),
        FeedbackOutcome::Applied
    );
    let after_first = service.state().snapshot().unwrap();
    for (id, state) in &before.chunk_state {
        let expected = (state.weight * 1.02).min(2.0_f64.max(state.weight));
        assert!((after_first.chunk_state[id].weight - expected).abs() < 1e-9);
    }

    assert_eq!(
        service.submit_feedback(&feedback_id, 1, "again").unwrap(),
        FeedbackOutcome::AlreadyApplied
    );
    let after_second = service.state().snapshot().unwrap();
    assert_eq!(after_first.chunk_state, after_second.chunk_state);
    assert_eq!(after_first.document_state, after_second.document_state);
    assert_eq!(after_first.index_state, after_second.index_state);

    assert!(service.submit_feedback("unknown", 1, "").is_err());
    assert!(service.submit_feedback(&feedback_id, 3, "").is_err());
}

#[tokio::test]
async fn test_repeat_question_hits_cache() {
    let tmp = TempDir::new().unwrap();
    let docs = write_docs(tmp.path());
    let generator = ScriptedGenerator::new("Rust is a systems language.");
    let service = open_service(tmp.path(), generator.clone());
    ingest::ingest_path(&service, &docs, "general", None).await.unwrap();

    let first = service.ask("What is Rust?").await.unwrap();
    assert!(!first.cached);
    let second = service.ask("  What is Rust?  ").await.unwrap();
    assert!(second.cached);
    assert_eq!(second.answer, first.answer);
    assert_eq!(second.feedback_id, first.feedback_id);
    assert_eq!(second.cache_similarity, Some(1.0));
    assert_eq!(generator.calls(), 1);
    assert_eq!(service.evaluations().list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_state_and_cache_survive_restart() {
    let tmp = TempDir::new().unwrap();
    let docs = write_docs(tmp.path());
    let first_generator = ScriptedGenerator::new("Rust is a systems language.");
    let (snapshot, indexes) = {
        let service = open_service(tmp.path(), first_generator.clone());
        ingest::ingest_path(&service, &docs, "general", None).await.unwrap();
        service.ask("What is Rust?").await.unwrap();
        (
            service.state().snapshot().unwrap(),
            service.registry().list().unwrap(),
        )
    };

    let second_generator = ScriptedGenerator::new("unused");
    let service = open_service(tmp.path(), second_generator.clone());
    assert_eq!(service.state().snapshot().unwrap(), snapshot);
    assert_eq!(service.registry().list().unwrap(), indexes);

    let response = service.ask("What is Rust?").await.unwrap();
    assert!(response.cached);
    assert_eq!(second_generator.calls(), 0);
}

#[tokio::test]
async fn test_empty_knowledge_base_short_circuits() {
    let tmp = TempDir::new().unwrap();
    let generator = ScriptedGenerator::new("unused");
    let service = open_service(tmp.path(), generator.clone());

    let response = service.ask("What is Rust?").await.unwrap();
    assert_eq!(response.answer, FALLBACK_ANSWER);
    assert!(response.metrics.is_none());
    assert!(response.feedback_id.is_none());
    assert_eq!(generator.calls(), 0);
    assert!(service.evaluations().list().unwrap().is_empty());
    assert!(service.state().list(EntityKind::Chunk).unwrap().is_empty());
}

#[tokio::test]
async fn test_reingest_changed_document_invalidates_cached_answers() {
    let tmp = TempDir::new().unwrap();
    let docs = write_docs(tmp.path());
    let generator = ScriptedGenerator::new("Rust is a systems language.");
    let service = open_service(tmp.path(), generator.clone());
    ingest::ingest_path(&service, &docs, "general", None).await.unwrap();
    service.ask("What is Rust?").await.unwrap();

    let unchanged = ingest::ingest_path(&service, &docs, "general", None).await.unwrap();
    assert_eq!(unchanged.documents_unchanged, 1);
    assert_eq!(unchanged.index_id, None);

    fs::write(docs.join("rust.md"), "Rust is a memory safe systems language.").unwrap();
    let updated = ingest::ingest_path(&service, &docs, "general", None).await.unwrap();
    assert_eq!(updated.documents_updated, 1);
    assert_eq!(updated.cache_entries_invalidated, 1);
    assert!(updated.index_id.is_some());

    let response = service.ask("What is Rust?").await.unwrap();
    assert!(!response.cached);
    assert_eq!(generator.calls(), 2);
    let chunk_id = &response.sources[0].chunk_id;
    let chunk = service.chunks().load(chunk_id).unwrap().unwrap();
    assert!(chunk.content.contains("memory safe"));
}

#[tokio::test]
async fn test_analysis_over_stored_records() {
    let tmp = TempDir::new().unwrap();
    let docs = write_docs(tmp.path());
    let generator = ScriptedGenerator::new("Docker and python.");
    let service = open_service(tmp.path(), generator);
    ingest::ingest_path(&service, &docs, "general", None).await.unwrap();

    let response = service.ask("What is Rust?").await.unwrap();
    service
        .submit_feedback(response.feedback_id.as_deref().unwrap(), -1, "off topic")
        .unwrap();

    let (report, proposals) = service.analyze().unwrap();
    assert_eq!(report.evaluations_count, 1);
    assert_eq!(report.feedback_count, 1);
    assert_eq!(report.rated_count, 1);
    assert_eq!(report.index_stats.len(), 1);
    // The answer shares no words with the question or the chunk.
    assert_eq!(report.avg_groundedness, Some(0.0));
    assert!(proposals.iter().any(|p| p.policy == "retrieval.top_k"));
}

fn run_ragloop(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_ragloop"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .expect("failed to run ragloop binary");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn test_cli_smoke() {
    let tmp = TempDir::new().unwrap();
    let data = tmp.path().join("data");
    let config_path = tmp.path().join("ragloop.toml");
    fs::write(
        &config_path,
        format!("[storage]\nroot = \"{}\"\n", data.display()),
    )
    .unwrap();

    let (stdout, _, ok) = run_ragloop(&config_path, &["init"]);
    assert!(ok);
    assert!(stdout.contains("Storage initialized"));
    assert!(data.join("state").is_dir());

    let (stdout, _, ok) = run_ragloop(&config_path, &["state", "chunks"]);
    assert!(ok);
    assert_eq!(stdout.trim(), "{}");

    let (stdout, _, ok) = run_ragloop(&config_path, &["indexes"]);
    assert!(ok);
    assert!(stdout.contains("No indexes"));

    let (_, stderr, ok) = run_ragloop(&config_path, &["feedback", "missing", "1"]);
    assert!(!ok);
    assert!(stderr.contains("not found") || stderr.contains("Not found"));

    let (_, _, ok) = run_ragloop(&config_path, &["feedback", "missing", "5"]);
    assert!(!ok);

    let (stdout, _, ok) = run_ragloop(&config_path, &["cache", "clear"]);
    assert!(ok);
    assert!(stdout.contains("Removed 0 entries"));
}

#[test]
fn test_cli_rejects_invalid_config() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("ragloop.toml");
    fs::write(
        &config_path,
        "[storage]\nroot = \"data\"\n[retrieval]\ntop_k = 1\nrerank_k = 2\n",
    )
    .unwrap();
    let (_, stderr, ok) = run_ragloop(&config_path, &["init"]);
    assert!(!ok);
    assert!(stderr.contains("retrieval"));
}
