//! Evaluation records and the human feedback path.
//!
//! Every answered question persists its [`EvaluationResult`] and a feedback
//! *shell* sharing the evaluation id. A later [`FeedbackStore::submit`]
//! rates the shell and folds the rating into learning state exactly once.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::evaluation::EvaluationResult;
use crate::state::StateStore;
use crate::store::{self, BlobStore};

fn blob_key(id: &str) -> String {
    format!("{id}.json")
}

fn load_all<T: serde::de::DeserializeOwned>(blobs: &dyn BlobStore, namespace: &str) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for key in blobs.list(namespace)? {
        if !key.ends_with(".json") {
            continue;
        }
        match store::get_json(blobs, namespace, &key) {
            Ok(Some(record)) => out.push(record),
            Ok(None) => {}
            Err(err) => tracing::warn!(namespace, key = %key, error = %err, "Skipping unreadable record"),
        }
    }
    Ok(out)
}

#[derive(Clone)]
pub struct EvaluationStore {
    blobs: Arc<dyn BlobStore>,
}

impl EvaluationStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub fn save(&self, evaluation: &EvaluationResult) -> Result<String> {
        store::put_json(
            self.blobs.as_ref(),
            store::EVALUATIONS,
            &blob_key(&evaluation.evaluation_id),
            evaluation,
        )?;
        Ok(evaluation.evaluation_id.clone())
    }

    pub fn load(&self, evaluation_id: &str) -> Result<Option<EvaluationResult>> {
        store::get_json(self.blobs.as_ref(), store::EVALUATIONS, &blob_key(evaluation_id))
    }

    /// Every readable evaluation, oldest first.
    pub fn list(&self) -> Result<Vec<EvaluationResult>> {
        let mut all: Vec<EvaluationResult> = load_all(self.blobs.as_ref(), store::EVALUATIONS)?;
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    /// Always equal to `evaluation_id`.
    pub feedback_id: String,
    pub evaluation_id: String,
    /// `-1`, `0` or `1`; `None` until the user rates the answer.
    #[serde(default)]
    pub rating: Option<i8>,
    #[serde(default)]
    pub comment: String,
    /// Set once the rating has been folded into learning state.
    #[serde(default)]
    pub applied: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOutcome {
    Applied,
    /// The record was already applied; nothing changed.
    AlreadyApplied,
}

pub struct FeedbackStore {
    blobs: Arc<dyn BlobStore>,
    state: Arc<StateStore>,
    submit_lock: Mutex<()>,
}

impl FeedbackStore {
    pub fn new(blobs: Arc<dyn BlobStore>, state: Arc<StateStore>) -> Self {
        Self {
            blobs,
            state,
            submit_lock: Mutex::new(()),
        }
    }

    fn save(&self, record: &FeedbackRecord) -> Result<()> {
        store::put_json(
            self.blobs.as_ref(),
            store::FEEDBACK,
            &blob_key(&record.feedback_id),
            record,
        )
    }

    /// Create an unrated record for an evaluation. Returns the feedback id.
    pub fn create_shell(&self, evaluation_id: &str) -> Result<String> {
        let record = FeedbackRecord {
            feedback_id: evaluation_id.to_string(),
            evaluation_id: evaluation_id.to_string(),
            rating: None,
            comment: String::new(),
            applied: false,
            created_at: Utc::now(),
            updated_at: None,
        };
        self.save(&record)?;
        Ok(record.feedback_id)
    }

    pub fn load(&self, feedback_id: &str) -> Result<Option<FeedbackRecord>> {
        store::get_json(self.blobs.as_ref(), store::FEEDBACK, &blob_key(feedback_id))
    }

    pub fn list(&self) -> Result<Vec<FeedbackRecord>> {
        let mut all: Vec<FeedbackRecord> = load_all(self.blobs.as_ref(), store::FEEDBACK)?;
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    /// Rate an answer and apply the global weight decay, at most once per
    /// feedback id.
    ///
    /// The check of `applied` and the application run under one lock, so
    /// concurrent submissions for the same id apply once. The record is
    /// marked applied before state is touched: a crash in between loses a
    /// nudge rather than applying it twice. A second submission returns
    /// [`FeedbackOutcome::AlreadyApplied`] and changes nothing.
    pub fn submit(&self, feedback_id: &str, rating: i8, comment: &str) -> Result<FeedbackOutcome> {
        if !(-1..=1).contains(&rating) {
            return Err(Error::validation(format!(
                "Feedback rating must be -1, 0 or 1, got {rating}"
            )));
        }
        let _guard = self
            .submit_lock
            .lock()
            .map_err(|_| Error::persistence("feedback lock poisoned"))?;

        let mut record = self
            .load(feedback_id)?
            .ok_or_else(|| Error::not_found(format!("Feedback {feedback_id}")))?;
        if record.applied {
            tracing::info!(feedback_id, "Feedback already applied, ignoring");
            return Ok(FeedbackOutcome::AlreadyApplied);
        }

        record.rating = Some(rating);
        record.comment = comment.to_string();
        record.applied = true;
        record.updated_at = Some(Utc::now());
        self.save(&record)?;

        self.state.apply_human_decay(rating)?;
        self.state.save_all()?;
        tracing::info!(feedback_id, rating, "Feedback applied");
        Ok(FeedbackOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::EvaluationMetrics;
    use crate::state::EntityKind;
    use crate::store::memory::InMemoryBlobStore;

    fn setup() -> (Arc<StateStore>, FeedbackStore) {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let state = Arc::new(StateStore::open(blobs.clone()).unwrap());
        (state.clone(), FeedbackStore::new(blobs, state))
    }

    #[test]
    fn test_shell_is_unrated() {
        let (_, feedback) = setup();
        let id = feedback.create_shell("eval-1").unwrap();
        assert_eq!(id, "eval-1");
        let record = feedback.load(&id).unwrap().unwrap();
        assert_eq!(record.evaluation_id, "eval-1");
        assert_eq!(record.rating, None);
        assert!(!record.applied);
    }

    #[test]
    fn test_submit_is_idempotent() {
        let (state, feedback) = setup();
        state.update_chunk("c1", 0.5, 0.5).unwrap();
        let id = feedback.create_shell("eval-1").unwrap();

        assert_eq!(feedback.submit(&id, -1, "bad").unwrap(), FeedbackOutcome::Applied);
        let after_first = state.snapshot().unwrap();
        assert!((state.peek(EntityKind::Chunk, "c1").unwrap().unwrap() - 0.49).abs() < 1e-12);

        assert_eq!(
            feedback.submit(&id, -1, "bad again").unwrap(),
            FeedbackOutcome::AlreadyApplied
        );
        let after_second = state.snapshot().unwrap();
        assert_eq!(after_first.chunk_state, after_second.chunk_state);
        assert_eq!(feedback.load(&id).unwrap().unwrap().comment, "bad");
    }

    #[test]
    fn test_concurrent_submits_apply_once() {
        let (state, feedback) = setup();
        state.update_chunk("c1", 1.0, 1.0).unwrap();
        let id = feedback.create_shell("eval-1").unwrap();
        let feedback = Arc::new(feedback);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let feedback = feedback.clone();
                let id = id.clone();
                std::thread::spawn(move || feedback.submit(&id, 1, "").unwrap())
            })
            .collect();
        let applied = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == FeedbackOutcome::Applied)
            .count();
        assert_eq!(applied, 1);
        assert!((state.chunk_weight("c1").unwrap() - 1.02).abs() < 1e-12);
    }

    #[test]
    fn test_submit_unknown_and_invalid() {
        let (_, feedback) = setup();
        assert!(matches!(feedback.submit("missing", 1, ""), Err(Error::NotFound { .. })));
        feedback.create_shell("e").unwrap();
        assert!(matches!(feedback.submit("e", 2, ""), Err(Error::Validation { .. })));
        assert!(!feedback.load("e").unwrap().unwrap().applied);
    }

    #[test]
    fn test_neutral_rating_marks_applied_without_decay() {
        let (state, feedback) = setup();
        state.chunk_weight("c1").unwrap();
        feedback.create_shell("e").unwrap();
        assert_eq!(feedback.submit("e", 0, "").unwrap(), FeedbackOutcome::Applied);
        assert_eq!(state.chunk_weight("c1").unwrap(), 1.0);
        assert!(feedback.load("e").unwrap().unwrap().applied);
    }

    #[test]
    fn test_evaluation_store_round_trip() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let evaluations = EvaluationStore::new(blobs);
        let evaluation = EvaluationResult {
            evaluation_id: "e1".into(),
            question: "q".into(),
            answer: "a".into(),
            metrics: EvaluationMetrics {
                relevance: 0.5,
                groundedness: 0.25,
                answerability: 0.2,
            },
            chunks: Vec::new(),
            documents: Vec::new(),
            indexes: Vec::new(),
            created_at: Utc::now(),
        };
        assert_eq!(evaluations.save(&evaluation).unwrap(), "e1");
        assert_eq!(evaluations.load("e1").unwrap(), Some(evaluation.clone()));
        assert_eq!(evaluations.list().unwrap(), vec![evaluation]);
    }
}
