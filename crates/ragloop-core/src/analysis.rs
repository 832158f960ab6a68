//! Offline analysis of stored evaluations and feedback, plus rule-based
//! policy proposals. Nothing here mutates learning state or configuration.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::embedding::round_score;
use crate::evaluation::EvaluationResult;
use crate::feedback::FeedbackRecord;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexStats {
    pub count: usize,
    pub avg_relevance: f64,
    pub avg_groundedness: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DocumentStats {
    pub count: usize,
    pub avg_relevance: f64,
    pub avg_answerability: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub evaluations_count: usize,
    pub feedback_count: usize,
    /// Feedback records carrying a non-zero rating.
    pub rated_count: usize,
    /// Means of the answer-level metrics; `None` with no evaluations.
    pub avg_relevance: Option<f64>,
    pub avg_groundedness: Option<f64>,
    pub avg_answerability: Option<f64>,
    /// Share of rated answers where the user disagreed with the evaluator.
    pub conflict_rate: Option<f64>,
    pub index_stats: BTreeMap<String, IndexStats>,
    pub document_stats: BTreeMap<String, DocumentStats>,
}

/// An evaluation counts as positive when the mean of its relevance and
/// groundedness reaches this value.
pub const POSITIVE_EVALUATION: f64 = 0.5;

fn mean_of(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| round_score(sum / n as f64))
}

pub fn run_analysis(evaluations: &[EvaluationResult], feedback: &[FeedbackRecord]) -> AnalysisReport {
    let mut index_stats: BTreeMap<String, IndexStats> = BTreeMap::new();
    let mut document_stats: BTreeMap<String, DocumentStats> = BTreeMap::new();
    for evaluation in evaluations {
        for index in &evaluation.indexes {
            let s = index_stats.entry(index.index_id.clone()).or_default();
            s.count += 1;
            s.avg_relevance += index.avg_relevance;
            s.avg_groundedness += index.avg_groundedness;
        }
        for doc in &evaluation.documents {
            let s = document_stats.entry(doc.document_id.clone()).or_default();
            s.count += 1;
            s.avg_relevance += doc.relevance;
            s.avg_answerability += doc.answerability;
        }
    }
    for s in index_stats.values_mut() {
        s.avg_relevance = round_score(s.avg_relevance / s.count as f64);
        s.avg_groundedness = round_score(s.avg_groundedness / s.count as f64);
    }
    for s in document_stats.values_mut() {
        s.avg_relevance = round_score(s.avg_relevance / s.count as f64);
        s.avg_answerability = round_score(s.avg_answerability / s.count as f64);
    }

    let by_id: HashMap<&str, &EvaluationResult> = evaluations
        .iter()
        .map(|e| (e.evaluation_id.as_str(), e))
        .collect();
    let mut rated = 0;
    let mut conflicts = 0;
    for record in feedback {
        let Some(rating) = record.rating.filter(|r| *r != 0) else {
            continue;
        };
        rated += 1;
        if let Some(evaluation) = by_id.get(record.evaluation_id.as_str()) {
            let quality = (evaluation.metrics.relevance + evaluation.metrics.groundedness) / 2.0;
            let evaluator_positive = quality >= POSITIVE_EVALUATION;
            if evaluator_positive != (rating > 0) {
                conflicts += 1;
            }
        }
    }

    AnalysisReport {
        evaluations_count: evaluations.len(),
        feedback_count: feedback.len(),
        rated_count: rated,
        avg_relevance: mean_of(evaluations.iter().map(|e| e.metrics.relevance)),
        avg_groundedness: mean_of(evaluations.iter().map(|e| e.metrics.groundedness)),
        avg_answerability: mean_of(evaluations.iter().map(|e| e.metrics.answerability)),
        conflict_rate: (rated > 0).then(|| round_score(conflicts as f64 / rated as f64)),
        index_stats,
        document_stats,
    }
}

/// Thresholds below which a metric triggers a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PolicyThresholds {
    pub relevance: f64,
    pub groundedness: f64,
    pub answerability: f64,
    pub conflict_rate: f64,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            relevance: 0.5,
            groundedness: 0.5,
            answerability: 0.4,
            conflict_rate: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyProposal {
    /// Configuration key the proposal targets, e.g. `retrieval.top_k`.
    pub policy: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    pub reason: String,
}

fn proposal(policy: &str, action: &str, delta: Option<i64>, reason: &str) -> PolicyProposal {
    PolicyProposal {
        policy: policy.to_string(),
        action: action.to_string(),
        delta,
        reason: reason.to_string(),
    }
}

/// Rule-based recommendations. Missing metrics never trigger a rule.
pub fn propose_policies(report: &AnalysisReport, thresholds: &PolicyThresholds) -> Vec<PolicyProposal> {
    let below = |value: Option<f64>, limit: f64| value.is_some_and(|v| v < limit);
    let mut proposals = Vec::new();

    if below(report.avg_groundedness, thresholds.groundedness) {
        proposals.push(proposal(
            "retrieval.top_k",
            "increase",
            Some(2),
            "Low groundedness: answers lack supporting context",
        ));
    }
    if below(report.avg_relevance, thresholds.relevance) {
        proposals.push(proposal(
            "retrieval.heuristics",
            "enable",
            None,
            "Low relevance: chunk selection needs reranking nudges",
        ));
    }
    if below(report.avg_answerability, thresholds.answerability) {
        proposals.push(proposal(
            "retrieval.use_query_rewrite",
            "enable",
            None,
            "Low answerability: queries may be underspecified",
        ));
    }
    if report.conflict_rate.is_some_and(|rate| rate > thresholds.conflict_rate) {
        proposals.push(proposal(
            "analysis",
            "flag",
            None,
            "High conflict between automatic evaluation and user feedback",
        ));
    }
    proposals
}
