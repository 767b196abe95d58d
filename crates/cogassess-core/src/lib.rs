//! Trial engine and behavioral risk scorer for rule-based executive-function
//! tasks (go/no-go, day-night Stroop, dimensional change card sort).
//!
//! Data flows one way: [`ProtocolTable`] -> [`TrialSequencer`] -> per trial
//! [`evaluate`] -> [`MetricsAggregator`] -> at session end a [`RiskEstimator`].
//! [`AssessmentSession`] wires the pieces together for a single child session.

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

pub mod classifier;
pub mod evaluator;
pub mod metrics;
pub mod protocol;
pub mod sequencer;
pub mod session;

pub use classifier::{
    classify, score_fallback, AssessmentMethod, ExternalModelResult, ExternalRiskModel,
    FallbackPolicy, FallbackScore, ModelBackedEstimator, RiskAssessment, RiskEstimator,
    RiskLevel, RiskModelRequest, RuleBasedEstimator,
};
pub use evaluator::{evaluate, evaluate_with_counters, BehaviorCounters};
pub use metrics::{
    compute_session_metrics, LiveSnapshot, MetricsAggregator, PracticeSummary,
    ReactionTimeStats, SessionMetrics,
};
pub use protocol::{
    AgeBand, CutPoints, ExpectedResponse, ProtocolSpec, ProtocolTable, RiskThresholds, Rule,
    StimulusDescriptor, TaskType,
};
pub use sequencer::{SequencerState, TrialSequencer};
pub use session::{AssessmentSession, SessionId, SessionRecord, SessionReport};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AssessmentError {
    #[error("invalid sequence state: {0}")]
    InvalidSequenceState(String),
    #[error("malformed session history: {0}")]
    MalformedSessionHistory(String),
    #[error("external model unavailable: {0}")]
    ExternalModelUnavailable(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Practice,
    Main,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Practice => "practice",
            Self::Main => "main",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    None,
    Perseverative,
    Other,
    Omission,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Perseverative => "perseverative",
            Self::Other => "other",
            Self::Omission => "omission",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "perseverative" => Some(Self::Perseverative),
            "other" => Some(Self::Other),
            "omission" => Some(Self::Omission),
            _ => None,
        }
    }
}

/// How a session reached the `Complete` state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Natural,
    EarlyStop,
    Abandoned,
}

impl CompletionReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Natural => "natural",
            Self::EarlyStop => "early_stop",
            Self::Abandoned => "abandoned",
        }
    }
}

/// A stimulus presentation emitted by the sequencer. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trial {
    pub index: u32,
    pub block_index: u32,
    pub phase: Phase,
    pub stimulus: StimulusDescriptor,
    pub rule: Rule,
    pub previous_rule: Option<Rule>,
    pub first_after_switch: bool,
}

impl Trial {
    #[must_use]
    pub fn expected_response(&self) -> Option<&ExpectedResponse> {
        self.stimulus.expected_for(self.rule)
    }
}

/// The caller's record of what the child did on one trial.
///
/// A missing value or a missing reaction time both mean the response window
/// elapsed without a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseRecord {
    pub trial_index: u32,
    pub value: Option<String>,
    pub reaction_time_ms: Option<f64>,
}

impl ResponseRecord {
    #[must_use]
    pub fn answered(trial_index: u32, value: impl Into<String>, reaction_time_ms: f64) -> Self {
        Self {
            trial_index,
            value: Some(value.into()),
            reaction_time_ms: Some(reaction_time_ms),
        }
    }

    #[must_use]
    pub fn timeout(trial_index: u32) -> Self {
        Self {
            trial_index,
            value: None,
            reaction_time_ms: None,
        }
    }

    #[must_use]
    pub fn is_absent(&self) -> bool {
        self.value.is_none() || self.reaction_time_ms.is_none()
    }
}

/// Evaluator verdict for one trial. Appended to the session history and never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialOutcome {
    pub index: u32,
    pub block_index: u32,
    pub phase: Phase,
    pub rule: Rule,
    pub stimulus_id: String,
    pub response: Option<String>,
    pub correct: bool,
    pub reaction_time_ms: Option<f64>,
    pub category: ErrorCategory,
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`AssessmentError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, AssessmentError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AssessmentError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AssessmentError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AssessmentError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AssessmentError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            AssessmentError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

pub(crate) fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.min(max).max(min)
}
