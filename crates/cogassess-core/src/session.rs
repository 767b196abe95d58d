use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::info;
use ulid::Ulid;

use crate::classifier::{RiskAssessment, RiskEstimator};
use crate::evaluator::evaluate;
use crate::metrics::{LiveSnapshot, MetricsAggregator, SessionMetrics};
use crate::protocol::{AgeBand, ProtocolSpec, TaskType};
use crate::sequencer::{SequencerState, TrialSequencer};
use crate::{
    format_rfc3339, parse_rfc3339_utc, AssessmentError, CompletionReason, ResponseRecord, Trial,
    TrialOutcome,
};

pub const SESSION_RECORD_CONTRACT_VERSION: &str = "session_record.v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionId(pub Ulid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One child's pass through one protocol.
///
/// Owns the sequencer and the outcome history. Sessions share nothing but the
/// immutable protocol, so independent sessions can run on separate threads.
#[derive(Debug, Clone)]
pub struct AssessmentSession {
    id: SessionId,
    seed: u64,
    sequencer: TrialSequencer,
    aggregator: MetricsAggregator,
    pending: Option<Trial>,
}

impl AssessmentSession {
    #[must_use]
    pub fn new(protocol: Arc<ProtocolSpec>, seed: u64) -> Self {
        Self::with_id(SessionId::new(), protocol, seed)
    }

    #[must_use]
    pub fn with_id(id: SessionId, protocol: Arc<ProtocolSpec>, seed: u64) -> Self {
        let aggregator = MetricsAggregator::for_protocol(&protocol);
        Self {
            id,
            seed,
            sequencer: TrialSequencer::new(protocol, seed),
            aggregator,
            pending: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub fn protocol(&self) -> &Arc<ProtocolSpec> {
        self.sequencer.protocol()
    }

    #[must_use]
    pub fn state(&self) -> SequencerState {
        self.sequencer.state()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.sequencer.completion_reason().is_some()
    }

    #[must_use]
    pub fn outcomes(&self) -> &[TrialOutcome] {
        self.aggregator.outcomes()
    }

    /// # Errors
    /// Returns [`AssessmentError::InvalidSequenceState`] when already started
    /// and [`AssessmentError::Configuration`] when the protocol is invalid.
    pub fn start(&mut self) -> Result<(), AssessmentError> {
        self.sequencer.start()?;
        info!(
            session_id = %self.id,
            task = self.protocol().task_type.as_str(),
            age_band = self.protocol().age_band.as_str(),
            seed = self.seed,
            "session started"
        );
        Ok(())
    }

    /// # Errors
    /// Propagates [`TrialSequencer::next_trial`] failures.
    pub fn next_trial(&mut self) -> Result<Trial, AssessmentError> {
        let trial = self.sequencer.next_trial()?;
        self.pending = Some(trial.clone());
        Ok(trial)
    }

    /// Evaluates the response to the outstanding trial and records the
    /// outcome.
    ///
    /// # Errors
    /// Returns [`AssessmentError::InvalidSequenceState`] when the response
    /// does not address the outstanding trial, and
    /// [`AssessmentError::Validation`] when its reaction time is negative or
    /// not finite.
    pub fn respond(&mut self, response: &ResponseRecord) -> Result<TrialOutcome, AssessmentError> {
        let Some(trial) = self.pending.as_ref() else {
            return Err(AssessmentError::InvalidSequenceState(format!(
                "response for trial {} received with no trial outstanding",
                response.trial_index
            )));
        };
        if trial.index != response.trial_index {
            return Err(AssessmentError::InvalidSequenceState(format!(
                "response for trial {} received while trial {} is outstanding",
                response.trial_index, trial.index
            )));
        }
        if let Some(reaction_time_ms) = response.reaction_time_ms {
            if !reaction_time_ms.is_finite() || reaction_time_ms < 0.0 {
                return Err(AssessmentError::Validation(format!(
                    "reaction_time_ms MUST be finite and >= 0, got {reaction_time_ms}"
                )));
            }
        }

        let outcome = evaluate(trial, response);
        let state = self.sequencer.record_outcome(&outcome)?;
        self.pending = None;
        self.aggregator.push(outcome.clone());

        if let SequencerState::Complete(reason) = state {
            info!(
                session_id = %self.id,
                reason = reason.as_str(),
                trials = self.sequencer.trials_emitted(),
                "session complete"
            );
        }
        Ok(outcome)
    }

    /// # Errors
    /// Returns [`AssessmentError::InvalidSequenceState`] when already complete.
    pub fn abandon(&mut self) -> Result<(), AssessmentError> {
        self.sequencer.abandon()?;
        self.pending = None;
        info!(
            session_id = %self.id,
            reason = CompletionReason::Abandoned.as_str(),
            trials = self.aggregator.outcomes().len(),
            "session complete"
        );
        Ok(())
    }

    #[must_use]
    pub fn snapshot(&self) -> LiveSnapshot {
        self.aggregator.snapshot()
    }

    /// Summarises a completed session and scores it with `estimator`.
    ///
    /// # Errors
    /// Returns [`AssessmentError::InvalidSequenceState`] before completion and
    /// [`AssessmentError::MalformedSessionHistory`] when the history cannot be
    /// summarised (for example a session abandoned before any main trial).
    pub fn finish(&self, estimator: &dyn RiskEstimator) -> Result<SessionReport, AssessmentError> {
        let Some(completion_reason) = self.sequencer.completion_reason() else {
            return Err(AssessmentError::InvalidSequenceState(format!(
                "finish called in state {:?}",
                self.sequencer.state()
            )));
        };

        let metrics = self.aggregator.finalize()?;
        let protocol = self.protocol();
        let assessment = estimator.estimate(protocol, &metrics);

        Ok(SessionReport {
            session_id: self.id,
            task_type: protocol.task_type,
            age_band: protocol.age_band,
            seed: self.seed,
            completion_reason,
            practice_outcomes: self.aggregator.practice_outcomes(),
            main_outcomes: self.aggregator.main_outcomes(),
            metrics,
            assessment,
            elapsed_ms: self.sequencer.elapsed_ms(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub task_type: TaskType,
    pub age_band: AgeBand,
    pub seed: u64,
    pub completion_reason: CompletionReason,
    pub practice_outcomes: Vec<TrialOutcome>,
    pub main_outcomes: Vec<TrialOutcome>,
    pub metrics: SessionMetrics,
    pub assessment: RiskAssessment,
    pub elapsed_ms: f64,
}

/// Versioned envelope handed to whatever stores session results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub contract_version: String,
    pub recorded_at: String,
    pub report: SessionReport,
}

impl SessionRecord {
    /// # Errors
    /// Returns [`AssessmentError::Validation`] when the timestamp cannot be
    /// formatted.
    pub fn new(report: SessionReport, recorded_at: OffsetDateTime) -> Result<Self, AssessmentError> {
        Ok(Self {
            contract_version: SESSION_RECORD_CONTRACT_VERSION.to_string(),
            recorded_at: format_rfc3339(recorded_at)?,
            report,
        })
    }

    /// # Errors
    /// Returns [`AssessmentError::Validation`] on an unknown contract version
    /// or a non-UTC `recorded_at`.
    pub fn validate(&self) -> Result<(), AssessmentError> {
        if self.contract_version != SESSION_RECORD_CONTRACT_VERSION {
            return Err(AssessmentError::Validation(format!(
                "unsupported contract_version `{}`; expected `{SESSION_RECORD_CONTRACT_VERSION}`",
                self.contract_version
            )));
        }
        parse_rfc3339_utc(&self.recorded_at)?;
        Ok(())
    }

    /// # Errors
    /// Returns [`AssessmentError::Validation`] when decoding or validation
    /// fails.
    pub fn from_json(value: &Value) -> Result<Self, AssessmentError> {
        let record: Self = serde_json::from_value(value.clone()).map_err(|err| {
            AssessmentError::Validation(format!("invalid session record JSON payload: {err}"))
        })?;
        record.validate()?;
        Ok(record)
    }
}
