use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::metrics::SessionMetrics;
use crate::protocol::{AgeBand, ProtocolSpec, RiskThresholds, TaskType};
use crate::{clamp, AssessmentError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
}

impl RiskLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "moderate" => Some(Self::Moderate),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentMethod {
    RuleBased,
    Fallback,
    ExternalModel,
}

impl AssessmentMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RuleBased => "rule_based",
            Self::Fallback => "fallback",
            Self::ExternalModel => "external_model",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,
    /// Probability of elevated risk, in `[0, 1]`.
    pub probability: f64,
    pub confidence: f64,
    /// Breached thresholds, in evaluation order.
    pub contributing_factors: Vec<String>,
    pub method: AssessmentMethod,
}

/// Heuristic constants of the rule-based fallback. These are policy, not
/// clinical truth, and are versioned like any other configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackPolicy {
    pub policy_version: u32,
    pub baseline_probability: f64,
    pub high_accuracy_relief: f64,
    pub accuracy_increment: f64,
    pub accuracy_shortfall_slope: f64,
    pub severe_accuracy_increment: f64,
    pub perseveration_increment: f64,
    pub severe_perseveration_increment: f64,
    pub switch_cost_increment: f64,
    pub severe_switch_cost_increment: f64,
    pub perseverative_rate_increment: f64,
    pub min_probability: f64,
    pub max_probability: f64,
    pub low_band_upper: f64,
    pub high_band_lower: f64,
}

impl FallbackPolicy {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            policy_version: 1,
            baseline_probability: 0.50,
            high_accuracy_relief: 0.25,
            accuracy_increment: 0.15,
            accuracy_shortfall_slope: 0.50,
            severe_accuracy_increment: 0.15,
            perseveration_increment: 0.20,
            severe_perseveration_increment: 0.10,
            switch_cost_increment: 0.10,
            severe_switch_cost_increment: 0.10,
            perseverative_rate_increment: 0.05,
            min_probability: 0.05,
            max_probability: 0.95,
            low_band_upper: 0.30,
            high_band_lower: 0.70,
        }
    }

    /// Validates numeric bounds and band ordering.
    ///
    /// # Errors
    /// Returns [`AssessmentError::Configuration`] when one or more fields are
    /// outside allowed bounds.
    pub fn validate(&self) -> Result<(), AssessmentError> {
        if self.policy_version == 0 {
            return Err(AssessmentError::Configuration(
                "policy_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("baseline_probability", self.baseline_probability),
            ("high_accuracy_relief", self.high_accuracy_relief),
            ("accuracy_increment", self.accuracy_increment),
            ("severe_accuracy_increment", self.severe_accuracy_increment),
            ("perseveration_increment", self.perseveration_increment),
            (
                "severe_perseveration_increment",
                self.severe_perseveration_increment,
            ),
            ("switch_cost_increment", self.switch_cost_increment),
            (
                "severe_switch_cost_increment",
                self.severe_switch_cost_increment,
            ),
            (
                "perseverative_rate_increment",
                self.perseverative_rate_increment,
            ),
            ("min_probability", self.min_probability),
            ("max_probability", self.max_probability),
            ("low_band_upper", self.low_band_upper),
            ("high_band_lower", self.high_band_lower),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AssessmentError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        if !self.accuracy_shortfall_slope.is_finite() || self.accuracy_shortfall_slope < 0.0 {
            return Err(AssessmentError::Configuration(
                "accuracy_shortfall_slope MUST be finite and >= 0.0".to_string(),
            ));
        }

        if self.min_probability >= self.max_probability {
            return Err(AssessmentError::Configuration(
                "min_probability MUST be below max_probability".to_string(),
            ));
        }

        if self.low_band_upper > self.high_band_lower {
            return Err(AssessmentError::Configuration(
                "low_band_upper cannot exceed high_band_lower".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a policy from JSON.
    ///
    /// # Errors
    /// Returns [`AssessmentError::Configuration`] when JSON decoding fails
    /// or decoded values violate policy constraints.
    pub fn from_json(value: &Value) -> Result<Self, AssessmentError> {
        let policy: Self = serde_json::from_value(value.clone()).map_err(|err| {
            AssessmentError::Configuration(format!("invalid fallback policy JSON payload: {err}"))
        })?;
        policy.validate()?;
        Ok(policy)
    }

    #[must_use]
    pub fn band(&self, probability: f64) -> RiskLevel {
        if probability < self.low_band_upper {
            RiskLevel::Low
        } else if probability > self.high_band_lower {
            RiskLevel::High
        } else {
            RiskLevel::Moderate
        }
    }
}

/// Payload handed to an external risk model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskModelRequest {
    pub task_type: TaskType,
    pub age_band: AgeBand,
    pub features: BTreeMap<String, f64>,
}

impl RiskModelRequest {
    #[must_use]
    pub fn from_metrics(task_type: TaskType, age_band: AgeBand, metrics: &SessionMetrics) -> Self {
        Self {
            task_type,
            age_band,
            features: metrics.feature_map(),
        }
    }
}

/// Response contract of an external risk model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalModelResult {
    #[serde(default = "default_success")]
    pub success: bool,
    pub prediction: u8,
    /// `[p(no risk), p(risk)]`.
    pub probability: [f64; 2],
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
}

fn default_success() -> bool {
    true
}

impl ExternalModelResult {
    /// Checks the response contract.
    ///
    /// # Errors
    /// Returns [`AssessmentError::ExternalModelUnavailable`] when the model
    /// reported failure or returned out-of-range values.
    pub fn validate(&self) -> Result<(), AssessmentError> {
        if !self.success {
            return Err(AssessmentError::ExternalModelUnavailable(
                "model reported an unsuccessful prediction".to_string(),
            ));
        }
        if self.prediction > 1 {
            return Err(AssessmentError::ExternalModelUnavailable(format!(
                "prediction MUST be 0 or 1, got {}",
                self.prediction
            )));
        }
        for (name, value) in [
            ("probability[0]", self.probability[0]),
            ("probability[1]", self.probability[1]),
            ("confidence", self.confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AssessmentError::ExternalModelUnavailable(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }
        if !self.risk_score.is_finite() {
            return Err(AssessmentError::ExternalModelUnavailable(
                "risk_score MUST be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Black-box risk model. Implementations signal any failure with
/// [`AssessmentError::ExternalModelUnavailable`].
pub trait ExternalRiskModel {
    fn model_name(&self) -> &str;

    #[allow(clippy::missing_errors_doc)]
    fn predict(&self, request: &RiskModelRequest) -> Result<ExternalModelResult, AssessmentError>;
}

/// Maps session metrics to a risk assessment. Every implementation always
/// produces an assessment.
pub trait RiskEstimator {
    fn estimate(&self, protocol: &ProtocolSpec, metrics: &SessionMetrics) -> RiskAssessment;
}

/// Deterministic threshold scoring with no model involved.
#[derive(Debug, Clone)]
pub struct RuleBasedEstimator {
    policy: FallbackPolicy,
}

impl Default for RuleBasedEstimator {
    fn default() -> Self {
        Self {
            policy: FallbackPolicy::v1(),
        }
    }
}

impl RuleBasedEstimator {
    #[must_use]
    pub fn new(policy: FallbackPolicy) -> Self {
        Self { policy }
    }
}

impl RiskEstimator for RuleBasedEstimator {
    fn estimate(&self, protocol: &ProtocolSpec, metrics: &SessionMetrics) -> RiskAssessment {
        let score = score_fallback(metrics, &protocol.thresholds, &self.policy);
        score.into_assessment(&self.policy, AssessmentMethod::RuleBased)
    }
}

/// Consults an external model and falls back to threshold scoring when the
/// model is unavailable.
#[derive(Debug, Clone)]
pub struct ModelBackedEstimator<M> {
    model: M,
    policy: FallbackPolicy,
}

impl<M: ExternalRiskModel> ModelBackedEstimator<M> {
    #[must_use]
    pub fn new(model: M, policy: FallbackPolicy) -> Self {
        Self { model, policy }
    }

    #[must_use]
    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<M: ExternalRiskModel> RiskEstimator for ModelBackedEstimator<M> {
    fn estimate(&self, protocol: &ProtocolSpec, metrics: &SessionMetrics) -> RiskAssessment {
        let request = RiskModelRequest::from_metrics(protocol.task_type, protocol.age_band, metrics);
        match self.model.predict(&request) {
            Ok(result) => classify(metrics, &protocol.thresholds, &self.policy, Some(&result)),
            Err(err) => {
                warn!(
                    model = self.model.model_name(),
                    error = %err,
                    "external risk model unavailable, using fallback scoring"
                );
                classify(metrics, &protocol.thresholds, &self.policy, None)
            }
        }
    }
}

/// Intermediate result of the threshold walk.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackScore {
    pub probability: f64,
    pub contributing_factors: Vec<String>,
}

impl FallbackScore {
    fn into_assessment(self, policy: &FallbackPolicy, method: AssessmentMethod) -> RiskAssessment {
        RiskAssessment {
            risk_level: policy.band(self.probability),
            probability: self.probability,
            confidence: self.probability.max(1.0 - self.probability),
            contributing_factors: self.contributing_factors,
            method,
        }
    }
}

/// Classifies a session. A successful, well-formed external result is used
/// as-is; otherwise the threshold fallback decides.
#[must_use]
pub fn classify(
    metrics: &SessionMetrics,
    thresholds: &RiskThresholds,
    policy: &FallbackPolicy,
    external: Option<&ExternalModelResult>,
) -> RiskAssessment {
    let score = score_fallback(metrics, thresholds, policy);

    if let Some(result) = external {
        match result.validate() {
            Ok(()) => {
                return RiskAssessment {
                    risk_level: result.risk_level,
                    probability: result.probability[1],
                    confidence: result.confidence,
                    contributing_factors: score.contributing_factors,
                    method: AssessmentMethod::ExternalModel,
                };
            }
            Err(err) => {
                warn!(error = %err, "rejecting external model result, using fallback scoring");
            }
        }
    }

    score.into_assessment(policy, AssessmentMethod::Fallback)
}

/// Walks the thresholds in a fixed order, accumulating additive adjustments
/// from the policy baseline, then clamps.
#[must_use]
pub fn score_fallback(
    metrics: &SessionMetrics,
    thresholds: &RiskThresholds,
    policy: &FallbackPolicy,
) -> FallbackScore {
    let mut probability = policy.baseline_probability;
    let mut factors = Vec::new();

    let accuracy = metrics.accuracy;
    if accuracy >= thresholds.accuracy.low {
        probability -= policy.high_accuracy_relief;
    }
    if accuracy < thresholds.accuracy.moderate {
        probability += policy.accuracy_increment
            + policy.accuracy_shortfall_slope * (thresholds.accuracy.moderate - accuracy);
        factors.push("overall_accuracy.below_moderate".to_string());
    }
    if accuracy < thresholds.accuracy.high {
        probability += policy.severe_accuracy_increment;
        factors.push("overall_accuracy.below_high".to_string());
    }

    let perseverative_errors = f64::from(metrics.perseverative_errors);
    if perseverative_errors > thresholds.perseverative_errors.moderate {
        probability += policy.perseveration_increment;
        factors.push("perseverative_errors.above_moderate".to_string());
    }
    if perseverative_errors > thresholds.perseverative_errors.high {
        probability += policy.severe_perseveration_increment;
        factors.push("perseverative_errors.above_high".to_string());
    }

    if let Some(switch_cost) = metrics.switch_cost_ms {
        if switch_cost > thresholds.switch_cost_ms.moderate {
            probability += policy.switch_cost_increment;
            factors.push("switch_cost.above_moderate".to_string());
        }
        if switch_cost > thresholds.switch_cost_ms.high {
            probability += policy.severe_switch_cost_increment;
            factors.push("switch_cost.above_high".to_string());
        }
    }

    if let Some(rate) = metrics.perseverative_error_rate {
        if rate > thresholds.perseverative_error_rate.moderate {
            probability += policy.perseverative_rate_increment;
            factors.push("perseverative_error_rate.above_moderate".to_string());
        }
    }

    FallbackScore {
        probability: clamp(probability, policy.min_probability, policy.max_probability),
        contributing_factors: factors,
    }
}
