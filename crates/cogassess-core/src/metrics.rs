use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::evaluator::BehaviorCounters;
use crate::protocol::ProtocolSpec;
use crate::{AssessmentError, ErrorCategory, Phase, TrialOutcome};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ReactionTimeStats {
    pub sample_count: u32,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Population variance.
    pub variance_ms2: f64,
}

/// Practice-block summary. Reported for debugging only; never scored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PracticeSummary {
    pub trials: u32,
    pub correct: u32,
    pub accuracy: Option<f64>,
}

/// Session summary derived purely from the ordered outcome history.
///
/// `None` means "undefined", never zero: post-switch fields are `None` for
/// protocols without a switch, and the switch cost is `None` whenever either
/// side lacks a correct reaction-time sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMetrics {
    pub main_trials: u32,
    pub correct_trials: u32,
    pub accuracy: f64,
    pub pre_switch_trials: u32,
    pub post_switch_trials: Option<u32>,
    pub accuracy_pre_switch: Option<f64>,
    pub accuracy_post_switch: Option<f64>,
    pub mean_correct_rt_pre_switch_ms: Option<f64>,
    pub mean_correct_rt_post_switch_ms: Option<f64>,
    pub switch_cost_ms: Option<f64>,
    pub perseverative_errors: u32,
    pub perseverative_error_rate: Option<f64>,
    pub other_errors: u32,
    pub omissions: u32,
    pub longest_correct_streak: u32,
    pub longest_error_streak: u32,
    pub reaction_time: Option<ReactionTimeStats>,
    pub practice: PracticeSummary,
}

impl SessionMetrics {
    /// Flattens every defined numeric field for the external risk model and
    /// tabular export. Undefined values are left out rather than zeroed.
    #[must_use]
    pub fn feature_map(&self) -> BTreeMap<String, f64> {
        let mut features = BTreeMap::new();
        let mut put = |name: &str, value: Option<f64>| {
            if let Some(value) = value {
                features.insert(name.to_string(), value);
            }
        };

        put("main_trials", Some(f64::from(self.main_trials)));
        put("correct_trials", Some(f64::from(self.correct_trials)));
        put("accuracy", Some(self.accuracy));
        put("pre_switch_trials", Some(f64::from(self.pre_switch_trials)));
        put("post_switch_trials", self.post_switch_trials.map(f64::from));
        put("accuracy_pre_switch", self.accuracy_pre_switch);
        put("accuracy_post_switch", self.accuracy_post_switch);
        put(
            "mean_correct_rt_pre_switch_ms",
            self.mean_correct_rt_pre_switch_ms,
        );
        put(
            "mean_correct_rt_post_switch_ms",
            self.mean_correct_rt_post_switch_ms,
        );
        put("switch_cost_ms", self.switch_cost_ms);
        put(
            "perseverative_errors",
            Some(f64::from(self.perseverative_errors)),
        );
        put("perseverative_error_rate", self.perseverative_error_rate);
        put("other_errors", Some(f64::from(self.other_errors)));
        put("omissions", Some(f64::from(self.omissions)));
        put(
            "longest_correct_streak",
            Some(f64::from(self.longest_correct_streak)),
        );
        put(
            "longest_error_streak",
            Some(f64::from(self.longest_error_streak)),
        );
        if let Some(rt) = self.reaction_time {
            put("rt_sample_count", Some(f64::from(rt.sample_count)));
            put("rt_mean_ms", Some(rt.mean_ms));
            put("rt_min_ms", Some(rt.min_ms));
            put("rt_max_ms", Some(rt.max_ms));
            put("rt_variance_ms2", Some(rt.variance_ms2));
        }
        features
    }
}

/// Running counters for live feedback while a session is in progress.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LiveSnapshot {
    pub outcomes_recorded: u32,
    pub practice: BehaviorCounters,
    pub main: BehaviorCounters,
    pub main_accuracy: Option<f64>,
}

/// Collects outcomes for one session and derives [`SessionMetrics`] on demand.
#[derive(Debug, Clone, Default)]
pub struct MetricsAggregator {
    switch_point: Option<u32>,
    outcomes: Vec<TrialOutcome>,
    practice: BehaviorCounters,
    main: BehaviorCounters,
}

impl MetricsAggregator {
    #[must_use]
    pub fn new(switch_point: Option<u32>) -> Self {
        Self {
            switch_point,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn for_protocol(protocol: &ProtocolSpec) -> Self {
        Self::new(protocol.switch_point)
    }

    pub fn push(&mut self, outcome: TrialOutcome) {
        match outcome.phase {
            Phase::Practice => self.practice = self.practice.advance(&outcome),
            Phase::Main => self.main = self.main.advance(&outcome),
        }
        self.outcomes.push(outcome);
    }

    #[must_use]
    pub fn snapshot(&self) -> LiveSnapshot {
        LiveSnapshot {
            outcomes_recorded: u32::try_from(self.outcomes.len()).unwrap_or(u32::MAX),
            practice: self.practice,
            main: self.main,
            main_accuracy: ratio(self.main.correct, self.main.trials),
        }
    }

    #[must_use]
    pub fn outcomes(&self) -> &[TrialOutcome] {
        &self.outcomes
    }

    #[must_use]
    pub fn practice_outcomes(&self) -> Vec<TrialOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.phase == Phase::Practice)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn main_outcomes(&self) -> Vec<TrialOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.phase == Phase::Main)
            .cloned()
            .collect()
    }

    /// Computes the session summary from everything pushed so far.
    ///
    /// # Errors
    /// Returns [`AssessmentError::MalformedSessionHistory`] when the history
    /// is empty or inconsistent.
    pub fn finalize(&self) -> Result<SessionMetrics, AssessmentError> {
        compute_session_metrics(&self.outcomes, self.switch_point)
    }
}

/// Derives [`SessionMetrics`] from a complete, ordered outcome history
/// (practice outcomes first, then main outcomes).
///
/// # Errors
/// Returns [`AssessmentError::MalformedSessionHistory`] when the history is
/// empty, has no main-phase outcomes, has index gaps or duplicates, interleaves
/// phases, or carries an outcome whose fields contradict each other.
#[allow(clippy::too_many_lines)]
pub fn compute_session_metrics(
    outcomes: &[TrialOutcome],
    switch_point: Option<u32>,
) -> Result<SessionMetrics, AssessmentError> {
    validate_history(outcomes)?;

    let mut practice = PracticeSummary {
        trials: 0,
        correct: 0,
        accuracy: None,
    };

    let mut main_trials = 0_u32;
    let mut correct_trials = 0_u32;
    let mut pre_trials = 0_u32;
    let mut pre_correct = 0_u32;
    let mut post_trials = 0_u32;
    let mut post_correct = 0_u32;
    let mut pre_correct_rts = Vec::new();
    let mut post_correct_rts = Vec::new();
    let mut all_rts = Vec::new();
    let mut perseverative_errors = 0_u32;
    let mut other_errors = 0_u32;
    let mut omissions = 0_u32;

    let mut correct_run = 0_u32;
    let mut error_run = 0_u32;
    let mut longest_correct_streak = 0_u32;
    let mut longest_error_streak = 0_u32;

    for outcome in outcomes {
        if outcome.phase == Phase::Practice {
            practice.trials += 1;
            if outcome.correct {
                practice.correct += 1;
            }
            continue;
        }

        main_trials += 1;
        let post_switch = switch_point.is_some_and(|point| outcome.block_index > point);
        if post_switch {
            post_trials += 1;
        } else {
            pre_trials += 1;
        }

        if outcome.correct {
            correct_trials += 1;
            correct_run += 1;
            error_run = 0;
            longest_correct_streak = longest_correct_streak.max(correct_run);
            if post_switch {
                post_correct += 1;
            } else {
                pre_correct += 1;
            }
            if let Some(rt) = outcome.reaction_time_ms {
                if post_switch {
                    post_correct_rts.push(rt);
                } else {
                    pre_correct_rts.push(rt);
                }
            }
        } else {
            error_run += 1;
            correct_run = 0;
            longest_error_streak = longest_error_streak.max(error_run);
        }

        match outcome.category {
            ErrorCategory::Perseverative => perseverative_errors += 1,
            ErrorCategory::Other => other_errors += 1,
            ErrorCategory::Omission => omissions += 1,
            ErrorCategory::None => {}
        }

        if let Some(rt) = outcome.reaction_time_ms {
            all_rts.push(rt);
        }
    }

    practice.accuracy = ratio(practice.correct, practice.trials);

    let has_switch = switch_point.is_some();
    let mean_correct_rt_pre_switch_ms = mean(&pre_correct_rts);
    let mean_correct_rt_post_switch_ms = if has_switch {
        mean(&post_correct_rts)
    } else {
        None
    };
    let switch_cost_ms = match (mean_correct_rt_pre_switch_ms, mean_correct_rt_post_switch_ms) {
        (Some(pre), Some(post)) => Some(post - pre),
        _ => None,
    };

    Ok(SessionMetrics {
        main_trials,
        correct_trials,
        accuracy: ratio(correct_trials, main_trials).unwrap_or(0.0),
        pre_switch_trials: pre_trials,
        post_switch_trials: has_switch.then_some(post_trials),
        accuracy_pre_switch: ratio(pre_correct, pre_trials),
        accuracy_post_switch: if has_switch {
            ratio(post_correct, post_trials)
        } else {
            None
        },
        mean_correct_rt_pre_switch_ms,
        mean_correct_rt_post_switch_ms,
        switch_cost_ms,
        perseverative_errors,
        perseverative_error_rate: if has_switch {
            ratio(perseverative_errors, post_trials)
        } else {
            None
        },
        other_errors,
        omissions,
        longest_correct_streak,
        longest_error_streak,
        reaction_time: reaction_time_stats(&all_rts),
        practice,
    })
}

fn validate_history(outcomes: &[TrialOutcome]) -> Result<(), AssessmentError> {
    if outcomes.is_empty() {
        return Err(AssessmentError::MalformedSessionHistory(
            "outcome history is empty".to_string(),
        ));
    }

    let mut expected_practice_block = 1_u32;
    let mut expected_main_block = 1_u32;
    let mut seen_main = false;

    for (position, outcome) in outcomes.iter().enumerate() {
        let expected_index = u32::try_from(position + 1).map_err(|_| {
            AssessmentError::MalformedSessionHistory("outcome history too long".to_string())
        })?;
        if outcome.index != expected_index {
            return Err(AssessmentError::MalformedSessionHistory(format!(
                "expected trial index {expected_index}, found {} (gap or duplicate)",
                outcome.index
            )));
        }

        match outcome.phase {
            Phase::Practice => {
                if seen_main {
                    return Err(AssessmentError::MalformedSessionHistory(format!(
                        "practice trial {} recorded after the main block started",
                        outcome.index
                    )));
                }
                if outcome.block_index != expected_practice_block {
                    return Err(AssessmentError::MalformedSessionHistory(format!(
                        "trial {} has practice block index {}, expected {expected_practice_block}",
                        outcome.index, outcome.block_index
                    )));
                }
                expected_practice_block += 1;
            }
            Phase::Main => {
                seen_main = true;
                if outcome.block_index != expected_main_block {
                    return Err(AssessmentError::MalformedSessionHistory(format!(
                        "trial {} has main block index {}, expected {expected_main_block}",
                        outcome.index, outcome.block_index
                    )));
                }
                expected_main_block += 1;
            }
        }

        if outcome.correct != (outcome.category == ErrorCategory::None) {
            return Err(AssessmentError::MalformedSessionHistory(format!(
                "trial {} is marked correct={} with category {}",
                outcome.index,
                outcome.correct,
                outcome.category.as_str()
            )));
        }

        if outcome.category == ErrorCategory::Omission && outcome.reaction_time_ms.is_some() {
            return Err(AssessmentError::MalformedSessionHistory(format!(
                "omission at trial {} carries a reaction time",
                outcome.index
            )));
        }

        if let Some(rt) = outcome.reaction_time_ms {
            if !rt.is_finite() || rt < 0.0 {
                return Err(AssessmentError::MalformedSessionHistory(format!(
                    "trial {} has an invalid reaction time {rt}",
                    outcome.index
                )));
            }
        }
    }

    if !seen_main {
        return Err(AssessmentError::MalformedSessionHistory(
            "outcome history has no main-phase trials".to_string(),
        ));
    }

    Ok(())
}

fn ratio(numerator: u32, denominator: u32) -> Option<f64> {
    if denominator == 0 {
        return None;
    }
    Some(f64::from(numerator) / f64::from(denominator))
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

#[allow(clippy::cast_precision_loss)]
fn reaction_time_stats(values: &[f64]) -> Option<ReactionTimeStats> {
    let mean_ms = mean(values)?;
    let variance_ms2 = values
        .iter()
        .map(|value| (value - mean_ms).powi(2))
        .sum::<f64>()
        / values.len() as f64;
    let min_ms = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max_ms = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    Some(ReactionTimeStats {
        sample_count: u32::try_from(values.len()).unwrap_or(u32::MAX),
        mean_ms,
        min_ms,
        max_ms,
        variance_ms2,
    })
}
