use serde::{Deserialize, Serialize};

use crate::protocol::ExpectedResponse;
use crate::{ErrorCategory, ResponseRecord, Trial, TrialOutcome};

/// Judges a single response against the trial it answers.
///
/// Pure: identical inputs always yield identical outcomes. Unknown response
/// values are classified, never rejected. Reaction times pass through
/// untouched.
#[must_use]
pub fn evaluate(trial: &Trial, response: &ResponseRecord) -> TrialOutcome {
    let expected = trial.expected_response();
    let answered = match (&response.value, response.reaction_time_ms) {
        (Some(value), Some(reaction_time_ms)) => Some((value.as_str(), reaction_time_ms)),
        _ => None,
    };

    let (correct, category, reaction_time_ms) = match answered {
        None => match expected {
            Some(ExpectedResponse::Withhold) => (true, ErrorCategory::None, None),
            _ => (false, ErrorCategory::Omission, None),
        },
        Some((value, reaction_time_ms)) => {
            if expected.is_some_and(|expected| expected.matches(value)) {
                (true, ErrorCategory::None, Some(reaction_time_ms))
            } else if is_perseverative(trial, value) {
                (false, ErrorCategory::Perseverative, Some(reaction_time_ms))
            } else {
                (false, ErrorCategory::Other, Some(reaction_time_ms))
            }
        }
    };

    TrialOutcome {
        index: trial.index,
        block_index: trial.block_index,
        phase: trial.phase,
        rule: trial.rule,
        stimulus_id: trial.stimulus.id.clone(),
        response: answered.map(|(value, _)| value.to_string()),
        correct,
        reaction_time_ms,
        category,
    }
}

/// [`evaluate`] plus the running counters advanced by the new outcome.
#[must_use]
pub fn evaluate_with_counters(
    trial: &Trial,
    response: &ResponseRecord,
    counters: BehaviorCounters,
) -> (TrialOutcome, BehaviorCounters) {
    let outcome = evaluate(trial, response);
    let counters = counters.advance(&outcome);
    (outcome, counters)
}

// The first trial under a new rule never counts as perseverative.
fn is_perseverative(trial: &Trial, value: &str) -> bool {
    if trial.first_after_switch {
        return false;
    }
    trial
        .previous_rule
        .and_then(|rule| trial.stimulus.expected_for(rule))
        .is_some_and(|expected| expected.matches(value))
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct BehaviorCounters {
    pub trials: u32,
    pub correct: u32,
    pub errors: u32,
    pub perseverative_errors: u32,
    pub omissions: u32,
    pub current_correct_run: u32,
    pub current_error_run: u32,
}

impl BehaviorCounters {
    #[must_use]
    pub fn advance(self, outcome: &TrialOutcome) -> Self {
        let mut next = self;
        next.trials += 1;
        if outcome.correct {
            next.correct += 1;
            next.current_correct_run += 1;
            next.current_error_run = 0;
        } else {
            next.errors += 1;
            next.current_error_run += 1;
            next.current_correct_run = 0;
        }
        match outcome.category {
            ErrorCategory::Perseverative => next.perseverative_errors += 1,
            ErrorCategory::Omission => next.omissions += 1,
            ErrorCategory::None | ErrorCategory::Other => {}
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Rule, StimulusDescriptor};
    use crate::Phase;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn red_rabbit() -> StimulusDescriptor {
        StimulusDescriptor {
            id: "red_rabbit".to_string(),
            attributes: BTreeMap::from([
                ("color".to_string(), "red".to_string()),
                ("shape".to_string(), "rabbit".to_string()),
            ]),
            expected: BTreeMap::from([
                (Rule::Color, ExpectedResponse::Respond("red".to_string())),
                (Rule::Shape, ExpectedResponse::Respond("rabbit".to_string())),
            ]),
        }
    }

    fn shark() -> StimulusDescriptor {
        StimulusDescriptor {
            id: "shark".to_string(),
            attributes: BTreeMap::from([("animal".to_string(), "shark".to_string())]),
            expected: BTreeMap::from([(Rule::Target, ExpectedResponse::Withhold)]),
        }
    }

    fn pre_switch_trial() -> Trial {
        Trial {
            index: 7,
            block_index: 3,
            phase: Phase::Main,
            stimulus: red_rabbit(),
            rule: Rule::Color,
            previous_rule: None,
            first_after_switch: false,
        }
    }

    fn post_switch_trial(first_after_switch: bool) -> Trial {
        Trial {
            index: 16,
            block_index: 12,
            phase: Phase::Main,
            stimulus: red_rabbit(),
            rule: Rule::Shape,
            previous_rule: Some(Rule::Color),
            first_after_switch,
        }
    }

    #[test]
    fn matching_response_is_correct() {
        let outcome = evaluate(
            &pre_switch_trial(),
            &ResponseRecord::answered(7, "red", 612.5),
        );
        assert!(outcome.correct);
        assert_eq!(outcome.category, ErrorCategory::None);
        assert_eq!(outcome.reaction_time_ms, Some(612.5));
        assert_eq!(outcome.response.as_deref(), Some("red"));
    }

    #[test]
    fn timeout_is_an_omission_without_reaction_time() {
        let outcome = evaluate(&post_switch_trial(false), &ResponseRecord::timeout(16));
        assert!(!outcome.correct);
        assert_eq!(outcome.category, ErrorCategory::Omission);
        assert_eq!(outcome.reaction_time_ms, None);
        assert_eq!(outcome.response, None);
    }

    #[test]
    fn stale_rule_answer_after_switch_is_perseverative() {
        let outcome = evaluate(
            &post_switch_trial(false),
            &ResponseRecord::answered(16, "red", 900.0),
        );
        assert!(!outcome.correct);
        assert_eq!(outcome.category, ErrorCategory::Perseverative);
    }

    #[test]
    fn stale_answer_on_first_post_switch_trial_is_other() {
        let outcome = evaluate(
            &post_switch_trial(true),
            &ResponseRecord::answered(16, "red", 900.0),
        );
        assert_eq!(outcome.category, ErrorCategory::Other);
    }

    #[test]
    fn wrong_answer_before_switch_is_other() {
        let outcome = evaluate(
            &pre_switch_trial(),
            &ResponseRecord::answered(7, "rabbit", 480.0),
        );
        assert_eq!(outcome.category, ErrorCategory::Other);
    }

    #[test]
    fn unknown_value_is_other_not_a_failure() {
        let outcome = evaluate(
            &post_switch_trial(false),
            &ResponseRecord::answered(16, "giraffe", 1_020.0),
        );
        assert!(!outcome.correct);
        assert_eq!(outcome.category, ErrorCategory::Other);
        assert_eq!(outcome.reaction_time_ms, Some(1_020.0));
    }

    #[test]
    fn withholding_on_no_go_is_correct_and_tapping_is_commission() {
        let trial = Trial {
            index: 3,
            block_index: 3,
            phase: Phase::Practice,
            stimulus: shark(),
            rule: Rule::Target,
            previous_rule: None,
            first_after_switch: false,
        };

        let withheld = evaluate(&trial, &ResponseRecord::timeout(3));
        assert!(withheld.correct);
        assert_eq!(withheld.category, ErrorCategory::None);
        assert_eq!(withheld.reaction_time_ms, None);

        let tapped = evaluate(&trial, &ResponseRecord::answered(3, "tap", 350.0));
        assert!(!tapped.correct);
        assert_eq!(tapped.category, ErrorCategory::Other);
    }

    #[test]
    fn evaluation_is_idempotent() {
        let trial = post_switch_trial(false);
        let response = ResponseRecord::answered(16, "red", 733.0);
        assert_eq!(evaluate(&trial, &response), evaluate(&trial, &response));
    }

    #[test]
    fn counters_track_runs_and_categories() {
        let trial = post_switch_trial(false);
        let mut counters = BehaviorCounters::default();
        for response in [
            ResponseRecord::answered(16, "rabbit", 500.0),
            ResponseRecord::answered(16, "red", 500.0),
            ResponseRecord::timeout(16),
        ] {
            let (_, next) = evaluate_with_counters(&trial, &response, counters);
            counters = next;
        }

        assert_eq!(counters.trials, 3);
        assert_eq!(counters.correct, 1);
        assert_eq!(counters.errors, 2);
        assert_eq!(counters.perseverative_errors, 1);
        assert_eq!(counters.omissions, 1);
        assert_eq!(counters.current_error_run, 2);
        assert_eq!(counters.current_correct_run, 0);
    }

    proptest! {
        #[test]
        fn prop_evaluation_is_pure_and_passes_reaction_time_through(
            value in prop::option::of("[a-z]{1,8}"),
            reaction_time_ms in 0.0_f64..5_000.0,
            first_after_switch in any::<bool>(),
        ) {
            let trial = post_switch_trial(first_after_switch);
            let response = match &value {
                Some(value) => ResponseRecord::answered(16, value, reaction_time_ms),
                None => ResponseRecord::timeout(16),
            };

            let outcome = evaluate(&trial, &response);
            prop_assert_eq!(&outcome, &evaluate(&trial, &response));
            prop_assert_eq!(outcome.correct, outcome.category == ErrorCategory::None);
            match value {
                Some(_) => {
                    prop_assert_eq!(outcome.reaction_time_ms, Some(reaction_time_ms));
                    prop_assert_ne!(outcome.category, ErrorCategory::Omission);
                }
                None => {
                    prop_assert_eq!(outcome.reaction_time_ms, None);
                    prop_assert_eq!(outcome.category, ErrorCategory::Omission);
                }
            }
            if first_after_switch {
                prop_assert_ne!(outcome.category, ErrorCategory::Perseverative);
            }
        }
    }
}
