use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protocol::{ProtocolSpec, Rule};
use crate::{AssessmentError, CompletionReason, Phase, Trial, TrialOutcome};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SequencerState {
    NotStarted,
    Practice,
    Main,
    Complete(CompletionReason),
}

/// Emits one trial at a time for a single session.
///
/// Stimuli are drawn uniformly from the protocol pool with replacement, so
/// consecutive trials may repeat a stimulus. Draws come from a seeded RNG and
/// are reproducible for a given `(protocol, seed)` pair.
#[derive(Debug, Clone)]
pub struct TrialSequencer {
    protocol: Arc<ProtocolSpec>,
    rng: StdRng,
    state: SequencerState,
    last_index: u32,
    practice_emitted: u32,
    main_emitted: u32,
    active_rule: Rule,
    previous_rule: Option<Rule>,
    switched: bool,
    consecutive_errors: u32,
    outstanding: Option<u32>,
    elapsed_ms: f64,
}

impl TrialSequencer {
    #[must_use]
    pub fn new(protocol: Arc<ProtocolSpec>, seed: u64) -> Self {
        let active_rule = protocol.initial_rule;
        Self {
            protocol,
            rng: StdRng::seed_from_u64(seed),
            state: SequencerState::NotStarted,
            last_index: 0,
            practice_emitted: 0,
            main_emitted: 0,
            active_rule,
            previous_rule: None,
            switched: false,
            consecutive_errors: 0,
            outstanding: None,
            elapsed_ms: 0.0,
        }
    }

    /// Leaves `NotStarted`. Protocols without practice trials go straight to
    /// the main block.
    ///
    /// # Errors
    /// Returns [`AssessmentError::InvalidSequenceState`] when already started
    /// and [`AssessmentError::Configuration`] when the protocol is invalid.
    pub fn start(&mut self) -> Result<(), AssessmentError> {
        if self.state != SequencerState::NotStarted {
            return Err(AssessmentError::InvalidSequenceState(format!(
                "start called in state {:?}",
                self.state
            )));
        }
        self.protocol.validate()?;

        self.state = if self.protocol.practice_trial_count == 0 {
            SequencerState::Main
        } else {
            SequencerState::Practice
        };
        debug!(
            task = self.protocol.task_type.as_str(),
            age_band = self.protocol.age_band.as_str(),
            state = ?self.state,
            "sequencer started"
        );
        Ok(())
    }

    /// Emits the next trial.
    ///
    /// # Errors
    /// Returns [`AssessmentError::InvalidSequenceState`] before `start`,
    /// after completion, or while the previous trial's outcome is still
    /// outstanding.
    pub fn next_trial(&mut self) -> Result<Trial, AssessmentError> {
        let phase = match self.state {
            SequencerState::NotStarted => {
                return Err(AssessmentError::InvalidSequenceState(
                    "next_trial called before start".to_string(),
                ))
            }
            SequencerState::Complete(reason) => {
                return Err(AssessmentError::InvalidSequenceState(format!(
                    "next_trial called after completion ({})",
                    reason.as_str()
                )))
            }
            SequencerState::Practice => Phase::Practice,
            SequencerState::Main => Phase::Main,
        };

        if let Some(index) = self.outstanding {
            return Err(AssessmentError::InvalidSequenceState(format!(
                "trial {index} is still awaiting its outcome"
            )));
        }

        let block_index = match phase {
            Phase::Practice => {
                self.practice_emitted += 1;
                self.practice_emitted
            }
            Phase::Main => {
                self.main_emitted += 1;
                self.main_emitted
            }
        };

        let mut first_after_switch = false;
        if phase == Phase::Main && !self.switched {
            if let Some(switch_point) = self.protocol.switch_point {
                if block_index == switch_point + 1 {
                    first_after_switch = self.switch_rule();
                }
            }
        }

        let pool = &self.protocol.stimuli;
        let stimulus = pool[self.rng.gen_range(0..pool.len())].clone();

        self.last_index += 1;
        self.outstanding = Some(self.last_index);

        Ok(Trial {
            index: self.last_index,
            block_index,
            phase,
            stimulus,
            rule: self.active_rule,
            previous_rule: self.previous_rule,
            first_after_switch,
        })
    }

    /// Feeds back the outcome of the outstanding trial. Updates the
    /// consecutive-error counter and applies the completion rules.
    ///
    /// # Errors
    /// Returns [`AssessmentError::InvalidSequenceState`] when the outcome does
    /// not belong to the outstanding trial.
    pub fn record_outcome(
        &mut self,
        outcome: &TrialOutcome,
    ) -> Result<SequencerState, AssessmentError> {
        match self.outstanding {
            Some(index) if index == outcome.index => {}
            Some(index) => {
                return Err(AssessmentError::InvalidSequenceState(format!(
                    "outcome for trial {} recorded while trial {index} is outstanding",
                    outcome.index
                )))
            }
            None => {
                return Err(AssessmentError::InvalidSequenceState(format!(
                    "outcome for trial {} recorded with no trial outstanding",
                    outcome.index
                )))
            }
        }
        self.outstanding = None;

        let trial_duration = outcome
            .reaction_time_ms
            .unwrap_or_else(|| f64::from(self.protocol.stimulus_timeout_ms));
        self.elapsed_ms += trial_duration + f64::from(self.protocol.inter_trial_interval_ms);

        match self.state {
            SequencerState::Practice => {
                if self.practice_emitted >= self.protocol.practice_trial_count {
                    self.state = SequencerState::Main;
                    debug!(
                        rule = self.active_rule.as_str(),
                        "practice block finished, entering main block"
                    );
                }
            }
            SequencerState::Main => {
                if outcome.correct {
                    self.consecutive_errors = 0;
                } else {
                    self.consecutive_errors += 1;
                }

                // Reaching the error limit on the final main trial is a natural finish.
                if self.main_emitted >= self.protocol.main_trial_count {
                    self.state = SequencerState::Complete(CompletionReason::Natural);
                } else if self
                    .protocol
                    .max_consecutive_errors
                    .is_some_and(|limit| self.consecutive_errors >= limit)
                {
                    self.state = SequencerState::Complete(CompletionReason::EarlyStop);
                    debug!(
                        consecutive_errors = self.consecutive_errors,
                        main_trials = self.main_emitted,
                        "early stop threshold reached"
                    );
                }
            }
            SequencerState::NotStarted | SequencerState::Complete(_) => {
                return Err(AssessmentError::InvalidSequenceState(format!(
                    "record_outcome called in state {:?}",
                    self.state
                )))
            }
        }

        Ok(self.state)
    }

    /// Ends the session without exhausting the trial budget.
    ///
    /// # Errors
    /// Returns [`AssessmentError::InvalidSequenceState`] when already complete.
    pub fn abandon(&mut self) -> Result<(), AssessmentError> {
        if let SequencerState::Complete(reason) = self.state {
            return Err(AssessmentError::InvalidSequenceState(format!(
                "abandon called after completion ({})",
                reason.as_str()
            )));
        }
        self.outstanding = None;
        self.state = SequencerState::Complete(CompletionReason::Abandoned);
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> SequencerState {
        self.state
    }

    #[must_use]
    pub fn completion_reason(&self) -> Option<CompletionReason> {
        match self.state {
            SequencerState::Complete(reason) => Some(reason),
            _ => None,
        }
    }

    #[must_use]
    pub fn protocol(&self) -> &Arc<ProtocolSpec> {
        &self.protocol
    }

    #[must_use]
    pub fn active_rule(&self) -> Rule {
        self.active_rule
    }

    #[must_use]
    pub fn switched(&self) -> bool {
        self.switched
    }

    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    #[must_use]
    pub fn trials_emitted(&self) -> u32 {
        self.last_index
    }

    #[must_use]
    pub fn outstanding_trial(&self) -> Option<u32> {
        self.outstanding
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed_ms
    }

    fn switch_rule(&mut self) -> bool {
        let Some(next_rule) = self.protocol.resolved_post_switch_rule() else {
            return false;
        };
        debug!(
            from = self.active_rule.as_str(),
            to = next_rule.as_str(),
            main_trial = self.main_emitted,
            "rule switch"
        );
        self.previous_rule = Some(self.active_rule);
        self.active_rule = next_rule;
        self.switched = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AgeBand, ProtocolTable, TaskType};
    use crate::ErrorCategory;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn protocol(task: TaskType) -> ProtocolSpec {
        let table = must_ok(ProtocolTable::v1());
        must_ok(table.get(task, AgeBand::EarlySchool))
            .as_ref()
            .clone()
    }

    fn outcome_for(trial: &Trial, correct: bool) -> TrialOutcome {
        TrialOutcome {
            index: trial.index,
            block_index: trial.block_index,
            phase: trial.phase,
            rule: trial.rule,
            stimulus_id: trial.stimulus.id.clone(),
            response: Some("fixture".to_string()),
            correct,
            reaction_time_ms: Some(500.0),
            category: if correct {
                ErrorCategory::None
            } else {
                ErrorCategory::Other
            },
        }
    }

    fn run_to_completion(sequencer: &mut TrialSequencer) -> Vec<Trial> {
        must_ok(sequencer.start());
        let mut trials = Vec::new();
        while !matches!(sequencer.state(), SequencerState::Complete(_)) {
            let trial = must_ok(sequencer.next_trial());
            must_ok(sequencer.record_outcome(&outcome_for(&trial, true)));
            trials.push(trial);
        }
        trials
    }

    #[test]
    fn next_trial_before_start_is_rejected() {
        let mut sequencer = TrialSequencer::new(Arc::new(protocol(TaskType::Dccs)), 7);
        assert!(matches!(
            sequencer.next_trial(),
            Err(AssessmentError::InvalidSequenceState(_))
        ));
    }

    #[test]
    fn natural_completion_emits_full_budget() {
        let spec = protocol(TaskType::Dccs);
        let expected = spec.total_trial_count();
        let mut sequencer = TrialSequencer::new(Arc::new(spec), 7);
        let trials = run_to_completion(&mut sequencer);

        assert_eq!(trials.len(), expected as usize);
        assert_eq!(
            sequencer.completion_reason(),
            Some(CompletionReason::Natural)
        );
        for (position, trial) in trials.iter().enumerate() {
            assert_eq!(trial.index as usize, position + 1);
        }
        assert!(matches!(
            sequencer.next_trial(),
            Err(AssessmentError::InvalidSequenceState(_))
        ));
    }

    #[test]
    fn switch_fires_once_right_after_switch_point() {
        let mut sequencer = TrialSequencer::new(Arc::new(protocol(TaskType::Dccs)), 11);
        let trials = run_to_completion(&mut sequencer);

        let flagged: Vec<&Trial> = trials.iter().filter(|t| t.first_after_switch).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].phase, Phase::Main);
        assert_eq!(flagged[0].block_index, 11);
        assert_eq!(flagged[0].rule, Rule::Shape);
        assert_eq!(flagged[0].previous_rule, Some(Rule::Color));

        for trial in &trials {
            let post_switch = trial.phase == Phase::Main && trial.block_index > 10;
            let expected_rule = if post_switch { Rule::Shape } else { Rule::Color };
            assert_eq!(trial.rule, expected_rule);
        }
    }

    #[test]
    fn practice_to_main_keeps_rule() {
        let mut sequencer = TrialSequencer::new(Arc::new(protocol(TaskType::Dccs)), 3);
        must_ok(sequencer.start());
        for _ in 0..4 {
            let trial = must_ok(sequencer.next_trial());
            assert_eq!(trial.phase, Phase::Practice);
            must_ok(sequencer.record_outcome(&outcome_for(&trial, false)));
        }
        assert_eq!(sequencer.state(), SequencerState::Main);
        assert_eq!(sequencer.consecutive_errors(), 0);

        let trial = must_ok(sequencer.next_trial());
        assert_eq!(trial.phase, Phase::Main);
        assert_eq!(trial.index, 5);
        assert_eq!(trial.block_index, 1);
        assert_eq!(trial.rule, Rule::Color);
    }

    #[test]
    fn three_consecutive_errors_stop_early() {
        let mut spec = protocol(TaskType::Dccs);
        spec.max_consecutive_errors = Some(3);
        let mut sequencer = TrialSequencer::new(Arc::new(spec), 5);
        must_ok(sequencer.start());

        let mut pattern = vec![true; 4];
        pattern.extend([false, true, false, false, false]);
        for correct in pattern {
            let trial = must_ok(sequencer.next_trial());
            must_ok(sequencer.record_outcome(&outcome_for(&trial, correct)));
        }

        assert_eq!(
            sequencer.state(),
            SequencerState::Complete(CompletionReason::EarlyStop)
        );
        assert_eq!(sequencer.trials_emitted(), 9);
    }

    #[test]
    fn error_limit_on_last_main_trial_is_natural_completion() {
        let mut spec = protocol(TaskType::Dccs);
        spec.max_consecutive_errors = Some(3);
        let practice = spec.practice_trial_count;
        let main = spec.main_trial_count;
        let mut sequencer = TrialSequencer::new(Arc::new(spec), 5);
        must_ok(sequencer.start());

        for _ in 0..practice {
            let trial = must_ok(sequencer.next_trial());
            must_ok(sequencer.record_outcome(&outcome_for(&trial, true)));
        }
        for block_index in 1..=main {
            let trial = must_ok(sequencer.next_trial());
            must_ok(sequencer.record_outcome(&outcome_for(&trial, block_index + 3 <= main)));
        }

        assert_eq!(sequencer.consecutive_errors(), 3);
        assert_eq!(sequencer.trials_emitted(), practice + main);
        assert_eq!(
            sequencer.completion_reason(),
            Some(CompletionReason::Natural)
        );
    }

    #[test]
    fn next_trial_requires_outcome_for_previous_trial() {
        let mut sequencer = TrialSequencer::new(Arc::new(protocol(TaskType::DayNight)), 1);
        must_ok(sequencer.start());
        let trial = must_ok(sequencer.next_trial());
        assert!(sequencer.next_trial().is_err());

        let mut stray = outcome_for(&trial, true);
        stray.index += 1;
        assert!(sequencer.record_outcome(&stray).is_err());
        must_ok(sequencer.record_outcome(&outcome_for(&trial, true)));
        assert!(sequencer.next_trial().is_ok());
    }

    #[test]
    fn abandon_completes_with_distinct_reason() {
        let mut sequencer = TrialSequencer::new(Arc::new(protocol(TaskType::GoNoGo)), 1);
        must_ok(sequencer.start());
        let _ = must_ok(sequencer.next_trial());
        must_ok(sequencer.abandon());
        assert_eq!(
            sequencer.completion_reason(),
            Some(CompletionReason::Abandoned)
        );
        assert!(sequencer.abandon().is_err());
    }

    #[test]
    fn same_seed_reproduces_stimulus_order() {
        let spec = Arc::new(protocol(TaskType::GoNoGo));
        let first = run_to_completion(&mut TrialSequencer::new(Arc::clone(&spec), 42));
        let second = run_to_completion(&mut TrialSequencer::new(spec, 42));
        assert_eq!(first, second);
    }

    #[test]
    fn elapsed_time_accumulates_durations_and_intervals() {
        let spec = protocol(TaskType::DayNight);
        let interval = f64::from(spec.inter_trial_interval_ms);
        let timeout = f64::from(spec.stimulus_timeout_ms);
        let mut sequencer = TrialSequencer::new(Arc::new(spec), 9);
        must_ok(sequencer.start());

        let trial = must_ok(sequencer.next_trial());
        must_ok(sequencer.record_outcome(&outcome_for(&trial, true)));
        let trial = must_ok(sequencer.next_trial());
        let mut missed = outcome_for(&trial, false);
        missed.reaction_time_ms = None;
        must_ok(sequencer.record_outcome(&missed));

        let expected = 500.0 + interval + timeout + interval;
        assert!((sequencer.elapsed_ms() - expected).abs() < f64::EPSILON);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_trial_budget_and_switch_flag(
            practice in 0u32..6,
            main in 1u32..40,
            switch_seed in any::<u32>(),
            has_switch in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let mut spec = protocol(TaskType::Dccs);
            spec.practice_trial_count = practice;
            spec.main_trial_count = main;
            spec.max_consecutive_errors = None;
            spec.switch_point = if has_switch && main > 1 {
                Some(1 + switch_seed % (main - 1))
            } else {
                None
            };
            must_ok(spec.validate());
            let switch_point = spec.switch_point;

            let mut sequencer = TrialSequencer::new(Arc::new(spec), seed);
            let trials = run_to_completion(&mut sequencer);

            prop_assert_eq!(trials.len() as u32, practice + main);
            let flagged: Vec<&Trial> = trials.iter().filter(|t| t.first_after_switch).collect();
            match switch_point {
                Some(point) => {
                    prop_assert_eq!(flagged.len(), 1);
                    prop_assert_eq!(flagged[0].block_index, point + 1);
                    prop_assert_eq!(flagged[0].phase, Phase::Main);
                }
                None => prop_assert!(flagged.is_empty()),
            }
        }
    }
}
