use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::AssessmentError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    GoNoGo,
    DayNight,
    Dccs,
}

impl TaskType {
    pub const ALL: [Self; 3] = [Self::GoNoGo, Self::DayNight, Self::Dccs];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GoNoGo => "go_no_go",
            Self::DayNight => "day_night",
            Self::Dccs => "dccs",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "go_no_go" => Some(Self::GoNoGo),
            "day_night" => Some(Self::DayNight),
            "dccs" => Some(Self::Dccs),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgeBand {
    /// 3-4 years.
    Preschool,
    /// 5-6 years.
    EarlySchool,
    /// 7 years and older.
    SchoolAge,
}

impl AgeBand {
    pub const ALL: [Self; 3] = [Self::Preschool, Self::EarlySchool, Self::SchoolAge];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preschool => "preschool",
            Self::EarlySchool => "early_school",
            Self::SchoolAge => "school_age",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "preschool" => Some(Self::Preschool),
            "early_school" => Some(Self::EarlySchool),
            "school_age" => Some(Self::SchoolAge),
            _ => None,
        }
    }
}

/// The stimulus attribute that currently decides correctness.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    Color,
    Shape,
    Opposite,
    Literal,
    Target,
}

impl Rule {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Color => "color",
            Self::Shape => "shape",
            Self::Opposite => "opposite",
            Self::Literal => "literal",
            Self::Target => "target",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "color" => Some(Self::Color),
            "shape" => Some(Self::Shape),
            "opposite" => Some(Self::Opposite),
            "literal" => Some(Self::Literal),
            "target" => Some(Self::Target),
            _ => None,
        }
    }

    /// Partner rule for two-rule tasks. `None` when the rule has no natural
    /// partner and the protocol must name its post-switch rule explicitly.
    #[must_use]
    pub fn complement(self) -> Option<Self> {
        match self {
            Self::Color => Some(Self::Shape),
            Self::Shape => Some(Self::Color),
            Self::Opposite => Some(Self::Literal),
            Self::Literal => Some(Self::Opposite),
            Self::Target => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExpectedResponse {
    Respond(String),
    /// No-go stimulus: the correct behavior is to let the window elapse.
    Withhold,
}

impl ExpectedResponse {
    #[must_use]
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Respond(expected) => responses_equal(expected, value),
            Self::Withhold => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StimulusDescriptor {
    pub id: String,
    pub attributes: BTreeMap<String, String>,
    pub expected: BTreeMap<Rule, ExpectedResponse>,
}

impl StimulusDescriptor {
    #[must_use]
    pub fn expected_for(&self, rule: Rule) -> Option<&ExpectedResponse> {
        self.expected.get(&rule)
    }
}

fn responses_equal(lhs: &str, rhs: &str) -> bool {
    lhs.trim().eq_ignore_ascii_case(rhs.trim())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CutPoints {
    pub low: f64,
    pub moderate: f64,
    pub high: f64,
}

impl CutPoints {
    fn validate_ordering(&self, name: &str, lower_is_worse: bool) -> Result<(), AssessmentError> {
        for (label, value) in [
            ("low", self.low),
            ("moderate", self.moderate),
            ("high", self.high),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(AssessmentError::Configuration(format!(
                    "{name}.{label} MUST be a finite, non-negative number"
                )));
            }
        }

        let ordered = if lower_is_worse {
            self.low >= self.moderate && self.moderate >= self.high
        } else {
            self.low <= self.moderate && self.moderate <= self.high
        };
        if !ordered {
            let direction = if lower_is_worse {
                "low >= moderate >= high"
            } else {
                "low <= moderate <= high"
            };
            return Err(AssessmentError::Configuration(format!(
                "{name} cut points MUST satisfy {direction}"
            )));
        }
        Ok(())
    }
}

/// Cut points consulted by the fallback classifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RiskThresholds {
    /// Overall main-block accuracy; lower is worse.
    pub accuracy: CutPoints,
    pub perseverative_errors: CutPoints,
    pub switch_cost_ms: CutPoints,
    pub perseverative_error_rate: CutPoints,
}

impl RiskThresholds {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            accuracy: CutPoints {
                low: 0.90,
                moderate: 0.75,
                high: 0.50,
            },
            perseverative_errors: CutPoints {
                low: 1.0,
                moderate: 2.0,
                high: 4.0,
            },
            switch_cost_ms: CutPoints {
                low: 150.0,
                moderate: 300.0,
                high: 600.0,
            },
            perseverative_error_rate: CutPoints {
                low: 0.10,
                moderate: 0.25,
                high: 0.50,
            },
        }
    }

    /// Validates that every cut-point triple is ordered.
    ///
    /// # Errors
    /// Returns [`AssessmentError::Configuration`] on unordered or non-finite
    /// cut points, or accuracy cut points above 1.
    pub fn validate(&self) -> Result<(), AssessmentError> {
        self.accuracy.validate_ordering("accuracy", true)?;
        if self.accuracy.low > 1.0 {
            return Err(AssessmentError::Configuration(
                "accuracy cut points MUST be in [0.0, 1.0]".to_string(),
            ));
        }
        self.perseverative_errors
            .validate_ordering("perseverative_errors", false)?;
        self.switch_cost_ms.validate_ordering("switch_cost_ms", false)?;
        self.perseverative_error_rate
            .validate_ordering("perseverative_error_rate", false)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolSpec {
    pub task_type: TaskType,
    pub age_band: AgeBand,
    pub practice_trial_count: u32,
    pub main_trial_count: u32,
    /// Main-block relative: trials `1..=k` precede the switch, trial `k + 1`
    /// is the first under the new rule.
    pub switch_point: Option<u32>,
    pub initial_rule: Rule,
    #[serde(default)]
    pub post_switch_rule: Option<Rule>,
    pub stimulus_timeout_ms: u32,
    pub inter_trial_interval_ms: u32,
    #[serde(default)]
    pub max_consecutive_errors: Option<u32>,
    pub stimuli: Vec<StimulusDescriptor>,
    pub thresholds: RiskThresholds,
}

impl ProtocolSpec {
    #[must_use]
    pub fn total_trial_count(&self) -> u32 {
        self.practice_trial_count
            .saturating_add(self.main_trial_count)
    }

    /// Rule activated at the switch point, if the protocol switches.
    #[must_use]
    pub fn resolved_post_switch_rule(&self) -> Option<Rule> {
        self.switch_point?;
        self.post_switch_rule.or_else(|| self.initial_rule.complement())
    }

    #[must_use]
    pub fn active_rules(&self) -> Vec<Rule> {
        let mut rules = vec![self.initial_rule];
        if let Some(rule) = self.resolved_post_switch_rule() {
            rules.push(rule);
        }
        rules
    }

    /// Validates trial budgets, switch configuration, stimulus coverage and
    /// thresholds.
    ///
    /// # Errors
    /// Returns [`AssessmentError::Configuration`] describing the first
    /// violated constraint.
    pub fn validate(&self) -> Result<(), AssessmentError> {
        let key = format!("{}/{}", self.task_type.as_str(), self.age_band.as_str());

        if self.main_trial_count == 0 {
            return Err(AssessmentError::Configuration(format!(
                "{key}: main_trial_count MUST be >= 1"
            )));
        }

        if let Some(switch_point) = self.switch_point {
            if switch_point == 0 || switch_point >= self.main_trial_count {
                return Err(AssessmentError::Configuration(format!(
                    "{key}: switch_point MUST be in 1..main_trial_count"
                )));
            }
            match self.resolved_post_switch_rule() {
                None => {
                    return Err(AssessmentError::Configuration(format!(
                        "{key}: rule {} has no complement; post_switch_rule is required",
                        self.initial_rule.as_str()
                    )))
                }
                Some(rule) if rule == self.initial_rule => {
                    return Err(AssessmentError::Configuration(format!(
                        "{key}: post_switch_rule MUST differ from initial_rule"
                    )))
                }
                Some(_) => {}
            }
        } else if self.post_switch_rule.is_some() {
            return Err(AssessmentError::Configuration(format!(
                "{key}: post_switch_rule requires switch_point"
            )));
        }

        if self.stimulus_timeout_ms == 0 {
            return Err(AssessmentError::Configuration(format!(
                "{key}: stimulus_timeout_ms MUST be >= 1"
            )));
        }

        if self.max_consecutive_errors == Some(0) {
            return Err(AssessmentError::Configuration(format!(
                "{key}: max_consecutive_errors MUST be >= 1 when set"
            )));
        }

        if self.stimuli.is_empty() {
            return Err(AssessmentError::Configuration(format!(
                "{key}: stimulus pool MUST NOT be empty"
            )));
        }

        let mut seen = BTreeSet::new();
        let rules = self.active_rules();
        for stimulus in &self.stimuli {
            if !seen.insert(stimulus.id.as_str()) {
                return Err(AssessmentError::Configuration(format!(
                    "{key}: duplicate stimulus id {}",
                    stimulus.id
                )));
            }
            for rule in &rules {
                match stimulus.expected_for(*rule) {
                    None => {
                        return Err(AssessmentError::Configuration(format!(
                            "{key}: stimulus {} has no expected response for rule {}",
                            stimulus.id,
                            rule.as_str()
                        )))
                    }
                    Some(ExpectedResponse::Respond(value)) if value.trim().is_empty() => {
                        return Err(AssessmentError::Configuration(format!(
                            "{key}: stimulus {} has an empty expected response",
                            stimulus.id
                        )))
                    }
                    Some(_) => {}
                }
            }
        }

        self.thresholds
            .validate()
            .map_err(|err| AssessmentError::Configuration(format!("{key}: {err}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ProtocolTableWire {
    table_version: u32,
    protocols: Vec<ProtocolSpec>,
}

/// Immutable, validated set of protocols keyed by task and age band.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolTable {
    table_version: u32,
    entries: BTreeMap<(TaskType, AgeBand), Arc<ProtocolSpec>>,
}

impl ProtocolTable {
    /// Builds a table from protocol entries.
    ///
    /// # Errors
    /// Returns [`AssessmentError::Configuration`] when an entry fails
    /// validation or two entries share a `(task, age band)` key.
    pub fn new(table_version: u32, protocols: Vec<ProtocolSpec>) -> Result<Self, AssessmentError> {
        if table_version == 0 {
            return Err(AssessmentError::Configuration(
                "table_version MUST be >= 1".to_string(),
            ));
        }

        let mut entries = BTreeMap::new();
        for protocol in protocols {
            protocol.validate()?;
            let key = (protocol.task_type, protocol.age_band);
            if entries.insert(key, Arc::new(protocol)).is_some() {
                return Err(AssessmentError::Configuration(format!(
                    "duplicate protocol entry for {}/{}",
                    key.0.as_str(),
                    key.1.as_str()
                )));
            }
        }

        if entries.is_empty() {
            return Err(AssessmentError::Configuration(
                "protocol table MUST contain at least one entry".to_string(),
            ));
        }

        Ok(Self {
            table_version,
            entries,
        })
    }

    /// Built-in protocol table.
    ///
    /// # Errors
    /// Returns [`AssessmentError::Configuration`] only if the built-in
    /// entries stop validating.
    pub fn v1() -> Result<Self, AssessmentError> {
        let mut protocols = Vec::new();
        for age_band in AgeBand::ALL {
            let (main_trial_count, timeout_ms, interval_ms) = match age_band {
                AgeBand::Preschool => (16, 5_000, 1_000),
                AgeBand::EarlySchool => (20, 4_000, 800),
                AgeBand::SchoolAge => (24, 3_000, 600),
            };

            protocols.push(ProtocolSpec {
                task_type: TaskType::GoNoGo,
                age_band,
                practice_trial_count: 4,
                main_trial_count: main_trial_count * 2,
                switch_point: None,
                initial_rule: Rule::Target,
                post_switch_rule: None,
                stimulus_timeout_ms: timeout_ms / 2,
                inter_trial_interval_ms: interval_ms,
                max_consecutive_errors: None,
                stimuli: go_no_go_stimuli(),
                thresholds: RiskThresholds::v1(),
            });

            protocols.push(ProtocolSpec {
                task_type: TaskType::DayNight,
                age_band,
                practice_trial_count: 2,
                main_trial_count,
                switch_point: None,
                initial_rule: Rule::Opposite,
                post_switch_rule: None,
                stimulus_timeout_ms: timeout_ms,
                inter_trial_interval_ms: interval_ms,
                max_consecutive_errors: None,
                stimuli: day_night_stimuli(),
                thresholds: RiskThresholds::v1(),
            });

            protocols.push(ProtocolSpec {
                task_type: TaskType::Dccs,
                age_band,
                practice_trial_count: 4,
                main_trial_count,
                switch_point: Some(main_trial_count / 2),
                initial_rule: Rule::Color,
                post_switch_rule: Some(Rule::Shape),
                stimulus_timeout_ms: timeout_ms,
                inter_trial_interval_ms: interval_ms,
                max_consecutive_errors: Some(if age_band == AgeBand::Preschool { 6 } else { 8 }),
                stimuli: dccs_stimuli(),
                thresholds: RiskThresholds::v1(),
            });
        }

        Self::new(1, protocols)
    }

    /// Decodes and validates a protocol table from JSON.
    ///
    /// # Errors
    /// Returns [`AssessmentError::Configuration`] when JSON decoding fails
    /// or decoded entries violate protocol constraints.
    pub fn from_json(value: &Value) -> Result<Self, AssessmentError> {
        let wire: ProtocolTableWire = serde_json::from_value(value.clone()).map_err(|err| {
            AssessmentError::Configuration(format!("invalid protocol table JSON payload: {err}"))
        })?;
        Self::new(wire.table_version, wire.protocols)
    }

    /// Encodes the table in the same shape accepted by [`Self::from_json`].
    ///
    /// # Errors
    /// Returns [`AssessmentError::Configuration`] when serialization fails.
    pub fn to_json(&self) -> Result<Value, AssessmentError> {
        let wire = ProtocolTableWire {
            table_version: self.table_version,
            protocols: self
                .entries
                .values()
                .map(|protocol| protocol.as_ref().clone())
                .collect(),
        };
        serde_json::to_value(wire).map_err(|err| {
            AssessmentError::Configuration(format!("failed to encode protocol table: {err}"))
        })
    }

    #[must_use]
    pub fn table_version(&self) -> u32 {
        self.table_version
    }

    /// Looks up the protocol for a task and age band.
    ///
    /// # Errors
    /// Returns [`AssessmentError::Configuration`] when no entry exists.
    pub fn get(&self, task: TaskType, age_band: AgeBand) -> Result<Arc<ProtocolSpec>, AssessmentError> {
        self.entries
            .get(&(task, age_band))
            .cloned()
            .ok_or_else(|| {
                AssessmentError::Configuration(format!(
                    "missing protocol configuration for {}/{}",
                    task.as_str(),
                    age_band.as_str()
                ))
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProtocolSpec>> {
        self.entries.values()
    }
}

fn stimulus(
    id: &str,
    attributes: &[(&str, &str)],
    expected: &[(Rule, ExpectedResponse)],
) -> StimulusDescriptor {
    StimulusDescriptor {
        id: id.to_string(),
        attributes: attributes
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect(),
        expected: expected.iter().cloned().collect(),
    }
}

fn respond(value: &str) -> ExpectedResponse {
    ExpectedResponse::Respond(value.to_string())
}

// Conflict cards only: each card matches one sorting box by color and the
// other by shape, so a stale-rule answer is always distinguishable.
fn dccs_stimuli() -> Vec<StimulusDescriptor> {
    vec![
        stimulus(
            "red_rabbit",
            &[("color", "red"), ("shape", "rabbit")],
            &[(Rule::Color, respond("red")), (Rule::Shape, respond("rabbit"))],
        ),
        stimulus(
            "blue_boat",
            &[("color", "blue"), ("shape", "boat")],
            &[(Rule::Color, respond("blue")), (Rule::Shape, respond("boat"))],
        ),
    ]
}

fn day_night_stimuli() -> Vec<StimulusDescriptor> {
    vec![
        stimulus(
            "sun",
            &[("picture", "sun")],
            &[(Rule::Opposite, respond("night")), (Rule::Literal, respond("day"))],
        ),
        stimulus(
            "moon",
            &[("picture", "moon")],
            &[(Rule::Opposite, respond("day")), (Rule::Literal, respond("night"))],
        ),
    ]
}

// Three go stimuli to one no-go keeps the prepotent tap response dominant.
fn go_no_go_stimuli() -> Vec<StimulusDescriptor> {
    vec![
        stimulus(
            "fish_orange",
            &[("animal", "fish"), ("color", "orange")],
            &[(Rule::Target, respond("tap"))],
        ),
        stimulus(
            "fish_blue",
            &[("animal", "fish"), ("color", "blue")],
            &[(Rule::Target, respond("tap"))],
        ),
        stimulus(
            "fish_green",
            &[("animal", "fish"), ("color", "green")],
            &[(Rule::Target, respond("tap"))],
        ),
        stimulus(
            "shark",
            &[("animal", "shark"), ("color", "grey")],
            &[(Rule::Target, ExpectedResponse::Withhold)],
        ),
    ]
}
