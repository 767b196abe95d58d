//! Embeddable command surface for the assessment engine.
//!
//! Hosts can either parse a full command line and hand it to [`run_cli`], or
//! drive a scripted session directly through [`run_scripted_session`].
//! Stdout carries results only; diagnostics go through `tracing`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use cogassess_core::{
    now_utc, parse_rfc3339_utc, AgeBand, AssessmentSession, ExpectedResponse, FallbackPolicy,
    ModelBackedEstimator, ProtocolSpec, ProtocolTable, ResponseRecord, RiskAssessment,
    RiskEstimator, Rule, RuleBasedEstimator, SessionMetrics, SessionRecord, SessionReport,
    TaskType, Trial,
};
use cogassess_model_http::{HttpModelConfig, HttpRiskModel, DEFAULT_TIMEOUT_MS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(name = "cogassess")]
#[command(about = "Executive-function task engine and risk scorer")]
pub struct Cli {
    /// Protocol table JSON replacing the built-in table.
    #[arg(long, global = true)]
    protocols: Option<PathBuf>,

    /// Fallback scoring policy JSON replacing the built-in policy.
    #[arg(long, global = true)]
    fallback_policy: Option<PathBuf>,

    /// External risk model endpoint. Without it scoring is rule-based.
    #[arg(long, global = true)]
    model_url: Option<String>,

    #[arg(long, global = true, default_value_t = DEFAULT_TIMEOUT_MS)]
    model_timeout_ms: u64,

    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Protocol {
        #[command(subcommand)]
        command: ProtocolCommand,
    },
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    /// Score a stored session-metrics document.
    Classify(ClassifyArgs),
    /// Write one CSV feature row per session record.
    Export(ExportArgs),
}

#[derive(Debug, Subcommand)]
pub enum ProtocolCommand {
    List(ProtocolListArgs),
    Show(ProtocolShowArgs),
}

#[derive(Debug, Args)]
pub struct ProtocolListArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ProtocolShowArgs {
    #[arg(long)]
    task: TaskArg,
    #[arg(long)]
    age_band: AgeBandArg,
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    Run(SessionRunArgs),
}

#[derive(Debug, Args)]
pub struct SessionRunArgs {
    #[arg(long)]
    task: TaskArg,
    #[arg(long)]
    age_band: AgeBandArg,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Response script JSON (`{"steps": [...]}`).
    #[arg(long)]
    script: PathBuf,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    recorded_at: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ClassifyArgs {
    #[arg(long)]
    metrics: PathBuf,
    #[arg(long)]
    task: TaskArg,
    #[arg(long)]
    age_band: AgeBandArg,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long = "record", required = true)]
    records: Vec<PathBuf>,
    #[arg(long)]
    output: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum TaskArg {
    GoNoGo,
    DayNight,
    Dccs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum AgeBandArg {
    Preschool,
    EarlySchool,
    SchoolAge,
}

fn map_task(value: TaskArg) -> TaskType {
    match value {
        TaskArg::GoNoGo => TaskType::GoNoGo,
        TaskArg::DayNight => TaskType::DayNight,
        TaskArg::Dccs => TaskType::Dccs,
    }
}

fn map_age_band(value: AgeBandArg) -> AgeBand {
    match value {
        AgeBandArg::Preschool => AgeBand::Preschool,
        AgeBandArg::EarlySchool => AgeBand::EarlySchool,
        AgeBandArg::SchoolAge => AgeBand::SchoolAge,
    }
}

/// One scripted answer. The script's last step repeats once it runs out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptStep {
    /// Answer whatever the active rule expects (withhold on no-go).
    Correct {
        #[serde(default = "default_reaction_time_ms")]
        reaction_time_ms: f64,
    },
    /// Answer as if `rule` were active.
    Rule {
        rule: Rule,
        #[serde(default = "default_reaction_time_ms")]
        reaction_time_ms: f64,
    },
    Value {
        value: String,
        #[serde(default = "default_reaction_time_ms")]
        reaction_time_ms: f64,
    },
    Omit,
}

fn default_reaction_time_ms() -> f64 {
    500.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseScript {
    pub steps: Vec<ScriptStep>,
}

impl ResponseScript {
    /// # Errors
    /// Returns an error when the script is empty or carries an invalid
    /// reaction time.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(anyhow!("response script MUST contain at least one step"));
        }
        for (position, step) in self.steps.iter().enumerate() {
            let reaction_time_ms = match step {
                ScriptStep::Correct { reaction_time_ms }
                | ScriptStep::Rule {
                    reaction_time_ms, ..
                }
                | ScriptStep::Value {
                    reaction_time_ms, ..
                } => *reaction_time_ms,
                ScriptStep::Omit => continue,
            };
            if !reaction_time_ms.is_finite() || reaction_time_ms < 0.0 {
                return Err(anyhow!(
                    "script step {position}: reaction_time_ms MUST be finite and >= 0"
                ));
            }
        }
        Ok(())
    }

    /// Response for the `position`-th trial (0-based, practice included).
    #[must_use]
    pub fn respond(&self, position: usize, trial: &Trial) -> ResponseRecord {
        let Some(step) = self
            .steps
            .get(position)
            .or_else(|| self.steps.last())
        else {
            return ResponseRecord::timeout(trial.index);
        };

        match step {
            ScriptStep::Correct { reaction_time_ms } => {
                answer_under(trial, trial.rule, *reaction_time_ms)
            }
            ScriptStep::Rule {
                rule,
                reaction_time_ms,
            } => answer_under(trial, *rule, *reaction_time_ms),
            ScriptStep::Value {
                value,
                reaction_time_ms,
            } => ResponseRecord::answered(trial.index, value.clone(), *reaction_time_ms),
            ScriptStep::Omit => ResponseRecord::timeout(trial.index),
        }
    }
}

fn answer_under(trial: &Trial, rule: Rule, reaction_time_ms: f64) -> ResponseRecord {
    match trial.stimulus.expected_for(rule) {
        Some(ExpectedResponse::Respond(value)) => {
            ResponseRecord::answered(trial.index, value.clone(), reaction_time_ms)
        }
        Some(ExpectedResponse::Withhold) | None => ResponseRecord::timeout(trial.index),
    }
}

/// Drives one session to completion with scripted responses and scores it.
///
/// # Errors
/// Returns an error when the session cannot be started, a response is
/// rejected, or the finished history cannot be summarised.
pub fn run_scripted_session(
    protocol: Arc<ProtocolSpec>,
    seed: u64,
    script: &ResponseScript,
    estimator: &dyn RiskEstimator,
) -> Result<SessionReport> {
    script.validate()?;
    let mut session = AssessmentSession::new(protocol, seed);
    session.start()?;

    let mut position = 0_usize;
    while !session.is_complete() {
        let trial = session.next_trial()?;
        let response = script.respond(position, &trial);
        let outcome = session.respond(&response)?;
        debug!(
            trial = outcome.index,
            phase = outcome.phase.as_str(),
            category = outcome.category.as_str(),
            "scripted response recorded"
        );
        position += 1;
    }

    Ok(session.finish(estimator)?)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolListJsonPayload {
    pub contract_version: String,
    pub table_version: u32,
    pub protocols: Vec<ProtocolSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolSummary {
    pub task_type: TaskType,
    pub age_band: AgeBand,
    pub practice_trial_count: u32,
    pub main_trial_count: u32,
    pub switch_point: Option<u32>,
    pub stimulus_timeout_ms: u32,
    pub max_consecutive_errors: Option<u32>,
}

#[must_use]
pub fn build_protocol_list_payload(table: &ProtocolTable) -> ProtocolListJsonPayload {
    ProtocolListJsonPayload {
        contract_version: "protocol_list.v1".to_string(),
        table_version: table.table_version(),
        protocols: table
            .iter()
            .map(|spec| ProtocolSummary {
                task_type: spec.task_type,
                age_band: spec.age_band,
                practice_trial_count: spec.practice_trial_count,
                main_trial_count: spec.main_trial_count,
                switch_point: spec.switch_point,
                stimulus_timeout_ms: spec.stimulus_timeout_ms,
                max_consecutive_errors: spec.max_consecutive_errors,
            })
            .collect(),
    }
}

/// Executes the parsed top-level command.
///
/// # Errors
/// Returns an error when configuration cannot be loaded or the requested
/// command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let table = load_protocols(cli.protocols.as_deref())?;
    match cli.command {
        Command::Protocol { command } => run_protocol(command, &table),
        Command::Session {
            command: SessionCommand::Run(args),
        } => {
            let estimator = build_estimator(
                cli.fallback_policy.as_deref(),
                cli.model_url.as_deref(),
                cli.model_timeout_ms,
            )?;
            run_session(&args, &table, estimator.as_ref())
        }
        Command::Classify(args) => {
            let estimator = build_estimator(
                cli.fallback_policy.as_deref(),
                cli.model_url.as_deref(),
                cli.model_timeout_ms,
            )?;
            run_classify(&args, &table, estimator.as_ref())
        }
        Command::Export(args) => run_export(&args),
    }
}

fn run_protocol(command: ProtocolCommand, table: &ProtocolTable) -> Result<()> {
    match command {
        ProtocolCommand::List(args) => {
            let payload = build_protocol_list_payload(table);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_protocol_table(&payload);
            }
            Ok(())
        }
        ProtocolCommand::Show(args) => {
            let spec = table.get(map_task(args.task), map_age_band(args.age_band))?;
            println!("{}", serde_json::to_string_pretty(spec.as_ref())?);
            Ok(())
        }
    }
}

fn run_session(
    args: &SessionRunArgs,
    table: &ProtocolTable,
    estimator: &dyn RiskEstimator,
) -> Result<()> {
    let protocol = table.get(map_task(args.task), map_age_band(args.age_band))?;
    let script: ResponseScript = serde_json::from_value(read_json_file(&args.script)?)
        .with_context(|| format!("invalid response script {}", args.script.display()))?;

    let recorded_at = match args.recorded_at.as_deref() {
        Some(raw) => parse_rfc3339_utc(raw).with_context(|| format!("invalid --recorded-at: {raw}"))?,
        None => now_utc(),
    };

    let report = run_scripted_session(protocol, args.seed, &script, estimator)?;
    let record = SessionRecord::new(report, recorded_at)?;
    info!(
        session_id = %record.report.session_id,
        risk_level = record.report.assessment.risk_level.as_str(),
        method = record.report.assessment.method.as_str(),
        "session scored"
    );

    if let Some(path) = &args.out {
        let serialized = serde_json::to_string_pretty(&record)?;
        std::fs::write(path, serialized)
            .with_context(|| format!("failed writing session record to {}", path.display()))?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_session_summary(&record.report);
    }
    Ok(())
}

fn run_classify(
    args: &ClassifyArgs,
    table: &ProtocolTable,
    estimator: &dyn RiskEstimator,
) -> Result<()> {
    let protocol = table.get(map_task(args.task), map_age_band(args.age_band))?;
    let metrics: SessionMetrics = serde_json::from_value(read_json_file(&args.metrics)?)
        .with_context(|| format!("invalid session metrics {}", args.metrics.display()))?;
    if !(0.0..=1.0).contains(&metrics.accuracy) {
        return Err(anyhow!(
            "session metrics accuracy MUST be in [0.0, 1.0], got {}",
            metrics.accuracy
        ));
    }

    let assessment: RiskAssessment = estimator.estimate(&protocol, &metrics);
    println!("{}", serde_json::to_string_pretty(&assessment)?);
    Ok(())
}

const EXPORT_FIXED_COLUMNS: [&str; 9] = [
    "session_id",
    "task_type",
    "age_band",
    "seed",
    "completion_reason",
    "recorded_at",
    "risk_level",
    "probability",
    "method",
];

fn run_export(args: &ExportArgs) -> Result<()> {
    let mut records = Vec::with_capacity(args.records.len());
    for path in &args.records {
        let record = SessionRecord::from_json(&read_json_file(path)?)
            .with_context(|| format!("invalid session record {}", path.display()))?;
        records.push(record);
    }

    let feature_maps: Vec<_> = records
        .iter()
        .map(|record| record.report.metrics.feature_map())
        .collect();
    let feature_columns: BTreeSet<&str> = feature_maps
        .iter()
        .flat_map(|features| features.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_path(&args.output)
        .with_context(|| format!("failed opening {}", args.output.display()))?;
    writer.write_record(
        EXPORT_FIXED_COLUMNS
            .iter()
            .copied()
            .chain(feature_columns.iter().copied()),
    )?;

    for (record, features) in records.iter().zip(&feature_maps) {
        let report = &record.report;
        let mut row = vec![
            report.session_id.to_string(),
            report.task_type.as_str().to_string(),
            report.age_band.as_str().to_string(),
            report.seed.to_string(),
            report.completion_reason.as_str().to_string(),
            record.recorded_at.clone(),
            report.assessment.risk_level.as_str().to_string(),
            report.assessment.probability.to_string(),
            report.assessment.method.as_str().to_string(),
        ];
        row.extend(feature_columns.iter().map(|column| {
            features
                .get(*column)
                .map_or_else(String::new, ToString::to_string)
        }));
        writer.write_record(&row)?;
    }
    writer.flush()?;

    println!(
        "exported={} output={}",
        records.len(),
        args.output.display()
    );
    Ok(())
}

fn load_protocols(path: Option<&Path>) -> Result<ProtocolTable> {
    match path {
        Some(path) => ProtocolTable::from_json(&read_json_file(path)?)
            .with_context(|| format!("invalid protocol table {}", path.display())),
        None => Ok(ProtocolTable::v1()?),
    }
}

fn load_fallback_policy(path: Option<&Path>) -> Result<FallbackPolicy> {
    match path {
        Some(path) => FallbackPolicy::from_json(&read_json_file(path)?)
            .with_context(|| format!("invalid fallback policy {}", path.display())),
        None => Ok(FallbackPolicy::v1()),
    }
}

fn build_estimator(
    policy_path: Option<&Path>,
    model_url: Option<&str>,
    model_timeout_ms: u64,
) -> Result<Box<dyn RiskEstimator>> {
    let policy = load_fallback_policy(policy_path)?;
    match model_url {
        Some(url) => {
            let model = HttpRiskModel::new(HttpModelConfig::new(url).with_timeout_ms(model_timeout_ms))?;
            Ok(Box::new(ModelBackedEstimator::new(model, policy)))
        }
        None => Ok(Box::new(RuleBasedEstimator::new(policy))),
    }
}

fn read_json_file(path: &Path) -> Result<Value> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn print_protocol_table(payload: &ProtocolListJsonPayload) {
    println!(
        "contract={} table_version={}",
        payload.contract_version, payload.table_version
    );
    println!(
        "{:<10} {:<13} {:<9} {:<5} {:<7} {:<11} early_stop",
        "task", "age_band", "practice", "main", "switch", "timeout_ms"
    );
    println!("{}", "-".repeat(70));
    for item in &payload.protocols {
        println!(
            "{:<10} {:<13} {:<9} {:<5} {:<7} {:<11} {}",
            item.task_type.as_str(),
            item.age_band.as_str(),
            item.practice_trial_count,
            item.main_trial_count,
            item.switch_point
                .map_or_else(|| "none".to_string(), |value| value.to_string()),
            item.stimulus_timeout_ms,
            item.max_consecutive_errors
                .map_or_else(|| "none".to_string(), |value| value.to_string())
        );
    }
}

fn print_session_summary(report: &SessionReport) {
    let metrics = &report.metrics;
    let assessment = &report.assessment;
    println!(
        "session={} task={} age_band={} seed={} reason={} elapsed_ms={:.0}",
        report.session_id,
        report.task_type.as_str(),
        report.age_band.as_str(),
        report.seed,
        report.completion_reason.as_str(),
        report.elapsed_ms
    );
    println!(
        "practice={} main={} accuracy={:.3} perseverative_errors={} omissions={} switch_cost_ms={}",
        report.practice_outcomes.len(),
        metrics.main_trials,
        metrics.accuracy,
        metrics.perseverative_errors,
        metrics.omissions,
        metrics
            .switch_cost_ms
            .map_or_else(|| "n/a".to_string(), |value| format!("{value:.1}"))
    );
    println!(
        "risk={} probability={:.3} confidence={:.3} method={} factors={}",
        assessment.risk_level.as_str(),
        assessment.probability,
        assessment.confidence,
        assessment.method.as_str(),
        if assessment.contributing_factors.is_empty() {
            "none".to_string()
        } else {
            assessment.contributing_factors.join(",")
        }
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use cogassess_core::{AssessmentMethod, CompletionReason, ErrorCategory, RiskLevel};
    use serde_json::json;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn dccs(age_band: AgeBand) -> Arc<ProtocolSpec> {
        must(
            must(ProtocolTable::v1().map_err(Into::into))
                .get(TaskType::Dccs, age_band)
                .map_err(Into::into),
        )
    }

    fn parse_script(value: Value) -> ResponseScript {
        must(serde_json::from_value(value).map_err(Into::into))
    }

    #[test]
    fn script_steps_decode_with_default_reaction_time() {
        let script = parse_script(json!({
            "steps": [
                {"kind": "correct"},
                {"kind": "rule", "rule": "color", "reaction_time_ms": 800},
                {"kind": "value", "value": "giraffe"},
                {"kind": "omit"}
            ]
        }));
        assert_eq!(
            script.steps[0],
            ScriptStep::Correct {
                reaction_time_ms: 500.0
            }
        );
        assert_eq!(
            script.steps[1],
            ScriptStep::Rule {
                rule: Rule::Color,
                reaction_time_ms: 800.0
            }
        );
        must(script.validate());
    }

    #[test]
    fn empty_or_negative_scripts_are_rejected() {
        assert!(parse_script(json!({"steps": []})).validate().is_err());
        assert!(parse_script(json!({"steps": [{"kind": "correct", "reaction_time_ms": -5}]}))
            .validate()
            .is_err());
    }

    #[test]
    fn last_step_repeats_once_script_is_exhausted() {
        let script = parse_script(json!({
            "steps": [{"kind": "correct"}, {"kind": "omit"}]
        }));
        let report = must(run_scripted_session(
            dccs(AgeBand::SchoolAge),
            4,
            &script,
            &RuleBasedEstimator::default(),
        ));

        assert!(report.practice_outcomes[0].correct);
        assert!(report.practice_outcomes[1..]
            .iter()
            .chain(&report.main_outcomes)
            .all(|outcome| outcome.category == ErrorCategory::Omission));
        assert_eq!(report.completion_reason, CompletionReason::EarlyStop);
        assert_eq!(report.assessment.risk_level, RiskLevel::High);
    }

    #[test]
    fn all_correct_script_completes_naturally_with_low_risk() {
        let script = parse_script(json!({"steps": [{"kind": "correct", "reaction_time_ms": 650}]}));
        let protocol = dccs(AgeBand::EarlySchool);
        let report = must(run_scripted_session(
            Arc::clone(&protocol),
            7,
            &script,
            &RuleBasedEstimator::default(),
        ));

        assert_eq!(report.completion_reason, CompletionReason::Natural);
        assert_eq!(report.main_outcomes.len(), protocol.main_trial_count as usize);
        assert_eq!(report.assessment.risk_level, RiskLevel::Low);
        assert_eq!(report.assessment.method, AssessmentMethod::RuleBased);
    }

    #[test]
    fn protocol_list_json_contract_is_stable_v1() {
        let table = must(ProtocolTable::v1().map_err(Into::into));
        let value = must(serde_json::to_value(build_protocol_list_payload(&table)).map_err(Into::into));

        assert_eq!(value["contract_version"], json!("protocol_list.v1"));
        assert_eq!(value["table_version"], json!(1));
        let protocols = match value["protocols"].as_array() {
            Some(items) => items,
            None => panic!("protocols must be an array"),
        };
        assert_eq!(protocols.len(), 9);
        assert!(protocols.contains(&json!({
            "task_type": "dccs",
            "age_band": "early_school",
            "practice_trial_count": 4,
            "main_trial_count": 20,
            "switch_point": 10,
            "stimulus_timeout_ms": 4000,
            "max_consecutive_errors": 8
        })));
    }

    #[test]
    fn unreachable_model_falls_back_to_threshold_scoring() {
        let listener = must(std::net::TcpListener::bind("127.0.0.1:0").map_err(Into::into));
        let addr = must(listener.local_addr().map_err(Into::into));
        drop(listener);

        let estimator = must(build_estimator(
            None,
            Some(&format!("http://{addr}/predict")),
            250,
        ));
        let script = parse_script(json!({"steps": [{"kind": "correct"}]}));
        let report = must(run_scripted_session(
            dccs(AgeBand::Preschool),
            1,
            &script,
            estimator.as_ref(),
        ));
        assert_eq!(report.assessment.method, AssessmentMethod::Fallback);
        assert_eq!(report.assessment.risk_level, RiskLevel::Low);
    }
}
