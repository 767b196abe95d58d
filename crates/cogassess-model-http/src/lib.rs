#![forbid(unsafe_code)]

//! HTTP JSON adapter for an external risk model service.
//!
//! The service receives the flattened feature request as a JSON `POST` body
//! and answers with an `ExternalModelResult` document. Every transport,
//! status or decoding problem surfaces as
//! [`AssessmentError::ExternalModelUnavailable`] so the caller can fall back
//! to rule-based scoring.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use cogassess_core::{AssessmentError, ExternalModelResult, ExternalRiskModel, RiskModelRequest};
use serde_json::Value;
use tracing::debug;

pub const ADAPTER_VERSION: &str = "http_json.v1";
pub const DEFAULT_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpModelConfig {
    pub url: String,
    pub timeout_ms: u64,
    pub headers: BTreeMap<String, String>,
    pub auth_bearer_token: Option<String>,
}

impl HttpModelConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            headers: BTreeMap::new(),
            auth_bearer_token: None,
        }
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Reads `url`, `timeout_ms`, `headers` and `auth_bearer_env` from a JSON
    /// parameter object.
    ///
    /// # Errors
    /// Returns [`AssessmentError::Configuration`] when `url` is missing,
    /// `headers` is not a string map, or the bearer-token variable is unset.
    pub fn from_params(params: &Value) -> Result<Self, AssessmentError> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AssessmentError::Configuration("http model requires params.url".to_string())
            })?
            .to_string();

        let timeout_ms = params
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        let mut headers = BTreeMap::new();
        if let Some(raw_headers) = params.get("headers") {
            let obj = raw_headers.as_object().ok_or_else(|| {
                AssessmentError::Configuration("params.headers must be an object".to_string())
            })?;
            for (key, value) in obj {
                let str_value = value.as_str().ok_or_else(|| {
                    AssessmentError::Configuration(format!(
                        "params.headers values must be strings, key='{key}'"
                    ))
                })?;
                headers.insert(key.clone(), str_value.to_string());
            }
        }

        let auth_bearer_token = match params.get("auth_bearer_env").and_then(Value::as_str) {
            Some(env_name) => Some(std::env::var(env_name).map_err(|_| {
                AssessmentError::Configuration(format!(
                    "missing env var '{env_name}' required by params.auth_bearer_env"
                ))
            })?),
            None => None,
        };

        let config = Self {
            url,
            timeout_ms,
            headers,
            auth_bearer_token,
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`AssessmentError::Configuration`] for an empty or non-HTTP
    /// URL or a zero timeout.
    pub fn validate(&self) -> Result<(), AssessmentError> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(AssessmentError::Configuration(format!(
                "http model url MUST start with http:// or https://, got '{}'",
                self.url
            )));
        }
        if self.timeout_ms == 0 {
            return Err(AssessmentError::Configuration(
                "http model timeout_ms MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpRiskModel {
    config: HttpModelConfig,
    agent: ureq::Agent,
}

impl HttpRiskModel {
    /// # Errors
    /// Returns [`AssessmentError::Configuration`] when `config` is invalid.
    pub fn new(config: HttpModelConfig) -> Result<Self, AssessmentError> {
        config.validate()?;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build();
        Ok(Self { config, agent })
    }

    #[must_use]
    pub fn config(&self) -> &HttpModelConfig {
        &self.config
    }
}

impl ExternalRiskModel for HttpRiskModel {
    fn model_name(&self) -> &str {
        "http_json"
    }

    fn predict(&self, request: &RiskModelRequest) -> Result<ExternalModelResult, AssessmentError> {
        let outbound_json = build_request_json(request)?;

        let mut req = self
            .agent
            .request("POST", &self.config.url)
            .set("content-type", "application/json");
        for (header, value) in &self.config.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &self.config.auth_bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        let started = Instant::now();
        let body: Value = match req.send_json(&outbound_json) {
            Ok(response) => response.into_json().map_err(|err| {
                AssessmentError::ExternalModelUnavailable(format!(
                    "response body is not JSON: {err}"
                ))
            })?,
            Err(ureq::Error::Status(code, _)) => {
                return Err(AssessmentError::ExternalModelUnavailable(format!(
                    "http status {code}"
                )));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(AssessmentError::ExternalModelUnavailable(format!(
                    "http transport failure: {err}"
                )));
            }
        };
        debug!(
            url = %self.config.url,
            latency_ms = started.elapsed().as_millis(),
            "risk model responded"
        );

        let result: ExternalModelResult = serde_json::from_value(body).map_err(|err| {
            AssessmentError::ExternalModelUnavailable(format!(
                "response does not match the model result contract: {err}"
            ))
        })?;
        result.validate()?;
        Ok(result)
    }
}

fn build_request_json(request: &RiskModelRequest) -> Result<Value, AssessmentError> {
    let mut payload = serde_json::to_value(request).map_err(|err| {
        AssessmentError::ExternalModelUnavailable(format!("failed to encode model request: {err}"))
    })?;
    if let Value::Object(fields) = &mut payload {
        fields.insert(
            "adapter_version".to_string(),
            Value::String(ADAPTER_VERSION.to_string()),
        );
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cogassess_core::{AgeBand, RiskLevel, TaskType};
    use serde_json::json;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_request() -> RiskModelRequest {
        RiskModelRequest {
            task_type: TaskType::Dccs,
            age_band: AgeBand::EarlySchool,
            features: BTreeMap::from([
                ("accuracy".to_string(), 0.85),
                ("perseverative_errors".to_string(), 3.0),
            ]),
        }
    }

    /// Serves exactly one HTTP response and hands back the raw request body.
    fn serve_once(status_line: &'static str, body: String) -> (String, JoinHandle<String>) {
        let listener = must_ok(TcpListener::bind("127.0.0.1:0"));
        let url = format!("http://{}/predict", must_ok(listener.local_addr()));

        let handle = std::thread::spawn(move || {
            let (stream, _) = must_ok(listener.accept());
            let mut reader = BufReader::new(must_ok(stream.try_clone()));
            let mut content_length = 0_usize;
            loop {
                let mut line = String::new();
                must_ok(reader.read_line(&mut line));
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = must_ok(value.trim().parse());
                    }
                }
            }
            let mut request_body = vec![0_u8; content_length];
            must_ok(reader.read_exact(&mut request_body));

            let mut stream = stream;
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            must_ok(stream.write_all(response.as_bytes()));
            must_ok(String::from_utf8(request_body))
        });

        (url, handle)
    }

    fn join(handle: JoinHandle<String>) -> String {
        match handle.join() {
            Ok(body) => body,
            Err(_) => panic!("stub server thread panicked"),
        }
    }

    #[test]
    fn posts_features_and_decodes_model_result() {
        let (url, handle) = serve_once(
            "200 OK",
            json!({
                "success": true,
                "prediction": 1,
                "probability": [0.2, 0.8],
                "confidence": 0.8,
                "risk_level": "high",
                "risk_score": 80.0
            })
            .to_string(),
        );
        let model = must_ok(HttpRiskModel::new(HttpModelConfig::new(url)));

        let result = must_ok(model.predict(&fixture_request()));
        assert_eq!(result.prediction, 1);
        assert_eq!(result.risk_level, RiskLevel::High);
        assert!((result.probability[1] - 0.8).abs() < f64::EPSILON);

        let sent: Value = must_ok(serde_json::from_str(&join(handle)));
        assert_eq!(sent["task_type"], "dccs");
        assert_eq!(sent["age_band"], "early_school");
        assert_eq!(sent["adapter_version"], ADAPTER_VERSION);
        assert_eq!(sent["features"]["perseverative_errors"], 3.0);
    }

    #[test]
    fn error_status_maps_to_unavailable() {
        let (url, handle) = serve_once(
            "503 Service Unavailable",
            json!({"error": "warming up"}).to_string(),
        );
        let model = must_ok(HttpRiskModel::new(HttpModelConfig::new(url)));

        let result = model.predict(&fixture_request());
        assert!(matches!(
            result,
            Err(AssessmentError::ExternalModelUnavailable(message)) if message.contains("503")
        ));
        join(handle);
    }

    #[test]
    fn off_contract_body_maps_to_unavailable() {
        let (url, handle) = serve_once(
            "200 OK",
            json!({"prediction": 1, "probability": [0.5, 1.5], "confidence": 0.9,
                   "risk_level": "high", "risk_score": 1.0})
            .to_string(),
        );
        let model = must_ok(HttpRiskModel::new(HttpModelConfig::new(url)));

        assert!(matches!(
            model.predict(&fixture_request()),
            Err(AssessmentError::ExternalModelUnavailable(_))
        ));
        join(handle);
    }

    #[test]
    fn refused_connection_maps_to_unavailable() {
        let listener = must_ok(TcpListener::bind("127.0.0.1:0"));
        let url = format!("http://{}/predict", must_ok(listener.local_addr()));
        drop(listener);

        let model = must_ok(HttpRiskModel::new(
            HttpModelConfig::new(url).with_timeout_ms(250),
        ));
        assert!(matches!(
            model.predict(&fixture_request()),
            Err(AssessmentError::ExternalModelUnavailable(_))
        ));
    }

    #[test]
    fn params_require_url() {
        assert!(matches!(
            HttpModelConfig::from_params(&json!({})),
            Err(AssessmentError::Configuration(_))
        ));
        assert!(matches!(
            HttpModelConfig::from_params(&json!({"url": "ftp://example.test"})),
            Err(AssessmentError::Configuration(_))
        ));

        let config = must_ok(HttpModelConfig::from_params(&json!({
            "url": "http://127.0.0.1:9/predict",
            "timeout_ms": 150,
            "headers": {"x-model": "ef-risk"}
        })));
        assert_eq!(config.timeout_ms, 150);
        assert_eq!(config.headers.get("x-model").map(String::as_str), Some("ef-risk"));
        assert_eq!(config.auth_bearer_token, None);
    }
}
