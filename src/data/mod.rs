//! Forecast data model and upstream access
//!
//! This module contains the normalized forecast record shared between the
//! cache and the HTTP front end, the error type for the fetch pipeline, and
//! the place-key convention used to address yr.no forecasts.

pub mod forecast;
pub mod xml;

pub use forecast::{Fetcher, ForecastClient, DEFAULT_TIMEOUT, DEFAULT_UPSTREAM_BASE};

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Example shown to clients that forget the place parameter
pub const PLACE_EXAMPLE: &str = "Norway/Telemark/Sauherad/Gvarv";

/// Errors produced by the fetch-parse-cache pipeline
///
/// `Clone` so that one failed in-flight fetch can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForecastError {
    /// The caller supplied no usable place key
    #[error("{0}")]
    Validation(String),

    /// The upstream could not be reached or answered with an error status
    #[error("Could not retrieve forecast for '{key}': {message}")]
    Upstream { key: String, message: String },

    /// The upstream body was not a usable forecast document
    #[error("Could not parse forecast for '{key}': {message}")]
    Parse { key: String, message: String },
}

impl ForecastError {
    pub fn upstream(key: &str, message: impl Into<String>) -> Self {
        Self::Upstream {
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub fn parse(key: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// HTTP status the front end answers with for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Parse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A normalized yr.no forecast
///
/// Built once per successful fetch and never modified afterwards; the cache
/// hands out `Arc<ForecastRecord>` so every reader sees the same value.
/// `location`, `credit`, `meta` and `sun` are passed through from the
/// upstream document as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastRecord {
    location: Value,
    credit: Value,
    meta: Value,
    sun: Value,
    /// Time slices in upstream (chronological) order
    forecast: Vec<Value>,
    /// Textual forecast block, when kept
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<Value>,
    #[serde(skip_serializing)]
    fetched_at: DateTime<Utc>,
}

impl ForecastRecord {
    pub fn new(location: Value, credit: Value, meta: Value, sun: Value, forecast: Vec<Value>) -> Self {
        Self {
            location,
            credit,
            meta,
            sun,
            forecast,
            text: None,
            fetched_at: Utc::now(),
        }
    }

    /// Attach the textual forecast block
    pub fn with_text(mut self, text: Value) -> Self {
        self.text = Some(text);
        self
    }

    pub fn location(&self) -> &Value {
        &self.location
    }

    pub fn credit(&self) -> &Value {
        &self.credit
    }

    pub fn meta(&self) -> &Value {
        &self.meta
    }

    pub fn sun(&self) -> &Value {
        &self.sun
    }

    pub fn forecast(&self) -> &[Value] {
        &self.forecast
    }

    pub fn text(&self) -> Option<&Value> {
        self.text.as_ref()
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Fetch time as an HTTP date, for `Last-Modified`
    pub fn last_modified(&self) -> String {
        self.fetched_at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }

    /// Place name from the location block, if present
    pub fn place_name(&self) -> Option<&str> {
        self.location.get("name").and_then(Value::as_str)
    }

    /// A copy limited to the first `limit` time slices
    pub fn truncated(&self, limit: usize) -> Self {
        let mut copy = self.clone();
        copy.forecast.truncate(limit);
        copy
    }
}

/// Normalize a user-supplied place reference into a cache key
///
/// Accepts a bare place path (`Norway/Telemark/Sauherad/Gvarv`), a `/place/`
/// path, or a full or host-relative yr.no forecast URL, and reduces all of
/// them to the bare path with no leading or trailing slash.
///
/// # Returns
/// * `Ok(String)` - The normalized place path
/// * `Err(ForecastError::Validation)` - If nothing usable remains
pub fn normalize_place(input: &str) -> Result<String, ForecastError> {
    let mut rest = input.trim();

    for scheme in ["https://", "http://"] {
        let matches = rest
            .get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme));
        if matches {
            rest = &rest[scheme.len()..];
        }
    }

    // Drop a host part such as `www.yr.no`
    if let Some(first) = rest.split('/').next() {
        if first.contains('.') {
            rest = &rest[first.len()..];
        }
    }

    let rest = rest.split(['?', '#']).next().unwrap_or_default();
    let rest = rest.trim_matches('/');
    let rest = rest.strip_suffix("forecast.xml").unwrap_or(rest);
    let rest = rest.trim_end_matches('/');
    let rest = rest.strip_prefix("place/").unwrap_or(rest);

    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() || rest == "place" {
        return Err(ForecastError::Validation(format!(
            "Missing place to forecast. Example: ?place={}",
            PLACE_EXAMPLE
        )));
    }

    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record() -> ForecastRecord {
        ForecastRecord::new(
            json!({"name": "Gvarv", "country": "Norway"}),
            json!({"link": {"text": "Weather forecast from yr.no"}}),
            json!({"lastupdate": "2013-05-01T10:00:00"}),
            json!({"rise": "2013-05-01T05:12:00", "set": "2013-05-01T21:14:00"}),
            vec![json!({"from": "1"}), json!({"from": "2"}), json!({"from": "3"})],
        )
    }

    #[test]
    fn test_normalize_bare_place_path() {
        assert_eq!(
            normalize_place("Norway/Telemark/Sauherad/Gvarv").unwrap(),
            "Norway/Telemark/Sauherad/Gvarv"
        );
        assert_eq!(
            normalize_place(" /Norway/Telemark/Sauherad/Gvarv/ ").unwrap(),
            "Norway/Telemark/Sauherad/Gvarv"
        );
    }

    #[test]
    fn test_normalize_full_url() {
        assert_eq!(
            normalize_place("http://www.yr.no/place/Norway/Telemark/Sauherad/Gvarv/forecast.xml")
                .unwrap(),
            "Norway/Telemark/Sauherad/Gvarv"
        );
        assert_eq!(
            normalize_place("HTTPS://www.yr.no/place/Sweden/Stockholm/Stockholm/").unwrap(),
            "Sweden/Stockholm/Stockholm"
        );
    }

    #[test]
    fn test_normalize_host_relative_url() {
        assert_eq!(
            normalize_place("www.yr.no/place/Norway/Oslo/Oslo/Oslo/forecast.xml").unwrap(),
            "Norway/Oslo/Oslo/Oslo"
        );
        assert_eq!(
            normalize_place("/place/Norway/Oslo/Oslo/Oslo").unwrap(),
            "Norway/Oslo/Oslo/Oslo"
        );
    }

    #[test]
    fn test_normalize_collapses_duplicate_slashes() {
        assert_eq!(normalize_place("Norway//Oslo").unwrap(), "Norway/Oslo");
    }

    #[test]
    fn test_normalize_rejects_empty_input() {
        for input in ["", "   ", "/", "http://www.yr.no/", "place/", "forecast.xml"] {
            let result = normalize_place(input);
            assert!(
                matches!(result, Err(ForecastError::Validation(_))),
                "Expected validation error for {:?}, got {:?}",
                input,
                result
            );
        }
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ForecastError::Validation("x".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ForecastError::upstream("k", "down").status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ForecastError::parse("k", "bad").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_upstream_error_mentions_key() {
        let err = ForecastError::upstream("Norway/Oslo", "status 404");
        assert!(err.to_string().contains("Norway/Oslo"));
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_record_serializes_public_shape() {
        let value = serde_json::to_value(sample_record()).unwrap();
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();

        assert_eq!(keys.len(), 5);
        assert_eq!(value["location"]["name"], "Gvarv");
        assert_eq!(value["forecast"].as_array().unwrap().len(), 3);
        assert!(value.get("text").is_none());
        assert!(value.get("fetched_at").is_none());
    }

    #[test]
    fn test_record_with_text_serializes_text() {
        let record = sample_record().with_text(json!({"location": {"name": "Telemark"}}));
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["text"]["location"]["name"], "Telemark");
    }

    #[test]
    fn test_last_modified_is_http_date_of_fetch() {
        let record = sample_record();
        let header = record.last_modified();

        assert!(header.ends_with(" GMT"));
        let parsed = DateTime::parse_from_rfc2822(&header.replace("GMT", "+0000")).unwrap();
        assert_eq!(parsed.timestamp(), record.fetched_at().timestamp());
        assert_eq!(record.truncated(1).last_modified(), header);
    }

    #[test]
    fn test_truncated_keeps_order_and_leaves_original() {
        let record = sample_record();
        let short = record.truncated(2);

        assert_eq!(short.forecast(), &[json!({"from": "1"}), json!({"from": "2"})]);
        assert_eq!(record.forecast().len(), 3);
        assert_eq!(record.truncated(10).forecast().len(), 3);
    }

    #[test]
    fn test_place_name() {
        assert_eq!(sample_record().place_name(), Some("Gvarv"));
    }
}
