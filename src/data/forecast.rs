//! yr.no forecast client
//!
//! This module fetches `forecast.xml` documents from yr.no and normalizes them
//! into [`ForecastRecord`]s.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::debug;

use super::xml::parse_document;
use super::{ForecastError, ForecastRecord};

/// Base URL of the yr.no web service
pub const DEFAULT_UPSTREAM_BASE: &str = "https://www.yr.no";

/// Upper bound for a single upstream request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const USER_AGENT: &str = concat!("polman/", env!("CARGO_PKG_VERSION"));

/// Source of forecast records for the cache
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch and normalize the forecast for a place key
    async fn fetch(&self, key: &str) -> Result<ForecastRecord, ForecastError>;
}

/// Client for fetching forecast documents from yr.no
#[derive(Debug, Clone)]
pub struct ForecastClient {
    client: Client,
    base_url: String,
    keep_text: bool,
}

impl ForecastClient {
    /// Create a new ForecastClient with a bounded request timeout
    ///
    /// # Arguments
    /// * `base_url` - Upstream base, e.g. `https://www.yr.no`
    /// * `timeout` - Limit for connecting, sending and reading one response
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self::with_client(client, base_url))
    }

    /// Create a new ForecastClient with a custom HTTP client
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            keep_text: false,
        }
    }

    /// Keep the textual forecast block in fetched records
    pub fn with_keep_text(mut self, keep_text: bool) -> Self {
        self.keep_text = keep_text;
        self
    }

    /// Upstream URL of the forecast document for a place key
    pub fn forecast_url(&self, key: &str) -> String {
        format!("{}/place/{}/forecast.xml", self.base_url, key)
    }
}

#[async_trait]
impl Fetcher for ForecastClient {
    async fn fetch(&self, key: &str) -> Result<ForecastRecord, ForecastError> {
        let url = self.forecast_url(key);
        debug!(key, %url, "fetching forecast from upstream");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(key, &e))?;

        // Checked before touching the body so a failing upstream cannot stall us
        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(ForecastError::upstream(
                key,
                format!("upstream answered {}, are you sure this is a valid place?", status),
            ));
        }

        let body = response.text().await.map_err(|e| transport_error(key, &e))?;
        let document = parse_document(&body).map_err(|e| ForecastError::parse(key, e.to_string()))?;

        normalize_document(key, document, self.keep_text)
    }
}

fn transport_error(key: &str, error: &reqwest::Error) -> ForecastError {
    if error.is_timeout() {
        ForecastError::upstream(key, "request to upstream timed out")
    } else {
        ForecastError::upstream(key, format!("request to upstream failed: {}", error))
    }
}

/// Turn a parsed yr.no document into a ForecastRecord
///
/// The parser leaves a lone `<time>` element as a scalar, so the tabular
/// entries are coerced into a sequence here. `forecast.text` is dropped
/// unless `keep_text` is set.
pub fn normalize_document(
    key: &str,
    document: Value,
    keep_text: bool,
) -> Result<ForecastRecord, ForecastError> {
    let Value::Object(mut document) = document else {
        return Err(ForecastError::parse(key, "document is not an element tree"));
    };

    if document.contains_key("error") {
        return Err(ForecastError::parse(key, "upstream returned an error document"));
    }

    let mut weatherdata = take_object(&mut document, "weatherdata")
        .ok_or_else(|| ForecastError::parse(key, "missing <weatherdata> element"))?;

    if weatherdata.contains_key("error") {
        return Err(ForecastError::parse(key, "upstream returned an error document"));
    }

    let mut forecast = take_object(&mut weatherdata, "forecast")
        .ok_or_else(|| ForecastError::parse(key, "missing <forecast> element"))?;

    let times = match forecast.remove("tabular") {
        Some(Value::Object(mut tabular)) => into_sequence(tabular.remove("time")),
        // `<tabular/>` parses to an empty string
        Some(Value::String(_)) => Vec::new(),
        _ => return Err(ForecastError::parse(key, "missing <tabular> element")),
    };

    let mut take = |field: &str| weatherdata.remove(field).unwrap_or(Value::Null);
    let mut record = ForecastRecord::new(
        take("location"),
        take("credit"),
        take("meta"),
        take("sun"),
        times,
    );

    if keep_text {
        if let Some(text) = forecast.remove("text") {
            record = record.with_text(text);
        }
    }

    debug!(key, entries = record.forecast().len(), "normalized forecast document");
    Ok(record)
}

fn take_object(fields: &mut Map<String, Value>, name: &str) -> Option<Map<String, Value>> {
    match fields.remove(name) {
        Some(Value::Object(object)) => Some(object),
        _ => None,
    }
}

fn into_sequence(value: Option<Value>) -> Vec<Value> {
    match value {
        None => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(single) => vec![single],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GVARV_XML: &str = include_str!("../../tests/fixtures/gvarv.xml");
    const GVARV_KEY: &str = "Norway/Telemark/Sauherad/Gvarv";

    const SINGLE_TIME_XML: &str = r#"<weatherdata>
        <location><name>Lonely</name></location>
        <forecast>
            <tabular>
                <time from="2013-05-01T12:00:00" to="2013-05-01T18:00:00">
                    <temperature unit="celsius" value="7" />
                </time>
            </tabular>
        </forecast>
    </weatherdata>"#;

    fn parse(xml: &str) -> Value {
        parse_document(xml).expect("Failed to parse fixture")
    }

    async fn client_for(server: &MockServer) -> ForecastClient {
        ForecastClient::new(server.uri(), Duration::from_secs(2)).expect("Failed to build client")
    }

    #[test]
    fn test_normalize_fixture() {
        let record = normalize_document(GVARV_KEY, parse(GVARV_XML), true).unwrap();

        assert_eq!(record.place_name(), Some("Gvarv"));
        assert_eq!(record.forecast().len(), 10);
        assert_eq!(record.meta()["lastupdate"], "2013-05-01T10:26:00");
        assert_eq!(record.sun()["rise"], "2013-05-01T05:19:32");
        assert_eq!(record.credit()["link"]["url"], "http://www.yr.no/place/Norway/Telemark/Sauherad/Gvarv/");
        assert!(record.text().is_some());
    }

    #[test]
    fn test_normalize_preserves_time_order() {
        let record = normalize_document(GVARV_KEY, parse(GVARV_XML), false).unwrap();

        let starts: Vec<&str> = record
            .forecast()
            .iter()
            .filter_map(|t| t["from"].as_str())
            .collect();
        let mut sorted = starts.clone();
        sorted.sort();

        assert_eq!(starts.len(), 10);
        assert_eq!(starts, sorted);
        assert_eq!(starts[0], "2013-05-01T12:00:00");
        assert_eq!(starts[9], "2013-05-03T18:00:00");
    }

    #[test]
    fn test_normalize_single_time_is_sequence() {
        let record = normalize_document("Lonely", parse(SINGLE_TIME_XML), false).unwrap();

        assert_eq!(record.forecast().len(), 1);
        assert_eq!(record.forecast()[0]["temperature"]["value"], "7");
    }

    #[test]
    fn test_normalize_drops_text_by_default() {
        let record = normalize_document(GVARV_KEY, parse(GVARV_XML), false).unwrap();

        assert!(record.text().is_none());
        let value = serde_json::to_value(&record).unwrap();
        let mut keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["credit", "forecast", "location", "meta", "sun"]);
        assert_eq!(record.forecast().len(), 10);
    }

    #[test]
    fn test_normalize_missing_blocks_are_null() {
        let record = normalize_document("Lonely", parse(SINGLE_TIME_XML), false).unwrap();

        assert_eq!(record.credit(), &Value::Null);
        assert_eq!(record.sun(), &Value::Null);
    }

    #[test]
    fn test_normalize_empty_tabular() {
        let xml = "<weatherdata><forecast><tabular/></forecast></weatherdata>";
        let record = normalize_document("Empty", parse(xml), false).unwrap();

        assert!(record.forecast().is_empty());
    }

    #[test]
    fn test_normalize_error_document() {
        let result = normalize_document("Nowhere", parse("<error><message>Unknown place</message></error>"), false);

        match result {
            Err(ForecastError::Parse { key, .. }) => assert_eq!(key, "Nowhere"),
            other => panic!("Expected Parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_normalize_nested_error_field() {
        let xml = "<weatherdata><error>Service unavailable</error></weatherdata>";
        let result = normalize_document("Nowhere", parse(xml), false);

        assert!(matches!(result, Err(ForecastError::Parse { .. })));
    }

    #[test]
    fn test_normalize_missing_forecast() {
        let result = normalize_document("x", json!({"weatherdata": {"location": {}}}), false);
        assert!(matches!(result, Err(ForecastError::Parse { .. })));

        let result = normalize_document("x", json!({"other": {}}), false);
        assert!(matches!(result, Err(ForecastError::Parse { .. })));
    }

    #[test]
    fn test_forecast_url() {
        let client = ForecastClient::with_client(Client::new(), "https://www.yr.no/");

        assert_eq!(
            client.forecast_url(GVARV_KEY),
            "https://www.yr.no/place/Norway/Telemark/Sauherad/Gvarv/forecast.xml"
        );
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/place/Norway/Telemark/Sauherad/Gvarv/forecast.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(GVARV_XML))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server).await;
        let record = client.fetch(GVARV_KEY).await.unwrap();

        assert_eq!(record.place_name(), Some("Gvarv"));
        assert_eq!(record.forecast().len(), 10);
        assert!(record.text().is_none());
    }

    #[tokio::test]
    async fn test_fetch_keep_text() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(GVARV_XML))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server).await.with_keep_text(true);
        let record = client.fetch(GVARV_KEY).await.unwrap();

        assert!(record.text().is_some());
    }

    #[tokio::test]
    async fn test_fetch_not_found_is_upstream_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("<html>Not found</html>"))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server).await;
        let err = client.fetch("Norway/Nowhere").await.unwrap_err();

        match &err {
            ForecastError::Upstream { key, message } => {
                assert_eq!(key, "Norway/Nowhere");
                assert!(message.contains("404"));
            }
            other => panic!("Expected Upstream error, got {:?}", other),
        }
        assert!(err.to_string().contains("Norway/Nowhere"));
    }

    #[tokio::test]
    async fn test_fetch_server_error_is_upstream_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server).await;
        let result = client.fetch(GVARV_KEY).await;

        assert!(matches!(result, Err(ForecastError::Upstream { .. })));
    }

    #[tokio::test]
    async fn test_fetch_error_body_is_parse_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("<error><message>No such place</message></error>"),
            )
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server).await;
        let result = client.fetch(GVARV_KEY).await;

        assert!(matches!(result, Err(ForecastError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_fetch_malformed_body_is_parse_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<weatherdata><forecast>"))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server).await;
        let result = client.fetch(GVARV_KEY).await;

        assert!(matches!(result, Err(ForecastError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_upstream_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(GVARV_XML)
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&mock_server)
            .await;

        let client = ForecastClient::new(mock_server.uri(), Duration::from_millis(50)).unwrap();
        let err = client.fetch(GVARV_KEY).await.unwrap_err();

        match err {
            ForecastError::Upstream { message, .. } => assert!(message.contains("timed out")),
            other => panic!("Expected Upstream timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_upstream_error() {
        // Port 9 (discard) is not expected to be listening on loopback
        let client = ForecastClient::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let result = client.fetch(GVARV_KEY).await;

        assert!(matches!(result, Err(ForecastError::Upstream { .. })));
    }
}
