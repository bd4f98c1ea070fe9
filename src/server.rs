//! HTTP front end for the forecast cache
//!
//! Serves `/api/forecast` as HTML, JSON or JSONP depending on the `Accept`
//! header, and reports through `X-Polman-Cache-Hit` whether the forecast came
//! from memory.

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{
        header::{ACCEPT, CONTENT_TYPE, LAST_MODIFIED},
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    },
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::cache::ForecastCache;
use crate::cli::ServerConfig;
use crate::data::{normalize_place, ForecastClient, ForecastError, ForecastRecord};
use crate::sweep::SweepHandle;

/// Response header telling whether the forecast was served from memory
pub const CACHE_HIT_HEADER: &str = "x-polman-cache-hit";

/// Number of time slices returned when the client does not ask for a limit
pub const DEFAULT_LIMIT: usize = 10;

/// Errors that stop the server from starting or running
#[derive(Debug, Error)]
pub enum ServerError {
    /// The upstream HTTP client could not be built
    #[error("Failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),

    /// Binding or serving failed
    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<ForecastCache>,
}

/// Query params for the forecast endpoint
#[derive(Debug, Default, Deserialize)]
pub struct ForecastQuery {
    /// Place path, e.g. `Norway/Telemark/Sauherad/Gvarv`
    pub place: Option<String>,
    /// Legacy yr.no forecast URL, used when `place` is absent
    pub url: Option<String>,
    /// Maximum number of time slices, `DEFAULT_LIMIT` when absent
    pub limit: Option<usize>,
    /// JSONP callback name
    pub jsonp: Option<String>,
}

impl ForecastQuery {
    fn raw_place(&self) -> &str {
        [&self.place, &self.url]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .unwrap_or_default()
    }

    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

/// Representation chosen for a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Html,
    Json,
    Javascript,
}

impl Format {
    /// Concrete media types a format is served as
    fn media_types(self) -> &'static [&'static str] {
        match self {
            Self::Html => &["text/html"],
            Self::Json => &["application/json"],
            Self::Javascript => &["application/javascript", "text/javascript", "application/x-javascript"],
        }
    }

    /// Formats covered by a media range, most preferred first
    fn for_media_range(range: &str) -> &'static [Format] {
        match range.to_ascii_lowercase().as_str() {
            "*/*" => &[Self::Html, Self::Json, Self::Javascript],
            "text/*" => &[Self::Html, Self::Javascript],
            "application/*" => &[Self::Json, Self::Javascript],
            "text/html" => &[Self::Html],
            "application/json" => &[Self::Json],
            "application/javascript" | "text/javascript" | "application/x-javascript" => {
                &[Self::Javascript]
            }
            _ => &[],
        }
    }

    /// Whether every media type of this format was listed with `q=0`
    fn is_refused(self, refused: &[&str]) -> bool {
        self.media_types()
            .iter()
            .all(|t| refused.iter().any(|r| r.eq_ignore_ascii_case(t)))
    }
}

/// Pick a response format from an `Accept` header value
///
/// Media ranges are tried by descending q-value, ties in the order the client
/// listed them. A wildcard never resolves to a format whose types the client
/// refused with `q=0`. A missing or blank header selects HTML.
///
/// # Returns
/// * `Some(Format)` - The first acceptable representation
/// * `None` - If the client accepts none of them
pub fn negotiate(accept: Option<&str>) -> Option<Format> {
    let Some(accept) = accept.map(str::trim).filter(|a| !a.is_empty()) else {
        return Some(Format::Html);
    };

    let mut ranges: Vec<(f32, usize, &str)> = accept
        .split(',')
        .enumerate()
        .filter_map(|(position, part)| {
            let mut params = part.split(';');
            let range = params.next()?.trim();
            let quality = params
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            Some((quality, position, range))
        })
        .collect();

    let refused: Vec<&str> = ranges
        .iter()
        .filter(|(quality, _, _)| *quality <= 0.0)
        .map(|(_, _, range)| *range)
        .collect();
    ranges.retain(|(quality, _, _)| *quality > 0.0);

    ranges.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });

    ranges.into_iter().find_map(|(_, _, range)| {
        Format::for_media_range(range)
            .iter()
            .copied()
            .find(|format| !format.is_refused(&refused))
    })
}

/// Strip a JSONP callback name down to `[A-Za-z0-9_$.\[\]]`
pub fn sanitize_callback(raw: &str) -> Option<String> {
    let name: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.' | '[' | ']'))
        .collect();
    (!name.is_empty()).then_some(name)
}

fn error_response(error: &ForecastError) -> Response {
    (error.status_code(), error.to_string()).into_response()
}

fn render_json(record: &ForecastRecord) -> Response {
    Json(record).into_response()
}

fn render_jsonp(record: &ForecastRecord, callback: &str) -> Response {
    let body = match serde_json::to_string(record) {
        Ok(json) => json.replace('\u{2028}', "\\u2028").replace('\u{2029}', "\\u2029"),
        Err(e) => {
            warn!(error = %e, "failed to serialize forecast");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    (
        [(CONTENT_TYPE, "text/javascript; charset=utf-8")],
        format!("/**/ typeof {0} === 'function' && {0}({1});", callback, body),
    )
        .into_response()
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// String at `path` inside a pass-through block, or empty
fn field_str<'a>(value: &'a Value, path: &[&str]) -> &'a str {
    path.iter()
        .try_fold(value, |node, field| node.get(field))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// Minimal HTML table of the forecast
pub fn render_html(record: &ForecastRecord) -> String {
    let name = escape_html(record.place_name().unwrap_or("Unknown place"));
    let mut page = String::new();

    let _ = write!(
        page,
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Forecast for {name}</title>\n</head>\n<body>\n<h1>{name}</h1>\n"
    );
    page.push_str(
        "<table>\n<thead><tr><th>From</th><th>To</th><th>Weather</th><th>Temperature</th><th>Precipitation</th><th>Wind</th></tr></thead>\n<tbody>\n",
    );

    for slice in record.forecast() {
        let _ = writeln!(
            page,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}&deg;C</td><td>{}mm</td><td>{}m/s</td></tr>",
            escape_html(field_str(slice, &["from"])),
            escape_html(field_str(slice, &["to"])),
            escape_html(field_str(slice, &["symbol", "name"])),
            escape_html(field_str(slice, &["temperature", "value"])),
            escape_html(field_str(slice, &["precipitation", "value"])),
            escape_html(field_str(slice, &["windSpeed", "mps"])),
        );
    }
    page.push_str("</tbody>\n</table>\n");

    let credit_url = field_str(record.credit(), &["link", "url"]);
    let credit_text = field_str(record.credit(), &["link", "text"]);
    if !credit_text.is_empty() {
        let _ = writeln!(
            page,
            "<p class=\"credit\"><a href=\"{}\">{}</a></p>",
            escape_html(credit_url),
            escape_html(credit_text)
        );
    }

    page.push_str("</body>\n</html>\n");
    page
}

/// GET /api/forecast - Forecast for a place
async fn show_forecast(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ForecastQuery>,
) -> Response {
    let key = match normalize_place(query.raw_place()) {
        Ok(key) => key,
        Err(e) => {
            debug!(error = %e, "rejected forecast request");
            return error_response(&e);
        }
    };

    let accept = headers.get(ACCEPT).and_then(|v| v.to_str().ok());
    let Some(format) = negotiate(accept) else {
        return (
            StatusCode::NOT_ACCEPTABLE,
            "Supported formats: text/html, application/json, application/javascript",
        )
            .into_response();
    };

    let lookup = match state.cache.get_or_fetch(&key).await {
        Ok(lookup) => lookup,
        Err(e) => return error_response(&e),
    };

    let record = lookup.record.truncated(query.limit());
    let mut response = match format {
        Format::Html => Html(render_html(&record)).into_response(),
        Format::Json => render_json(&record),
        Format::Javascript => match query.jsonp.as_deref().and_then(sanitize_callback) {
            Some(callback) => render_jsonp(&record, &callback),
            None => render_json(&record),
        },
    };

    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static(CACHE_HIT_HEADER),
        HeaderValue::from_static(if lookup.from_cache { "true" } else { "false" }),
    );
    if let Ok(fetched) = HeaderValue::from_str(&record.last_modified()) {
        headers.insert(LAST_MODIFIED, fetched);
    }
    response
}

/// GET /health - Health check endpoint
async fn health_check() -> &'static str {
    "ok"
}

/// Create the HTTP router
pub fn create_router(cache: Arc<ForecastCache>) -> Router {
    let state = AppState { cache };

    // JSON and JSONP consumers live on other origins
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .expose_headers([HeaderName::from_static(CACHE_HIT_HEADER)]);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/forecast", get(show_forecast))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Run the HTTP server until Ctrl-C
pub async fn run_server(config: ServerConfig) -> Result<(), ServerError> {
    let client =
        ForecastClient::new(config.upstream.as_str(), config.timeout)?.with_keep_text(config.keep_text);
    let cache = Arc::new(ForecastCache::new(Arc::new(client), config.ttl));
    let sweep = SweepHandle::spawn(Arc::clone(&cache), config.sweep.clone());
    let app = create_router(cache);

    let listener = TcpListener::bind(config.addr).await?;
    info!(
        addr = %listener.local_addr()?,
        upstream = %config.upstream,
        ttl_secs = config.ttl.as_secs(),
        "forecast server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweep.shutdown().await;
    info!("forecast server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
}
