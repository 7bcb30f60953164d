use std::{borrow::Cow, sync::LazyLock, time::Duration};

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

static STRING_LITERAL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'"#).unwrap());
static UNQUOTED_KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([{,]\s*)([A-Za-z_$][\w$]*)\s*:").unwrap());
static TRAILING_COMMA_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").unwrap());

/// Parses a JavaScript object literal as found in inline player scripts.
///
/// Handles the usual deviations from JSON: unquoted keys, single-quoted
/// strings and trailing commas. String contents are never rewritten. Returns
/// `None` if the result still isn't an object.
#[must_use]
pub fn parse_js_object(source: &str) -> Option<Map<String, Value>> {
    if let Ok(Value::Object(map)) = serde_json::from_str(source) {
        return Some(map);
    }

    let mut normalized = String::with_capacity(source.len());
    let mut code_start = 0;
    for literal in STRING_LITERAL_REGEX.find_iter(source) {
        normalized.push_str(&normalize_code(&source[code_start..literal.start()]));
        normalized.push_str(&normalize_string(literal.as_str()));
        code_start = literal.end();
    }
    normalized.push_str(&normalize_code(&source[code_start..]));

    match serde_json::from_str(&normalized) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn normalize_code(code: &str) -> String {
    let code = UNQUOTED_KEY_REGEX.replace_all(code, "$1\"$2\":");
    TRAILING_COMMA_REGEX.replace_all(&code, "$1").into_owned()
}

fn normalize_string(literal: &str) -> Cow<'_, str> {
    match literal.strip_prefix('\'').and_then(|l| l.strip_suffix('\'')) {
        Some(inner) => format!("\"{}\"", inner.replace("\\'", "'").replace('"', "\\\"")).into(),
        None => literal.into(),
    }
}

/// Builds the HTTP client shared by every request
///
/// # Panics
/// When the TLS backend can't be initialised
#[must_use]
pub fn init_http_client(timeout: Duration) -> reqwest::Client {
    let mut headers = HeaderMap::new();
    headers.insert(
        "User-Agent",
        HeaderValue::from_str(&format!(
            "{}/{} (+{})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_REPOSITORY")
        ))
        .unwrap(),
    );

    reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(10).min(timeout))
        .timeout(timeout)
        .build()
        .expect("Unable to build HTTP client")
}

/// Spawn a task that watches for CTRL + C signal and cancels a [`CancellationToken`] when caught
pub fn spawn_ct_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Caught CTRL+C signal!");
        ct.cancel();
    });
}
