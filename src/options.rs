//! Per-request simulation directives read from the query string.
//!
//! - `_delay=<ms>`: wait before answering
//! - `_error[=<status>]`: answer with an error status (500 when no code is given)
//! - `_mock[=<flag>]`: skip the backend and answer from fixtures

use std::collections::HashMap;
use std::ops::RangeInclusive;

pub const DELAY_PARAM: &str = "_delay";
pub const ERROR_PARAM: &str = "_error";
pub const MOCK_PARAM: &str = "_mock";

/// Status used when `_error` carries no usable code.
pub const DEFAULT_ERROR_STATUS: u16 = 500;

/// Codes `_error` may inject. Informational 1xx codes cannot end an HTTP
/// exchange, so they fall back to [`DEFAULT_ERROR_STATUS`].
pub const INJECTABLE_STATUS: RangeInclusive<u16> = 200..=999;

/// Requested error mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    /// Error requested without a status code
    Default,
    /// Error requested with an explicit status code
    Status(u16),
}

impl ErrorMode {
    /// The HTTP status to answer with.
    pub fn status(&self) -> u16 {
        match self {
            ErrorMode::Status(code) if INJECTABLE_STATUS.contains(code) => *code,
            _ => DEFAULT_ERROR_STATUS,
        }
    }
}

/// Resolved simulation settings for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestOption {
    pub delay_ms: u64,
    pub error: Option<ErrorMode>,
    pub force_mock: bool,
}

/// Values found in a query string. `None` leaves the default untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptionOverrides {
    pub delay_ms: Option<u64>,
    pub error: Option<ErrorMode>,
    pub force_mock: Option<bool>,
}

/// Parse simulation directives from a request URL.
pub fn parse(url: &str) -> OptionOverrides {
    let query = url.split_once('?').map(|(_, q)| q).unwrap_or("");
    let params = parse_query_string(query);
    let mut overrides = OptionOverrides::default();

    if let Some(value) = params.get(DELAY_PARAM) {
        overrides.delay_ms = value.trim().parse::<u64>().ok();
    }

    if let Some(value) = params.get(ERROR_PARAM) {
        overrides.error = Some(match value.trim().parse::<u16>() {
            Ok(code) => ErrorMode::Status(code),
            Err(_) => ErrorMode::Default,
        });
    }

    if let Some(value) = params.get(MOCK_PARAM) {
        overrides.force_mock = Some(!matches!(value.as_str(), "false" | "0"));
    }

    overrides
}

/// Overlay parsed values on the defaults, field by field.
pub fn merge(defaults: &RequestOption, overrides: OptionOverrides) -> RequestOption {
    RequestOption {
        delay_ms: overrides.delay_ms.unwrap_or(defaults.delay_ms),
        error: overrides.error.or(defaults.error),
        force_mock: overrides.force_mock.unwrap_or(defaults.force_mock),
    }
}

/// Parse a query string into key-value pairs. The first occurrence of a key wins.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        let (key, value) = match part.split_once('=') {
            Some((key, value)) => (urlencoding_decode(key), urlencoding_decode(value)),
            None => (urlencoding_decode(part), String::new()),
        };
        params.entry(key).or_insert(value);
    }

    params
}

/// Percent and `+` decoding. Invalid escapes are kept as written.
fn urlencoding_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = s
                    .get(i + 1..i + 3)
                    .filter(|h| h.bytes().all(|b| b.is_ascii_hexdigit()))
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(byte) => {
                        decoded.push(byte);
                        i += 3;
                        continue;
                    }
                    None => decoded.push(b'%'),
                }
            }
            b'+' => decoded.push(b' '),
            b => decoded.push(b),
        }
        i += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}
