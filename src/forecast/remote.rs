use crate::forecast::{ForecastError, ForecastSource, ForecastTable, format_date};
use serde::Deserialize;
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use time::Date;
use tracing::{debug, warn};

/// Forecast source backed by the prediction web service.
///
/// Requests `GET {base_url}/api/v1/predictions/{feed_key}/{from_date}/{days}/{interval}`.
pub struct HttpForecastSource {
    client: reqwest::blocking::Client,
    base_url: String,
    feed_key: String,
    interval_minutes: u32,
}

impl HttpForecastSource {
    pub fn new(
        base_url: &str,
        feed_key: &str,
        interval_minutes: u32,
        timeout: Duration,
    ) -> Result<Self, ForecastError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ForecastError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            feed_key: feed_key.to_string(),
            interval_minutes,
        })
    }

    pub fn request_url(&self, from_date: Date, horizon_days: u32) -> Result<String, ForecastError> {
        Ok(format!(
            "{}/api/v1/predictions/{}/{}/{}/{}",
            self.base_url,
            self.feed_key,
            format_date(from_date)?,
            horizon_days,
            self.interval_minutes
        ))
    }
}

impl fmt::Debug for HttpForecastSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpForecastSource")
            .field("base_url", &self.base_url)
            .field("feed_key", &self.feed_key)
            .field("interval_minutes", &self.interval_minutes)
            .finish()
    }
}

impl ForecastSource for HttpForecastSource {
    fn fetch(&mut self, from_date: Date, horizon_days: u32) -> Result<ForecastTable, ForecastError> {
        let url = self.request_url(from_date, horizon_days)?;
        debug!(url = %url, "Requesting forecast");

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| ForecastError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ForecastError::Http(status.as_u16()));
        }
        let body = response
            .text()
            .map_err(|err| ForecastError::Transport(err.to_string()))?;

        let table = parse_predictions(&body)?;
        if table.is_empty() {
            warn!(
                feed_key = %self.feed_key,
                "Forecast service has no model for feed, feedback will be unavailable"
            );
        }
        Ok(table)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PredictionsBody {
    Forecast(PredictionsResponse),
    Empty(Vec<serde_json::Value>),
}

#[derive(Debug, Deserialize)]
struct PredictionsResponse {
    timestamps: Vec<String>,
    predictions: Vec<Option<f64>>,
    predictions_lower_bound: Vec<Option<f64>>,
    predictions_upper_bound: Vec<Option<f64>>,
}

const NON_FINITE_TOKENS: [&str; 3] = ["-Infinity", "Infinity", "NaN"];

/// The service serialises missing bounds as bare `NaN` (and may emit
/// `Infinity`), which is not JSON. Rewrite those tokens outside string
/// literals to `null`.
fn replace_non_finite(body: &str) -> Cow<'_, str> {
    if !body.contains("NaN") && !body.contains("Infinity") {
        return Cow::Borrowed(body);
    }
    let bytes = body.as_bytes();
    let mut out = String::with_capacity(body.len());
    let mut copied = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut index = 0;
    while index < bytes.len() {
        let byte = bytes[index];
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            index += 1;
            continue;
        }
        if byte == b'"' {
            in_string = true;
            index += 1;
            continue;
        }
        match NON_FINITE_TOKENS
            .iter()
            .find(|token| bytes[index..].starts_with(token.as_bytes()))
        {
            Some(token) => {
                out.push_str(&body[copied..index]);
                out.push_str("null");
                index += token.len();
                copied = index;
            }
            None => index += 1,
        }
    }
    out.push_str(&body[copied..]);
    Cow::Owned(out)
}

fn non_finite_as_nan(column: &[Option<f64>]) -> Vec<f64> {
    column
        .iter()
        .map(|value| value.unwrap_or(f64::NAN))
        .collect()
}

/// Decode a predictions response. An empty JSON array means the service has no
/// model for the feed and yields an empty table.
pub fn parse_predictions(body: &str) -> Result<ForecastTable, ForecastError> {
    let body = replace_non_finite(body);
    let parsed: PredictionsBody =
        serde_json::from_str(&body).map_err(|err| ForecastError::Decode(err.to_string()))?;

    match parsed {
        PredictionsBody::Forecast(response) => ForecastTable::from_columns(
            &response.timestamps,
            &non_finite_as_nan(&response.predictions),
            &non_finite_as_nan(&response.predictions_lower_bound),
            &non_finite_as_nan(&response.predictions_upper_bound),
        ),
        PredictionsBody::Empty(values) if values.is_empty() => Ok(ForecastTable::empty()),
        PredictionsBody::Empty(values) => Err(ForecastError::Decode(format!(
            "unexpected array with {} elements",
            values.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::ForecastRange;
    use crate::forecast::feedback::{FeedbackCode, classify};
    use time::macros::{date, datetime};

    #[test]
    fn request_url_follows_service_route() -> Result<(), ForecastError> {
        let source = HttpForecastSource::new(
            "http://localhost/",
            "aula-studio",
            1,
            Duration::from_secs(5),
        )?;

        let url = source.request_url(date!(2024-05-01), 7)?;

        assert_eq!(
            url,
            "http://localhost/api/v1/predictions/aula-studio/2024-05-01/7/1"
        );
        Ok(())
    }

    #[test]
    fn predictions_body_becomes_table() -> Result<(), ForecastError> {
        let body = r#"{
            "feed": "Aula studio",
            "periods": 7,
            "timestamps": ["2024-05-01 00:01:00", "2024-05-01 00:02:00", "2024-05-01 00:02:00"],
            "predictions": [3.2, 4.0, 4.1],
            "predictions_lower_bound": [1.0, 2.0, 1.5],
            "predictions_upper_bound": [5.5, 6.0, 6.5]
        }"#;

        let table = parse_predictions(body)?;

        assert_eq!(table.len(), 3);
        assert_eq!(
            table.lookup(datetime!(2024-05-01 00:02:30)),
            Some(ForecastRange {
                lower: 1.5,
                upper: 6.5
            })
        );
        Ok(())
    }

    #[test]
    fn nan_bounds_load_as_unavailable_minutes() -> Result<(), ForecastError> {
        let body = r#"{
            "timestamps": ["2024-05-01 00:01:00", "2024-05-01 00:02:00"],
            "predictions": [3.0, 4.0],
            "predictions_lower_bound": [1.0, NaN],
            "predictions_upper_bound": [5.0, Infinity]
        }"#;

        let table = parse_predictions(body)?;

        assert_eq!(table.len(), 2);
        let missing = table.lookup(datetime!(2024-05-01 00:02));
        assert!(missing.is_some_and(|range| range.lower.is_nan()));
        assert_eq!(classify(4, missing), FeedbackCode::Unavailable);
        assert_eq!(
            classify(4, table.lookup(datetime!(2024-05-01 00:01))),
            FeedbackCode::InRange
        );
        Ok(())
    }

    #[test]
    fn non_finite_tokens_inside_strings_are_kept() {
        let body = r#"{"feed": "NaN \"Infinity\" room", "value": -Infinity}"#;

        assert_eq!(
            replace_non_finite(body),
            r#"{"feed": "NaN \"Infinity\" room", "value": null}"#
        );
    }

    #[test]
    fn empty_array_means_no_forecast() -> Result<(), ForecastError> {
        let table = parse_predictions("[]")?;

        assert!(table.is_empty());
        Ok(())
    }

    #[test]
    fn missing_columns_fail_to_decode() {
        let result = parse_predictions(r#"{"timestamps": []}"#);

        assert!(matches!(result, Err(ForecastError::Decode(_))));
    }

    #[test]
    fn uneven_columns_are_rejected() {
        let body = r#"{
            "timestamps": ["2024-05-01 00:01:00"],
            "predictions": [3.2, 4.0],
            "predictions_lower_bound": [1.0],
            "predictions_upper_bound": [5.5]
        }"#;

        let result = parse_predictions(body);

        assert!(matches!(result, Err(ForecastError::ColumnLength)));
    }

    #[test]
    fn unreachable_service_is_a_transport_error() -> Result<(), ForecastError> {
        // Port 9 (discard) on localhost is closed in test environments.
        let mut source =
            HttpForecastSource::new("http://127.0.0.1:9", "feed", 1, Duration::from_millis(500))?;

        let result = source.fetch(date!(2024-05-01), 7);

        assert!(matches!(result, Err(ForecastError::Transport(_))));
        Ok(())
    }
}
