//! Locale-independent text rendering for stored values.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Stored stop time of a row that has not stopped yet.
pub const OPEN_ENDED_TIMESTAMP: &str = "0001-01-01 00:00:00.000000";

/// Separator used for metric values and monitor headers.
pub const LIST_SEPARATOR: &str = "; ";

/// Name of the reserved first monitor header column.
pub const TIMESTAMP_HEADER: &str = "Timestamp";

/// Render a UTC epoch-millisecond timestamp as `YYYY-MM-DD HH:MM:SS.ffffff`.
///
/// Out-of-range values clamp to the Unix epoch.
pub fn format_timestamp_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .format("%Y-%m-%d %H:%M:%S%.6f")
        .to_string()
}

/// Render a decimal with `.` as separator and without exponent notation.
pub fn render_decimal(value: f64) -> String {
    if value.is_finite() {
        // Display for f64 never uses exponent notation and ignores the host locale.
        value.to_string()
    } else {
        "0".to_string()
    }
}

/// Render one metric value. `null` becomes `0`.
pub fn render_metric(value: &Value) -> String {
    match value {
        Value::Null => "0".to_string(),
        Value::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                render_decimal(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render a row of metric values joined by [`LIST_SEPARATOR`].
pub fn render_metric_row(values: &[Value]) -> String {
    values
        .iter()
        .map(render_metric)
        .collect::<Vec<_>>()
        .join(LIST_SEPARATOR)
}

/// Monitor header row with the reserved timestamp column first.
pub fn render_monitor_headers(headers: &[String]) -> String {
    std::iter::once(TIMESTAMP_HEADER)
        .chain(headers.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(LIST_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn decimals_use_a_dot_separator() {
        assert_eq!(render_decimal(12.5), "12.5");
        assert_eq!(render_decimal(-0.25), "-0.25");
        assert_eq!(render_decimal(3.0), "3");
    }

    #[test]
    fn decimals_never_use_exponent_notation() {
        assert_eq!(render_decimal(1e21), "1000000000000000000000");
        assert_eq!(render_decimal(1e-7), "0.0000001");
    }

    #[test]
    fn non_finite_decimals_render_as_zero() {
        assert_eq!(render_decimal(f64::NAN), "0");
        assert_eq!(render_decimal(f64::INFINITY), "0");
    }

    #[test]
    fn metric_row_renders_nulls_as_zero() {
        let values = vec![json!(12.5), json!(null), json!(7), json!("n/a"), json!(true)];
        assert_eq!(render_metric_row(&values), "12.5; 0; 7; n/a; 1");
    }

    #[test]
    fn monitor_headers_reserve_timestamp_column() {
        let headers = vec!["CPU".to_string(), "Memory".to_string()];
        assert_eq!(render_monitor_headers(&headers), "Timestamp; CPU; Memory");
        assert_eq!(render_monitor_headers(&[]), "Timestamp");
    }

    #[test]
    fn timestamps_are_utc_with_microseconds() {
        assert_eq!(format_timestamp_ms(0), "1970-01-01 00:00:00.000000");
        assert_eq!(format_timestamp_ms(1_500_000_000_123), "2017-07-14 02:40:00.123000");
    }

    #[test]
    fn out_of_range_timestamps_clamp_to_epoch() {
        assert_eq!(format_timestamp_ms(i64::MAX), "1970-01-01 00:00:00.000000");
    }

    proptest! {
        #[test]
        fn rendered_decimals_parse_back(v in -1.0e12f64..1.0e12f64) {
            let text = render_decimal(v);
            prop_assert!(!text.contains(','));
            prop_assert!(!text.contains('e'));
            prop_assert_eq!(text.parse::<f64>().unwrap(), v);
        }
    }
}
