//! # Utility Functions and Helper Module
//!
//! Helpers shared by the driver, the controller and result reporting:
//! human-readable formatting of latencies, durations and counts, validation
//! of numeric configuration values, run identifiers, and plain-text tables
//! for console output.
//!
//! ## Usage Examples
//!
//! ```rust
//! use pubsub_loadtest::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_latency_ms(0.5), "500μs");
//! assert_eq!(format_latency_ms(175.0), "175.00ms");
//! assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
//! assert!(validate_positive("--batch-size", 1000).is_ok());
//! ```

use crate::error::LoadtestError;
use std::time::Duration;
use uuid::Uuid;

/// Generate a unique identifier for a load test run
///
/// The identifier is recorded in the results file so that output from
/// several runs can be told apart.
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Format a latency given in milliseconds
///
/// Bucket boundaries and percentile estimates are milliseconds, but span from
/// sub-millisecond midpoints up to the overflow sentinel, so the unit is
/// chosen by magnitude:
///
/// - **Microseconds**: < 1 ms (e.g., "500μs")
/// - **Milliseconds**: < 1 s (e.g., "175.00ms")
/// - **Seconds**: everything larger (e.g., "3.00s")
///
/// ## Examples
///
/// ```rust
/// # use pubsub_loadtest::utils::format_latency_ms;
/// assert_eq!(format_latency_ms(0.0), "0μs");
/// assert_eq!(format_latency_ms(1.0), "1.00ms");
/// assert_eq!(format_latency_ms(3000.0), "3.00s");
/// ```
pub fn format_latency_ms(latency_ms: f64) -> String {
    if latency_ms < 1.0 {
        format!("{:.0}μs", latency_ms * 1_000.0)
    } else if latency_ms < 1_000.0 {
        format!("{:.2}ms", latency_ms)
    } else {
        format!("{:.2}s", latency_ms / 1_000.0)
    }
}

/// Format a duration in a human-readable way
///
/// ## Unit Selection Logic
///
/// - **Milliseconds**: < 1 second (e.g., "250.00ms")
/// - **Seconds**: < 60 seconds (e.g., "5.25s")
/// - **Minutes and Hours**: compound format (e.g., "5m 30s", "2h 15m 30s")
///
/// ## Examples
///
/// ```rust
/// # use pubsub_loadtest::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_millis(250)), "250.00ms");
/// assert_eq!(format_duration(Duration::from_secs(120)), "2m 0s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ms = duration.as_secs_f64() * 1_000.0;

    if total_ms < 1_000.0 {
        format!("{:.2}ms", total_ms)
    } else if total_ms < 60_000.0 {
        format!("{:.2}s", total_ms / 1_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            format!(
                "{}h {}m {}s",
                minutes / 60,
                minutes % 60,
                remaining_seconds
            )
        }
    }
}

/// Format an integer count with thousands separators, e.g. "1,234,567"
pub fn format_count(count: u64) -> String {
    let digits = count.to_string();
    let mut formatted = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, digit) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            formatted.push(',');
        }
        formatted.push(digit);
    }
    formatted
}

/// Validate that a size, count or duration parameter is greater than zero
///
/// ## Parameters
/// - `name`: Flag or field name used in the error message
/// - `value`: The value to check
///
/// ## Returns
/// - `Ok(())`: The value is positive
/// - `Err(LoadtestError::InvalidArgument)`: The value is zero
///
/// The message matches the one produced by the command-line parser, so a
/// configuration built in code fails the same way as one built from flags.
pub fn validate_positive(name: &str, value: usize) -> Result<(), LoadtestError> {
    if value == 0 {
        return Err(LoadtestError::InvalidArgument(format!(
            "Parameter {} should be an int greater than 0 (found {})",
            name, value
        )));
    }
    Ok(())
}

/// Render one `|`-separated table row padded to `widths`
pub(crate) fn table_row(columns: &[&str], widths: &[usize]) -> String {
    let mut row = String::from("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        row.push_str(&format!(" {:width$} |", column, width = width));
    }
    row
}

/// Render a `+---+` separator matching `widths`
pub(crate) fn table_separator(widths: &[usize]) -> String {
    let mut separator = String::from("+");
    for &width in widths {
        separator.push_str(&"-".repeat(width + 2));
        separator.push('+');
    }
    separator
}
