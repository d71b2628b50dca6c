use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{json, Value};

use cadence_types::{ToolResult, ToolSchema};

use crate::Tool;

/// Named output styles accepted by the date tools. Unknown styles fall back
/// to `iso`.
const DATE_STYLES: &[(&str, &str)] = &[
    ("iso", "%Y-%m-%d"),
    ("us", "%m/%d/%Y"),
    ("eu", "%d/%m/%Y"),
    ("long", "%B %d, %Y"),
    ("short", "%b %d, %Y"),
    ("full", "%A, %B %d, %Y"),
];

const DATETIME_STYLES: &[(&str, &str)] = &[
    ("iso", "%Y-%m-%dT%H:%M:%SZ"),
    ("us", "%m/%d/%Y %I:%M %p"),
    ("eu", "%d/%m/%Y %H:%M"),
    ("long", "%B %d, %Y at %H:%M UTC"),
    ("short", "%b %d, %Y %H:%M"),
    ("full", "%A, %B %d, %Y at %H:%M UTC"),
];

fn style_pattern(table: &'static [(&'static str, &'static str)], style: &str) -> &'static str {
    table
        .iter()
        .find(|(name, _)| *name == style)
        .or_else(|| table.iter().find(|(name, _)| *name == "iso"))
        .map(|(_, pattern)| *pattern)
        .unwrap_or("%Y-%m-%d")
}

/// Accepts RFC 3339 timestamps plus the common bare date/datetime shapes the
/// model tends to produce. Everything is interpreted as UTC.
fn parse_datetime(input: &str) -> Result<DateTime<Utc>, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("no date provided".to_string());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    for pattern in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, pattern) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    for pattern in ["%Y-%m-%d", "%m/%d/%Y", "%d.%m.%Y", "%B %d, %Y", "%b %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, pattern) {
            let naive = date
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| format!("invalid date `{trimmed}`"))?;
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(format!(
        "could not parse `{trimmed}` as a date. Use ISO format like 2026-08-30 or 2026-08-30T12:00:00Z."
    ))
}

fn str_arg<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

fn error_result(message: String) -> ToolResult {
    ToolResult {
        output: format!("Error: {message}"),
        metadata: json!({}),
    }
}

/// Returns the current date and time in UTC.
pub struct CurrentDatetimeTool;

#[async_trait]
impl Tool for CurrentDatetimeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_current_datetime".to_string(),
            description: "Get the current date and time in UTC. Optionally pass a style: \
                          iso, us, eu, long, short, or full."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "style": {
                        "type": "string",
                        "description": "Output style (iso, us, eu, long, short, full). Defaults to full."
                    }
                }
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let style = match str_arg(&args, "style") {
            "" => "full",
            other => other,
        };
        let now = Utc::now();
        let output = now.format(style_pattern(DATETIME_STYLES, style)).to_string();
        Ok(ToolResult {
            output,
            metadata: json!({"iso": now.to_rfc3339(), "style": style}),
        })
    }
}

/// Reformats a date string into one of the named styles.
pub struct FormatDateTool;

#[async_trait]
impl Tool for FormatDateTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "format_date".to_string(),
            description: "Reformat a date into a named style: iso, us, eu, long, short, or full."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "date": {
                        "type": "string",
                        "description": "The date to reformat, e.g. 2026-08-30"
                    },
                    "style": {
                        "type": "string",
                        "description": "Output style (iso, us, eu, long, short, full)"
                    }
                },
                "required": ["date", "style"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let date = match parse_datetime(str_arg(&args, "date")) {
            Ok(dt) => dt,
            Err(reason) => return Ok(error_result(reason)),
        };
        let style = str_arg(&args, "style");
        let output = date.format(style_pattern(DATE_STYLES, style)).to_string();
        Ok(ToolResult {
            output,
            metadata: json!({"iso": date.to_rfc3339(), "style": style}),
        })
    }
}

/// Computes the span between two dates.
pub struct DateDifferenceTool;

#[async_trait]
impl Tool for DateDifferenceTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "calculate_date_difference".to_string(),
            description: "Calculate the difference between two dates in days, hours, and minutes."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "start_date": {"type": "string", "description": "The earlier date"},
                    "end_date": {"type": "string", "description": "The later date"}
                },
                "required": ["start_date", "end_date"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let start = match parse_datetime(str_arg(&args, "start_date")) {
            Ok(dt) => dt,
            Err(reason) => return Ok(error_result(format!("start_date: {reason}"))),
        };
        let end = match parse_datetime(str_arg(&args, "end_date")) {
            Ok(dt) => dt,
            Err(reason) => return Ok(error_result(format!("end_date: {reason}"))),
        };
        let span = end - start;
        let days = span.num_days();
        let hours = span.num_hours() - days * 24;
        let minutes = span.num_minutes() - span.num_hours() * 60;
        Ok(ToolResult {
            output: format!("{days} days, {hours} hours, {minutes} minutes"),
            metadata: json!({
                "totalDays": days,
                "totalHours": span.num_hours(),
                "totalMinutes": span.num_minutes()
            }),
        })
    }
}

/// Adds a duration to a date.
pub struct AddTimeTool;

#[async_trait]
impl Tool for AddTimeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "add_time_to_date".to_string(),
            description: "Add (or with negative values, subtract) weeks, days, hours, and \
                          minutes to a date."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "date": {"type": "string", "description": "The starting date"},
                    "weeks": {"type": "integer", "description": "Weeks to add"},
                    "days": {"type": "integer", "description": "Days to add"},
                    "hours": {"type": "integer", "description": "Hours to add"},
                    "minutes": {"type": "integer", "description": "Minutes to add"}
                },
                "required": ["date"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let date = match parse_datetime(str_arg(&args, "date")) {
            Ok(dt) => dt,
            Err(reason) => return Ok(error_result(reason)),
        };
        let int_arg = |key: &str| args.get(key).and_then(|v| v.as_i64()).unwrap_or(0);
        let shifted = date
            + Duration::weeks(int_arg("weeks"))
            + Duration::days(int_arg("days"))
            + Duration::hours(int_arg("hours"))
            + Duration::minutes(int_arg("minutes"));
        Ok(ToolResult {
            output: shifted.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            metadata: json!({"iso": shifted.to_rfc3339()}),
        })
    }
}

/// Names the weekday of a date.
pub struct DayOfWeekTool;

#[async_trait]
impl Tool for DayOfWeekTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_day_of_week".to_string(),
            description: "Get the day of the week for a given date.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "date": {"type": "string", "description": "The date, e.g. 2026-08-30"}
                },
                "required": ["date"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let date = match parse_datetime(str_arg(&args, "date")) {
            Ok(dt) => dt,
            Err(reason) => return Ok(error_result(reason)),
        };
        Ok(ToolResult {
            output: date.format("%A").to_string(),
            metadata: json!({"isoWeekday": date.weekday().number_from_monday()}),
        })
    }
}
