use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use super::{truncate_chars, CapturedSession, ExceptionRecord, SessionRef};

const SUMMARY_TEXT_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Output,
    Exception,
    Stopped,
    Exit,
}

impl EventType {
    pub const ALL: [EventType; 4] = [Self::Output, Self::Exception, Self::Stopped, Self::Exit];

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "output" => Some(Self::Output),
            "exception" => Some(Self::Exception),
            "stopped" => Some(Self::Stopped),
            "exit" => Some(Self::Exit),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Exception => "exception",
            Self::Stopped => "stopped",
            Self::Exit => "exit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    All,
    Summary,
    Milestones,
}

impl Granularity {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all" => Some(Self::All),
            "summary" => Some(Self::Summary),
            "milestones" => Some(Self::Milestones),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Significance {
    Normal,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct TimelineQuery {
    pub event_types: Vec<EventType>,
    /// Milliseconds from the start (or from the end with `from_end`).
    pub window: Option<i64>,
    pub from_end: bool,
    pub granularity: Granularity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub timestamp: i64,
    pub relative_time: i64,
    pub event_type: String,
    pub summary: String,
    pub significance: Significance,
    /// Set when the timestamp was interpolated rather than observed.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub estimated: bool,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestones {
    pub first_output: Option<i64>,
    pub first_exception: Option<ExceptionRecord>,
    pub breakpoint_hits: Vec<i64>,
    pub session_exit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineResult {
    pub timeline: Vec<TimelineEntry>,
    pub milestones: Milestones,
    pub duration: i64,
    pub event_count: usize,
    pub session: SessionRef,
}

/// Exceptions are not timestamped by the adapter: the n-th of `count`
/// exceptions is placed at `start + duration * n / count`. This is an
/// approximation and entries built from it are flagged `estimated`.
pub fn estimate_exception_ts(session: &CapturedSession, index: usize, now: i64) -> i64 {
    let count = session.exceptions.len().max(1) as i64;
    session.start_time + session.duration_ms(now) * (index as i64 + 1) / count
}

/// Rebuild a chronological view of a session.
pub fn timeline(session: &CapturedSession, query: &TimelineQuery, now: i64) -> TimelineResult {
    let wants = |t: EventType| query.event_types.contains(&t);
    let relative = |ts: i64| ts - session.start_time;
    let mut entries = Vec::new();

    if wants(EventType::Output) {
        for output in &session.outputs {
            let mut summary = format!(
                "[{}] {}",
                output.category,
                truncate_chars(&output.text, SUMMARY_TEXT_CHARS)
            );
            if output.text.chars().count() > SUMMARY_TEXT_CHARS {
                summary.push_str("...");
            }
            entries.push(TimelineEntry {
                timestamp: output.ts,
                relative_time: relative(output.ts),
                event_type: EventType::Output.as_str().to_string(),
                summary,
                significance: if output.category == "stderr" {
                    Significance::Warning
                } else {
                    Significance::Normal
                },
                estimated: false,
                data: serde_json::to_value(output).unwrap_or(Value::Null),
            });
        }
    }

    if wants(EventType::Exception) {
        for (idx, exception) in session.exceptions.iter().enumerate() {
            let ts = estimate_exception_ts(session, idx, now);
            let message = exception
                .description
                .as_deref()
                .filter(|_| exception.message.is_empty())
                .unwrap_or(&exception.message);
            entries.push(TimelineEntry {
                timestamp: ts,
                relative_time: relative(ts),
                event_type: EventType::Exception.as_str().to_string(),
                summary: format!("Exception: {message}"),
                significance: Significance::Error,
                estimated: true,
                data: serde_json::to_value(exception).unwrap_or(Value::Null),
            });
        }
    }

    if wants(EventType::Stopped) {
        for stop in &session.stopped_events {
            let summary = match &stop.text {
                Some(text) => format!("Paused: {} - {}", stop.reason, text),
                None => format!("Paused: {}", stop.reason),
            };
            entries.push(TimelineEntry {
                timestamp: stop.ts,
                relative_time: relative(stop.ts),
                event_type: EventType::Stopped.as_str().to_string(),
                summary,
                significance: if stop.reason == "exception" {
                    Significance::Error
                } else {
                    Significance::Warning
                },
                estimated: false,
                data: serde_json::to_value(stop).unwrap_or(Value::Null),
            });
        }
    }

    if wants(EventType::Exit) {
        if let Some(code) = session.exit_code {
            let ts = session.end_time.unwrap_or(now);
            entries.push(TimelineEntry {
                timestamp: ts,
                relative_time: relative(ts),
                event_type: EventType::Exit.as_str().to_string(),
                summary: format!("Process exited: code {code}"),
                significance: if code == 0 {
                    Significance::Normal
                } else {
                    Significance::Error
                },
                estimated: false,
                data: json!({ "exitCode": code }),
            });
        }
    }

    entries.sort_by_key(|e| e.timestamp);

    if let Some(window) = query.window {
        if query.from_end {
            let cutoff = session.end_time.unwrap_or(now) - window;
            entries.retain(|e| e.timestamp >= cutoff);
        } else {
            let cutoff = session.start_time + window;
            entries.retain(|e| e.timestamp <= cutoff);
        }
    }

    let entries = match query.granularity {
        Granularity::All => entries,
        Granularity::Milestones => entries
            .into_iter()
            .filter(|e| e.event_type != "output" || e.significance != Significance::Normal)
            .collect(),
        Granularity::Summary => summarize_by_second(session, entries),
    };

    TimelineResult {
        event_count: entries.len(),
        timeline: entries,
        milestones: Milestones {
            first_output: session.outputs.front().map(|o| o.ts),
            first_exception: session.exceptions.first().cloned(),
            breakpoint_hits: session
                .stopped_events
                .iter()
                .filter(|e| e.reason == "breakpoint")
                .map(|e| e.ts)
                .collect(),
            session_exit: session.end_time,
        },
        duration: session.duration_ms(now),
        session: SessionRef::from(session),
    }
}

fn summarize_by_second(session: &CapturedSession, entries: Vec<TimelineEntry>) -> Vec<TimelineEntry> {
    let mut grouped: BTreeMap<i64, Vec<TimelineEntry>> = BTreeMap::new();
    for entry in entries {
        grouped
            .entry(entry.relative_time.div_euclid(1000))
            .or_default()
            .push(entry);
    }
    grouped
        .into_iter()
        .map(|(second, events)| {
            let errors = events
                .iter()
                .filter(|e| e.significance == Significance::Error)
                .count();
            let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
            TimelineEntry {
                timestamp: session.start_time + second * 1000,
                relative_time: second * 1000,
                event_type: "summary".to_string(),
                summary: format!("Second {second}: {} events ({errors} errors)", events.len()),
                significance: if errors > 0 {
                    Significance::Error
                } else {
                    Significance::Normal
                },
                estimated: events.iter().any(|e| e.estimated),
                data: json!({ "events": events.len(), "types": types }),
            }
        })
        .collect()
}
