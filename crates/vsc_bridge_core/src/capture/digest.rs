//! Per-session digests: summary, log tail, exception report and the
//! multi-stage output filter.

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::{truncate_chars, CapturedSession, OutputEvent, OutputLine, SessionRef, SourceLocation};

const SAMPLE_COUNT: usize = 3;
const SAMPLE_TEXT_CHARS: usize = 100;
const CONTEXT_TEXT_CHARS: usize = 200;

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub id: String,
    #[serde(rename = "type")]
    pub session_type: String,
    pub name: String,
    pub duration: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryCounts {
    pub stdout: usize,
    pub stderr: usize,
    pub console: usize,
    pub telemetry: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryCounts {
    pub total_outputs: usize,
    pub by_category: CategoryCounts,
    pub exceptions: usize,
    pub stopped_events: usize,
    pub breakpoint_hits: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryMetrics {
    pub total_data_size: usize,
    pub avg_output_length: usize,
    pub events_per_second: f64,
    pub time_since_last_event: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub has_exceptions: bool,
    /// Exceptions per minute.
    pub exception_rate: f64,
    /// Share of stderr outputs, in percent.
    pub error_ratio: f64,
    pub exit_code: Option<i64>,
    pub abnormal_exit: bool,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExceptionBrief {
    pub message: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Samples {
    pub first: Vec<OutputLine>,
    pub last: Vec<OutputLine>,
    pub last_exception: Option<ExceptionBrief>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub session: SessionStatus,
    pub counts: SummaryCounts,
    pub metrics: SummaryMetrics,
    pub health: Health,
    pub samples: Samples,
}

pub fn summarize(session: &CapturedSession, compact: bool, now: i64) -> SessionSummary {
    let duration_sec = session.duration_ms(now) as f64 / 1000.0;
    let total_outputs = session.outputs.len();
    let count = |category: &str| session.outputs.iter().filter(|o| o.category == category).count();
    let by_category = CategoryCounts {
        stdout: count("stdout"),
        stderr: count("stderr"),
        console: count("console"),
        telemetry: count("telemetry"),
    };
    let total_data_size: usize = session.outputs.iter().map(|o| o.text.chars().count()).sum();
    let per_second = |n: usize| if duration_sec > 0.0 { n as f64 / duration_sec } else { 0.0 };
    let active = session.end_time.is_none() && !session.terminated;
    let status = if active {
        "active"
    } else if session.terminated {
        "terminated"
    } else {
        "ended"
    };

    let sample = |o: &OutputEvent| OutputLine::from_output(o, SAMPLE_TEXT_CHARS);
    let skip_last = total_outputs.saturating_sub(SAMPLE_COUNT);

    SessionSummary {
        summary: compact.then(|| {
            format!(
                "Session {}: {} outputs, {} exceptions, exit={}, {}",
                truncate_chars(&session.session_id, 8),
                total_outputs,
                session.exceptions.len(),
                session
                    .exit_code
                    .map_or_else(|| "none".to_string(), |c| c.to_string()),
                if active { "active" } else { "ended" }
            )
        }),
        session: SessionStatus {
            id: session.session_id.clone(),
            session_type: session.session_type.clone(),
            name: session.name.clone(),
            duration: format!("{duration_sec:.2}s"),
            status: status.to_string(),
        },
        health: Health {
            has_exceptions: !session.exceptions.is_empty(),
            exception_rate: round_to(per_second(session.exceptions.len()) * 60.0, 2),
            error_ratio: if total_outputs > 0 {
                round_to(by_category.stderr as f64 / total_outputs as f64 * 100.0, 1)
            } else {
                0.0
            },
            exit_code: session.exit_code,
            abnormal_exit: session.exit_code.is_some_and(|c| c != 0),
            truncated: session.truncated,
        },
        counts: SummaryCounts {
            total_outputs,
            by_category,
            exceptions: session.exceptions.len(),
            stopped_events: session.stopped_events.len(),
            breakpoint_hits: session
                .stopped_events
                .iter()
                .filter(|e| e.reason == "breakpoint")
                .count(),
        },
        metrics: SummaryMetrics {
            total_data_size,
            avg_output_length: if total_outputs > 0 {
                (total_data_size as f64 / total_outputs as f64).round() as usize
            } else {
                0
            },
            events_per_second: round_to(per_second(total_outputs), 2),
            time_since_last_event: session.outputs.back().map(|o| now - o.ts),
        },
        samples: Samples {
            first: session.outputs.iter().take(SAMPLE_COUNT).map(sample).collect(),
            last: session.outputs.iter().skip(skip_last).map(sample).collect(),
            last_exception: session.exceptions.last().map(|e| ExceptionBrief {
                message: e.message.clone(),
                description: e.description.clone(),
            }),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub ts: i64,
    pub relative_time: i64,
    pub category: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceLocation>,
}

#[derive(Debug, Clone)]
pub struct LogQuery {
    pub count: usize,
    /// `None` keeps every category.
    pub category: Option<String>,
    pub search: Option<Regex>,
    /// Absolute ms epoch, or an offset from `now` when negative.
    pub since: Option<i64>,
    /// Oldest first when set.
    pub reverse: bool,
    pub show_source: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilterCounts {
    pub by_category: usize,
    pub by_search: usize,
    pub by_time: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogsResult {
    pub logs: Vec<LogEntry>,
    pub matched: usize,
    pub total: usize,
    pub filtered: LogFilterCounts,
    pub session: SessionRef,
}

/// Most recent outputs first unless `reverse` asks for chronological order.
pub fn logs(session: &CapturedSession, query: &LogQuery, now: i64) -> LogsResult {
    let mut remaining: Vec<&OutputEvent> = session.outputs.iter().collect();
    let mut filtered = LogFilterCounts::default();

    if let Some(category) = &query.category {
        let before = remaining.len();
        remaining.retain(|o| &o.category == category);
        filtered.by_category = before - remaining.len();
    }
    if let Some(pattern) = &query.search {
        let before = remaining.len();
        remaining.retain(|o| pattern.is_match(&o.text));
        filtered.by_search = before - remaining.len();
    }
    if let Some(since) = query.since {
        let cutoff = if since < 0 { now + since } else { since };
        let before = remaining.len();
        remaining.retain(|o| o.ts >= cutoff);
        filtered.by_time = before - remaining.len();
    }
    if !query.reverse {
        remaining.reverse();
    }

    let logs: Vec<LogEntry> = remaining
        .into_iter()
        .take(query.count)
        .map(|o| LogEntry {
            ts: o.ts,
            relative_time: o.ts - session.start_time,
            category: o.category.clone(),
            text: o.text.clone(),
            source: query
                .show_source
                .then(|| SourceLocation::from_output(o))
                .flatten(),
        })
        .collect();

    LogsResult {
        matched: logs.len(),
        logs,
        total: session.outputs.len(),
        filtered,
        session: SessionRef::from(session),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionInfo {
    pub message: String,
    pub description: Option<String>,
    pub type_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopInfo {
    pub reason: String,
    pub thread_id: Option<i64>,
    pub text: Option<String>,
    pub hit_breakpoint_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExceptionContext {
    pub before: Vec<OutputLine>,
    pub after: Vec<OutputLine>,
    pub estimated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameLocation {
    pub file: Value,
    pub line: Value,
    pub column: Value,
    pub function: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionReport {
    pub exception: ExceptionInfo,
    pub stack_trace: Option<Value>,
    pub time_since_start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_event: Option<StopInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ExceptionContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<FrameLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionsResult {
    pub exceptions: Vec<ExceptionReport>,
    pub total_exceptions: usize,
    pub showing: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub session: SessionRef,
}

#[derive(Debug, Clone, Copy)]
pub struct ExceptionQuery {
    pub count: usize,
    pub with_context: bool,
    pub context_lines: usize,
}

/// The last `count` exceptions. Exceptions are not timestamped, so the
/// surrounding output window is placed proportionally and flagged
/// `estimated`.
pub fn exceptions(session: &CapturedSession, query: ExceptionQuery) -> ExceptionsResult {
    let total = session.exceptions.len();
    if total == 0 {
        return ExceptionsResult {
            exceptions: Vec::new(),
            total_exceptions: 0,
            showing: 0,
            message: Some("No exceptions captured in this session".to_string()),
            session: SessionRef::from(session),
        };
    }

    let first = total.saturating_sub(query.count);
    let outputs: Vec<&OutputEvent> = session.outputs.iter().collect();
    let reports: Vec<ExceptionReport> = session.exceptions[first..]
        .iter()
        .enumerate()
        .map(|(offset, exception)| {
            let index = first + offset;
            let stopped_event = session
                .stopped_events
                .iter()
                .find(|e| e.reason == "exception" && e.thread_id == exception.thread_id)
                .map(|e| StopInfo {
                    reason: e.reason.clone(),
                    thread_id: e.thread_id,
                    text: e.text.clone(),
                    hit_breakpoint_ids: e.hit_breakpoint_ids.clone(),
                });

            let context = query.with_context.then(|| {
                let estimated = outputs.len() * (index + 1) / total;
                let start = estimated.saturating_sub(query.context_lines);
                let end = (estimated + query.context_lines).min(outputs.len());
                let line = |o: &&OutputEvent| OutputLine::from_output(o, CONTEXT_TEXT_CHARS);
                ExceptionContext {
                    before: outputs[start..estimated].iter().map(line).collect(),
                    after: outputs[estimated..end].iter().map(line).collect(),
                    estimated: true,
                }
            });

            let top_frame = exception
                .stack_frames
                .as_ref()
                .and_then(Value::as_array)
                .and_then(|frames| frames.first());
            let location = top_frame.map(|frame| {
                let field = |key: &str| frame.get(key).cloned().unwrap_or(Value::Null);
                FrameLocation {
                    file: field("source"),
                    line: field("line"),
                    column: field("column"),
                    function: field("name"),
                }
            });

            ExceptionReport {
                exception: ExceptionInfo {
                    message: exception.message.clone(),
                    description: exception.description.clone(),
                    type_name: exception.type_name.clone(),
                },
                stack_trace: exception.stack_frames.clone(),
                time_since_start: context
                    .as_ref()
                    .and_then(|c| c.before.first())
                    .map(|o| o.ts - session.start_time),
                stopped_event,
                context,
                location,
            }
        })
        .collect();

    ExceptionsResult {
        showing: reports.len(),
        exceptions: reports,
        total_exceptions: total,
        message: None,
        session: SessionRef::from(session),
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutputFilter {
    pub categories: Vec<String>,
    pub time_range: Option<(i64, i64)>,
    /// Outputs matching any of these are dropped.
    pub exclude: Vec<Regex>,
    /// Outputs must match all of these.
    pub include: Vec<Regex>,
    pub sources: Vec<String>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
}

/// Remaining output count after each stage. A skipped stage carries the
/// previous count forward.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterStages {
    pub original: usize,
    pub after_categories: usize,
    pub after_time_range: usize,
    pub after_exclude: usize,
    pub after_include: usize,
    pub after_sources: usize,
    pub after_length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilteredEvent {
    pub ts: i64,
    pub relative_time: i64,
    pub category: String,
    pub text: String,
    pub source: Option<SourceLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterResult {
    pub events: Vec<FilteredEvent>,
    pub stats: FilterStages,
    pub total_filtered: usize,
    pub total_in_session: usize,
    pub session: SessionRef,
}

pub fn filter(session: &CapturedSession, filter: &OutputFilter) -> FilterResult {
    let mut remaining: Vec<&OutputEvent> = session.outputs.iter().collect();
    let mut stats = FilterStages {
        original: remaining.len(),
        ..FilterStages::default()
    };

    if !filter.categories.is_empty() {
        remaining.retain(|o| filter.categories.contains(&o.category));
    }
    stats.after_categories = remaining.len();

    if let Some((start, end)) = filter.time_range {
        remaining.retain(|o| o.ts >= start && o.ts <= end);
    }
    stats.after_time_range = remaining.len();

    remaining.retain(|o| !filter.exclude.iter().any(|re| re.is_match(&o.text)));
    stats.after_exclude = remaining.len();

    remaining.retain(|o| filter.include.iter().all(|re| re.is_match(&o.text)));
    stats.after_include = remaining.len();

    if !filter.sources.is_empty() {
        remaining.retain(|o| {
            o.source_path()
                .is_some_and(|path| filter.sources.iter().any(|s| path.contains(s.as_str())))
        });
    }
    stats.after_sources = remaining.len();

    remaining.retain(|o| {
        let len = o.text.chars().count();
        filter.min_length.map_or(true, |min| len >= min)
            && filter.max_length.map_or(true, |max| len <= max)
    });
    stats.after_length = remaining.len();

    let events: Vec<FilteredEvent> = remaining
        .into_iter()
        .map(|o| FilteredEvent {
            ts: o.ts,
            relative_time: o.ts - session.start_time,
            category: o.category.clone(),
            text: o.text.clone(),
            source: SourceLocation::from_output(o),
        })
        .collect();

    FilterResult {
        total_filtered: events.len(),
        events,
        stats,
        total_in_session: session.outputs.len(),
        session: SessionRef::from(session),
    }
}
