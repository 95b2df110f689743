//! Read-only analyses over captured debug sessions.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::capture::compare::{compare, CompareBy};
use crate::capture::digest::{self, ExceptionQuery, LogQuery, OutputFilter};
use crate::capture::search::{search, SearchQuery};
use crate::capture::stats::{stats, GroupBy};
use crate::capture::timeline::{timeline, EventType, Granularity, TimelineQuery};
use crate::capture::now_ms;
use crate::codes::ErrorCode;
use crate::context::ScriptContext;
use crate::envelope::ScriptOutput;
use crate::error::ScriptError;
use crate::registry::{parse_params, Field, ParamSchema, Script, ScriptKind};
use crate::scripts::{captured, captured_many, compile_pattern};

const CATEGORIES: &[&str] = &["all", "stdout", "stderr", "console", "telemetry"];

/// `"all"` means no category filter.
fn category_filter(category: Option<String>) -> Option<String> {
    category.filter(|c| c != "all")
}

fn invalid_choice(field: &str, value: &str, allowed: &str) -> ScriptError {
    ScriptError::new(
        ErrorCode::InvalidParams,
        format!("Invalid parameters: {field}: Expected one of: {allowed}, got '{value}'"),
    )
    .with_details(json!({ "errors": [{ "path": field, "message": format!("Expected one of: {allowed}"), "code": "invalid_enum_value" }] }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryParams {
    session_id: Option<String>,
    compact: bool,
}

pub struct Summary;

#[async_trait]
impl Script for Summary {
    fn name(&self) -> &'static str {
        "dap.summary"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "Overview of a captured session: counts, metrics, health, samples"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("sessionId"))
            .field(Field::boolean("compact").default(false))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: SummaryParams = parse_params(params)?;
        let session = captured(&ctx.bridge.capture, params.session_id.as_deref()).await?;
        ScriptOutput::data(digest::summarize(&session, params.compact, now_ms()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsParams {
    session_id: Option<String>,
    count: usize,
    category: Option<String>,
    search: Option<String>,
    since: Option<i64>,
    reverse: bool,
    show_source: bool,
}

pub struct Logs;

#[async_trait]
impl Script for Logs {
    fn name(&self) -> &'static str {
        "dap.logs"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "Recent output of a captured session, newest first"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("sessionId"))
            .field(Field::integer("count").default(20).min(1.0).max(10_000.0))
            .field(Field::one_of("category", CATEGORIES).default("all"))
            .field(Field::string("search").describe("Case-insensitive regex"))
            .field(Field::integer("since").describe("Epoch ms, or a negative offset from now"))
            .field(Field::boolean("reverse").default(false))
            .field(Field::boolean("showSource").default(true))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: LogsParams = parse_params(params)?;
        let session = captured(&ctx.bridge.capture, params.session_id.as_deref()).await?;
        let search = params
            .search
            .as_deref()
            .map(|pattern| compile_pattern("search", pattern, false))
            .transpose()?;
        let query = LogQuery {
            count: params.count,
            category: category_filter(params.category),
            search,
            since: params.since,
            reverse: params.reverse,
            show_source: params.show_source,
        };
        ScriptOutput::data(digest::logs(&session, &query, now_ms()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchParams {
    session_id: Option<String>,
    pattern: String,
    category: Option<String>,
    context_lines: usize,
    limit: usize,
    case_sensitive: bool,
}

pub struct Search;

#[async_trait]
impl Script for Search {
    fn name(&self) -> &'static str {
        "dap.search"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "Regex search over captured output with surrounding context"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("sessionId").describe("Session id, or 'all'"))
            .field(Field::string("pattern").required())
            .field(Field::one_of("category", CATEGORIES))
            .field(Field::integer("contextLines").default(2).min(0.0).max(20.0))
            .field(Field::integer("limit").default(50).min(1.0).max(1000.0))
            .field(Field::boolean("caseSensitive").default(false))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: SearchParams = parse_params(params)?;
        let sessions = captured_many(&ctx.bridge.capture, params.session_id.as_deref()).await?;
        let query = SearchQuery {
            pattern: compile_pattern("pattern", &params.pattern, params.case_sensitive)?,
            category: category_filter(params.category),
            context_lines: params.context_lines,
            limit: params.limit,
        };
        ScriptOutput::data(search(&sessions, &query))
    }
}

#[derive(Debug, Default, Deserialize)]
struct TimeRange {
    start: i64,
    end: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FilterSpec {
    categories: Vec<String>,
    time_range: Option<TimeRange>,
    exclude: Vec<String>,
    include: Vec<String>,
    sources: Vec<String>,
    min_length: Option<usize>,
    max_length: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilterParams {
    session_id: Option<String>,
    filters: FilterSpec,
}

pub struct Filter;

#[async_trait]
impl Script for Filter {
    fn name(&self) -> &'static str {
        "dap.filter"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "Staged filtering of captured output by category, time, pattern, source, and length"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("sessionId"))
            .field(Field::object("filters").required().describe(
                "{categories, timeRange{start,end}, exclude[], include[], sources[], minLength, maxLength}",
            ))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: FilterParams = parse_params(params)?;
        let session = captured(&ctx.bridge.capture, params.session_id.as_deref()).await?;
        let spec = params.filters;
        let compile = |field: &str, patterns: &[String]| {
            patterns
                .iter()
                .map(|p| compile_pattern(field, p, false))
                .collect::<Result<Vec<_>, _>>()
        };
        let filter = OutputFilter {
            exclude: compile("filters.exclude", &spec.exclude)?,
            include: compile("filters.include", &spec.include)?,
            categories: spec.categories,
            time_range: spec.time_range.map(|r| (r.start, r.end)),
            sources: spec.sources,
            min_length: spec.min_length,
            max_length: spec.max_length,
        };
        ScriptOutput::data(digest::filter(&session, &filter))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExceptionsParams {
    session_id: Option<String>,
    count: usize,
    with_context: bool,
    context_lines: usize,
}

pub struct Exceptions;

#[async_trait]
impl Script for Exceptions {
    fn name(&self) -> &'static str {
        "dap.exceptions"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "Exceptions raised in a captured session with estimated surrounding output"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("sessionId"))
            .field(Field::integer("count").default(10).min(1.0).max(100.0))
            .field(Field::boolean("withContext").default(true))
            .field(Field::integer("contextLines").default(5).min(0.0).max(50.0))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: ExceptionsParams = parse_params(params)?;
        let session = captured(&ctx.bridge.capture, params.session_id.as_deref()).await?;
        let query = ExceptionQuery {
            count: params.count,
            with_context: params.with_context,
            context_lines: params.context_lines,
        };
        ScriptOutput::data(digest::exceptions(&session, query))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsParams {
    session_id: Option<String>,
    group_by: String,
    include_charts: bool,
}

pub struct Stats;

#[async_trait]
impl Script for Stats {
    fn name(&self) -> &'static str {
        "dap.stats"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "Distribution, top-N, averages, and anomalies over captured output"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("sessionId").describe("Session id, or 'all'"))
            .field(Field::one_of("groupBy", &["category", "source", "hour", "session"]).default("category"))
            .field(Field::boolean("includeCharts").default(true))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: StatsParams = parse_params(params)?;
        let group_by = GroupBy::parse(&params.group_by)
            .ok_or_else(|| invalid_choice("groupBy", &params.group_by, "category, source, hour, session"))?;
        let sessions = captured_many(&ctx.bridge.capture, params.session_id.as_deref()).await?;
        ScriptOutput::data(stats(&sessions, group_by, params.include_charts, now_ms()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimelineParams {
    session_id: Option<String>,
    event_types: Option<Vec<String>>,
    window: Option<i64>,
    granularity: String,
    from_end: bool,
}

pub struct Timeline;

#[async_trait]
impl Script for Timeline {
    fn name(&self) -> &'static str {
        "dap.timeline"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "Chronological view of a captured session with milestones"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("sessionId"))
            .field(Field::array("eventTypes").describe("Any of output, exception, stopped, exit"))
            .field(Field::integer("window").min(1.0).describe("Window in ms"))
            .field(Field::one_of("granularity", &["all", "summary", "milestones"]).default("all"))
            .field(Field::boolean("fromEnd").default(false))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: TimelineParams = parse_params(params)?;
        let event_types = match params.event_types {
            None => EventType::ALL.to_vec(),
            Some(names) => names
                .iter()
                .map(|name| {
                    EventType::parse(name)
                        .ok_or_else(|| invalid_choice("eventTypes", name, "output, exception, stopped, exit"))
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        let granularity = Granularity::parse(&params.granularity)
            .ok_or_else(|| invalid_choice("granularity", &params.granularity, "all, summary, milestones"))?;
        let session = captured(&ctx.bridge.capture, params.session_id.as_deref()).await?;
        let query = TimelineQuery {
            event_types,
            window: params.window,
            from_end: params.from_end,
            granularity,
        };
        ScriptOutput::data(timeline(&session, &query, now_ms()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompareParams {
    session_a: String,
    session_b: String,
    compare_by: String,
}

pub struct Compare;

#[async_trait]
impl Script for Compare {
    fn name(&self) -> &'static str {
        "dap.compare"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "Compare two captured sessions"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("sessionA").required())
            .field(Field::string("sessionB").required())
            .field(Field::one_of("compareBy", &["counts", "exceptions", "timeline", "outputs"]).default("counts"))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: CompareParams = parse_params(params)?;
        let by = CompareBy::parse(&params.compare_by).ok_or_else(|| {
            invalid_choice("compareBy", &params.compare_by, "counts, exceptions, timeline, outputs")
        })?;
        let a = captured(&ctx.bridge.capture, Some(&params.session_a)).await?;
        let b = captured(&ctx.bridge.capture, Some(&params.session_b)).await?;
        ScriptOutput::data(compare(&a, &b, by, now_ms()))
    }
}
