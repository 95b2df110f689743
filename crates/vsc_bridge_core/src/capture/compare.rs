use std::collections::BTreeMap;

use serde::Serialize;

use super::{truncate_chars, CapturedSession};

const DIVERGENCE_TEXT_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareBy {
    Counts,
    Exceptions,
    Timeline,
    Outputs,
}

impl CompareBy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "counts" => Some(Self::Counts),
            "exceptions" => Some(Self::Exceptions),
            "timeline" => Some(Self::Timeline),
            "outputs" => Some(Self::Outputs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counts => "counts",
            Self::Exceptions => "exceptions",
            Self::Timeline => "timeline",
            Self::Outputs => "outputs",
        }
    }
}

/// Deltas are always `A - B`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountDeltas {
    pub delta_outputs: i64,
    pub delta_exceptions: i64,
    pub delta_stops: i64,
    pub exit_code_a: Option<i64>,
    pub exit_code_b: Option<i64>,
    pub exit_code_changed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDiff {
    pub only_in_a: Vec<String>,
    pub only_in_b: Vec<String>,
    pub common: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Divergence {
    #[serde(rename_all = "camelCase")]
    At {
        output_index: usize,
        timestamp_a: i64,
        timestamp_b: i64,
        relative_time_a: i64,
        relative_time_b: i64,
        text_a: String,
        text_b: String,
    },
    #[serde(rename_all = "camelCase")]
    Prefix {
        message: String,
        shorter_session: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputBreakdown {
    pub categories_a: BTreeMap<String, usize>,
    pub categories_b: BTreeMap<String, usize>,
    pub category_deltas: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub counts: CountDeltas,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exceptions: Option<ExceptionDiff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub divergence_point: Option<Divergence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_breakdown: Option<OutputBreakdown>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBrief {
    pub id: String,
    #[serde(rename = "type")]
    pub session_type: String,
    pub name: String,
    pub duration: i64,
    pub outputs: usize,
    pub exceptions: usize,
    pub exit_code: Option<i64>,
}

impl SessionBrief {
    fn new(session: &CapturedSession, now: i64) -> Self {
        Self {
            id: session.session_id.clone(),
            session_type: session.session_type.clone(),
            name: session.name.clone(),
            duration: session.duration_ms(now),
            outputs: session.outputs.len(),
            exceptions: session.exceptions.len(),
            exit_code: session.exit_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareResult {
    pub comparison: Comparison,
    pub session_a: SessionBrief,
    pub session_b: SessionBrief,
    pub compare_by: String,
}

pub fn compare(a: &CapturedSession, b: &CapturedSession, by: CompareBy, now: i64) -> CompareResult {
    let counts = CountDeltas {
        delta_outputs: a.outputs.len() as i64 - b.outputs.len() as i64,
        delta_exceptions: a.exceptions.len() as i64 - b.exceptions.len() as i64,
        delta_stops: a.stopped_events.len() as i64 - b.stopped_events.len() as i64,
        exit_code_a: a.exit_code,
        exit_code_b: b.exit_code,
        exit_code_changed: a.exit_code != b.exit_code,
    };

    let exceptions = matches!(by, CompareBy::Counts | CompareBy::Exceptions).then(|| {
        let messages = |s: &CapturedSession| -> Vec<String> {
            s.exceptions
                .iter()
                .map(|e| match (&e.description, e.message.is_empty()) {
                    (Some(description), true) => description.clone(),
                    _ => e.message.clone(),
                })
                .collect()
        };
        let (in_a, in_b) = (messages(a), messages(b));
        ExceptionDiff {
            only_in_a: in_a.iter().filter(|m| !in_b.contains(m)).cloned().collect(),
            only_in_b: in_b.iter().filter(|m| !in_a.contains(m)).cloned().collect(),
            common: in_a.iter().filter(|m| in_b.contains(m)).cloned().collect(),
        }
    });

    let divergence_point =
        matches!(by, CompareBy::Timeline | CompareBy::Outputs).then(|| divergence(a, b));

    let output_breakdown = (by == CompareBy::Outputs).then(|| {
        let categories = |s: &CapturedSession| {
            let mut counts = BTreeMap::new();
            for output in &s.outputs {
                *counts.entry(output.category.clone()).or_insert(0usize) += 1;
            }
            counts
        };
        let (categories_a, categories_b) = (categories(a), categories(b));
        let category_deltas = categories_a
            .keys()
            .chain(categories_b.keys())
            .map(|cat| {
                let count_a = categories_a.get(cat).copied().unwrap_or(0) as i64;
                let count_b = categories_b.get(cat).copied().unwrap_or(0) as i64;
                (cat.clone(), count_a - count_b)
            })
            .collect();
        OutputBreakdown {
            categories_a,
            categories_b,
            category_deltas,
        }
    });

    CompareResult {
        comparison: Comparison {
            counts,
            exceptions,
            divergence_point,
            output_breakdown,
        },
        session_a: SessionBrief::new(a, now),
        session_b: SessionBrief::new(b, now),
        compare_by: by.as_str().to_string(),
    }
}

/// First output index where category or text differ.
fn divergence(a: &CapturedSession, b: &CapturedSession) -> Divergence {
    let found = a
        .outputs
        .iter()
        .zip(b.outputs.iter())
        .position(|(x, y)| x.text != y.text || x.category != y.category);

    match found {
        Some(idx) => {
            let (x, y) = (&a.outputs[idx], &b.outputs[idx]);
            Divergence::At {
                output_index: idx,
                timestamp_a: x.ts,
                timestamp_b: y.ts,
                relative_time_a: x.ts - a.start_time,
                relative_time_b: y.ts - b.start_time,
                text_a: truncate_chars(&x.text, DIVERGENCE_TEXT_CHARS),
                text_b: truncate_chars(&y.text, DIVERGENCE_TEXT_CHARS),
            }
        }
        None => Divergence::Prefix {
            message: "Sessions matched until one ended".to_string(),
            shorter_session: if a.outputs.len() < b.outputs.len() {
                "A".to_string()
            } else {
                "B".to_string()
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::store::{ExceptionRecord, OutputEvent};

    fn session(id: &str, lines: &[(&str, &str)]) -> CapturedSession {
        let mut session = CapturedSession::new(id, "node", id, 500);
        for (i, (category, text)) in lines.iter().enumerate() {
            session.outputs.push_back(OutputEvent {
                ts: 500 + i as i64 * 100,
                category: category.to_string(),
                text: text.to_string(),
                source: None,
                line: None,
                column: None,
            });
        }
        session
    }

    fn exception(message: &str) -> ExceptionRecord {
        ExceptionRecord {
            thread_id: None,
            message: message.to_string(),
            description: None,
            type_name: None,
            stack_frames: None,
        }
    }

    #[test]
    fn test_count_deltas_are_a_minus_b() {
        let a = session("a", &[("stdout", "start")]);
        let b = session("b", &[("stdout", "start"), ("stderr", "boom")]);

        let result = compare(&a, &b, CompareBy::Counts, 1_000);
        assert_eq!(result.comparison.counts.delta_outputs, -1);
        assert_eq!(result.comparison.counts.delta_exceptions, 0);
        assert!(!result.comparison.counts.exit_code_changed);
        assert!(result.comparison.exceptions.is_some());
        assert!(result.comparison.divergence_point.is_none());
        assert_eq!(result.session_b.outputs, 2);
        assert_eq!(result.compare_by, "counts");
    }

    #[test]
    fn test_exception_sets() {
        let mut a = session("a", &[]);
        let mut b = session("b", &[]);
        a.exceptions = vec![exception("TypeError"), exception("RangeError")];
        b.exceptions = vec![exception("RangeError"), exception("SyntaxError")];
        b.exit_code = Some(1);

        let result = compare(&a, &b, CompareBy::Exceptions, 1_000);
        let diff = result.comparison.exceptions.expect("exception diff");
        assert_eq!(diff.only_in_a, vec!["TypeError"]);
        assert_eq!(diff.only_in_b, vec!["SyntaxError"]);
        assert_eq!(diff.common, vec!["RangeError"]);
        assert!(result.comparison.counts.exit_code_changed);
    }

    #[test]
    fn test_divergence_and_breakdown() {
        let a = session("a", &[("stdout", "start"), ("stdout", "ok")]);
        let b = session("b", &[("stdout", "start"), ("stderr", "boom"), ("stderr", "again")]);

        let result = compare(&a, &b, CompareBy::Outputs, 1_000);
        match result.comparison.divergence_point.expect("divergence") {
            Divergence::At {
                output_index,
                relative_time_a,
                text_b,
                ..
            } => {
                assert_eq!(output_index, 1);
                assert_eq!(relative_time_a, 100);
                assert_eq!(text_b, "boom");
            }
            other => panic!("unexpected divergence: {other:?}"),
        }
        let breakdown = result.comparison.output_breakdown.expect("breakdown");
        assert_eq!(breakdown.category_deltas.get("stdout"), Some(&1));
        assert_eq!(breakdown.category_deltas.get("stderr"), Some(&-2));
    }

    #[test]
    fn test_identical_prefix_reports_shorter_session() {
        let a = session("a", &[("stdout", "start")]);
        let b = session("b", &[("stdout", "start"), ("stdout", "more")]);

        let result = compare(&a, &b, CompareBy::Timeline, 1_000);
        assert_eq!(
            result.comparison.divergence_point,
            Some(Divergence::Prefix {
                message: "Sessions matched until one ended".into(),
                shorter_session: "A".into(),
            })
        );
        assert!(result.comparison.exceptions.is_none());
    }
}
