use std::collections::BTreeMap;

use regex::Regex;
use serde::Serialize;

use super::{CapturedSession, OutputLine};

const CONTEXT_TEXT_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub pattern: Regex,
    /// `None` searches every category.
    pub category: Option<String>,
    pub context_lines: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedOutput {
    pub ts: i64,
    pub relative_time: i64,
    pub category: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchContext {
    pub before: Vec<OutputLine>,
    pub after: Vec<OutputLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMatch {
    pub session_id: String,
    pub output: MatchedOutput,
    pub match_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<MatchContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub matches: Vec<SearchMatch>,
    pub total_matches: usize,
    pub matches_by_session: BTreeMap<String, usize>,
    pub sessions_searched: usize,
    pub pattern: String,
    pub truncated: bool,
}

/// Regex search across session outputs with an optional context window.
pub fn search(sessions: &[CapturedSession], query: &SearchQuery) -> SearchResult {
    let mut matches = Vec::new();
    let mut matches_by_session = BTreeMap::new();

    for session in sessions {
        let outputs: Vec<_> = session
            .outputs
            .iter()
            .filter(|o| query.category.as_deref().map_or(true, |c| o.category == c))
            .collect();

        for (idx, output) in outputs.iter().enumerate() {
            let Some(found) = query.pattern.find(&output.text) else {
                continue;
            };
            let context = (query.context_lines > 0).then(|| {
                let start = idx.saturating_sub(query.context_lines);
                let end = (idx + query.context_lines + 1).min(outputs.len());
                MatchContext {
                    before: outputs[start..idx]
                        .iter()
                        .map(|o| OutputLine::from_output(o, CONTEXT_TEXT_CHARS))
                        .collect(),
                    after: outputs[idx + 1..end]
                        .iter()
                        .map(|o| OutputLine::from_output(o, CONTEXT_TEXT_CHARS))
                        .collect(),
                }
            });
            matches.push(SearchMatch {
                session_id: session.session_id.clone(),
                output: MatchedOutput {
                    ts: output.ts,
                    relative_time: output.ts - session.start_time,
                    category: output.category.clone(),
                    text: output.text.clone(),
                },
                match_text: Some(found.as_str().to_string()),
                context,
            });
            *matches_by_session
                .entry(session.session_id.clone())
                .or_insert(0) += 1;
        }
    }

    let total_matches = matches.len();
    matches.truncate(query.limit);
    SearchResult {
        matches,
        total_matches,
        matches_by_session,
        sessions_searched: sessions.len(),
        pattern: query.pattern.as_str().to_string(),
        truncated: total_matches > query.limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::store::{CapturedSession, OutputEvent};
    use regex::RegexBuilder;

    fn session(id: &str, lines: &[(&str, &str)]) -> CapturedSession {
        let mut session = CapturedSession::new(id, "node", id, 1_000);
        for (i, (category, text)) in lines.iter().enumerate() {
            session.outputs.push_back(OutputEvent {
                ts: 1_000 + i as i64 * 10,
                category: category.to_string(),
                text: text.to_string(),
                source: None,
                line: None,
                column: None,
            });
        }
        session
    }

    fn query(pattern: &str, context_lines: usize, limit: usize) -> SearchQuery {
        SearchQuery {
            pattern: RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("valid regex"),
            category: None,
            context_lines,
            limit,
        }
    }

    #[test]
    fn test_matches_with_context() {
        let s = session(
            "s1",
            &[("stdout", "start"), ("stdout", "loading"), ("stderr", "ERROR boom"), ("stdout", "after")],
        );
        let result = search(&[s], &query("error", 1, 50));

        assert_eq!(result.total_matches, 1);
        let m = &result.matches[0];
        assert_eq!(m.match_text.as_deref(), Some("ERROR"));
        assert_eq!(m.output.relative_time, 20);
        let context = m.context.as_ref().expect("context");
        assert_eq!(context.before.len(), 1);
        assert_eq!(context.before[0].text, "loading");
        assert_eq!(context.after[0].text, "after");
        assert_eq!(result.matches_by_session.get("s1"), Some(&1));
        assert!(!result.truncated);
    }

    #[test]
    fn test_limit_and_category_filter() {
        let a = session("a", &[("stdout", "tick"), ("stderr", "tick"), ("stdout", "tick")]);
        let b = session("b", &[("stdout", "tick")]);

        let result = search(&[a.clone(), b], &query("tick", 0, 2));
        assert_eq!(result.total_matches, 4);
        assert_eq!(result.matches.len(), 2);
        assert!(result.truncated);
        assert_eq!(result.sessions_searched, 2);
        assert!(result.matches[0].context.is_none());

        let mut stderr_only = query("tick", 0, 10);
        stderr_only.category = Some("stderr".into());
        assert_eq!(search(&[a], &stderr_only).total_matches, 1);
    }
}
