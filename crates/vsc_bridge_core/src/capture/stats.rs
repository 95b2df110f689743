use std::collections::{BTreeMap, HashMap};

use chrono::{TimeZone, Utc};
use serde::Serialize;

use super::{truncate_chars, CapturedSession};

const MESSAGE_KEY_CHARS: usize = 100;
const BAR_WIDTH: usize = 40;
const SPARK_CHARS: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
/// A gap between outputs this many times the mean gap counts as an anomaly.
const GAP_FACTOR: f64 = 10.0;
/// A one-second bucket this many times the mean rate counts as a spike.
const SPIKE_FACTOR: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Category,
    Source,
    Hour,
    Session,
}

impl GroupBy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "category" => Some(Self::Category),
            "source" => Some(Self::Source),
            "hour" => Some(Self::Hour),
            "session" => Some(Self::Session),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    pub by_category: BTreeMap<String, usize>,
    pub by_source: BTreeMap<String, usize>,
    pub over_time: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_session: Option<BTreeMap<String, usize>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Counted {
    pub key: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopN {
    pub most_frequent_messages: Vec<Counted>,
    pub noisiest_files: Vec<Counted>,
    pub exception_hotspots: Vec<Counted>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Averages {
    pub events_per_second: f64,
    pub time_between_outputs: i64,
    pub outputs_per_session: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub ts: i64,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Anomalies {
    pub spikes: Vec<Anomaly>,
    pub gaps: Vec<Anomaly>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryBar {
    pub category: String,
    pub count: usize,
    pub percentage: f64,
    pub bar: String,
    pub bar_length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sparkline {
    pub sparkline: String,
    pub hours: Vec<String>,
    pub counts: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Charts {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub category_distribution: Vec<CategoryBar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeline: Option<Sparkline>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub total_outputs: usize,
    pub total_exceptions: usize,
    pub sessions_analyzed: usize,
    pub timespan: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResult {
    pub distribution: Distribution,
    pub top_n: TopN,
    pub averages: Averages,
    pub anomalies: Anomalies,
    pub charts: Charts,
    pub summary: StatsSummary,
}

fn top(counts: HashMap<String, usize>, n: usize) -> Vec<Counted> {
    let mut entries: Vec<Counted> = counts
        .into_iter()
        .map(|(key, count)| Counted { key, count })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    entries.truncate(n);
    entries
}

fn hour_bucket(ts: i64) -> String {
    Utc.timestamp_millis_opt(ts)
        .single()
        .map(|t| t.format("%Y-%m-%dT%H:00").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Aggregate metrics over one or more sessions.
pub fn stats(sessions: &[CapturedSession], group_by: GroupBy, include_charts: bool, now: i64) -> StatsResult {
    let outputs: Vec<_> = sessions.iter().flat_map(|s| s.outputs.iter()).collect();
    let exception_count: usize = sessions.iter().map(|s| s.exceptions.len()).sum();

    let mut by_category = BTreeMap::new();
    let mut source_counts: HashMap<String, usize> = HashMap::new();
    let mut over_time = BTreeMap::new();
    let mut messages: HashMap<String, usize> = HashMap::new();
    for output in &outputs {
        *by_category.entry(output.category.clone()).or_insert(0) += 1;
        if let Some(path) = output.source_path() {
            *source_counts.entry(path.to_string()).or_insert(0) += 1;
        }
        *over_time.entry(hour_bucket(output.ts)).or_insert(0) += 1;
        *messages
            .entry(truncate_chars(&output.text, MESSAGE_KEY_CHARS))
            .or_insert(0) += 1;
    }

    let mut hotspots: HashMap<String, usize> = HashMap::new();
    for exception in sessions.iter().flat_map(|s| s.exceptions.iter()) {
        let top_frame = exception
            .stack_frames
            .as_ref()
            .and_then(|frames| frames.as_array())
            .and_then(|frames| frames.first());
        if let Some(frame) = top_frame {
            let file = frame
                .pointer("/source/path")
                .or_else(|| frame.get("source"))
                .map(|s| s.as_str().map(str::to_string).unwrap_or_else(|| s.to_string()))
                .unwrap_or_default();
            let line = frame.get("line").and_then(|l| l.as_i64()).unwrap_or(0);
            *hotspots.entry(format!("{file}:{line}")).or_insert(0) += 1;
        }
    }

    let noisiest_files = top(source_counts.clone(), 10);
    let by_source: BTreeMap<String, usize> = top(source_counts, 20)
        .into_iter()
        .map(|c| (c.key, c.count))
        .collect();
    let by_session = (group_by == GroupBy::Session).then(|| {
        sessions
            .iter()
            .map(|s| (s.session_id.clone(), s.outputs.len()))
            .collect()
    });

    let total_duration: i64 = sessions.iter().map(|s| s.duration_ms(now)).sum();
    let total_secs = total_duration as f64 / 1000.0;
    let averages = Averages {
        events_per_second: if total_secs > 0.0 {
            round2(outputs.len() as f64 / total_secs)
        } else {
            0.0
        },
        time_between_outputs: if outputs.len() > 1 {
            (total_duration as f64 / (outputs.len() - 1) as f64).round() as i64
        } else {
            0
        },
        outputs_per_session: if sessions.is_empty() {
            0
        } else {
            (outputs.len() as f64 / sessions.len() as f64).round() as usize
        },
    };

    let charts = if include_charts {
        build_charts(&by_category, &over_time, outputs.len())
    } else {
        Charts::default()
    };

    StatsResult {
        distribution: Distribution {
            by_category,
            by_source,
            over_time,
            by_session,
        },
        top_n: TopN {
            most_frequent_messages: top(messages, 10),
            noisiest_files,
            exception_hotspots: top(hotspots, 5),
        },
        averages,
        anomalies: detect_anomalies(sessions),
        charts,
        summary: StatsSummary {
            total_outputs: outputs.len(),
            total_exceptions: exception_count,
            sessions_analyzed: sessions.len(),
            timespan: format!("{total_secs:.2}s"),
        },
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn build_charts(
    by_category: &BTreeMap<String, usize>,
    over_time: &BTreeMap<String, usize>,
    total: usize,
) -> Charts {
    let max = by_category.values().copied().max().unwrap_or(0);
    let category_distribution = by_category
        .iter()
        .map(|(category, &count)| {
            let bar_length = if max > 0 { count * BAR_WIDTH / max } else { 0 };
            CategoryBar {
                category: category.clone(),
                count,
                percentage: if total > 0 {
                    (count as f64 * 1000.0 / total as f64).round() / 10.0
                } else {
                    0.0
                },
                bar: "█".repeat(bar_length),
                bar_length,
            }
        })
        .collect();

    let timeline = over_time.values().copied().max().map(|max_hour| {
        let top = SPARK_CHARS.len() - 1;
        Sparkline {
            sparkline: over_time
                .values()
                .map(|&count| SPARK_CHARS[count * top / max_hour.max(1)])
                .collect(),
            hours: over_time.keys().cloned().collect(),
            counts: over_time.values().copied().collect(),
        }
    });

    Charts {
        category_distribution,
        timeline,
    }
}

// Per session: unusually long silences and unusually busy seconds.
fn detect_anomalies(sessions: &[CapturedSession]) -> Anomalies {
    let mut anomalies = Anomalies::default();
    for session in sessions {
        let stamps: Vec<i64> = session.outputs.iter().map(|o| o.ts).collect();
        if stamps.len() < 3 {
            continue;
        }
        let gaps: Vec<i64> = stamps.windows(2).map(|w| (w[1] - w[0]).max(0)).collect();
        let mean_gap = gaps.iter().sum::<i64>() as f64 / gaps.len() as f64;
        for (i, gap) in gaps.iter().enumerate() {
            if mean_gap > 0.0 && *gap as f64 > mean_gap * GAP_FACTOR && *gap >= 1000 {
                anomalies.gaps.push(Anomaly {
                    ts: stamps[i],
                    detail: format!("{}ms without output in {}", gap, session.session_id),
                });
            }
        }

        let mut per_second: BTreeMap<i64, usize> = BTreeMap::new();
        for ts in &stamps {
            *per_second.entry(ts.div_euclid(1000)).or_insert(0) += 1;
        }
        if per_second.len() < 2 {
            continue;
        }
        let mean_rate = stamps.len() as f64 / per_second.len() as f64;
        for (second, count) in per_second {
            if count as f64 > mean_rate * SPIKE_FACTOR {
                anomalies.spikes.push(Anomaly {
                    ts: second * 1000,
                    detail: format!("{} outputs in one second in {}", count, session.session_id),
                });
            }
        }
    }
    anomalies
}
