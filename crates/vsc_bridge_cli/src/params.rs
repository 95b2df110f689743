use std::time::Duration;

use anyhow::{bail, Context};
use serde_json::{Map, Value};

/// Extra client time over a script's own `timeoutMs` so the host answers first.
const WAIT_HEADROOM: Duration = Duration::from_secs(5);

/// Build script params from an optional JSON object plus `key=value` pairs.
/// Scalars stay strings; the host's schema coerces them.
pub fn build(json: Option<&str>, pairs: &[String]) -> anyhow::Result<Value> {
    let mut params = match json {
        Some(raw) => match serde_json::from_str::<Value>(raw).context("--params is not valid JSON")? {
            Value::Object(map) => map,
            other => bail!("--params must be a JSON object, got {other}"),
        },
        None => Map::new(),
    };

    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected key=value, got '{pair}'");
        };
        if key.is_empty() {
            bail!("empty parameter name in '{pair}'");
        }
        params.insert(key.to_string(), parse_value(value));
    }
    Ok(Value::Object(params))
}

/// The client timeout for a job whose params may carry a `timeoutMs` of its own.
pub fn client_timeout(base: Duration, params: &Value) -> Duration {
    let script_wait = match params.get("timeoutMs") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    match script_wait {
        Some(ms) => base.max(Duration::from_millis(ms).saturating_add(WAIT_HEADROOM)),
        None => base,
    }
}

fn parse_value(raw: &str) -> Value {
    let structured = raw.starts_with('[') || raw.starts_with('{');
    if structured {
        if let Ok(value) = serde_json::from_str(raw) {
            return value;
        }
    }
    Value::String(raw.to_string())
}
