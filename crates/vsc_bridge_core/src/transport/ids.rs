use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use rand::Rng;

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

const RESERVED_NAMES: &[&str] = &["CON", "PRN", "AUX", "NUL"];
const MAX_JOB_ID_LEN: usize = 64;

/// Client job id: `YYYYMMDDTHHMMSSfffZ-<seq>-<rand>`, lexically ordered by creation time.
pub fn sortable_id() -> String {
    sortable_id_at(Utc::now())
}

fn sortable_id_at(now: DateTime<Utc>) -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) % 10_000;
    let suffix: u16 = rand::thread_rng().gen();
    format!("{}-{seq:04}-{suffix:04x}", now.format("%Y%m%dT%H%M%S%3fZ"))
}

/// Host-originated id: `YYYYMMDDTHHMMSS.fffZ-<pid>-<rand>`.
pub fn host_job_id() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!(
        "{}-{}-{suffix:06x}",
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
        std::process::id()
    )
}

/// Whether `id` can safely name a job directory on every platform.
pub fn is_valid_job_id(id: &str) -> bool {
    if id.is_empty() || id.len() > MAX_JOB_ID_LEN {
        return false;
    }
    if id.chars().any(|c| matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c.is_control()) {
        return false;
    }
    if id.ends_with('.') || id.ends_with(' ') || id == "." || id == ".." {
        return false;
    }
    let stem = id.split('.').next().unwrap_or(id).to_ascii_uppercase();
    if RESERVED_NAMES.contains(&stem.as_str()) {
        return false;
    }
    let is_numbered_device = (stem.starts_with("COM") || stem.starts_with("LPT"))
        && stem.len() == 4
        && stem.as_bytes()[3].is_ascii_digit();
    !is_numbered_device
}
