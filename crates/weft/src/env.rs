use std::env;
use std::sync::OnceLock;

static WEFT_EXECUTOR_THREADS: OnceLock<usize> = OnceLock::new();
static WEFT_TRACE: OnceLock<bool> = OnceLock::new();
static WEFT_PATTERN_CACHE_CAP: OnceLock<usize> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_usize(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok()
}

pub(crate) fn executor_threads() -> usize {
    *WEFT_EXECUTOR_THREADS.get_or_init(|| {
        env::var("WEFT_EXECUTOR_THREADS")
            .ok()
            .and_then(|v| parse_usize(&v))
            .filter(|&n| n > 0)
            .unwrap_or(32)
    })
}

pub(crate) fn trace_enabled() -> bool {
    *WEFT_TRACE.get_or_init(|| match env::var("WEFT_TRACE") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

pub(crate) fn pattern_cache_capacity() -> usize {
    *WEFT_PATTERN_CACHE_CAP.get_or_init(|| {
        env::var("WEFT_PATTERN_CACHE_CAP")
            .ok()
            .and_then(|v| parse_usize(&v))
            .filter(|&n| n > 0)
            .unwrap_or(64)
    })
}
