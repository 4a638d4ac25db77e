use regex::Regex;
use std::sync::OnceLock;

const SIZE: &str = r"([\d.]+[KMGT]?B)";

/// One parsed snapshot of a running download. Every field is optional: the
/// tool prints several shapes of progress line and each carries a different
/// subset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSample {
    pub current: Option<String>,
    pub total: Option<String>,
    pub speed: Option<String>,
    pub remaining: Option<String>,
    pub percent: Option<u8>,
}

struct Patterns {
    full: Regex,
    worker: Regex,
    percent: Regex,
    pair: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        full: Regex::new(&format!(
            r"↓\s*{SIZE}/{SIZE}\s+([\d.]+[KMGT]?B/s).*left\s+([\dhms]+)"
        ))
        .expect("valid regex"),
        worker: Regex::new(&format!(
            r"\[\d+\]\s+↓\s*{SIZE}/{SIZE}\s+([\d.]+[KMGT]?B/s)"
        ))
        .expect("valid regex"),
        percent: Regex::new(r"([0-9]+)%").expect("valid regex"),
        pair: Regex::new(&format!(r"{SIZE}/{SIZE}")).expect("valid regex"),
    })
}

/// Scans a chunk of download output line by line and returns the first
/// progress sample found. Lines are split on both `\n` and `\r` because the
/// tool redraws its progress bar in place.
pub fn parse_progress(chunk: &str) -> Option<ProgressSample> {
    chunk
        .split(['\n', '\r'])
        .find_map(parse_progress_line)
}

fn parse_progress_line(line: &str) -> Option<ProgressSample> {
    let patterns = patterns();
    let capture = |caps: &regex::Captures<'_>, idx: usize| {
        caps.get(idx).map(|m| m.as_str().to_string())
    };

    if let Some(caps) = patterns.full.captures(line) {
        return Some(ProgressSample {
            current: capture(&caps, 1),
            total: capture(&caps, 2),
            speed: capture(&caps, 3),
            remaining: capture(&caps, 4),
            percent: None,
        });
    }
    if let Some(caps) = patterns.worker.captures(line) {
        return Some(ProgressSample {
            current: capture(&caps, 1),
            total: capture(&caps, 2),
            speed: capture(&caps, 3),
            ..ProgressSample::default()
        });
    }
    if let Some(caps) = patterns.percent.captures(line) {
        // Digits only, so a failed parse means the value overflowed u64.
        let percent = caps[1].parse::<u64>().unwrap_or(u64::MAX).min(100) as u8;
        return Some(ProgressSample {
            percent: Some(percent),
            ..ProgressSample::default()
        });
    }
    if let Some(caps) = patterns.pair.captures(line) {
        return Some(ProgressSample {
            current: capture(&caps, 1),
            total: capture(&caps, 2),
            ..ProgressSample::default()
        });
    }
    None
}

/// Converts a display size such as `5.27GB` into bytes using binary
/// multiples. The unit is matched case-insensitively.
pub fn to_bytes(size: &str) -> Option<f64> {
    static SIZE_RE: OnceLock<Regex> = OnceLock::new();
    let re = SIZE_RE
        .get_or_init(|| Regex::new(r"(?i)([\d.]+)\s*([KMGT]?B)").expect("valid regex"));
    let caps = re.captures(size)?;
    let value = caps[1].parse::<f64>().ok()?;
    let multiplier = match caps[2].to_ascii_uppercase().as_str() {
        "TB" => 1024f64.powi(4),
        "GB" => 1024f64.powi(3),
        "MB" => 1024f64.powi(2),
        "KB" => 1024f64,
        _ => 1.0,
    };
    Some(value * multiplier)
}

/// Running percent for a single download. Never reports a value lower than
/// one it already reported.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last_total: Option<String>,
    last_percent: u8,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_percent(&self) -> u8 {
        self.last_percent
    }

    pub fn observe(&mut self, sample: &ProgressSample) -> u8 {
        if let Some(total) = sample.total.as_ref() {
            self.last_total = Some(total.clone());
        }

        let candidate = match (sample.current.as_deref(), self.last_total.as_deref()) {
            (Some(current), Some(total)) => ratio_percent(current, total),
            _ => None,
        }
        .or(sample.percent.map(|value| value.min(100)));

        if let Some(percent) = candidate {
            self.last_percent = self.last_percent.max(percent);
        }
        self.last_percent
    }
}

fn ratio_percent(current: &str, total: &str) -> Option<u8> {
    let current = to_bytes(current)?;
    let total = to_bytes(total)?;
    if total <= 0.0 {
        return None;
    }
    let percent = (current / total * 100.0).floor();
    Some(percent.clamp(0.0, 100.0) as u8)
}
