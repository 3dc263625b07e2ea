use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::models::ProgressRecord;

const DURATION_MARKER: &str = "Duration:";
const TIME_MARKER: &str = "time=";
const SPEED_MARKER: &str = "speed=";

/// Turns an engine's diagnostic lines into throttled progress records.
///
/// One parser is created per engine run. The first duration marker fixes the
/// total; every later position marker yields a record once the total is known.
/// Lines carrying neither marker are kept in a bounded tail for failure reports.
#[derive(Debug)]
pub struct ProgressParser {
    total: Option<Duration>,
    min_interval: Duration,
    last_emitted: Option<Instant>,
    diagnostics: VecDeque<String>,
    capacity: usize,
}

impl ProgressParser {
    pub fn new(min_interval: Duration, diagnostic_capacity: usize) -> Self {
        Self {
            total: None,
            min_interval,
            last_emitted: None,
            diagnostics: VecDeque::with_capacity(diagnostic_capacity),
            capacity: diagnostic_capacity,
        }
    }

    pub fn total_duration(&self) -> Option<Duration> {
        self.total
    }

    /// Parses one line without throttling.
    pub fn parse_line(&mut self, line: &str) -> Option<ProgressRecord> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(total) = marker_value(line, DURATION_MARKER).and_then(parse_timestamp) {
            if self.total.is_none() && !total.is_zero() {
                self.total = Some(total);
            }
            return None;
        }

        let Some(position) = marker_value(line, TIME_MARKER) else {
            self.remember(line);
            return None;
        };

        let total = self.total?;
        let current = parse_timestamp(position)?;
        let speed = parse_speed(line);

        let percentage = (current.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0);
        // Tiny speeds can push the estimate past what a Duration holds.
        let eta = speed.filter(|speed| *speed > 0.0).and_then(|speed| {
            let remaining = total.saturating_sub(current).as_secs_f64();
            Duration::try_from_secs_f64(remaining / speed).ok()
        });

        Some(ProgressRecord {
            percentage,
            elapsed: current,
            total,
            speed,
            eta,
        })
    }

    /// Parses one line and returns a record only if the throttle interval has passed.
    pub fn feed_line(&mut self, line: &str) -> Option<ProgressRecord> {
        self.feed_line_at(line, Instant::now())
    }

    pub fn feed_line_at(&mut self, line: &str, now: Instant) -> Option<ProgressRecord> {
        let record = self.parse_line(line)?;

        if let Some(last) = self.last_emitted
            && now.saturating_duration_since(last) < self.min_interval
        {
            return None;
        }

        self.last_emitted = Some(now);
        Some(record)
    }

    /// The retained non-progress lines, oldest first, joined by newlines.
    pub fn diagnostic_tail(&self) -> String {
        self.diagnostics
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn remember(&mut self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        if self.diagnostics.len() == self.capacity {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(line.to_string());
    }
}

/// Parses `HH:MM:SS` with an optional fractional part into a duration.
///
/// Negative stamps and placeholders such as `N/A` yield `None`.
pub fn parse_timestamp(value: &str) -> Option<Duration> {
    let mut parts = value.split(':');
    let hours = parts.next()?;
    let minutes = parts.next()?;
    let seconds = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let all_digits = |text: &str| !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(hours) || !all_digits(minutes) {
        return None;
    }

    let (whole, fraction) = seconds.split_once('.').unwrap_or((seconds, ""));
    if !all_digits(whole) || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let hours: u64 = hours.parse().ok()?;
    let minutes: u64 = minutes.parse().ok()?;
    let seconds: f64 = seconds.parse().ok()?;
    if minutes >= 60 || seconds >= 60.0 {
        return None;
    }

    let whole_minutes = hours.checked_mul(3600)?.checked_add(minutes * 60)?;
    Duration::try_from_secs_f64(whole_minutes as f64 + seconds).ok()
}

/// Renders a duration as `HH:MM:SS`, rounding down to whole seconds.
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

fn marker_value<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let start = line.find(marker)? + marker.len();
    let rest = line[start..].trim_start();
    let end = rest
        .find(|c: char| c.is_whitespace() || c == ',')
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

fn parse_speed(line: &str) -> Option<f64> {
    let value = marker_value(line, SPEED_MARKER)?;
    let number = value.strip_suffix('x')?;
    let speed: f64 = number.parse().ok()?;
    speed.is_finite().then_some(speed)
}
