use crate::{format_timestamp, ColumnLayout, Row, TIMESTAMP_COLUMN};
use clap::ValueEnum;
use log::{info, warn};
use num_format::{Locale, ToFormattedString};
use serde::Deserialize;
use std::{
    collections::VecDeque,
    fmt,
    io::{self, Write},
    time::{Duration, Instant},
};

#[derive(Deserialize, ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    /// Bar when a duration is set, else counter
    Auto,
    /// Running sample count and rate
    Counter,
    /// Fraction of the target duration
    Bar,
    /// No progress output
    None,
}

impl ProgressMode {
    pub fn resolve(self, has_duration: bool) -> Self {
        match self {
            ProgressMode::Auto if has_duration => ProgressMode::Bar,
            ProgressMode::Auto => ProgressMode::Counter,
            other => other,
        }
    }
}

/// Read-only view of a session at one instant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressSnapshot {
    pub taken_at: Instant,
    /// Wall-clock time since the session started.
    pub elapsed: Duration,
    /// Time covered by the rows written, on the sample clock.
    pub acquired: Duration,
    pub rows_written: u64,
    pub channel_count: usize,
    pub target: Option<Duration>,
}

/// Rows-per-second over a sliding window of recent appends.
#[derive(Debug)]
pub struct RateWindow {
    window: Duration,
    events: VecDeque<(Instant, u64)>,
}

impl Default for RateWindow {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl RateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: VecDeque::new(),
        }
    }

    /// Record `rows` appended at `now` and evict entries older than the window.
    /// The two newest entries are always kept so slow chunk cadences still
    /// yield a rate.
    pub fn record(&mut self, now: Instant, rows: u64) {
        self.events.push_back((now, rows));
        while self.events.len() > 2 {
            match self.events.front() {
                Some(&(ts, _)) if now.duration_since(ts) > self.window => {
                    self.events.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Rows per second between the oldest and newest entry, if they differ in time.
    pub fn rate(&self) -> Option<f64> {
        let (first, _) = *self.events.front()?;
        let (last, _) = *self.events.back()?;
        let span = last.duration_since(first).as_secs_f64();
        if span <= 0.0 {
            return None;
        }
        let rows: u64 = self.events.iter().skip(1).map(|&(_, n)| n).sum();
        Some(rows as f64 / span)
    }

    pub fn reset(&mut self) {
        self.events.clear();
    }
}

/// Refresh cap: report only when at least `min_interval` passed since the last one.
pub fn maybe_report(now: Instant, last_report: Instant, min_interval: Duration) -> (bool, Instant) {
    if now.saturating_duration_since(last_report) >= min_interval {
        (true, now)
    } else {
        (false, last_report)
    }
}

pub fn format_rate(samples_per_sec: f64) -> String {
    if samples_per_sec >= 1e6 {
        format!("{:.2} MS/s", samples_per_sec / 1e6)
    } else if samples_per_sec >= 1e3 {
        format!("{:.2} kS/s", samples_per_sec / 1e3)
    } else {
        format!("{samples_per_sec:.0} S/s")
    }
}

/// What a display should show for one report.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressLine {
    Counter(String),
    Bar { ratio: f64, label: String },
}

const BAR_WIDTH: usize = 30;

impl ProgressLine {
    /// `rows_per_sec` is per channel. Bar mode without a target falls back to a counter.
    pub fn build(mode: ProgressMode, snap: &ProgressSnapshot, rows_per_sec: f64) -> Option<Self> {
        let elapsed = snap.elapsed.as_secs_f64();
        match (mode, snap.target) {
            (ProgressMode::None, _) => None,
            (ProgressMode::Bar, Some(target)) => {
                let target = target.as_secs_f64();
                let acquired = snap.acquired.as_secs_f64();
                let ratio = (acquired / target).clamp(0.0, 1.0);
                let remaining = (target - acquired).max(0.0);
                let label = format!(
                    "{:3}% | elapsed {elapsed:5.1}s | ETA {remaining:5.1}s",
                    (ratio * 100.0) as u32
                );
                Some(ProgressLine::Bar { ratio, label })
            }
            _ => {
                let total = snap.rows_written * snap.channel_count as u64;
                Some(ProgressLine::Counter(format!(
                    "[{elapsed:6.1}s] samples/ch: {} | total: {} | ~{}",
                    snap.rows_written.to_formatted_string(&Locale::en),
                    total.to_formatted_string(&Locale::en),
                    format_rate(rows_per_sec * snap.channel_count as f64),
                )))
            }
        }
    }
}

impl fmt::Display for ProgressLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressLine::Counter(text) => f.write_str(text),
            ProgressLine::Bar { ratio, label } => {
                let filled = ((ratio * BAR_WIDTH as f64) as usize).min(BAR_WIDTH);
                write!(
                    f,
                    "[{}{}] {label}",
                    "█".repeat(filled),
                    " ".repeat(BAR_WIDTH - filled)
                )
            }
        }
    }
}

/// Where progress lines and preview text end up.
pub trait ProgressDisplay {
    /// Repaint the progress line.
    fn render(&mut self, line: &ProgressLine) -> io::Result<()>;

    /// Print a line of text above the progress line.
    fn note(&mut self, text: &str) -> io::Result<()>;

    /// Leave the display in a state where normal output can follow.
    fn finish(&mut self) -> io::Result<()>;
}

/// Emits reports as log lines and writes notes to `out`, for non-interactive output.
#[derive(Debug)]
pub struct LogDisplay<W: io::Write = io::Stdout> {
    out: W,
}

impl LogDisplay {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: io::Write> LogDisplay<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: io::Write> ProgressDisplay for LogDisplay<W> {
    fn render(&mut self, line: &ProgressLine) -> io::Result<()> {
        info!("{line}");
        Ok(())
    }

    fn note(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.out, "{text}")?;
        self.out.flush()
    }

    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Formats the first rows of a run for the console.
#[derive(Debug)]
pub struct RowPreview {
    remaining: usize,
    started: bool,
}

impl RowPreview {
    pub fn new(rows: usize) -> Self {
        Self {
            remaining: rows,
            started: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// Lines to print for `rows`, including the header and the start/end markers.
    pub fn lines(&mut self, layout: &ColumnLayout, rows: &[Row]) -> Vec<String> {
        let mut out = Vec::new();
        if self.remaining == 0 || rows.is_empty() {
            return out;
        }
        if !self.started {
            self.started = true;
            out.push("(…start of preview…)".to_string());
            let mut header = vec![TIMESTAMP_COLUMN.to_string(), "idx".to_string()];
            header.extend(layout.analog.iter().cloned());
            header.extend(layout.digital.iter().cloned());
            out.push(header.join(" | "));
        }
        for row in rows.iter().take(self.remaining) {
            let mut fields = vec![
                format_timestamp(row.timestamp).unwrap_or_else(|_| row.timestamp.to_string()),
                row.index.to_string(),
            ];
            fields.extend(row.analog.iter().map(|v| format!("{v:.6}")));
            fields.extend(
                row.digital
                    .states()
                    .iter()
                    .map(|&d| u8::from(d).to_string()),
            );
            out.push(fields.join(" | "));
            self.remaining -= 1;
        }
        if self.remaining == 0 {
            out.push("(…end of preview…)".to_string());
        }
        out
    }
}

/// Rate-limited progress output for one run.
pub struct ProgressReporter {
    mode: ProgressMode,
    min_interval: Duration,
    last_report: Instant,
    rate: RateWindow,
    display: Box<dyn ProgressDisplay>,
    preview: RowPreview,
    reports: u64,
    finished: bool,
    display_failed: bool,
}

impl ProgressReporter {
    /// `mode` should already be resolved; `Auto` is treated like its resolution
    /// for the first snapshot's target.
    pub fn new(
        mode: ProgressMode,
        min_interval: Duration,
        preview_rows: usize,
        display: Box<dyn ProgressDisplay>,
        start: Instant,
    ) -> Self {
        Self {
            mode,
            min_interval,
            last_report: start,
            rate: RateWindow::default(),
            display,
            preview: RowPreview::new(preview_rows),
            reports: 0,
            finished: false,
            display_failed: false,
        }
    }

    /// Number of lines rendered so far.
    pub fn reports(&self) -> u64 {
        self.reports
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed the rate window with rows just handed to the sink.
    pub fn record_rows(&mut self, now: Instant, rows: u64) {
        self.rate.record(now, rows);
    }

    /// Print preview lines for freshly written rows, if any are still due.
    pub fn preview(&mut self, layout: &ColumnLayout, rows: &[Row]) {
        if self.preview.is_done() {
            return;
        }
        for line in self.preview.lines(layout, rows) {
            let res = self.display.note(&line);
            self.check(res);
        }
    }

    /// Render if the refresh interval has passed. Returns whether a line was drawn.
    pub fn maybe_report(&mut self, snap: &ProgressSnapshot) -> bool {
        if self.finished {
            return false;
        }
        let (due, last) = maybe_report(snap.taken_at, self.last_report, self.min_interval);
        self.last_report = last;
        due && self.render(snap)
    }

    /// Forced final report, ignoring the interval. Only the first call renders.
    pub fn finish(&mut self, snap: &ProgressSnapshot) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        self.last_report = snap.taken_at;
        let drawn = self.render(snap);
        let res = self.display.finish();
        self.check(res);
        drawn
    }

    fn render(&mut self, snap: &ProgressSnapshot) -> bool {
        let mode = self.mode.resolve(snap.target.is_some());
        let rows_per_sec = self.rate.rate().unwrap_or_else(|| {
            let secs = snap.elapsed.as_secs_f64();
            if secs > 0.0 {
                snap.rows_written as f64 / secs
            } else {
                0.0
            }
        });
        match ProgressLine::build(mode, snap, rows_per_sec) {
            Some(line) => {
                let res = self.display.render(&line);
                self.check(res);
                self.reports += 1;
                true
            }
            None => false,
        }
    }

    fn check(&mut self, res: io::Result<()>) {
        if let Err(e) = res {
            if !self.display_failed {
                warn!("Progress display failed, continuing without it: {e}");
            }
            self.display_failed = true;
        }
    }
}
