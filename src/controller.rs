use crate::{
    assemble, AcquisitionDevice, AcquisitionSettings, AcquisitionSource, ColumnLayout, DaqError,
    DaqResult, DigitalSnapshot, ProgressDisplay, ProgressMode, ProgressReporter, ProgressSnapshot,
    RowClock, RowSink, SampleChunk,
};
use log::{debug, error, info, warn};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// How a run stops and reports, validated from configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct RunPlan {
    /// Minimum span of samples to acquire. `None` runs until stopped.
    pub duration: Option<Duration>,
    pub progress: ProgressMode,
    pub update_interval: Duration,
    /// Rows echoed to the console at the start of the run.
    pub preview_rows: usize,
    /// Consecutive read timeouts tolerated before the run fails.
    pub max_timeout_retries: u32,
}

/// Mutable state of the running session. Only the controller changes it.
#[derive(Debug)]
pub struct SessionState {
    pub layout: ColumnLayout,
    pub sample_rate: f64,
    pub chunk_size: usize,
    pub start_time: OffsetDateTime,
    pub started_at: Instant,
    pub target: Option<Duration>,
    rows_written: u64,
    chunks: u64,
    state: RunState,
}

impl SessionState {
    fn new(settings: &AcquisitionSettings, target: Option<Duration>) -> Self {
        Self {
            layout: ColumnLayout::new(settings.channels.clone(), settings.digital_lines.clone()),
            sample_rate: settings.sample_rate,
            chunk_size: settings.chunk_size,
            start_time: OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc()),
            started_at: Instant::now(),
            target,
            rows_written: 0,
            chunks: 0,
            state: RunState::Starting,
        }
    }

    /// Rows handed to the sink without error.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Time covered by the rows written, on the sample clock.
    pub fn acquired(&self) -> Duration {
        Duration::try_from_secs_f64(self.rows_written as f64 / self.sample_rate)
            .unwrap_or(Duration::MAX)
    }

    pub fn target_reached(&self) -> bool {
        self.target.is_some_and(|t| self.acquired() >= t)
    }

    pub fn snapshot(&self, now: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            taken_at: now,
            elapsed: now.saturating_duration_since(self.started_at),
            acquired: self.acquired(),
            rows_written: self.rows_written,
            channel_count: self.layout.analog.len(),
            target: self.target,
        }
    }

    fn enter(&mut self, state: RunState) {
        debug!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn clock(&self) -> RowClock {
        RowClock {
            start_time: self.start_time,
            sample_rate: self.sample_rate,
            chunk_size: self.chunk_size,
            digital_lines: self.layout.digital.len(),
        }
    }
}

#[derive(Debug)]
pub enum StopCause {
    DurationElapsed,
    StopRequested,
    Failed(DaqError),
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCause::DurationElapsed => f.write_str("duration elapsed"),
            StopCause::StopRequested => f.write_str("stopped by user"),
            StopCause::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// What is left of a run once it reached `Stopped`.
#[derive(Debug)]
pub struct RunSummary {
    pub rows_written: u64,
    pub chunks: u64,
    pub elapsed: Duration,
    pub cause: StopCause,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        !matches!(self.cause, StopCause::Failed(_))
    }
}

pub struct Controller {
    settings: AcquisitionSettings,
    plan: RunPlan,
    stop: Arc<AtomicBool>,
    display: Box<dyn ProgressDisplay>,
}

impl Controller {
    /// `stop` is polled between chunks; setting it ends the run after the chunk in flight.
    pub fn new(
        settings: AcquisitionSettings,
        plan: RunPlan,
        stop: Arc<AtomicBool>,
        display: Box<dyn ProgressDisplay>,
    ) -> Self {
        Self {
            settings,
            plan,
            stop,
            display,
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run a session to completion.
    ///
    /// Errors opening the source or the sink are returned as `Err` with nothing
    /// left open. Once running, every outcome, failures included, is reported
    /// in the summary's stop cause.
    pub fn run<D, S, F>(self, device: &D, open_sink: F) -> DaqResult<RunSummary>
    where
        D: AcquisitionDevice,
        S: RowSink,
        F: FnOnce(&ColumnLayout) -> DaqResult<S>,
    {
        let Controller {
            settings,
            plan,
            stop,
            display,
        } = self;

        let mut session = SessionState::new(&settings, plan.duration);
        let mut source = device.open(&settings)?;
        let mut sink = match open_sink(&session.layout) {
            Ok(sink) => sink,
            Err(e) => {
                if let Err(close_err) = source.close() {
                    warn!("Closing the source after a failed sink open: {close_err}");
                }
                return Err(e);
            }
        };

        session.started_at = Instant::now();
        session.start_time =
            OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let mut reporter = ProgressReporter::new(
            plan.progress,
            plan.update_interval,
            plan.preview_rows,
            display,
            session.started_at,
        );

        info!(
            "Acquiring {} at {} Hz in chunks of {}{}",
            settings.physical_channels().join(", "),
            settings.sample_rate,
            settings.chunk_size,
            match plan.duration {
                Some(d) => format!(" for {:.3} s", d.as_secs_f64()),
                None => String::new(),
            }
        );
        session.enter(RunState::Running);
        let cause = acquire(
            &mut session,
            &mut source,
            &mut sink,
            &mut reporter,
            &stop,
            plan.max_timeout_retries,
        );

        session.enter(RunState::Stopping);
        let cause = teardown(cause, &session, &mut source, &mut sink, &mut reporter);
        session.enter(RunState::Stopped);

        match &cause {
            StopCause::Failed(e) => error!("Run stopped: {e}"),
            other => info!("Run stopped: {other}"),
        }
        Ok(RunSummary {
            rows_written: session.rows_written,
            chunks: session.chunks,
            elapsed: session.started_at.elapsed(),
            cause,
        })
    }
}

fn acquire<A: AcquisitionSource, S: RowSink>(
    session: &mut SessionState,
    source: &mut A,
    sink: &mut S,
    reporter: &mut ProgressReporter,
    stop: &AtomicBool,
    max_timeout_retries: u32,
) -> StopCause {
    let clock = session.clock();
    let mut timeouts = 0u32;
    loop {
        if stop.load(Ordering::SeqCst) {
            return StopCause::StopRequested;
        }

        let chunk = match source.read_chunk() {
            Ok(chunk) => {
                timeouts = 0;
                chunk
            }
            Err(e) if e.is_transient() => {
                timeouts += 1;
                if timeouts > max_timeout_retries {
                    return StopCause::Failed(e);
                }
                warn!("{e}, retrying ({timeouts}/{max_timeout_retries})");
                continue;
            }
            Err(e) => return StopCause::Failed(e),
        };

        if let Err(e) = write_chunk(session, &clock, &chunk, source, sink, reporter) {
            return StopCause::Failed(e);
        }
        if session.target_reached() {
            return StopCause::DurationElapsed;
        }
    }
}

/// Snapshot, assemble, append, then account. Counters move only after the sink took the rows.
fn write_chunk<A: AcquisitionSource, S: RowSink>(
    session: &mut SessionState,
    clock: &RowClock,
    chunk: &SampleChunk,
    source: &mut A,
    sink: &mut S,
    reporter: &mut ProgressReporter,
) -> DaqResult<()> {
    if chunk.channel_count() != session.layout.analog.len() {
        return Err(DaqError::ShapeMismatch {
            what: "chunk channels",
            expected: session.layout.analog.len(),
            found: chunk.channel_count(),
        });
    }
    let snapshot = if session.layout.has_digital() {
        source.read_digital_snapshot()?
    } else {
        DigitalSnapshot::empty()
    };

    let rows = assemble(chunk, &snapshot, clock, session.rows_written)?;
    sink.append(&rows)?;
    session.rows_written += rows.len() as u64;
    session.chunks += 1;

    let now = Instant::now();
    reporter.record_rows(now, rows.len() as u64);
    reporter.preview(&session.layout, &rows);
    reporter.maybe_report(&session.snapshot(now));
    Ok(())
}

/// Flush, final report, close source, close sink. The first teardown failure
/// replaces a clean stop cause; the rest are logged.
fn teardown<A: AcquisitionSource, S: RowSink>(
    cause: StopCause,
    session: &SessionState,
    source: &mut A,
    sink: &mut S,
    reporter: &mut ProgressReporter,
) -> StopCause {
    let mut cause = cause;
    let mut record = |res: DaqResult<()>, step: &str| {
        if let Err(e) = res {
            if matches!(cause, StopCause::Failed(_)) {
                error!("{step} failed during shutdown: {e}");
            } else {
                cause = StopCause::Failed(e);
            }
        }
    };

    record(sink.flush(), "Sink flush");
    reporter.finish(&session.snapshot(Instant::now()));
    record(source.close(), "Source close");
    record(sink.close(), "Sink close");
    debug!(
        "Session closed after {} chunks, {} rows",
        session.chunks, session.rows_written
    );
    cause
}
