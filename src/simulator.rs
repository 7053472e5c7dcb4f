use crate::{
    AcquisitionDevice, AcquisitionSettings, AcquisitionSource, DaqError, DaqResult,
    DigitalSnapshot, SampleChunk, TerminalMode,
};
use crossbeam_channel::{bounded, tick, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, warn};
use ndarray::Array2;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::HashSet,
    f64::consts::TAU,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

pub const PRODUCT: &str = "USB-6009 (simulated)";

/// Aggregate analog sample rate limit across all channels.
pub const MAX_AGGREGATE_RATE: f64 = 48_000.0;

/// Lines per digital port.
const DIGITAL_PORTS: [u32; 2] = [8, 4];

/// Seconds of samples the task buffer holds before overflowing.
const BUFFER_SECONDS: f64 = 10.0;

/// Extra time a read waits beyond one chunk period.
const READ_SLACK: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct SimulatedDevice {
    name: String,
    seed: Option<u64>,
    paced: bool,
    buffer_chunks: Option<usize>,
    read_timeout: Option<Duration>,
}

impl SimulatedDevice {
    /// A device answering to `name`, producing chunks in real time.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seed: None,
            paced: true,
            buffer_chunks: None,
            read_timeout: None,
        }
    }

    /// Make the signal reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Produce chunks as fast as they are read instead of on the sample clock.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    /// Hold `chunks` chunks in the task buffer instead of ten seconds' worth.
    pub fn with_buffer_chunks(mut self, chunks: usize) -> Self {
        self.buffer_chunks = Some(chunks.max(1));
        self
    }

    /// Wait this long per read instead of one chunk period plus slack.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check settings against what the hardware supports.
    pub fn validate(&self, settings: &AcquisitionSettings) -> DaqResult<()> {
        if settings.device != self.name {
            return Err(DaqError::Configuration(format!(
                "device '{}' not found, the attached device is '{}'",
                settings.device, self.name
            )));
        }

        let (analog_count, limit) = match settings.terminal_mode {
            TerminalMode::Rse => (8, 10.0),
            TerminalMode::Diff => (4, 20.0),
            TerminalMode::Nrse => {
                return Err(DaqError::Configuration(format!(
                    "terminal mode NRSE is not supported by {PRODUCT}"
                )))
            }
        };

        let mut seen = HashSet::new();
        for ch in &settings.channels {
            let index = ch
                .strip_prefix("ai")
                .and_then(|n| n.parse::<u32>().ok())
                .filter(|&n| n < analog_count)
                .ok_or_else(|| {
                    DaqError::Configuration(format!(
                        "analog channel '{}/{ch}' does not exist in {} mode (ai0..ai{})",
                        settings.device,
                        settings.terminal_mode,
                        analog_count - 1
                    ))
                })?;
            if !seen.insert(index) {
                return Err(DaqError::Configuration(format!(
                    "analog channel '{ch}' is listed twice"
                )));
            }
        }

        for line in &settings.digital_lines {
            parse_line(line).ok_or_else(|| {
                DaqError::Configuration(format!(
                    "digital line '{}/{line}' does not exist",
                    settings.device
                ))
            })?;
        }

        let range = settings.voltage_range;
        if range.min < -limit || range.max > limit {
            return Err(DaqError::Configuration(format!(
                "voltage range {range} exceeds ±{limit} V in {} mode",
                settings.terminal_mode
            )));
        }

        let aggregate = settings.sample_rate * settings.channels.len() as f64;
        if aggregate > MAX_AGGREGATE_RATE {
            return Err(DaqError::Configuration(format!(
                "aggregate rate {aggregate} S/s exceeds the {MAX_AGGREGATE_RATE} S/s limit"
            )));
        }
        Ok(())
    }
}

/// Parse `portP/lineL` into `(P, L)` if the line exists.
fn parse_line(line: &str) -> Option<(u32, u32)> {
    let (port, line) = line.strip_prefix("port")?.split_once("/line")?;
    let (port, line) = (port.parse::<u32>().ok()?, line.parse::<u32>().ok()?);
    let width = *DIGITAL_PORTS.get(port as usize)?;
    (line < width).then_some((port, line))
}

impl AcquisitionDevice for SimulatedDevice {
    type Source = SimulatedSource;

    fn open(&self, settings: &AcquisitionSettings) -> DaqResult<SimulatedSource> {
        self.validate(settings)?;

        let chunk_duration = settings.chunk_duration();
        let capacity = self.buffer_chunks.unwrap_or_else(|| {
            ((BUFFER_SECONDS / chunk_duration.as_secs_f64()).ceil() as usize).max(2)
        });
        let (tx, rx) = bounded(capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let overflow = Arc::new(AtomicBool::new(false));

        let mut seeder = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let generator = SignalGenerator::new(settings, StdRng::seed_from_u64(seeder.random()));
        let paced = self.paced.then_some(chunk_duration);
        let handle = {
            let stop = Arc::clone(&stop);
            let overflow = Arc::clone(&overflow);
            thread::Builder::new()
                .name("sim-analog".into())
                .spawn(move || analog_task(generator, tx, paced, stop, overflow))?
        };

        debug!(
            "Opened {PRODUCT} task on {:?}, buffer of {capacity} chunks",
            settings.physical_channels()
        );

        Ok(SimulatedSource {
            rx: Some(rx),
            handle: Some(handle),
            stop,
            overflow,
            read_timeout: self
                .read_timeout
                .unwrap_or_else(|| chunk_duration.saturating_add(READ_SLACK)),
            digital: vec![false; settings.digital_lines.len()],
            rng: seeder,
        })
    }
}

/// Sine per channel plus uniform noise, kept inside the voltage range.
struct SignalGenerator {
    rng: StdRng,
    sample_rate: f64,
    chunk_size: usize,
    channels: usize,
    center: f64,
    amplitude: f64,
    noise: f64,
    min: f64,
    max: f64,
    next_index: u64,
}

impl SignalGenerator {
    fn new(settings: &AcquisitionSettings, rng: StdRng) -> Self {
        let range = settings.voltage_range;
        let span = range.max - range.min;
        Self {
            rng,
            sample_rate: settings.sample_rate,
            chunk_size: settings.chunk_size,
            channels: settings.channels.len(),
            center: (range.max + range.min) / 2.0,
            amplitude: 0.4 * span,
            noise: 0.01 * span,
            min: range.min,
            max: range.max,
            next_index: 0,
        }
    }

    fn next_chunk(&mut self) -> SampleChunk {
        let first = self.next_index;
        let mut data = Array2::zeros((self.chunk_size, self.channels));
        for ((s, c), v) in data.indexed_iter_mut() {
            let t = (first + s as u64) as f64 / self.sample_rate;
            let freq = (c + 1) as f64;
            let noise = self.rng.random_range(-self.noise..=self.noise);
            *v = (self.center + self.amplitude * (TAU * freq * t).sin() + noise)
                .clamp(self.min, self.max);
        }
        self.next_index += self.chunk_size as u64;
        SampleChunk::new(data)
    }
}

fn analog_task(
    mut generator: SignalGenerator,
    tx: Sender<SampleChunk>,
    paced: Option<Duration>,
    stop: Arc<AtomicBool>,
    overflow: Arc<AtomicBool>,
) {
    let ticker = paced.map(tick);
    while !stop.load(Ordering::SeqCst) {
        let chunk = match &ticker {
            Some(ticker) => {
                if ticker.recv().is_err() {
                    break;
                }
                let chunk = generator.next_chunk();
                match tx.try_send(chunk) {
                    Ok(()) => continue,
                    Err(TrySendError::Full(_)) => {
                        warn!("Simulated task buffer overflowed, stopping acquisition");
                        overflow.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            None => generator.next_chunk(),
        };
        if tx.send(chunk).is_err() {
            break;
        }
    }
}

/// Open analog task plus static digital lines of a [`SimulatedDevice`].
pub struct SimulatedSource {
    rx: Option<Receiver<SampleChunk>>,
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    overflow: Arc<AtomicBool>,
    read_timeout: Duration,
    digital: Vec<bool>,
    rng: StdRng,
}

impl SimulatedSource {
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}

impl AcquisitionSource for SimulatedSource {
    fn read_chunk(&mut self) -> DaqResult<SampleChunk> {
        if self.overflow.swap(false, Ordering::SeqCst) {
            return Err(DaqError::Acquisition(
                "buffer overflow, samples were not read fast enough".into(),
            ));
        }
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| DaqError::Acquisition("task is closed".into()))?;
        match rx.recv_timeout(self.read_timeout) {
            Ok(chunk) => Ok(chunk),
            Err(RecvTimeoutError::Timeout) => Err(DaqError::AcquisitionTimeout {
                waited: self.read_timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => {
                if self.overflow.swap(false, Ordering::SeqCst) {
                    Err(DaqError::Acquisition(
                        "buffer overflow, samples were not read fast enough".into(),
                    ))
                } else {
                    Err(DaqError::Acquisition("analog task stopped".into()))
                }
            }
        }
    }

    /// Lines occasionally toggle between reads, like a slowly changing switch bank.
    fn read_digital_snapshot(&mut self) -> DaqResult<DigitalSnapshot> {
        if self.rx.is_none() {
            return Err(DaqError::Acquisition("task is closed".into()));
        }
        if self.digital.is_empty() {
            return Err(DaqError::Configuration(
                "no digital lines are configured".into(),
            ));
        }
        if self.rng.random_bool(0.2) {
            let line = self.rng.random_range(0..self.digital.len());
            self.digital[line] = !self.digital[line];
        }
        Ok(DigitalSnapshot::new(self.digital.clone()))
    }

    fn close(&mut self) -> DaqResult<()> {
        self.stop.store(true, Ordering::SeqCst);
        // Dropping the receiver unblocks a producer waiting on a full buffer.
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| DaqError::Acquisition("analog task panicked".into()))?;
            debug!("Closed {PRODUCT} task");
        }
        Ok(())
    }
}

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
