use crate::DaqResult;
use clap::ValueEnum;
use ndarray::{Array2, ArrayView1};
use serde::Deserialize;
use std::{fmt, sync::Arc, time::Duration};

/// Analog input wiring configuration.
#[derive(Deserialize, ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalMode {
    /// Referenced single-ended
    #[serde(rename = "RSE")]
    #[value(name = "RSE")]
    Rse,
    /// Non-referenced single-ended
    #[serde(rename = "NRSE")]
    #[value(name = "NRSE")]
    Nrse,
    /// Differential
    #[serde(rename = "DIFF")]
    #[value(name = "DIFF")]
    Diff,
}

impl fmt::Display for TerminalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TerminalMode::Rse => "RSE",
            TerminalMode::Nrse => "NRSE",
            TerminalMode::Diff => "DIFF",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoltageRange {
    pub min: f64,
    pub max: f64,
}

impl fmt::Display for VoltageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}] V", self.min, self.max)
    }
}

/// Everything a device needs to open the analog and digital tasks.
#[derive(Clone, Debug)]
pub struct AcquisitionSettings {
    pub device: String,
    /// Analog channels relative to the device, e.g. `ai0`.
    pub channels: Vec<String>,
    /// Static digital lines relative to the device, e.g. `port0/line3`.
    pub digital_lines: Vec<String>,
    pub sample_rate: f64,
    pub chunk_size: usize,
    pub voltage_range: VoltageRange,
    pub terminal_mode: TerminalMode,
}

impl AcquisitionSettings {
    /// Nominal time covered by one chunk, saturating at `Duration::MAX`.
    pub fn chunk_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.chunk_size as f64 / self.sample_rate)
            .unwrap_or(Duration::MAX)
    }

    /// Fully qualified physical channel names, e.g. `Dev1/ai0`.
    pub fn physical_channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .map(|ch| format!("{}/{}", self.device, ch))
            .collect()
    }

    pub fn has_digital(&self) -> bool {
        !self.digital_lines.is_empty()
    }
}

/// One hardware-timed block of samples, shaped `(chunk_size, channel_count)`.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleChunk {
    data: Array2<f64>,
}

impl SampleChunk {
    pub fn new(data: Array2<f64>) -> Self {
        Self { data }
    }

    /// Build a chunk from channel-major buffers, the layout most drivers fill.
    pub fn from_channels(channels: &[Vec<f64>]) -> DaqResult<Self> {
        let n_channels = channels.len();
        let n_samples = channels.first().map_or(0, Vec::len);
        if let Some(bad) = channels.iter().find(|c| c.len() != n_samples) {
            return Err(crate::DaqError::ShapeMismatch {
                what: "channel buffer",
                expected: n_samples,
                found: bad.len(),
            });
        }
        let data = Array2::from_shape_fn((n_samples, n_channels), |(s, c)| channels[c][s]);
        Ok(Self { data })
    }

    /// Number of samples per channel.
    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    pub fn channel_count(&self) -> usize {
        self.data.ncols()
    }

    /// All channels' values for sample `i`.
    pub fn sample(&self, i: usize) -> ArrayView1<'_, f64> {
        self.data.row(i)
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }
}

/// Static digital line states captured once per chunk.
///
/// The states are shared, not copied, by every row of the chunk they are
/// assigned to: a snapshot is valid for exactly one chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigitalSnapshot {
    states: Arc<[bool]>,
}

impl DigitalSnapshot {
    pub fn new(states: Vec<bool>) -> Self {
        Self {
            states: states.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn states(&self) -> &[bool] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// True when both handles point at the same captured snapshot.
    pub fn same_capture(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.states, &other.states)
    }
}

/// An opened analog (and optional digital) task.
pub trait AcquisitionSource {
    /// Block until `chunk_size` samples per channel are available.
    fn read_chunk(&mut self) -> DaqResult<SampleChunk>;

    /// Current static digital line states. Must not be called when no lines
    /// are configured.
    fn read_digital_snapshot(&mut self) -> DaqResult<DigitalSnapshot>;

    /// Release the hardware. Calling it more than once is a no-op.
    fn close(&mut self) -> DaqResult<()>;
}

/// Something that can open an [`AcquisitionSource`].
pub trait AcquisitionDevice {
    type Source: AcquisitionSource;

    fn open(&self, settings: &AcquisitionSettings) -> DaqResult<Self::Source>;
}

impl<S: AcquisitionSource + ?Sized> AcquisitionSource for Box<S> {
    fn read_chunk(&mut self) -> DaqResult<SampleChunk> {
        (**self).read_chunk()
    }

    fn read_digital_snapshot(&mut self) -> DaqResult<DigitalSnapshot> {
        (**self).read_digital_snapshot()
    }

    fn close(&mut self) -> DaqResult<()> {
        (**self).close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AcquisitionSettings {
        AcquisitionSettings {
            device: "Dev1".into(),
            channels: vec!["ai0".into(), "ai1".into()],
            digital_lines: vec![],
            sample_rate: 500.0,
            chunk_size: 250,
            voltage_range: VoltageRange {
                min: -10.0,
                max: 10.0,
            },
            terminal_mode: TerminalMode::Rse,
        }
    }

    #[test]
    fn chunk_duration_follows_rate() {
        assert_eq!(settings().chunk_duration(), Duration::from_millis(500));
    }

    #[test]
    fn chunk_duration_saturates_at_tiny_rates() {
        let mut settings = settings();
        settings.sample_rate = 1e-300;
        assert_eq!(settings.chunk_duration(), Duration::MAX);
    }

    #[test]
    fn physical_channels_are_device_qualified() {
        assert_eq!(settings().physical_channels(), vec!["Dev1/ai0", "Dev1/ai1"]);
    }

    #[test]
    fn channel_major_buffers_are_transposed() {
        let chunk = SampleChunk::from_channels(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]])
            .unwrap();
        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.channel_count(), 2);
        assert_eq!(chunk.sample(1).to_vec(), vec![2.0, 5.0]);
    }

    #[test]
    fn ragged_channel_buffers_are_rejected() {
        let err = SampleChunk::from_channels(&[vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert!(matches!(err, crate::DaqError::ShapeMismatch { .. }));
    }

    #[test]
    fn snapshot_clones_share_the_capture() {
        let snap = DigitalSnapshot::new(vec![true, false]);
        let copy = snap.clone();
        assert!(snap.same_capture(&copy));
        assert!(!snap.same_capture(&DigitalSnapshot::new(vec![true, false])));
    }
}
