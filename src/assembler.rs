use crate::{DaqError, DaqResult, DigitalSnapshot, SampleChunk};
use time::OffsetDateTime;

/// Column names fixed for the whole run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnLayout {
    pub analog: Vec<String>,
    pub digital: Vec<String>,
}

pub const TIMESTAMP_COLUMN: &str = "timestamp_iso";
pub const INDEX_COLUMN: &str = "sample_index";

impl ColumnLayout {
    pub fn new(analog: Vec<String>, digital: Vec<String>) -> Self {
        Self { analog, digital }
    }

    /// Header row: timestamp, sample index, analog channels, then digital lines.
    pub fn headers(&self) -> Vec<String> {
        [TIMESTAMP_COLUMN, INDEX_COLUMN]
            .into_iter()
            .map(String::from)
            .chain(self.analog.iter().cloned())
            .chain(self.digital.iter().cloned())
            .collect()
    }

    pub fn has_digital(&self) -> bool {
        !self.digital.is_empty()
    }
}

/// One timestamped record.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    /// Position of this row in the whole run, starting at 0.
    pub index: u64,
    pub timestamp: OffsetDateTime,
    pub analog: Vec<f64>,
    /// The snapshot of the chunk this row came from, empty without digital lines.
    pub digital: DigitalSnapshot,
}

/// Fixed inputs of [`assemble`] for a run.
#[derive(Clone, Debug)]
pub struct RowClock {
    pub start_time: OffsetDateTime,
    pub sample_rate: f64,
    pub chunk_size: usize,
    pub digital_lines: usize,
}

impl RowClock {
    /// Wall-clock instant of the run's `index`-th sample, spaced on the nominal rate.
    pub fn timestamp(&self, index: u64) -> OffsetDateTime {
        let offset_ns = (index as f64 * 1e9 / self.sample_rate).round() as i64;
        self.start_time + time::Duration::nanoseconds(offset_ns)
    }
}

/// Build the rows of one chunk.
///
/// Row `i` is stamped `start_time + (rows_emitted + i) / sample_rate` and carries
/// the chunk's digital snapshot. The chunk must hold exactly `chunk_size` samples
/// and the snapshot exactly one state per configured line.
pub fn assemble(
    chunk: &SampleChunk,
    snapshot: &DigitalSnapshot,
    clock: &RowClock,
    rows_emitted: u64,
) -> DaqResult<Vec<Row>> {
    if chunk.len() != clock.chunk_size {
        return Err(DaqError::ShapeMismatch {
            what: "sample chunk",
            expected: clock.chunk_size,
            found: chunk.len(),
        });
    }
    if snapshot.len() != clock.digital_lines {
        return Err(DaqError::ShapeMismatch {
            what: "digital snapshot",
            expected: clock.digital_lines,
            found: snapshot.len(),
        });
    }

    let rows = (0..chunk.len())
        .map(|i| {
            let index = rows_emitted + i as u64;
            Row {
                index,
                timestamp: clock.timestamp(index),
                analog: chunk.sample(i).to_vec(),
                digital: snapshot.clone(),
            }
        })
        .collect();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn clock(chunk_size: usize, digital_lines: usize) -> RowClock {
        RowClock {
            start_time: OffsetDateTime::UNIX_EPOCH,
            sample_rate: 1000.0,
            chunk_size,
            digital_lines,
        }
    }

    fn chunk(samples: usize, channels: usize) -> SampleChunk {
        SampleChunk::new(Array2::from_shape_fn((samples, channels), |(s, c)| {
            (s * 10 + c) as f64
        }))
    }

    #[test]
    fn one_row_per_sample_with_every_channel() {
        for (samples, channels) in [(1, 1), (7, 3), (500, 8)] {
            let rows = assemble(
                &chunk(samples, channels),
                &DigitalSnapshot::empty(),
                &clock(samples, 0),
                0,
            )
            .unwrap();
            assert_eq!(rows.len(), samples);
            assert!(rows.iter().all(|r| r.analog.len() == channels));
            assert!(rows.iter().all(|r| r.digital.is_empty()));
        }
    }

    #[test]
    fn timestamps_step_by_one_sample_period() {
        let rows = assemble(&chunk(5, 2), &DigitalSnapshot::empty(), &clock(5, 0), 10).unwrap();
        for pair in rows.windows(2) {
            let step = pair[1].timestamp - pair[0].timestamp;
            assert_eq!(step, time::Duration::milliseconds(1));
        }
        assert_eq!(
            rows[0].timestamp,
            OffsetDateTime::UNIX_EPOCH + time::Duration::milliseconds(10)
        );
        assert_eq!(rows[0].index, 10);
        assert_eq!(rows[4].index, 14);
        assert_eq!(rows[3].analog, vec![30.0, 31.0]);
    }

    #[test]
    fn consecutive_chunks_continue_the_timeline() {
        let clock = clock(4, 0);
        let first = assemble(&chunk(4, 1), &DigitalSnapshot::empty(), &clock, 0).unwrap();
        let second = assemble(&chunk(4, 1), &DigitalSnapshot::empty(), &clock, 4).unwrap();
        assert!(first[3].timestamp < second[0].timestamp);
        assert_eq!(
            second[0].timestamp - first[3].timestamp,
            time::Duration::milliseconds(1)
        );
    }

    #[test]
    fn every_row_of_a_chunk_shares_its_snapshot() {
        let snap = DigitalSnapshot::new(vec![true, false]);
        let rows = assemble(&chunk(500, 2), &snap, &clock(500, 2), 0).unwrap();
        assert!(rows.iter().all(|r| r.digital.same_capture(&snap)));
        assert!(rows.iter().all(|r| r.digital.states() == [true, false]));
    }

    #[test]
    fn wrong_chunk_length_is_a_shape_mismatch() {
        let err = assemble(&chunk(3, 1), &DigitalSnapshot::empty(), &clock(4, 0), 0).unwrap_err();
        assert!(matches!(
            err,
            DaqError::ShapeMismatch {
                what: "sample chunk",
                expected: 4,
                found: 3
            }
        ));
    }

    #[test]
    fn wrong_snapshot_width_is_a_shape_mismatch() {
        let err = assemble(
            &chunk(4, 1),
            &DigitalSnapshot::new(vec![true]),
            &clock(4, 2),
            0,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DaqError::ShapeMismatch {
                what: "digital snapshot",
                ..
            }
        ));
    }

    #[test]
    fn headers_put_timestamp_first_and_digital_last() {
        let layout = ColumnLayout::new(
            vec!["ai0".into(), "ai1".into()],
            vec!["port0/line0".into()],
        );
        assert_eq!(
            layout.headers(),
            vec!["timestamp_iso", "sample_index", "ai0", "ai1", "port0/line0"]
        );
        assert!(layout.has_digital());
    }
}
