use crate::{DaqError, DaqResult, Row};
use log::debug;
use rust_xlsxwriter::{Workbook, Worksheet};
use std::{
    fs::{File, OpenOptions},
    path::Path,
};

pub trait RowSink {
    /// Append rows in order. May buffer; a failure is fatal for the run.
    fn append(&mut self, rows: &[Row]) -> DaqResult<()>;

    /// Force buffered rows to disk.
    fn flush(&mut self) -> DaqResult<()>;

    /// Flush and release the destination. Calling it more than once is a no-op.
    fn close(&mut self) -> DaqResult<()>;
}

impl<S: RowSink + ?Sized> RowSink for Box<S> {
    fn append(&mut self, rows: &[Row]) -> DaqResult<()> {
        (**self).append(rows)
    }

    fn flush(&mut self) -> DaqResult<()> {
        (**self).flush()
    }

    fn close(&mut self) -> DaqResult<()> {
        (**self).close()
    }
}

/// Render a row timestamp as `YYYY-MM-DDTHH:MM:SS.ffffff`.
pub fn format_timestamp(ts: time::OffsetDateTime) -> DaqResult<String> {
    Ok(ts.format(time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]"
    ))?)
}

/// Line-oriented delimited text output.
pub struct CsvWriter {
    writer: Option<csv::Writer<File>>,
    flush_every: usize,
    since_flush: usize,
    rows_written: u64,
}

impl CsvWriter {
    /// Create `path` and write the header row. An existing file is never overwritten.
    pub fn create(path: &Path, headers: &[String], flush_every: usize) -> DaqResult<Self> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(headers)?;
        writer.flush().map_err(write_error)?;
        debug!("CSV writer opened at '{}'", path.display());
        Ok(Self {
            writer: Some(writer),
            flush_every: flush_every.max(1),
            since_flush: 0,
            rows_written: 0,
        })
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    fn open_writer(&mut self) -> DaqResult<&mut csv::Writer<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| DaqError::Write("CSV writer is closed".into()))
    }
}

fn write_error(e: std::io::Error) -> DaqError {
    DaqError::Write(e.to_string())
}

impl RowSink for CsvWriter {
    fn append(&mut self, rows: &[Row]) -> DaqResult<()> {
        let writer = self.open_writer()?;
        let mut record = csv::StringRecord::new();
        for row in rows {
            record.clear();
            record.push_field(&format_timestamp(row.timestamp)?);
            record.push_field(&row.index.to_string());
            for v in &row.analog {
                record.push_field(&v.to_string());
            }
            for &d in row.digital.states() {
                record.push_field(if d { "1" } else { "0" });
            }
            writer.write_record(&record)?;
        }
        self.rows_written += rows.len() as u64;
        self.since_flush += rows.len();
        if self.since_flush >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> DaqResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(write_error)?;
        }
        self.since_flush = 0;
        Ok(())
    }

    fn close(&mut self) -> DaqResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(write_error)?;
            debug!("CSV writer closed after {} rows", self.rows_written);
        }
        Ok(())
    }
}

impl Drop for CsvWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

pub const SHEET_NAME: &str = "DAQ";

/// Spreadsheet workbook with a single sheet. Rows are kept in memory and the
/// workbook reaches disk on close.
pub struct XlsxWriter {
    file: Option<File>,
    workbook: Workbook,
    next_row: u32,
}

impl XlsxWriter {
    /// Reserve `path` and write the header row. An existing file is never overwritten.
    pub fn create(path: &Path, headers: &[String]) -> DaqResult<Self> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet().set_name(SHEET_NAME)?;
        for (col, header) in headers.iter().enumerate() {
            sheet.write_string(0, column(col)?, header)?;
        }
        debug!("XLSX writer opened at '{}'", path.display());
        Ok(Self {
            file: Some(file),
            workbook,
            next_row: 1,
        })
    }

    pub fn rows_written(&self) -> u64 {
        u64::from(self.next_row - 1)
    }

    fn sheet(&mut self) -> DaqResult<&mut Worksheet> {
        if self.file.is_none() {
            return Err(DaqError::Write("XLSX writer is closed".into()));
        }
        Ok(self.workbook.worksheet_from_index(0)?)
    }
}

fn column(index: usize) -> DaqResult<u16> {
    u16::try_from(index).map_err(|_| DaqError::Write(format!("too many columns ({index})")))
}

impl RowSink for XlsxWriter {
    fn append(&mut self, rows: &[Row]) -> DaqResult<()> {
        let mut r = self.next_row;
        let sheet = self.sheet()?;
        for row in rows {
            sheet.write_string(r, 0, format_timestamp(row.timestamp)?)?;
            sheet.write_number(r, 1, row.index as f64)?;
            let mut col = 2;
            for &v in &row.analog {
                sheet.write_number(r, column(col)?, v)?;
                col += 1;
            }
            for &d in row.digital.states() {
                sheet.write_number(r, column(col)?, u8::from(d))?;
                col += 1;
            }
            r += 1;
        }
        self.next_row = r;
        Ok(())
    }

    fn flush(&mut self) -> DaqResult<()> {
        Ok(())
    }

    fn close(&mut self) -> DaqResult<()> {
        if let Some(mut file) = self.file.take() {
            self.workbook.save_to_writer(&mut file)?;
            debug!("XLSX writer closed after {} rows", self.rows_written());
        }
        Ok(())
    }
}

impl Drop for XlsxWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(feature = "storage_hdf5")]
pub use self::hdf5_sink::HDF5Writer;

#[cfg(feature = "storage_hdf5")]
mod hdf5_sink {
    use super::RowSink;
    use crate::{ColumnLayout, DaqError, DaqResult, Row};
    use hdf5::{types::VarLenUnicode, Dataset, File};
    use log::debug;
    use ndarray::{s, Array1, Array2};
    use std::path::Path;

    /// Holds the run's datasets and the in-memory block not yet written.
    pub struct HDF5Writer {
        file: Option<File>,
        timestamps: Dataset,
        indices: Dataset,
        analog: Dataset,
        digital: Option<Dataset>,
        current_row: usize,
        buffer_capacity: usize,
        buffer_count: usize,
        ts_buffer: Array1<i64>,
        idx_buffer: Array1<u64>,
        analog_buffer: Array2<f64>,
        digital_buffer: Array2<u8>,
        n_channels: usize,
        n_lines: usize,
    }

    impl HDF5Writer {
        pub fn create(
            path: &Path,
            layout: &ColumnLayout,
            buffer_capacity: usize,
            compression_level: u8,
            blosc_threads: u8,
        ) -> DaqResult<Self> {
            let file = File::create(path)?;
            let buffer_capacity = buffer_capacity.max(1);
            let n_channels = layout.analog.len();
            let n_lines = layout.digital.len();
            hdf5::filters::blosc_set_nthreads(blosc_threads);

            let timestamps = file
                .new_dataset::<i64>()
                .shape(0..)
                .chunk(buffer_capacity)
                .create("timestamp_ns")?;
            let indices = file
                .new_dataset::<u64>()
                .shape(0..)
                .chunk(buffer_capacity)
                .create("sample_index")?;
            let analog = file
                .new_dataset::<f64>()
                .shape((0.., n_channels))
                .chunk((buffer_capacity, n_channels))
                .blosc_zstd(compression_level, true)
                .create("analog")?;
            write_names(&analog, "channels", &layout.analog)?;

            let digital = if n_lines > 0 {
                let ds = file
                    .new_dataset::<u8>()
                    .shape((0.., n_lines))
                    .chunk((buffer_capacity, n_lines))
                    .blosc_zstd(compression_level, true)
                    .create("digital")?;
                write_names(&ds, "lines", &layout.digital)?;
                Some(ds)
            } else {
                None
            };
            debug!("HDF5 writer opened at '{}'", path.display());

            Ok(Self {
                file: Some(file),
                timestamps,
                indices,
                analog,
                digital,
                current_row: 0,
                buffer_capacity,
                buffer_count: 0,
                ts_buffer: Array1::zeros(buffer_capacity),
                idx_buffer: Array1::zeros(buffer_capacity),
                analog_buffer: Array2::zeros((buffer_capacity, n_channels)),
                digital_buffer: Array2::zeros((buffer_capacity, n_lines)),
                n_channels,
                n_lines,
            })
        }

        fn push(&mut self, row: &Row) -> DaqResult<()> {
            if row.analog.len() != self.n_channels {
                return Err(DaqError::ShapeMismatch {
                    what: "analog row",
                    expected: self.n_channels,
                    found: row.analog.len(),
                });
            }
            if row.digital.len() != self.n_lines {
                return Err(DaqError::ShapeMismatch {
                    what: "digital row",
                    expected: self.n_lines,
                    found: row.digital.len(),
                });
            }
            let i = self.buffer_count;
            self.ts_buffer[i] = (row.timestamp.unix_timestamp_nanos()) as i64;
            self.idx_buffer[i] = row.index;
            for (c, v) in row.analog.iter().enumerate() {
                self.analog_buffer[[i, c]] = *v;
            }
            for (l, d) in row.digital.states().iter().enumerate() {
                self.digital_buffer[[i, l]] = u8::from(*d);
            }
            self.buffer_count += 1;

            if self.buffer_count == self.buffer_capacity {
                self.write_buffer()?;
            }
            Ok(())
        }

        fn write_buffer(&mut self) -> DaqResult<()> {
            if self.buffer_count == 0 {
                return Ok(());
            }
            let start = self.current_row;
            let end = start + self.buffer_count;

            self.timestamps.resize(end)?;
            self.timestamps
                .write_slice(&self.ts_buffer.slice(s![0..self.buffer_count]), start..end)?;
            self.indices.resize(end)?;
            self.indices
                .write_slice(&self.idx_buffer.slice(s![0..self.buffer_count]), start..end)?;
            self.analog.resize((end, self.n_channels))?;
            self.analog.write_slice(
                &self.analog_buffer.slice(s![0..self.buffer_count, ..]),
                (start..end, ..),
            )?;
            if let Some(digital) = &self.digital {
                digital.resize((end, self.n_lines))?;
                digital.write_slice(
                    &self.digital_buffer.slice(s![0..self.buffer_count, ..]),
                    (start..end, ..),
                )?;
            }

            self.current_row = end;
            self.buffer_count = 0;
            Ok(())
        }
    }

    fn write_names(ds: &Dataset, attr: &str, names: &[String]) -> DaqResult<()> {
        let names = names
            .iter()
            .map(|n| {
                n.parse::<VarLenUnicode>()
                    .map_err(|e| DaqError::Write(format!("bad column name '{n}': {e}")))
            })
            .collect::<DaqResult<Vec<_>>>()?;
        ds.new_attr::<VarLenUnicode>()
            .shape(names.len())
            .create(attr)?
            .write_raw(&names)?;
        Ok(())
    }

    impl RowSink for HDF5Writer {
        fn append(&mut self, rows: &[Row]) -> DaqResult<()> {
            if self.file.is_none() {
                return Err(DaqError::Write("HDF5 writer is closed".into()));
            }
            rows.iter().try_for_each(|row| self.push(row))
        }

        fn flush(&mut self) -> DaqResult<()> {
            self.write_buffer()?;
            if let Some(file) = &self.file {
                file.flush()?;
            }
            Ok(())
        }

        fn close(&mut self) -> DaqResult<()> {
            if self.file.is_none() {
                return Ok(());
            }
            self.flush()?;
            if let Some(file) = self.file.take() {
                file.close()?;
            }
            debug!("HDF5 writer closed after {} rows", self.current_row);
            Ok(())
        }
    }

}
