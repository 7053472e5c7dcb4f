use crate::{ColumnLayout, CsvWriter, DaqError, DaqResult, RowSink, XlsxWriter};
use clap::ValueEnum;
use log::debug;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

#[derive(Deserialize, ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Delimited text, one row per line
    Csv,
    /// Spreadsheet workbook, one sheet
    Xlsx,
    /// HDF5 file with one dataset per column group
    H5,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Xlsx => "xlsx",
            OutputFormat::H5 => "h5",
        }
    }

    fn accepts_extension(self, ext: &str) -> bool {
        match self {
            OutputFormat::Csv => ext == "csv",
            OutputFormat::Xlsx => ext == "xlsx",
            OutputFormat::H5 => ext == "h5" || ext == "hdf5",
        }
    }

    fn from_path(path: &Path) -> Self {
        match lower_extension(path).as_deref() {
            Some("xlsx") => OutputFormat::Xlsx,
            Some("h5") | Some("hdf5") => OutputFormat::H5,
            _ => OutputFormat::Csv,
        }
    }
}

fn lower_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

/// Knobs the sinks are created with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SinkOptions {
    /// Text output flushes after this many rows.
    pub flush_every: usize,
    /// Rows the binary sink buffers per dataset write.
    pub buffer_rows: usize,
    pub compression_level: u8,
    pub blosc_threads: u8,
}

/// A resolved, not yet existing output file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputTarget {
    pub path: PathBuf,
    pub format: OutputFormat,
}

/// Pick the output format and a fresh path for this run.
///
/// An explicit format wins, then the `outfile` extension, then CSV. A given
/// `outfile` has its extension coerced to the format; otherwise the file is
/// named after the device and `now` inside `output_dir`. Parent directories
/// are created and existing files are never reused.
pub fn infer_output(
    outfile: Option<&Path>,
    format: Option<OutputFormat>,
    output_dir: &Path,
    device: &str,
    now: OffsetDateTime,
) -> DaqResult<OutputTarget> {
    let format = format
        .or_else(|| outfile.map(OutputFormat::from_path))
        .unwrap_or(OutputFormat::Csv);

    let path = match outfile {
        Some(out) => {
            let mut out = out.to_path_buf();
            let keep = lower_extension(&out).is_some_and(|e| format.accepts_extension(&e));
            if !keep {
                out.set_extension(format.extension());
            }
            out
        }
        None => {
            let stamp = now.format(time::macros::format_description!(
                "[year][month][day]_[hour][minute][second]"
            ))?;
            let device: String = device
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            output_dir.join(format!("daq_{device}_{stamp}.{}", format.extension()))
        }
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
            debug!("Created output directory '{}'", parent.display());
        }
    }

    Ok(OutputTarget {
        path: safe_path(&path),
        format,
    })
}

/// `path` if free, else the first free `<stem>_<n>.<ext>` next to it.
pub fn safe_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    (1u64..)
        .map(|i| {
            let name = match &ext {
                Some(ext) => format!("{stem}_{i}.{ext}"),
                None => format!("{stem}_{i}"),
            };
            path.with_file_name(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

impl OutputTarget {
    /// Create the file and write its header.
    pub fn open(&self, layout: &ColumnLayout, opts: &SinkOptions) -> DaqResult<Box<dyn RowSink>> {
        match self.format {
            OutputFormat::Csv => Ok(Box::new(CsvWriter::create(
                &self.path,
                &layout.headers(),
                opts.flush_every,
            )?)),
            OutputFormat::Xlsx => Ok(Box::new(XlsxWriter::create(
                &self.path,
                &layout.headers(),
            )?)),
            OutputFormat::H5 => self.open_h5(layout, opts),
        }
    }

    #[cfg(feature = "storage_hdf5")]
    fn open_h5(&self, layout: &ColumnLayout, opts: &SinkOptions) -> DaqResult<Box<dyn RowSink>> {
        Ok(Box::new(crate::HDF5Writer::create(
            &self.path,
            layout,
            opts.buffer_rows,
            opts.compression_level,
            opts.blosc_threads,
        )?))
    }

    #[cfg(not(feature = "storage_hdf5"))]
    fn open_h5(&self, _layout: &ColumnLayout, _opts: &SinkOptions) -> DaqResult<Box<dyn RowSink>> {
        Err(DaqError::FeatureNotEnabled("storage_hdf5".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-03-05 14:07:09 UTC);

    fn opts() -> SinkOptions {
        SinkOptions {
            flush_every: 10,
            buffer_rows: 10,
            compression_level: 2,
            blosc_threads: 1,
        }
    }

    #[test]
    fn defaults_to_timestamped_csv_in_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let target = infer_output(None, None, &logs, "Dev1", NOW).unwrap();
        assert_eq!(target.format, OutputFormat::Csv);
        assert_eq!(target.path, logs.join("daq_Dev1_20240305_140709.csv"));
        assert!(logs.is_dir());
    }

    #[test]
    fn format_follows_flag_then_extension() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("run.hdf5");

        let target = infer_output(Some(&out), None, dir.path(), "Dev1", NOW).unwrap();
        assert_eq!(target.format, OutputFormat::H5);
        assert_eq!(target.path, out);

        let target =
            infer_output(Some(&out), Some(OutputFormat::Csv), dir.path(), "Dev1", NOW).unwrap();
        assert_eq!(target.path, dir.path().join("run.csv"));

        let xlsx = dir.path().join("run.XLSX");
        let target = infer_output(Some(&xlsx), None, dir.path(), "Dev1", NOW).unwrap();
        assert_eq!(target.format, OutputFormat::Xlsx);
        assert_eq!(target.path, xlsx);

        let target =
            infer_output(Some(&out), Some(OutputFormat::Xlsx), dir.path(), "Dev1", NOW).unwrap();
        assert_eq!(target.path, dir.path().join("run.xlsx"));

        let target = infer_output(
            Some(&dir.path().join("run.txt")),
            None,
            dir.path(),
            "Dev1",
            NOW,
        )
        .unwrap();
        assert_eq!(target.format, OutputFormat::Csv);
        assert_eq!(target.path, dir.path().join("run.csv"));
    }

    #[test]
    fn existing_files_get_numbered_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("run.csv");
        std::fs::write(&out, "").unwrap();
        std::fs::write(dir.path().join("run_1.csv"), "").unwrap();

        assert_eq!(safe_path(&out), dir.path().join("run_2.csv"));
        let target = infer_output(Some(&out), None, dir.path(), "Dev1", NOW).unwrap();
        assert_eq!(target.path, dir.path().join("run_2.csv"));
    }

    #[test]
    fn missing_parents_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a/b/run.csv");
        let target = infer_output(Some(&out), None, dir.path(), "Dev1", NOW).unwrap();
        assert!(dir.path().join("a/b").is_dir());
        assert_eq!(target.path, out);
    }

    #[test]
    fn csv_target_opens_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let target = OutputTarget {
            path: dir.path().join("run.csv"),
            format: OutputFormat::Csv,
        };
        let layout = ColumnLayout::new(vec!["ai0".into()], vec![]);
        let mut sink = target.open(&layout, &opts()).unwrap();
        sink.close().unwrap();
        let text = std::fs::read_to_string(&target.path).unwrap();
        assert_eq!(text, "timestamp_iso,sample_index,ai0\n");
    }

    #[test]
    fn xlsx_target_opens_a_workbook() {
        let dir = tempfile::tempdir().unwrap();
        let target = infer_output(None, Some(OutputFormat::Xlsx), dir.path(), "Dev1", NOW).unwrap();
        assert_eq!(target.path, dir.path().join("daq_Dev1_20240305_140709.xlsx"));
        let layout = ColumnLayout::new(vec!["ai0".into()], vec![]);
        let mut sink = target.open(&layout, &opts()).unwrap();
        sink.close().unwrap();
        assert!(std::fs::read(&target.path).unwrap().starts_with(b"PK"));
    }

    #[cfg(not(feature = "storage_hdf5"))]
    #[test]
    fn h5_without_feature_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let target = OutputTarget {
            path: dir.path().join("run.h5"),
            format: OutputFormat::H5,
        };
        let layout = ColumnLayout::new(vec!["ai0".into()], vec![]);
        assert!(matches!(
            target.open(&layout, &opts()),
            Err(DaqError::FeatureNotEnabled(_))
        ));
    }
}
