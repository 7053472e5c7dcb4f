use std::time::Duration;
use thiserror::Error;

pub type DaqResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    /// Bad channel, line, terminal mode or voltage range.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The hardware did not deliver a full chunk within the bounded wait.
    #[error("Acquisition timed out after {:.3} s", waited.as_secs_f64())]
    AcquisitionTimeout { waited: Duration },

    /// Device fault or disconnect.
    #[error("Acquisition error: {0}")]
    Acquisition(String),

    /// The row sink failed while appending or flushing.
    #[error("Write error: {0}")]
    Write(String),

    /// A collaborator handed over data whose shape disagrees with the session.
    #[error("Shape mismatch in {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// True for errors the acquisition loop may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, DaqError::AcquisitionTimeout { .. })
    }
}

impl From<csv::Error> for DaqError {
    fn from(value: csv::Error) -> Self {
        DaqError::Write(value.to_string())
    }
}

impl From<time::error::Format> for DaqError {
    fn from(value: time::error::Format) -> Self {
        DaqError::Write(format!("timestamp formatting failed: {value}"))
    }
}

impl From<rust_xlsxwriter::XlsxError> for DaqError {
    fn from(value: rust_xlsxwriter::XlsxError) -> Self {
        DaqError::Write(value.to_string())
    }
}

#[cfg(feature = "storage_hdf5")]
impl From<hdf5::Error> for DaqError {
    fn from(value: hdf5::Error) -> Self {
        DaqError::Write(value.to_string())
    }
}
