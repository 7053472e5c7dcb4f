//! Streams chunks from a multichannel DAQ device into timestamped rows on disk.

mod assembler;
mod config;
mod controller;
mod error;
mod output;
mod progress;
mod simulator;
mod source;
mod tui;
mod writer;

pub use assembler::*;
pub use config::*;
pub use controller::*;
pub use error::*;
pub use output::*;
pub use progress::*;
pub use simulator::*;
pub use source::*;
pub use tui::*;
pub use writer::*;
