use crate::{
    AcquisitionSettings, DaqError, DaqResult, OutputFormat, ProgressMode, RunPlan, SinkOptions,
    TerminalMode, VoltageRange,
};
use confique::Config;
use std::{path::PathBuf, time::Duration};

pub const DEFAULT_VMIN: f64 = -10.0;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub device_settings: DeviceSettings,
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub output_settings: OutputSettings,
}

#[derive(Config, Debug, Clone)]
pub struct DeviceSettings {
    #[config(default = "Dev1", env = "DAQ_DEVICE")]
    pub device: String,
    #[config(default = ["ai0"])]
    pub channels: Vec<String>,
    /// Digital line spec, e.g. `port0/line0:3,port1/line0`.
    #[config(default = "")]
    pub digital: String,
    /// Lower input limit. Defaults to -10 V.
    pub vmin: Option<f64>,
    #[config(default = 10.0)]
    pub vmax: f64,
    #[config(default = "RSE")]
    pub terminal: TerminalMode,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    #[config(default = 1000.0, env = "DAQ_RATE")]
    pub rate: f64,
    #[config(default = 1000)]
    pub chunk: usize,
    /// Seconds to run. Unset runs until interrupted.
    pub duration: Option<f64>,
    #[config(default = 3)]
    pub max_timeout_retries: u32,
    #[config(default = "auto")]
    pub progress: ProgressMode,
    #[config(default = 0.5)]
    pub update_interval: f64,
    #[config(default = 0)]
    pub print_first: usize,
}

#[derive(Config, Debug, Clone)]
pub struct OutputSettings {
    pub outfile: Option<PathBuf>,
    pub format: Option<OutputFormat>,
    #[config(default = "logs", env = "DAQ_OUTPUT_DIR")]
    pub output_dir: PathBuf,
    /// Seconds of data between periodic flushes of text output.
    #[config(default = 5.0)]
    pub flush_interval: f64,
    #[config(default = 1000)]
    pub buffer_rows: usize,
    #[config(default = 5)]
    pub blosc_threads: u8,
    #[config(default = 2)]
    pub compression_level: u8,
}

impl Conf {
    /// Validate the device section into the settings an acquisition device opens with.
    pub fn acquisition_settings(&self) -> DaqResult<AcquisitionSettings> {
        let dev = &self.device_settings;
        let run = &self.run_settings;

        let channels: Vec<String> = dev
            .channels
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if channels.is_empty() {
            return Err(DaqError::Configuration(
                "at least one analog input channel is required".into(),
            ));
        }
        if !(run.rate.is_finite() && run.rate > 0.0) {
            return Err(DaqError::Configuration(format!(
                "sample rate must be > 0 Hz, got {}",
                run.rate
            )));
        }
        if run.chunk == 0 {
            return Err(DaqError::Configuration("chunk size must be > 0".into()));
        }
        seconds("chunk duration", run.chunk as f64 / run.rate)?;

        let vmin = dev.vmin.unwrap_or(DEFAULT_VMIN);
        if vmin >= dev.vmax {
            return Err(DaqError::Configuration(format!(
                "vmin ({vmin}) must be below vmax ({})",
                dev.vmax
            )));
        }

        Ok(AcquisitionSettings {
            device: dev.device.clone(),
            channels,
            digital_lines: expand_digital_spec(&dev.digital)?,
            sample_rate: run.rate,
            chunk_size: run.chunk,
            voltage_range: VoltageRange {
                min: vmin,
                max: dev.vmax,
            },
            terminal_mode: dev.terminal,
        })
    }

    /// Validate the run section into the controller's stop and reporting plan.
    pub fn run_plan(&self) -> DaqResult<RunPlan> {
        let run = &self.run_settings;

        let duration = match run.duration {
            None => None,
            Some(secs) => Some(seconds("duration", secs)?),
        };
        let update_interval = seconds("progress update interval", run.update_interval)?;

        Ok(RunPlan {
            duration,
            progress: run.progress.resolve(duration.is_some()),
            update_interval,
            preview_rows: run.print_first,
            max_timeout_retries: run.max_timeout_retries,
        })
    }

    /// Rows between periodic text flushes, at least one chunk.
    pub fn flush_every_rows(&self) -> usize {
        let rows = (self.output_settings.flush_interval * self.run_settings.rate).round();
        (rows.max(0.0) as usize).max(1)
    }

    pub fn sink_options(&self) -> SinkOptions {
        let out = &self.output_settings;
        SinkOptions {
            flush_every: self.flush_every_rows(),
            buffer_rows: out.buffer_rows.max(1),
            compression_level: out.compression_level,
            blosc_threads: out.blosc_threads,
        }
    }
}

/// A positive, finite number of seconds that fits a `Duration`.
fn seconds(what: &str, secs: f64) -> DaqResult<Duration> {
    if !(secs.is_finite() && secs > 0.0) {
        return Err(DaqError::Configuration(format!(
            "{what} must be > 0 s, got {secs}"
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|_| DaqError::Configuration(format!("{what} of {secs} s is out of range")))
}

/// Expand a digital line spec into an ordered, de-duplicated line list.
///
/// `port0/line0:3` expands to four lines; reversed bounds are swapped. Tokens
/// without a range are taken verbatim and checked by the device at open time.
pub fn expand_digital_spec(spec: &str) -> DaqResult<Vec<String>> {
    let mut lines: Vec<String> = Vec::new();
    for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let expanded = match token.split_once(':') {
            None => vec![token.to_string()],
            Some((head, last)) => {
                let (port, first) = head.split_once("/line").ok_or_else(|| {
                    DaqError::Configuration(format!(
                        "digital range '{token}' must look like portN/lineA:B"
                    ))
                })?;
                let parse = |s: &str| {
                    s.trim().parse::<u32>().map_err(|_| {
                        DaqError::Configuration(format!("bad line number in '{token}'"))
                    })
                };
                let (mut a, mut b) = (parse(first)?, parse(last)?);
                if b < a {
                    std::mem::swap(&mut a, &mut b);
                }
                (a..=b).map(|i| format!("{port}/line{i}")).collect()
            }
        };
        for line in expanded {
            if !lines.contains(&line) {
                lines.push(line);
            }
        }
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf() -> Conf {
        Conf::builder().load().unwrap()
    }

    #[test]
    fn defaults_validate() {
        let conf = conf();
        let settings = conf.acquisition_settings().unwrap();
        assert_eq!(settings.device, "Dev1");
        assert_eq!(settings.channels, vec!["ai0"]);
        assert!(settings.digital_lines.is_empty());
        assert_eq!(settings.sample_rate, 1000.0);
        assert_eq!(settings.chunk_size, 1000);
        assert_eq!(settings.voltage_range, VoltageRange { min: -10.0, max: 10.0 });
        assert_eq!(settings.terminal_mode, TerminalMode::Rse);

        let plan = conf.run_plan().unwrap();
        assert_eq!(plan.duration, None);
        assert_eq!(plan.progress, ProgressMode::Counter);
        assert_eq!(plan.update_interval, Duration::from_millis(500));
        assert_eq!(plan.max_timeout_retries, 3);
    }

    #[test]
    fn duration_turns_auto_progress_into_bar() {
        let mut conf = conf();
        conf.run_settings.duration = Some(30.0);
        let plan = conf.run_plan().unwrap();
        assert_eq!(plan.duration, Some(Duration::from_secs(30)));
        assert_eq!(plan.progress, ProgressMode::Bar);
    }

    #[test]
    fn invalid_numbers_are_configuration_errors() {
        let mut conf = conf();
        conf.run_settings.rate = 0.0;
        assert!(matches!(
            conf.acquisition_settings(),
            Err(DaqError::Configuration(_))
        ));

        let mut conf = self::conf();
        conf.run_settings.chunk = 0;
        assert!(conf.acquisition_settings().is_err());

        let mut conf = self::conf();
        conf.run_settings.duration = Some(-1.0);
        assert!(conf.run_plan().is_err());

        let mut conf = self::conf();
        conf.run_settings.update_interval = 0.0;
        assert!(conf.run_plan().is_err());

        let mut conf = self::conf();
        conf.device_settings.vmin = Some(5.0);
        conf.device_settings.vmax = 1.0;
        assert!(conf.acquisition_settings().is_err());

        let mut conf = self::conf();
        conf.device_settings.channels = vec![" ".into()];
        assert!(conf.acquisition_settings().is_err());
    }

    #[test]
    fn out_of_range_times_are_configuration_errors() {
        let mut conf = conf();
        conf.run_settings.duration = Some(1e20);
        assert!(matches!(conf.run_plan(), Err(DaqError::Configuration(_))));

        let mut conf = self::conf();
        conf.run_settings.update_interval = 1e20;
        assert!(matches!(conf.run_plan(), Err(DaqError::Configuration(_))));

        let mut conf = self::conf();
        conf.run_settings.rate = 1e-300;
        assert!(matches!(
            conf.acquisition_settings(),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn vmin_does_not_follow_vmax() {
        let mut conf = conf();
        conf.device_settings.vmax = 5.0;
        let settings = conf.acquisition_settings().unwrap();
        assert_eq!(settings.voltage_range, VoltageRange { min: -10.0, max: 5.0 });

        conf.device_settings.vmin = Some(-1.0);
        let settings = conf.acquisition_settings().unwrap();
        assert_eq!(settings.voltage_range, VoltageRange { min: -1.0, max: 5.0 });
    }

    #[test]
    fn toml_file_is_layered_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daq.toml");
        std::fs::write(
            &path,
            r#"
            [device_settings]
            channels = ["ai0", "ai1"]
            digital = "port0/line0:1"
            terminal = "DIFF"

            [run_settings]
            rate = 250.0
            chunk = 50
            duration = 2.5
            progress = "none"
            "#,
        )
        .unwrap();

        let conf = Conf::builder().file(&path).load().unwrap();
        let settings = conf.acquisition_settings().unwrap();
        assert_eq!(settings.channels, vec!["ai0", "ai1"]);
        assert_eq!(settings.digital_lines, vec!["port0/line0", "port0/line1"]);
        assert_eq!(settings.terminal_mode, TerminalMode::Diff);
        assert_eq!(settings.chunk_size, 50);

        let plan = conf.run_plan().unwrap();
        assert_eq!(plan.progress, ProgressMode::None);
        assert_eq!(plan.duration, Some(Duration::from_secs_f64(2.5)));
    }

    #[test]
    fn flush_cadence_covers_five_seconds_of_samples() {
        let mut conf = conf();
        conf.run_settings.rate = 200.0;
        assert_eq!(conf.flush_every_rows(), 1000);
        conf.run_settings.rate = 0.01;
        assert_eq!(conf.flush_every_rows(), 1);
    }

    #[test]
    fn digital_ranges_expand_in_order() {
        assert_eq!(
            expand_digital_spec("port0/line0:3").unwrap(),
            vec!["port0/line0", "port0/line1", "port0/line2", "port0/line3"]
        );
        assert_eq!(
            expand_digital_spec("port1/line2:0").unwrap(),
            vec!["port1/line0", "port1/line1", "port1/line2"]
        );
    }

    #[test]
    fn digital_lists_drop_duplicates() {
        assert_eq!(
            expand_digital_spec(" port0/line3, port0/line0:1 ,port0/line3,").unwrap(),
            vec!["port0/line3", "port0/line0", "port0/line1"]
        );
        assert!(expand_digital_spec("").unwrap().is_empty());
        assert!(expand_digital_spec("  ").unwrap().is_empty());
    }

    #[test]
    fn malformed_digital_ranges_are_rejected() {
        assert!(expand_digital_spec("port0:3").is_err());
        assert!(expand_digital_spec("port0/lineX:3").is_err());
    }
}
