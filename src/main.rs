use anyhow::{ensure, Context, Result};
use clap::Parser;
use confique::Config;
use crossterm::style::Stylize;
use daq_logger::{
    infer_output, Conf, Controller, LogDisplay, OutputFormat, ProgressDisplay, ProgressMode,
    SimulatedDevice, StopCause, TerminalDisplay, TerminalMode, PRODUCT,
};
use log::{debug, LevelFilter};
use num_format::{Locale, ToFormattedString};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger};
use std::{
    io::IsTerminal,
    path::PathBuf,
    process::ExitCode,
    sync::{atomic::AtomicBool, Arc},
};
use time::OffsetDateTime;

/// Log analog inputs and static digital lines of a DAQ device to CSV, XLSX or HDF5.
///
/// Flags override values from the configuration file and `DAQ_*` environment
/// variables. Ctrl+C stops after the chunk being read and closes the file cleanly.
#[derive(Parser, Debug)]
#[command(name = "daq-logger", version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device name, e.g. Dev1
    #[arg(long)]
    device: Option<String>,

    /// Analog channels, e.g. ai0,ai1
    #[arg(long, value_delimiter = ',')]
    channels: Option<Vec<String>>,

    /// Digital lines, e.g. port0/line0:3,port1/line0
    #[arg(long)]
    digital: Option<String>,

    /// Sample rate per channel in Hz
    #[arg(long)]
    rate: Option<f64>,

    /// Samples per channel per read
    #[arg(long)]
    chunk: Option<usize>,

    /// Lower input limit in volts
    #[arg(long, allow_negative_numbers = true)]
    vmin: Option<f64>,

    /// Upper input limit in volts
    #[arg(long, allow_negative_numbers = true)]
    vmax: Option<f64>,

    /// Analog terminal configuration
    #[arg(long, value_enum)]
    term: Option<TerminalMode>,

    /// Output file. Auto-named under the output directory if omitted
    #[arg(long)]
    outfile: Option<PathBuf>,

    /// Output format. Inferred from --outfile if omitted, else csv
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Seconds to log. Runs until Ctrl+C if omitted
    #[arg(long)]
    duration: Option<f64>,

    /// Progress display
    #[arg(long, value_enum)]
    progress: Option<ProgressMode>,

    /// Seconds between progress refreshes
    #[arg(long)]
    update_interval: Option<f64>,

    /// Print the first N rows as they are logged
    #[arg(long)]
    print_first: Option<usize>,

    /// Consecutive read timeouts tolerated before giving up
    #[arg(long)]
    max_timeout_retries: Option<u32>,

    /// Seed for the simulated signal
    #[arg(long)]
    seed: Option<u64>,

    /// Extra setup and runtime output
    #[arg(long)]
    debug: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "debug")]
    quiet: bool,
}

impl Args {
    fn apply(&self, conf: &mut Conf) {
        let dev = &mut conf.device_settings;
        if let Some(device) = &self.device {
            dev.device = device.clone();
        }
        if let Some(channels) = &self.channels {
            dev.channels = channels.clone();
        }
        if let Some(digital) = &self.digital {
            dev.digital = digital.clone();
        }
        if self.vmin.is_some() {
            dev.vmin = self.vmin;
        }
        if let Some(vmax) = self.vmax {
            dev.vmax = vmax;
        }
        if let Some(term) = self.term {
            dev.terminal = term;
        }

        let run = &mut conf.run_settings;
        if let Some(rate) = self.rate {
            run.rate = rate;
        }
        if let Some(chunk) = self.chunk {
            run.chunk = chunk;
        }
        if self.duration.is_some() {
            run.duration = self.duration;
        }
        if let Some(progress) = self.progress {
            run.progress = progress;
        }
        if let Some(interval) = self.update_interval {
            run.update_interval = interval;
        }
        if let Some(n) = self.print_first {
            run.print_first = n;
        }
        if let Some(n) = self.max_timeout_retries {
            run.max_timeout_retries = n;
        }

        let out = &mut conf.output_settings;
        if self.outfile.is_some() {
            out.outfile = self.outfile.clone();
        }
        if self.format.is_some() {
            out.format = self.format;
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<bool> {
    let args = Args::parse();

    let level = if args.debug {
        LevelFilter::Debug
    } else if args.quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    TermLogger::init(
        level,
        ConfigBuilder::new().set_target_level(LevelFilter::Off).build(),
        simplelog::TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .context("failed to install logger")?;

    let mut builder = Conf::builder().env();
    if let Some(path) = &args.config {
        ensure!(path.exists(), "config file '{}' not found", path.display());
        builder = builder.file(path);
    }
    let mut conf = builder.load().context("failed to load configuration")?;
    args.apply(&mut conf);
    debug!("{conf:#?}");

    let settings = conf.acquisition_settings()?;
    let plan = conf.run_plan()?;
    let mut device = SimulatedDevice::new(settings.device.clone());
    if let Some(seed) = args.seed {
        device = device.with_seed(seed);
    }
    device.validate(&settings)?;

    let out = &conf.output_settings;
    let target = infer_output(
        out.outfile.as_deref(),
        out.format,
        &out.output_dir,
        &settings.device,
        OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc()),
    )?;
    let sink_options = conf.sink_options();

    println!("{}", format!("Logging from {PRODUCT}").bold());
    println!("Output:\t\t{} ({:?})", target.path.display(), target.format);
    println!("Channels:\t{}", settings.physical_channels().join(", "));
    println!("Terminal:\t{}", settings.terminal_mode);
    println!("Range:\t\t{}", settings.voltage_range);
    println!(
        "Rate:\t\t{} Hz, chunk {} samples",
        settings.sample_rate, settings.chunk_size
    );
    if settings.has_digital() {
        println!("DI lines:\t{}", settings.digital_lines.join(", "));
    }
    match plan.duration {
        Some(d) => println!("Duration:\t{:.3} s", d.as_secs_f64()),
        None => println!("Duration:\tuntil {}", "Ctrl+C".blue().bold()),
    }

    let stop = install_signal_handler()?;
    let display: Box<dyn ProgressDisplay> =
        if plan.progress != ProgressMode::None && std::io::stdout().is_terminal() {
            Box::new(TerminalDisplay::stdout().context("failed to set up progress display")?)
        } else {
            Box::new(LogDisplay::stdout())
        };

    let controller = Controller::new(settings, plan, stop, display);
    let summary = controller.run(&device, |layout| target.open(layout, &sink_options))?;

    let rows = summary.rows_written.to_formatted_string(&Locale::en);
    match &summary.cause {
        StopCause::Failed(e) => {
            println!("{} {e}", "Run failed:".red().bold());
            println!(
                "{rows} samples per AI channel written before the failure are in {}",
                target.path.display()
            );
        }
        cause => {
            println!(
                "{} Wrote {rows} samples per AI channel to {} ({cause}, {:.1} s)",
                "Done.".green().bold(),
                target.path.display(),
                summary.elapsed.as_secs_f64()
            );
        }
    }
    Ok(summary.is_success())
}

fn install_signal_handler() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))
        .context("failed to register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))
        .context("failed to register SIGTERM handler")?;
    Ok(stop)
}
