use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use drivedup_core::volume::DEFAULT_VOLUME_LABEL;
use drivedup_core::{
    DeviceId, DeviceSource, Duplicator, DuplicatorConfig, Event, EventBus, FileSystemKind,
    FormatOptions, JobStatus, JobTemplate, SystemDevices, SystemVolumes, VolumeService,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "drivedup")]
#[command(about = "Copies a folder onto every removable drive you plug in", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a directory onto each removable drive as it is plugged in
    Run {
        /// Directory whose contents are copied to every drive
        #[arg(required = true)]
        source: PathBuf,

        /// Format each drive before copying (erases it)
        #[arg(short, long)]
        format: bool,

        /// Filesystem to format with: FAT, FAT32, exFAT, NTFS or UDF
        #[arg(long = "fs", default_value = "FAT")]
        filesystem: String,

        /// Volume label given to formatted drives
        #[arg(short, long, default_value = DEFAULT_VOLUME_LABEL)]
        label: String,

        /// Do not ask for confirmation before formatting
        #[arg(short, long)]
        yes: bool,

        /// How often to look for new and removed drives, in milliseconds
        #[arg(long, default_value_t = 300)]
        poll_ms: u64,

        /// Pause after each copied file, in milliseconds
        #[arg(long, default_value_t = 100)]
        pace_ms: u64,
    },
    /// List available removable devices
    List,
    /// List the filesystems drives can be formatted with on this machine
    Filesystems,
}

/// Routes log lines around the progress bars so they do not tear them.
struct ProgressWriter(MultiProgress);

impl Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

fn init_logging(multi: &MultiProgress) {
    let multi = multi.clone();
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drivedup=info,drivedup_core=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(move || ProgressWriter(multi.clone())),
        )
        .init();
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn bar_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("{prefix:20} [{elapsed_precise}] [{bar:40.green/black}] {percent:>3}% {msg}")?
        .progress_chars("■ "))
}

/// One progress bar per attached drive, driven by duplicator events.
struct Dashboard {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<DeviceId, ProgressBar>,
    finished: usize,
    failed: usize,
}

impl Dashboard {
    fn new(multi: MultiProgress) -> Result<Self> {
        Ok(Self {
            multi,
            style: bar_style()?,
            bars: HashMap::new(),
            finished: 0,
            failed: 0,
        })
    }

    fn bar(&mut self, device: &DeviceId) -> &ProgressBar {
        self.bars.entry(device.clone()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(100));
            bar.set_style(self.style.clone());
            bar.set_prefix(device.to_string());
            bar
        })
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::DeviceAttached(device) => {
                let message = if device.label.is_empty() {
                    "Attached".to_string()
                } else {
                    format!("Attached [{}]", device.label)
                };
                self.bar(&device.id).set_message(message);
            }
            Event::DeviceDetached(id) => {
                if let Some(bar) = self.bars.remove(&id) {
                    if !bar.is_finished() {
                        bar.abandon_with_message("Removed");
                    }
                }
            }
            Event::Status {
                device,
                status,
                error,
            } => {
                let bar = self.bar(&device).clone();
                match status {
                    JobStatus::Finished => {
                        self.finished += 1;
                        bar.finish_with_message(format!("{}", style("✨ Done").green()));
                    }
                    JobStatus::Failed => {
                        self.failed += 1;
                        let reason = error.map(|e| e.to_string()).unwrap_or_default();
                        bar.abandon_with_message(format!("{} {}", style("❌ Failed:").red(), reason));
                    }
                    JobStatus::Canceled => {
                        let message = match error {
                            Some(reason) => format!("Could not start: {reason}"),
                            None => "Canceled".to_string(),
                        };
                        bar.abandon_with_message(message);
                    }
                    status => {
                        // A restarted job reuses its bar.
                        if bar.is_finished() {
                            bar.reset();
                        }
                        bar.set_message(status.to_string());
                    }
                }
            }
            Event::Progress {
                device,
                progress,
                sample,
            } => {
                let bar = self.bar(&device);
                bar.set_position((progress * 100.0).round() as u64);
                if let Some(name) = sample.current_file.as_deref().and_then(|f| f.file_name()) {
                    bar.set_message(name.to_string_lossy().into_owned());
                }
            }
        }
    }
}

fn run(
    source: PathBuf,
    format: Option<FormatOptions>,
    config: DuplicatorConfig,
    multi: MultiProgress,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let bus = EventBus::new(config.event_capacity);
    let events = bus.subscribe();
    let template = JobTemplate {
        source: source.clone(),
        format,
    };
    let mut duplicator = Duplicator::spawn_with_events(
        config,
        template,
        Arc::new(SystemDevices),
        Arc::new(SystemVolumes),
        bus,
    )?;

    multi.println(format!(
        "Copying {} to every removable drive plugged in. Press Ctrl+C to stop.",
        style(source.display()).cyan()
    ))?;

    let mut dashboard = Dashboard::new(multi.clone())?;
    while running.load(Ordering::SeqCst) {
        if let Ok(event) = events.recv_timeout(Duration::from_millis(100)) {
            dashboard.handle(event);
            for event in events.try_iter() {
                dashboard.handle(event);
            }
        }
    }

    info!("stopping");
    duplicator.shutdown();
    for event in events.try_iter() {
        dashboard.handle(event);
    }

    multi.clear()?;
    println!(
        "\n{} drive(s) written, {} failed.",
        style(dashboard.finished).green(),
        style(dashboard.failed).red()
    );
    Ok(())
}

fn main() -> Result<()> {
    // This flag allows for graceful shutdown on Ctrl+C.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let cli = Cli::parse();
    let multi = MultiProgress::new();
    init_logging(&multi);

    match cli.command {
        Commands::Run {
            source,
            format,
            filesystem,
            label,
            yes,
            poll_ms,
            pace_ms,
        } => {
            if !source.is_dir() {
                bail!("Source '{}' is not a directory.", source.display());
            }

            let format = if format {
                let kind = FileSystemKind::parse_or_default(&filesystem);
                match SystemVolumes.available_filesystems() {
                    Ok(kinds) if !kinds.contains(&kind) => {
                        warn!(filesystem = %kind, "this machine may not be able to format as {}", kind);
                    }
                    Err(err) => warn!(error = %format!("{err:#}"), "could not list filesystems"),
                    _ => {}
                }
                let options = FormatOptions::new(kind, label);

                println!(
                    "{} Every drive plugged in will be erased and formatted as {} [{}].",
                    style("WARNING:").red().bold(),
                    style(kind).cyan(),
                    options.sanitized_label(),
                );
                println!();
                if !yes && !confirm_operation("Are you sure you want to proceed?")? {
                    println!("Operation cancelled.");
                    return Ok(());
                }
                println!();
                Some(options)
            } else {
                None
            };

            let config = DuplicatorConfig {
                poll_interval: Duration::from_millis(poll_ms.max(1)),
                pace: Duration::from_millis(pace_ms),
                ..Default::default()
            };
            run(source, format, config, multi, running)?;
        }
        Commands::List => {
            let mut devices = SystemDevices.removable_devices()?;
            devices.retain(|d| d.ready);
            if devices.is_empty() {
                println!("No removable devices found.");
                return Ok(());
            }

            println!("Found {} removable devices:", devices.len());
            println!(
                "\n  {:<25} {:<12} {:<15} {:<8} {}",
                "LOCATION", "DEVICE", "LABEL", "FS", "SIZE"
            );
            println!("  {:-<25} {:-<12} {:-<15} {:-<8} {:-<10}", "", "", "", "", "");
            for device in devices {
                let label = if device.label.is_empty() {
                    "(No label)".to_string()
                } else {
                    device.label.clone()
                };
                println!(
                    "  {:<25} {:<12} {:<15} {:<8} {:>7.1} GB",
                    device.id.to_string(),
                    device.node.display().to_string(),
                    label,
                    device.file_system,
                    device.size_gb(),
                );
            }
        }
        Commands::Filesystems => {
            let kinds = SystemVolumes.available_filesystems()?;
            if kinds.is_empty() {
                println!("No format tools found on this machine.");
                return Ok(());
            }
            for kind in kinds {
                println!("  {kind}");
            }
        }
    }

    Ok(())
}
