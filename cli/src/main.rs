mod monitoring;

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use dlflash::{Event, Flasher};

#[derive(Parser, Debug)]
#[command(author, version, about = "cli for flashing Samsung devices in Download Mode", long_about = None)]
struct Args {
  #[command(subcommand)]
  command: Command,

  /// Path to an optional TOML configuration file (timeouts, packet-size override, log filter).
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List connected devices in Download Mode.
  List,
  /// Flash a firmware archive to the connected device.
  Flash {
    /// Path to a `.tar` or `.tar.md5` firmware archive.
    firmware: PathBuf,
    /// Optional PIT file to use for partition matching instead of the device's own PIT.
    #[arg(long)]
    pit: Option<PathBuf>,
    /// Reboot the device once the flash completes.
    #[arg(long, action)]
    reboot: bool,
  },
  /// Dump the connected device's PIT to stdout (binary) or a file.
  DumpPit {
    /// Write the PIT bytes here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
  },
  /// Install the udev rules required for unprivileged USB access (Linux only).
  HostSetup,
}

fn main() -> ExitCode {
  let args = Args::parse();
  let config = match &args.config {
    Some(path) => match dlflash::config::Config::load(path) {
      Ok(config) => Some(config),
      Err(err) => {
        eprintln!("failed to load config {}: {err}", path.display());
        return ExitCode::FAILURE;
      }
    },
    None => None,
  };

  monitoring::init_logger(config.as_ref().and_then(|c| c.log_filter.as_deref()));

  match run(args.command, config.as_ref()) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      tracing::error!("{err}");
      ExitCode::FAILURE
    }
  }
}

fn run(command: Command, config: Option<&dlflash::config::Config>) -> dlflash::Result<()> {
  match command {
    Command::List => {
      for device in Flasher::enumerate()? {
        println!(
          "{:04x}:{:04x} bus {} addr {} {}",
          device.vendor_id,
          device.product_id,
          device.bus_number,
          device.address,
          device.product.as_deref().unwrap_or("(unknown)")
        );
      }
      Ok(())
    }
    Command::Flash { firmware, pit, reboot } => {
      let callback = Arc::new(|event: Event| match event {
        Event::Step(phase) => tracing::info!("entering phase: {:?}", phase),
        Event::MemberStart { name, index, total } => {
          tracing::info!("starting member {}/{}: {}", index + 1, total, name)
        }
        Event::FlashProgress(progress) => {
          tracing::debug!("{}: {:.1}%", progress.member, progress.percent)
        }
        _ => {}
      });

      let mut flasher = Flasher::connect(config, Some(callback))?;
      let loaded = flasher.load_firmware(&firmware)?;
      let pit_override = match &pit {
        Some(path) => Some(dlflash::Pit::parse(&std::fs::read(path)?)?),
        None => None,
      };

      flasher.flash(&loaded, pit_override.as_ref(), reboot, None, |progress| {
        println!("{}: {:.1}%", progress.member, progress.percent);
      })?;

      Ok(())
    }
    Command::DumpPit { out } => {
      let mut flasher = Flasher::connect(config, None)?;
      let bytes = flasher.dump_pit()?;
      match out {
        Some(path) => std::fs::write(path, bytes)?,
        None => {
          use std::io::Write;
          std::io::stdout().write_all(&bytes)?;
        }
      }
      Ok(())
    }
    Command::HostSetup => dlflash::host_setup(),
  }
}
