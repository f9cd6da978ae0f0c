//! Kestrel terminal entry point.
//!
//! Boots the kernel from a state file on the host and runs a line-oriented
//! shell on stdin/stdout. End of input (Ctrl-D) saves and exits.
//!
//! The config file comes from `--config <path>`, then `KESTREL_CONFIG`;
//! without either the built-in defaults apply.

mod terminal;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use kestrel_kernel::Kernel;
use kestrel_platform::{Clock, FileStorage, HostClock};
use kestrel_types::KernelConfig;

use terminal::Terminal;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match config_path()? {
        Some(path) => KernelConfig::load(&path)
            .with_context(|| format!("could not load config {}", path.display()))?,
        None => KernelConfig::default(),
    };
    log::info!(
        "Starting {} with state at {}",
        config.hostname,
        config.storage.path.display()
    );

    let clock: Arc<dyn Clock> = Arc::new(HostClock::new());
    let storage = FileStorage::new(&config.storage.path);
    let kernel = Kernel::boot(config.clone(), Box::new(storage), Arc::clone(&clock))
        .context("kernel failed to boot")?;

    let stdin = io::stdin();
    let mut terminal = Terminal::new(stdin.lock(), io::stdout(), config, clock);
    let kernel = terminal.run(kernel)?;
    kernel.shutdown().context("could not save state on exit")?;
    log::info!("Goodbye");
    Ok(())
}

fn config_path() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args.next().context("--config needs a path")?;
            return Ok(Some(PathBuf::from(path)));
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Ok(Some(PathBuf::from(path)));
        }
        bail!("unknown argument '{arg}' (usage: kestrel [--config <path>])");
    }
    Ok(std::env::var_os("KESTREL_CONFIG").map(PathBuf::from))
}
