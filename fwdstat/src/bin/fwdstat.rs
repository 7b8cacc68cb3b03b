//! Request, back-pressure and ack statistics for event forwarder logs.

use std::{
    env,
    fs::File,
    io::{self, BufWriter},
    path::PathBuf,
};

use clap::Parser;
use fwdstat::{
    config::{self, Config, Overrides},
    report::{self, AckReceivedSource, Format, Report},
    scan::{self, Compression},
};
use tokio::runtime::Builder;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about,
    long_about = None,
    after_help = "As an alternative to the command line, arguments can be placed in a file, \
                  one per line, and passed as '@args.conf'."
)]
struct Args {
    /// Path to the forwarder log to scan. The forwarder must have logged at
    /// DEBUG level.
    #[clap(value_name = "FILENAME")]
    filename: PathBuf,

    /// increase output verbosity
    #[clap(short, long)]
    verbose: bool,

    /// path on disk to an optional YAML configuration file
    #[clap(long)]
    config_path: Option<PathBuf>,

    /// assumed size of one acknowledged batch in megabytes
    #[clap(long)]
    batch_megabytes: Option<u64>,

    /// samples behind the "acks received" average, received or requested
    #[clap(long)]
    acks_received_source: Option<AckReceivedSource>,

    /// report format, one of text, json or log
    #[clap(long)]
    format: Option<Format>,

    /// write the report here instead of stdout
    #[clap(long)]
    output: Option<PathBuf>,

    /// input compression, one of auto, none, zstd or gzip
    #[clap(long)]
    compression: Option<Compression>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            batch_megabytes: self.batch_megabytes,
            acks_received_source: self.acks_received_source,
            format: self.format,
            compression: self.compression,
        }
    }
}

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::Error),
    #[error("Scan failed: {0}")]
    Scan(#[from] scan::Error),
    #[error("Failed to emit report: {0}")]
    Report(#[from] report::Error),
    #[error("--output {0:?} cannot be used with the log format, log events go to stderr")]
    LogToOutput(PathBuf),
    #[error("Failed to create output {path:?}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

async fn run(args: &Args, config: Config) -> Result<(), Error> {
    // The output is only created once the format is known to write to it.
    if let (Some(path), Format::Log) = (&args.output, config.format) {
        return Err(Error::LogToOutput(path.clone()));
    }

    info!("Computing metrics on file {}", args.filename.display());
    let tally = scan::scan_path(&args.filename, config.compression).await?;

    let report = Report::build(&tally, config.report_options());
    match &args.output {
        Some(path) => {
            let file = File::create(path).map_err(|source| Error::Output {
                path: path.clone(),
                source,
            })?;
            report.emit(config.format, &mut BufWriter::new(file))?;
            info!("Report written to {}", path.display());
        }
        None => {
            let stdout = io::stdout();
            report.emit(config.format, &mut stdout.lock())?;
        }
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    let args = Args::parse_from(config::expand_args(env::args_os())?);

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(io::stderr)
        .with_ansi(false)
        .finish()
        .init();

    info!("Reminder: make sure the forwarder printed DEBUG log lines.");

    let config = match &args.config_path {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    }
    .apply(args.overrides())?;
    debug!(?config, "effective configuration");
    if config.acks_received_source == AckReceivedSource::Requested {
        warn!(
            "Averaging requested ack ids for 'acks received', the result equals the ackIDs sent average"
        );
    }

    let runtime = Builder::new_current_thread().build()?;
    let res = runtime.block_on(run(&args, config));
    debug!("Bye. :)");
    res
}
