//! The rpki-rp binary.
//!
//! Normally this sets up the configuration and drives a full validation
//! run. When invoked with the hidden `--proc` option it instead becomes
//! one of the worker processes, talking to the orchestrator over the
//! socket it inherited as standard input.

use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use log::error;
use structopt::StructOpt;
use rpki_rp::config::{BirdVersion, Config, OutFormats};
use rpki_rp::ipc::WorkerChannel;
use rpki_rp::run::Runner;
use rpki_rp::worker;

#[derive(StructOpt)]
#[structopt(
    name = "rpki-rp",
    about = "An RPKI relying party validator.",
)]
struct Args {
    /// Increase log verbosity; can be given multiple times.
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u32,

    /// TAL files to process instead of the TAL directory.
    #[structopt(short = "t", long = "tal", parse(from_os_str))]
    tal: Vec<PathBuf>,

    /// The directory to search for TAL files.
    #[structopt(
        long = "tal-dir", parse(from_os_str),
        default_value = "/etc/rpki",
    )]
    tal_dir: PathBuf,

    /// The directory to cache repository data in.
    #[structopt(
        short = "d", long = "cache-dir", parse(from_os_str),
        default_value = "/var/cache/rpki-client",
    )]
    cache_dir: PathBuf,

    /// The directory to write the output files to.
    #[structopt(
        short = "o", long = "output-dir", parse(from_os_str),
        default_value = "/var/db/rpki-client",
    )]
    output_dir: PathBuf,

    /// Produce OpenBGPD roa-set output.
    #[structopt(short = "B", long = "openbgpd")]
    openbgpd: bool,

    /// Produce BIRD 2.x output.
    #[structopt(long = "bird")]
    bird: bool,

    /// Produce BIRD 1.x output for the IPv4 table.
    #[structopt(long = "bird1v4")]
    bird1v4: bool,

    /// Produce BIRD 1.x output for the IPv6 table.
    #[structopt(long = "bird1v6")]
    bird1v6: bool,

    /// Produce CSV output.
    #[structopt(short = "c", long = "csv")]
    csv: bool,

    /// Produce JSON output.
    #[structopt(short = "j", long = "json")]
    json: bool,

    /// Wall clock budget for a single repository sync, in seconds.
    #[structopt(long = "repo-timeout", default_value = "900")]
    repo_timeout: u64,

    /// The rsync client to invoke.
    #[structopt(long = "rsync-command", default_value = "rsync")]
    rsync_command: String,

    /// Do not fetch anything, work from the existing cache.
    #[structopt(short = "n", long = "no-network")]
    no_network: bool,

    /// Internal: become the named worker process.
    #[structopt(long = "proc", hidden = true)]
    proc: Option<String>,
}

fn main() {
    let args = Args::from_args();

    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .format_timestamp(None)
        .init();

    if let Some(ref name) = args.proc {
        exit(run_worker(name, &args));
    }

    let mut outformats = OutFormats::empty();
    if args.openbgpd {
        outformats.add(OutFormats::OPENBGPD);
    }
    if args.bird || args.bird1v4 || args.bird1v6 {
        outformats.add(OutFormats::BIRD);
    }
    if args.csv {
        outformats.add(OutFormats::CSV);
    }
    if args.json {
        outformats.add(OutFormats::JSON);
    }
    if outformats.is_empty() {
        outformats = OutFormats::default();
    }

    let config = Config {
        verbose: args.verbose,
        cache_dir: args.cache_dir,
        output_dir: args.output_dir,
        tal_files: args.tal,
        tal_dir: args.tal_dir,
        outformats,
        bird_version: if args.bird1v4 {
            BirdVersion::Bird1v4
        }
        else if args.bird1v6 {
            BirdVersion::Bird1v6
        }
        else {
            BirdVersion::Bird2
        },
        repo_timeout: Duration::from_secs(args.repo_timeout),
        rsync_command: args.rsync_command,
        no_network: args.no_network,
    };

    let runner = match Runner::new(&config) {
        Ok(runner) => runner,
        Err(err) => {
            error!("{}", err);
            exit(1);
        }
    };
    match runner.run() {
        // Success means at least one trust anchor yielded a VRP.
        Ok(true) => exit(0),
        Ok(false) => {
            error!("no trust anchor produced any VRPs");
            exit(1);
        }
        Err(err) => {
            error!("{}", err);
            exit(1);
        }
    }
}

/// Runs one of the worker processes over the inherited socket.
fn run_worker(name: &str, args: &Args) -> i32 {
    let channel = WorkerChannel::new(unsafe { worker::stdin_stream() });
    let res = match name {
        worker::PROC_PARSER => worker::parser::run(channel),
        worker::PROC_RSYNC => {
            worker::rsync::run(channel, &args.rsync_command)
        }
        worker::PROC_HTTP => worker::http::run(channel),
        worker::PROC_RRDP => worker::rrdp::run(channel),
        _ => {
            error!("unknown worker process {}", name);
            return 1
        }
    };
    match res {
        Ok(()) => 0,
        Err(err) => {
            error!("{} worker: {}", name, err);
            1
        }
    }
}
