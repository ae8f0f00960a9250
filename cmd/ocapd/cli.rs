use std::fmt::Display;
use std::path::PathBuf;

use clap::{ArgAction, Parser as ClapParser, Subcommand as ClapSubcommand, ValueEnum};
use tracing::Level;

#[derive(ClapParser)]
#[command(
    name = "ocapd",
    author = "ocapd contributors",
    version,
    about = "ocapd object-capability kernel"
)]
pub struct CLI {
    #[command(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Option<Subcommand>,
}

#[derive(ClapParser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "datadir",
        value_name = "DATABASE_DIRECTORY",
        default_value = "ocapd-data",
        help = "Receives the name of the directory where the database is located.",
        long_help = "If the datadir is the word `memory`, ocapd will keep all state in memory and lose it on exit.",
        help_heading = "Kernel options",
        env = "OCAPD_DATADIR"
    )]
    pub datadir: PathBuf,
    #[arg(
        long = "worker.cmd",
        value_name = "COMMAND",
        help = "Program spawned for each process vat; the bundle spec is appended as the last argument.",
        help_heading = "Kernel options",
        env = "OCAPD_WORKER_CMD"
    )]
    pub worker_cmd: Option<String>,
    #[arg(
        long = "worker.handshake-timeout-ms",
        value_name = "MILLISECONDS",
        default_value_t = 10_000,
        help = "How long a freshly spawned worker may take to say ready.",
        help_heading = "Kernel options",
        env = "OCAPD_WORKER_HANDSHAKE_TIMEOUT_MS"
    )]
    pub handshake_timeout_ms: u64,
    #[arg(
        long = "gc.interval",
        value_name = "DELIVERIES",
        default_value_t = 20,
        help = "Deliveries per vat between bringOutYourDead prompts (0 disables the cadence).",
        help_heading = "Kernel options",
        env = "OCAPD_GC_INTERVAL"
    )]
    pub gc_interval: u64,
    #[arg(
        long = "http.addr",
        default_value = "0.0.0.0",
        value_name = "ADDRESS",
        help = "Listening address for the control-plane server.",
        help_heading = "RPC options",
        env = "OCAPD_HTTP_ADDR"
    )]
    pub http_addr: String,
    #[arg(
        long = "http.port",
        default_value = "8777",
        value_name = "PORT",
        help = "Listening port for the control-plane server.",
        help_heading = "RPC options",
        env = "OCAPD_HTTP_PORT"
    )]
    pub http_port: String,
    #[arg(
        long = "bundles.dir",
        value_name = "BUNDLE_DIRECTORY",
        help = "Root directory served as /<name>.bundle; disabled when absent.",
        help_heading = "RPC options",
        env = "OCAPD_BUNDLES_DIR"
    )]
    pub bundles_dir: Option<PathBuf>,
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error",
        help_heading = "Kernel options",
        env = "OCAPD_LOG_LEVEL"
    )]
    pub log_level: Level,
    #[arg(
        long = "log.color",
        default_value_t = LogColor::Auto,
        help = "Output logs with ANSI color codes.",
        long_help = "Possible values: auto, always, never",
        help_heading = "Kernel options",
        env = "OCAPD_LOG_COLOR"
    )]
    pub log_color: LogColor,
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    #[command(name = "removedb", about = "Remove the kernel database")]
    RemoveDB {
        #[arg(
            long = "force",
            help = "Delete the database without confirmation.",
            action = ArgAction::SetTrue
        )]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogColor {
    Auto,
    Always,
    Never,
}

impl Display for LogColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogColor::Auto => f.write_str("auto"),
            LogColor::Always => f.write_str("always"),
            LogColor::Never => f.write_str("never"),
        }
    }
}
