use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{Context, Result, ensure};
use clap::{Parser, ValueEnum, ValueHint, builder::NonEmptyStringValueParser};

use crate::service::{Config, DEFAULT_AGENCY_SIZE, DEFAULT_STARTER_PORT, ServiceMode};

/// Everything needed to launch a starter.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub config: Config,
    pub executable: PathBuf,
    pub server_args: Vec<String>,
    pub verbose: bool,
}

/// The top-level command requested by the user.
#[derive(Debug, Clone)]
pub enum Command {
    Start(StartOptions),
    ShowVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Single,
    Cluster,
}

impl From<Mode> for ServiceMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Single => ServiceMode::Single,
            Mode::Cluster => ServiceMode::Cluster,
        }
    }
}

/// Parse CLI arguments into a high-level command.
pub fn parse() -> Result<Command> {
    into_command(Cli::parse())
}

/// Like [`parse`], but from an explicit argument list.
pub fn parse_from<I, T>(args: I) -> Result<Command>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    into_command(Cli::try_parse_from(args)?)
}

fn into_command(cli: Cli) -> Result<Command> {
    if cli.version {
        return Ok(Command::ShowVersion);
    }

    ensure!(cli.agency_size >= 1, "--cluster.agency-size must be at least 1");
    ensure!(
        !(cli.local && cli.mode == Mode::Single),
        "--starter.local cannot be combined with --starter.mode=single"
    );
    ensure!(
        !(cli.local && cli.join.is_some()),
        "--starter.local cannot be combined with --starter.join"
    );

    let server_args = match cli.server_args.as_deref() {
        Some(raw) => shell_words::split(raw).context("failed to split --server.args")?,
        None => Vec::new(),
    };

    let config = Config {
        id: None,
        data_dir: cli.data_dir,
        own_address: cli.address.unwrap_or_default(),
        port: cli.port,
        master_address: cli.join,
        mode: cli.mode.into(),
        start_local_slaves: cli.local,
        agency_size: cli.agency_size,
        secure: cli.secure,
        ..Config::default()
    };

    Ok(Command::Start(StartOptions {
        config,
        executable: cli.executable,
        server_args,
        verbose: cli.verbose,
    }))
}

#[derive(Parser, Debug)]
#[command(
    name = "starter",
    about = "Bootstraps database servers on this host, alone or as part of a cluster",
    disable_help_subcommand = true,
    disable_version_flag = true
)]
struct Cli {
    /// Print version information and exit.
    #[arg(short = 'V', long = "version", action = clap::ArgAction::SetTrue)]
    version: bool,

    /// Directory holding setup.json and all server data.
    #[arg(
        long = "starter.data-dir",
        env = "DATA_DIR",
        value_name = "PATH",
        value_hint = ValueHint::DirPath,
        default_value = "."
    )]
    data_dir: PathBuf,

    /// Address under which other peers reach this starter.
    #[arg(
        long = "starter.address",
        value_name = "HOST",
        value_parser = NonEmptyStringValueParser::new()
    )]
    address: Option<String>,

    /// Port of the control plane. Server ports are derived from it.
    #[arg(long = "starter.port", value_name = "PORT", default_value_t = DEFAULT_STARTER_PORT)]
    port: u16,

    /// `host:port` of a master starter to join.
    #[arg(
        long = "starter.join",
        value_name = "HOST:PORT",
        value_parser = NonEmptyStringValueParser::new()
    )]
    join: Option<String>,

    #[arg(long = "starter.mode", value_enum, default_value_t = Mode::Cluster)]
    mode: Mode,

    /// Fill the agency with local slave starters on this host.
    #[arg(long = "starter.local", action = clap::ArgAction::SetTrue)]
    local: bool,

    #[arg(long = "cluster.agency-size", value_name = "N", default_value_t = DEFAULT_AGENCY_SIZE)]
    agency_size: usize,

    /// Database server binary.
    #[arg(
        long = "server.executable",
        value_name = "PATH",
        value_hint = ValueHint::ExecutablePath,
        default_value = "arangod"
    )]
    executable: PathBuf,

    /// Extra arguments passed to every server, split like a shell would.
    #[arg(long = "server.args", value_name = "ARGS", allow_hyphen_values = true)]
    server_args: Option<String>,

    /// Run servers with TLS endpoints.
    #[arg(long = "ssl.secure", action = clap::ArgAction::SetTrue)]
    secure: bool,

    /// Log at debug level.
    #[arg(short, long, env = "VERBOSE", action = clap::ArgAction::SetTrue)]
    verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(args: &[&str]) -> StartOptions {
        let argv = std::iter::once("starter").chain(args.iter().copied());
        match parse_from(argv).unwrap() {
            Command::Start(options) => options,
            Command::ShowVersion => panic!("expected start command"),
        }
    }

    #[test]
    fn defaults() {
        let options = start(&[]);
        assert_eq!(options.config.port, DEFAULT_STARTER_PORT);
        assert_eq!(options.config.agency_size, DEFAULT_AGENCY_SIZE);
        assert_eq!(options.config.mode, ServiceMode::Cluster);
        assert!(!options.config.start_local_slaves);
        assert!(options.config.own_address.is_empty());
        assert_eq!(options.executable, PathBuf::from("arangod"));
    }

    #[test]
    fn local_cluster() {
        let options = start(&[
            "--starter.local",
            "--starter.data-dir",
            "/tmp/db",
            "--starter.port",
            "9000",
            "--server.args",
            "--log.level 'startup=trace'",
        ]);
        assert!(options.config.start_local_slaves);
        assert_eq!(options.config.data_dir, PathBuf::from("/tmp/db"));
        assert_eq!(options.config.port, 9000);
        assert_eq!(options.server_args, vec!["--log.level", "startup=trace"]);
    }

    #[test]
    fn join_and_single_mode() {
        let options = start(&["--starter.join", "10.0.0.1:8528", "--starter.mode", "single"]);
        assert_eq!(options.config.master_address.as_deref(), Some("10.0.0.1:8528"));
        assert_eq!(options.config.mode, ServiceMode::Single);
    }

    #[test]
    fn version_flag() {
        assert!(matches!(
            parse_from(["starter", "--version"]).unwrap(),
            Command::ShowVersion
        ));
    }

    #[test]
    fn conflicting_flags_are_rejected() {
        assert!(parse_from(["starter", "--starter.local", "--starter.mode", "single"]).is_err());
        assert!(parse_from(["starter", "--starter.local", "--starter.join", "h:1"]).is_err());
        assert!(parse_from(["starter", "--cluster.agency-size", "0"]).is_err());
        assert!(parse_from(["starter", "--server.args", "'unterminated"]).is_err());
    }
}
