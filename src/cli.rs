// jobsentry: command-line interface

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Launches and monitors a child process in addition to sampling.
    Starter,
    /// Standby service participating only in failover and sampling.
    Service,
}

#[derive(Debug, Parser)]
#[command(name = "jobsentry", about = "Per-host job observability agent")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    pub config: String,

    /// Operating mode.
    #[arg(short, long, value_enum, default_value = "starter")]
    pub mode: Mode,

    /// Executable to launch when `--mode starter`.
    #[arg(short, long)]
    pub exec: Option<String>,

    /// Arguments passed to the launched executable.
    #[arg(short, long, num_args = 0.., value_delimiter = ' ')]
    pub args: Vec<String>,
}
