//! Command line interface for the `arciera` binary.

use std::net::IpAddr;

use clap::{Parser, ValueEnum};

/// Maximum level of emitted log records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Everything, including per-fragment assembler traces.
    Trace,
    /// Connection lifecycle and packet summaries.
    Debug,
    /// Startup and plugin messages.
    #[default]
    Info,
    /// Recoverable failures only.
    Warn,
    /// Failures only.
    Error,
}

/// Command line arguments for the `arciera` binary.
#[derive(Debug, Parser)]
#[command(name = "arciera", version, about = "Event-driven server for VarInt-framed packets")]
pub struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// TCP port to listen on.
    #[arg(short, long, default_value_t = 25565)]
    pub port: u16,

    /// Number of accept workers; defaults to the available parallelism.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum log level.
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Discard partial packets that receive no data for this many seconds.
    #[arg(long, value_name = "SECS")]
    pub fragment_idle_secs: Option<u64>,
}
