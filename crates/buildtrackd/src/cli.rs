use std::ffi::OsStr;
use std::path::PathBuf;

use buildtrack_core::{Channel, ObjectId};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: human, json"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ReportArgs {
    #[arg(long = "object", help = "Construction object id")]
    pub object_id: ObjectId,

    #[arg(
        long,
        default_value = "contractor",
        value_parser = parse_channel,
        help = "Value channel: regulator, contractor, or ai"
    )]
    pub channel: Channel,

    #[arg(
        long,
        value_parser = parse_date,
        help = "Report date (YYYY-MM-DD); defaults to today"
    )]
    pub as_of: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct StatusArgs {
    #[arg(long = "object", help = "Construction object id")]
    pub object_id: ObjectId,

    #[arg(
        long,
        value_parser = parse_date,
        help = "Status date (YYYY-MM-DD); defaults to today"
    )]
    pub as_of: Option<NaiveDate>,

    #[arg(
        long,
        help = "Days before plan finish that a pending control point turns yellow"
    )]
    pub deadline_window_days: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ReconcileArgs {
    #[arg(
        long = "object",
        value_delimiter = ',',
        help = "Object ids to reconcile; all objects with snapshots or control points when omitted"
    )]
    pub object_ids: Vec<ObjectId>,

    #[arg(long, default_value_t = 1, help = "Worker threads (clamped to at least 1)")]
    pub jobs: usize,

    #[arg(
        long,
        value_parser = parse_date,
        help = "Reconciliation date (YYYY-MM-DD); defaults to today"
    )]
    pub as_of: Option<NaiveDate>,

    #[arg(
        long,
        help = "Days before plan finish that a pending control point turns yellow"
    )]
    pub deadline_window_days: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct SyncArgs {
    #[arg(long = "object", help = "Construction object id")]
    pub object_id: ObjectId,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Print per-milestone progress view models as JSON
    Report(ReportArgs),
    /// Print control-point status, delay and color as JSON
    Status(StatusArgs),
    /// Run the full reconciliation for one or more objects
    Reconcile(ReconcileArgs),
    /// Mirror control points into the implementation timeline
    Sync(SyncArgs),
    /// Write the default config and create the database
    Init,
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Construction progress reconciliation")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Workspace root holding .buildtrack/"
    )]
    pub workspace: PathBuf,

    #[arg(
        long,
        global = true,
        default_value = "human",
        value_parser = parse_log_format,
        help = "Log format: human or json"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

pub fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}

fn parse_channel(value: &str) -> Result<Channel, String> {
    value.parse()
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|err| format!("invalid date '{value}', expected YYYY-MM-DD: {err}"))
}
