//! Conditions database inspector
//!
//! Reads a service configuration and runs one read-only query against the
//! configured database.
//!
//! Usage:
//!   conddb-inspect --config <file> ls <path>
//!   conddb-inspect --config <file> get <path> <time> [channel]
//!   conddb-inspect --config <file> iovs <path> <since> <until> [channel]
//!   conddb-inspect --config <file> tags
//!   conddb-inspect --config <file> health
//!
//! Times are validity keys (nanoseconds); `max` stands for the end of time.
//! Log output is controlled with `RUST_LOG`.

use conddb_core::{ChannelId, CondDbConfig, Iov, ValidityKey};
use conddb_storage::{CondDbAccessSvc, CondDbBackend, CondDbInfo, CondDbReader};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: conddb-inspect --config <file> <ls|get|iovs|tags|health> [args...]";

type CliResult<T> = Result<T, Box<dyn Error>>;

fn main() -> ExitCode {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("conddb_storage=info,conddb_core=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("conddb-inspect: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &[String]) -> CliResult<()> {
    let (config_path, command) = match args {
        [flag, path, rest @ ..] if flag == "--config" && !rest.is_empty() => {
            (PathBuf::from(path), rest)
        }
        _ => return Err(USAGE.into()),
    };

    let config = CondDbConfig::load(&config_path)?;
    let svc = CondDbAccessSvc::from_config(config)?;
    svc.initialize()?;
    let outcome = execute(&svc, command);
    svc.finalize()?;
    outcome
}

fn execute(svc: &CondDbAccessSvc<Box<dyn CondDbBackend>>, command: &[String]) -> CliResult<()> {
    let (name, rest) = command.split_first().ok_or(USAGE)?;
    match (name.as_str(), rest) {
        ("ls", [path]) => {
            let children = svc.child_nodes(path)?;
            for name in &children.containers {
                println!("{}/", name);
            }
            for name in &children.leaves {
                println!("{}", name);
            }
        }
        ("get", [path, when, channel @ ..]) => {
            let data = svc.get_object(path, parse_key(when)?, parse_channel(channel)?)?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        ("iovs", [path, since, until, channel @ ..]) => {
            let window = Iov::new(parse_key(since)?, parse_key(until)?)?;
            for iov in svc.get_iovs(path, &window, parse_channel(channel)?)? {
                println!("{}", iov);
            }
        }
        ("tags", []) => {
            let tags = svc
                .connection()
                .with_connection(|backend| backend.all_tags())?;
            for tag in tags {
                println!("{}", tag);
            }
        }
        ("health", []) => {
            println!("{}", serde_json::to_string_pretty(&svc.health())?);
        }
        _ => return Err(USAGE.into()),
    }
    Ok(())
}

fn parse_key(raw: &str) -> CliResult<ValidityKey> {
    if raw.eq_ignore_ascii_case("max") {
        return Ok(ValidityKey::MAX);
    }
    Ok(ValidityKey::new(raw.parse()?))
}

fn parse_channel(raw: &[String]) -> CliResult<ChannelId> {
    match raw {
        [] => Ok(ChannelId::default()),
        [id] => Ok(ChannelId::new(id.parse()?)),
        _ => Err(USAGE.into()),
    }
}
