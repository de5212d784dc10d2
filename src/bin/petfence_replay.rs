//! petfence replay tool
//!
//! Drives a monitor from a JSON-lines script and prints every confirmed
//! transition. Alarm flags live in a durable store under `--data-dir`, so a
//! second run resumes reminders left armed by the first.
//!
//! Script lines:
//! ```text
//! {"op":"zone","entity":"rex","lat":0.0,"lng":0.0,"radius":100.0}
//! {"op":"start","entity":"rex"}
//! {"op":"position","entity":"rex","lat":0.0,"lng":0.01}
//! {"op":"wait","ms":35000}
//! {"op":"disarm","entity":"rex"}
//! {"op":"stop","entity":"rex"}
//! ```

use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use petfence::storage::{open_alarm_store, InMemoryStores};
use petfence::{Coordinate, EntityId, FenceResult, MonitorConfig, MonitorService, TracingSink};

struct Args {
    config: Option<PathBuf>,
    data_dir: PathBuf,
    script: Option<PathBuf>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: None,
            data_dir: PathBuf::from("./petfence-data"),
            script: None,
        }
    }
}

fn value_of(args: &[String], i: usize, flag: &str) -> PathBuf {
    match args.get(i + 1) {
        Some(value) => PathBuf::from(value),
        None => {
            eprintln!("error: {flag} requires a value");
            std::process::exit(1);
        }
    }
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                parsed.config = Some(value_of(&args, i, "--config"));
                i += 2;
            }
            "--data-dir" | "-d" => {
                parsed.data_dir = value_of(&args, i, "--data-dir");
                i += 2;
            }
            "--script" | "-s" => {
                parsed.script = Some(value_of(&args, i, "--script"));
                i += 2;
            }
            "--help" | "-h" => {
                println!("petfence-replay - replay a position script through the monitor");
                println!();
                println!("USAGE:");
                println!("    petfence-replay [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -c, --config <FILE>       JSON monitor configuration");
                println!("    -d, --data-dir <DIR>      Alarm store directory [default: ./petfence-data]");
                println!("    -s, --script <FILE>       JSON-lines script [default: stdin]");
                println!("    -h, --help                Print help information");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    parsed
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Command {
    Zone {
        entity: String,
        lat: f64,
        lng: f64,
        radius: f64,
    },
    Position {
        entity: String,
        lat: f64,
        lng: f64,
    },
    Start {
        entity: String,
    },
    Stop {
        entity: String,
    },
    Disarm {
        entity: String,
    },
    Wait {
        ms: u64,
    },
}

async fn apply(service: &MonitorService, command: Command) -> FenceResult<()> {
    match command {
        Command::Zone {
            entity,
            lat,
            lng,
            radius,
        } => {
            let id = EntityId::new(entity)?;
            service.set_zone(&id, Coordinate::validated(lat, lng)?, radius).await
        }
        Command::Position { entity, lat, lng } => {
            let id = EntityId::new(entity)?;
            if !service.report_position(&id, lat, lng, Utc::now())? {
                warn!(entity_id = %id, "sample ignored as stale");
            }
            Ok(())
        }
        Command::Start { entity } => service.start_monitoring(&EntityId::new(entity)?).await,
        Command::Stop { entity } => service.stop_monitoring(&EntityId::new(entity)?).await,
        Command::Disarm { entity } => service.disarm(&EntityId::new(entity)?).await,
        Command::Wait { ms } => {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<MonitorConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(MonitorConfig::from_json_str(&fs::read_to_string(path)?)?),
        None => Ok(MonitorConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args();
    let config = load_config(args.config.as_ref())?;
    let alarms = Arc::new(open_alarm_store(&args.data_dir, None)?);
    let stores = InMemoryStores::default();

    let service = MonitorService::builder()
        .config(config)
        .in_memory(&stores)
        .alarm_store(alarms)
        .notifier(Arc::new(TracingSink))
        .build()?;

    let resumed = service.resume_alarms().await?;
    if !resumed.is_empty() {
        info!(count = resumed.len(), "resumed armed alarms from previous run");
    }

    let mut events = service.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.try_recv() {
                Ok(Some(event)) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "cannot encode event"),
                },
                Ok(None) => tokio::time::sleep(Duration::from_millis(20)).await,
                Err(_) => break,
            }
        }
    });

    let reader: Box<dyn BufRead> = match &args.script {
        Some(path) => Box::new(BufReader::new(fs::File::open(path)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };

    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let command: Command = match serde_json::from_str(trimmed) {
            Ok(command) => command,
            Err(e) => {
                warn!(line = n + 1, error = %e, "skipping malformed script line");
                continue;
            }
        };
        if let Err(e) = apply(&service, command).await {
            warn!(line = n + 1, error = %e, "command failed");
        }
    }

    // Let the last wake-ups settle before tearing down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    service.shutdown().await;
    printer.abort();
    Ok(())
}
