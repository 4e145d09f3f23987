use clap::{Parser, Subcommand};
use plcwire_common::{load_settings, CommonError, Logger, LoggingSettings};
use plcwire_driver_s7::{
    parse_tag, DriverError, EventCategory, EventDetails, S7Connection, S7ConnectionConfig,
    S7Event, S7Tag, SessionEvent, SubscriptionRequest,
};
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};
use thiserror::Error;
use tokio::sync::mpsc;

/// Read tags from and watch events of a Siemens S7 CPU.
#[derive(Parser)]
#[command(name = "plcwire")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "S7 driver client", long_about = None)]
struct Cli {
    /// Settings file (TOML). Values may be overridden with `PLCWIRE__...` variables.
    #[arg(short, long, env = "PLCWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `logging.level`
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read tags once and print the results
    Read {
        /// Tags such as `%DB1.DBW0:INT`; defaults to `tags` from the settings
        tags: Vec<String>,
    },
    /// Print the negotiated session parameters
    Info,
    /// Print device events until Ctrl-C
    Watch {
        /// Comma separated categories: MODE, SYS, USR, ALM
        #[arg(long, value_delimiter = ',', default_value = "MODE")]
        events: Vec<EventCategory>,
        /// Tags delivered by a cyclic job
        #[arg(long, value_delimiter = ',')]
        cyclic: Vec<String>,
        /// Cyclic period in milliseconds
        #[arg(long, default_value_t = 1000)]
        period_ms: u64,
    },
}

#[derive(Debug, Deserialize)]
struct Settings {
    #[serde(default)]
    logging: LoggingSettings,
    #[serde(default)]
    connection: S7ConnectionConfig,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Common(#[from] CommonError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Usage(String),
}

type CliResult<T> = Result<T, CliError>;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();
    let mut settings: Settings = load_settings(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        settings.logging.level = level;
    }
    let mut logger = Logger::from_settings(&settings.logging)?;
    logger.initialize()?;

    let conn = S7Connection::new(settings.connection)?;
    conn.connect().await?;
    let outcome = match cli.command {
        Command::Read { tags } => {
            let tags = if tags.is_empty() { settings.tags } else { tags };
            read(&conn, &tags).await
        }
        Command::Info => info(&conn),
        Command::Watch {
            events,
            cyclic,
            period_ms,
        } => watch(&conn, events, &cyclic, Duration::from_millis(period_ms)).await,
    };
    conn.disconnect().await;
    outcome
}

fn parse_tags(specs: &[String]) -> CliResult<Vec<S7Tag>> {
    specs
        .iter()
        .map(|s| parse_tag(s).map_err(|e| CliError::Usage(format!("{s}: {e}"))))
        .collect()
}

async fn read(conn: &S7Connection, specs: &[String]) -> CliResult<()> {
    if specs.is_empty() {
        return Err(CliError::Usage("no tags given".into()));
    }
    let tags = parse_tags(specs)?;
    for r in conn.read(&tags).await? {
        match r.value {
            Some(v) => println!("{}\t{:?}\t{v:?}", r.tag, r.status),
            None => println!("{}\t{:?}", r.tag, r.status),
        }
    }
    Ok(())
}

fn info(conn: &S7Connection) -> CliResult<()> {
    let params = conn.session_params().ok_or(DriverError::NotConnected)?;
    println!("{}", serde_json::to_string_pretty(&params)?);
    Ok(())
}

fn print_event(ev: &S7Event) -> CliResult<()> {
    println!("{}", serde_json::to_string(ev)?);
    if let EventDetails::Cyclic(data) = &ev.details {
        for item in &data.items {
            println!(
                "  {}\t{:?}",
                item.tag.as_deref().unwrap_or("?"),
                item.value
            );
        }
    }
    Ok(())
}

async fn watch(
    conn: &S7Connection,
    events: Vec<EventCategory>,
    cyclic: &[String],
    period: Duration,
) -> CliResult<()> {
    let mut requests: Vec<SubscriptionRequest> = events
        .iter()
        .filter(|c| **c != EventCategory::Cyclic)
        .map(|c| SubscriptionRequest::Event(*c))
        .collect();
    if !cyclic.is_empty() {
        requests.push(SubscriptionRequest::Cyclic {
            tags: parse_tags(cyclic)?,
            period,
        });
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut categories: Vec<EventCategory> = Vec::new();
    for r in &requests {
        let category = match r {
            SubscriptionRequest::Event(c) => *c,
            SubscriptionRequest::Cyclic { .. } => EventCategory::Cyclic,
        };
        if !categories.contains(&category) {
            categories.push(category);
        }
    }
    for category in categories {
        let tx = tx.clone();
        conn.register(category, move |ev| {
            let _ = tx.send(ev.clone());
        })?;
    }
    let subscriptions = conn.subscribe(&requests).await?;
    tracing::info!(count = subscriptions.len(), "watching, Ctrl-C to stop");

    let mut lifecycle = conn.subscribe_connection_events();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(ev) = rx.recv() => print_event(&ev)?,
            Ok(ev) = lifecycle.recv() => match ev {
                SessionEvent::Disconnected => {
                    tracing::warn!("connection lost");
                    break;
                }
                other => tracing::info!(event = ?other, "connection event"),
            },
        }
    }
    if conn.is_connected() {
        conn.unsubscribe(&subscriptions).await?;
    }
    Ok(())
}
