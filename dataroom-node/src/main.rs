use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dataroom_core::{ComparisonOp, DatasetId, FilterPredicate};
use dataroom_exec::ExecuteError;
use dataroom_mpc::QueryType;
use dataroom_node::config::{load_config, ConfigFormat, LogFormat};
use dataroom_node::service::{DataRoomNode, RoomRequest};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "dataroom-node",
    version,
    about = "Reference node for governed aggregate queries and multi-party data rooms"
)]
struct Cli {
    /// Path to configuration file (TOML or YAML).
    #[arg(long, env = "DATAROOM_NODE_CONFIG", default_value = "configs/dataroom-node.toml")]
    config: PathBuf,
    /// Explicit configuration format override.
    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,
    /// Overrides the configured log format.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check a query against the safety rules without running it.
    Validate {
        #[arg(long)]
        sql: String,
    },
    /// Submit and execute a query against one dataset.
    Run {
        #[arg(long)]
        sql: String,
        #[arg(long)]
        dataset: String,
        #[arg(long, default_value = "dp_backend")]
        backend: String,
        #[arg(long)]
        delta: Option<f64>,
    },
    /// Run a multi-party aggregate across datasets of different organizations.
    Mpc {
        #[arg(long, value_parser = parse_query_type)]
        query_type: QueryType,
        #[arg(long)]
        column: String,
        /// Comma separated dataset ids, one per organization.
        #[arg(long, value_delimiter = ',', required = true)]
        datasets: Vec<String>,
        /// Equality filters as `column=value`.
        #[arg(long = "where", value_parser = parse_filter)]
        filters: Vec<FilterPredicate>,
        #[arg(long, default_value = "cli room")]
        name: String,
        /// Skip the Laplace layer on the reconstructed total.
        #[arg(long)]
        no_dp: bool,
    },
    /// List backends and dataset budgets.
    Catalog,
}

fn parse_query_type(value: &str) -> Result<QueryType, String> {
    QueryType::from_name(value).ok_or_else(|| format!("unknown query type '{value}' (sum, count, avg)"))
}

fn parse_filter(value: &str) -> Result<FilterPredicate, String> {
    let (column, literal) = value
        .split_once('=')
        .ok_or_else(|| format!("expected column=value, got '{value}'"))?;
    let literal = literal.trim();
    let predicate = match literal.parse::<f64>() {
        Ok(number) => FilterPredicate::new(column.trim(), ComparisonOp::Eq, number),
        Err(_) => FilterPredicate::new(column.trim(), ComparisonOp::Eq, literal),
    };
    Ok(predicate)
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config, cli.config_format)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(
        &config.node.log_level,
        cli.log_format.unwrap_or(config.node.log_format),
    );
    let node = DataRoomNode::from_config(&config)?;

    match cli.command {
        Command::Validate { sql } => {
            let report = node.validate_sql(&sql);
            print_json(&report)?;
            if !report.valid {
                bail!("query rejected");
            }
        }
        Command::Run {
            sql,
            dataset,
            backend,
            delta,
        } => match node.run_query(&sql, DatasetId::new(dataset), &backend, delta).await {
            Ok(run) => print_json(&run)?,
            Err(ExecuteError::Run(err)) => {
                print_json(err.run())?;
                bail!(err);
            }
            Err(err) => bail!(err),
        },
        Command::Mpc {
            query_type,
            column,
            datasets,
            filters,
            name,
            no_dp,
        } => {
            let request = RoomRequest {
                name,
                query_type,
                column,
                datasets: datasets.into_iter().map(DatasetId::new).collect(),
                filters,
                apply_dp_noise: !no_dp,
            };
            let mut room = node.open_room(&request)?;
            let outcome = node.execute_room(&mut room).await;
            print_json(&room)?;
            outcome?;
        }
        Command::Catalog => {
            let backends: Vec<_> = node.catalog().descriptors().collect();
            let budgets: Vec<_> = node
                .budgets()
                .into_iter()
                .map(|(dataset, budget)| {
                    serde_json::json!({
                        "dataset": dataset,
                        "total": budget.total,
                        "consumed": budget.consumed,
                        "reserved": budget.reserved,
                        "remaining": budget.remaining(),
                    })
                })
                .collect();
            print_json(&serde_json::json!({ "backends": backends, "budgets": budgets }))?;
        }
    }
    Ok(())
}
