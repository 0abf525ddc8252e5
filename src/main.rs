//! db-bridge - diagnostic CLI.
//!
//! Opens the aliases configured through `DB_<ALIAS>_*` environment keys and
//! pings them, runs a query, prints pool statistics or runs the validators.

use db_bridge::config::{CliExportFormat, Command, Config, EndpointConfig};
use db_bridge::result::{ExportFormat, ExportOptions, ResultExporter};
use db_bridge::validation::QueryValidator;
use db_bridge::{DatabaseRegistry, QueryParam};
use std::collections::HashMap;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn export_format(format: CliExportFormat) -> ExportFormat {
    match format {
        CliExportFormat::Csv => ExportFormat::Csv,
        CliExportFormat::Json => ExportFormat::Json,
        CliExportFormat::Xml => ExportFormat::Xml,
        CliExportFormat::Excel => ExportFormat::Excel,
        CliExportFormat::Text => ExportFormat::Text,
    }
}

/// CLI parameters are JSON literals; anything else is a plain string.
fn parse_param(raw: &str) -> QueryParam {
    serde_json::from_str(raw)
        .map(QueryParam::from_json)
        .unwrap_or_else(|_| QueryParam::String(raw.to_string()))
}

async fn open_aliases(registry: &DatabaseRegistry, wanted: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let vars: HashMap<String, String> = std::env::vars().collect();
    let aliases = if wanted.is_empty() {
        EndpointConfig::aliases_in(&vars)
    } else {
        wanted.to_vec()
    };
    if aliases.is_empty() {
        return Err("no aliases configured; set DB_<ALIAS>_TYPE and DB_<ALIAS>_HOST (or DB_<ALIAS>_URL)".into());
    }

    for alias in aliases {
        let config = EndpointConfig::from_env_map(&alias, &vars)?;
        registry.open(config).await?;
    }
    Ok(())
}

async fn run(config: Config, registry: &DatabaseRegistry) -> Result<(), Box<dyn std::error::Error>> {
    match config.command {
        Command::Ping { aliases } => {
            open_aliases(registry, &aliases).await?;
            let mut failed = 0;
            for alias in registry.aliases().await {
                match registry.ping(&alias).await {
                    Ok(latency_ms) => println!("{}: ok ({} ms)", alias, latency_ms),
                    Err(e) => {
                        failed += 1;
                        println!("{}: FAILED {}", alias, e);
                    }
                }
            }
            if failed > 0 {
                return Err(format!("{} alias(es) failed", failed).into());
            }
        }
        Command::Query {
            alias,
            sql,
            params,
            output,
            format,
        } => {
            open_aliases(registry, std::slice::from_ref(&alias)).await?;
            let params: Vec<QueryParam> = params.iter().map(|p| parse_param(p)).collect();
            let result = registry.query(&alias, &sql, &params).await?;

            match output {
                Some(path) => {
                    let options = ExportOptions {
                        format: format.map(export_format),
                        ..Default::default()
                    };
                    let summary = ResultExporter::with_options(&result, options).write(&path)?;
                    println!("{}", summary);
                }
                None => {
                    let exporter = ResultExporter::new(&result);
                    match format.map(export_format) {
                        Some(ExportFormat::Text) | None => print!("{}", exporter.to_text()),
                        Some(ExportFormat::Json) => println!("{}", exporter.to_json()?),
                        Some(ExportFormat::Excel) => {
                            return Err("spreadsheet output needs --output <file.xlsx>".into());
                        }
                        Some(other) => print!("{}", String::from_utf8_lossy(&exporter.render(other)?)),
                    }
                }
            }
        }
        Command::Stats { alias } => {
            open_aliases(registry, std::slice::from_ref(&alias)).await?;
            let stats = registry.stats(&alias).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Validate {
            sql,
            engine,
            param_count,
            max_complexity,
        } => {
            let report = QueryValidator::validate_all(&sql, engine, param_count, max_complexity);
            for result in &report.results {
                let mark = if result.passed { "PASS" } else { "FAIL" };
                println!("[{}] {:<10} {}", mark, result.rule, result.message);
            }
            if !report.passed {
                return Err("validation failed".into());
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse_args();
    init_tracing(&config);

    info!("Starting db-bridge v{}", env!("CARGO_PKG_VERSION"));

    let registry = DatabaseRegistry::new();
    let result = run(config, &registry).await;
    registry.shutdown().await;

    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result
}
