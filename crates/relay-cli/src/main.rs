//! Record store inspection CLI.
//!
//! Provides the `relay-store` binary for debugging persisted caches:
//! `normalize` merges a response payload into a (possibly empty) source,
//! `lookup` reads a request's fragment out of a source, and `check` reports
//! whether a source holds everything a request selects.
//!
//! Every subcommand takes a compiled request (JSON) and builds the same
//! [`Store`] an application would, configured from `--config` and the
//! `RELAY_GC_*` environment variables. Logging goes to stderr and is
//! filtered by `RELAY_LOG` (default `warn`).

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use relay_core::{create_operation_descriptor, ConcreteRequest, GraphQLResponse, OperationDescriptor, Variables};
use relay_store::{OperationAvailability, RecordSource, Store, StoreConfig};

/// Normalized record store tools.
#[derive(Parser)]
#[command(name = "relay-store", about = "Normalized GraphQL record store tools")]
struct Cli {
    /// Store configuration file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Normalize a response and print the resulting record source.
    Normalize {
        #[command(flatten)]
        input: RequestInput,

        /// Response payload file (`{"data": ...}`).
        #[arg(short = 'p', long)]
        response: PathBuf,

        /// Existing record source to merge into (default: empty).
        #[arg(short, long)]
        source: Option<PathBuf>,
    },
    /// Read the request's fragment from a record source.
    Lookup {
        #[command(flatten)]
        input: RequestInput,

        /// Record source file.
        #[arg(short, long)]
        source: PathBuf,
    },
    /// Report whether a record source holds all the request's data.
    Check {
        #[command(flatten)]
        input: RequestInput,

        /// Record source file.
        #[arg(short, long)]
        source: PathBuf,
    },
}

#[derive(clap::Args)]
struct RequestInput {
    /// Compiled request file.
    #[arg(short, long)]
    request: PathBuf,

    /// Operation variables as inline JSON.
    #[arg(short, long, default_value = "{}")]
    variables: String,
}

/// A failed subcommand: the message for stderr and the exit code.
struct Failure {
    message: String,
    code: i32,
}

impl Failure {
    fn input(message: impl Into<String>) -> Self {
        Failure {
            message: message.into(),
            code: 1,
        }
    }

    fn io(path: &Path, err: std::io::Error) -> Self {
        Failure {
            message: format!("failed to read '{}': {}", path.display(), err),
            code: 3,
        }
    }
}

fn main() {
    let filter = EnvFilter::try_from_env("RELAY_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Normalize {
            input,
            response,
            source,
        } => run_normalize(config, &input, &response, source.as_deref()),
        Commands::Lookup { input, source } => run_lookup(config, &input, &source),
        Commands::Check { input, source } => run_check(config, &input, &source),
    });

    match result {
        Ok((output, code)) => {
            println!("{}", serde_json::to_string_pretty(&output).unwrap_or_else(|_| output.to_string()));
            process::exit(code);
        }
        Err(failure) => {
            eprintln!("Error: {}", failure.message);
            process::exit(failure.code);
        }
    }
}

/// Exit codes: 0 = success, 1 = invalid input, 2 = data missing,
/// 3 = I/O error.
type Outcome = Result<(Value, i32), Failure>;

fn run_normalize(config: StoreConfig, input: &RequestInput, response: &Path, source: Option<&Path>) -> Outcome {
    let operation = load_operation(input)?;
    let response: GraphQLResponse = read_json(response)?;
    let source = match source {
        Some(path) => read_json(path)?,
        None => RecordSource::new(),
    };
    let options = config.normalization_options();
    let store = Store::new(source, config);

    let result = relay_store::normalize(&operation.root, &response, &options)
        .map_err(|err| Failure::input(format!("normalization failed: {err}")))?;
    for error in &result.errors {
        tracing::warn!(path = error.path(), error = %error, "payload does not match the request");
    }
    store
        .publish(&result.source, &[])
        .map_err(|err| Failure::input(format!("publish failed: {err}")))?;
    store.notify(Some(&operation), false);

    let output = store
        .to_json()
        .map_err(|err| Failure::input(format!("failed to serialize the source: {err}")))?;
    Ok((output, 0))
}

fn run_lookup(config: StoreConfig, input: &RequestInput, source: &Path) -> Outcome {
    let operation = load_operation(input)?;
    let store = Store::new(read_json(source)?, config);
    let snapshot = store.lookup(&operation.fragment);
    let code = if snapshot.is_missing_data { 2 } else { 0 };
    let output = json!({
        "data": snapshot.data,
        "isMissingData": snapshot.is_missing_data,
        "seenRecords": snapshot.seen_records,
    });
    Ok((output, code))
}

fn run_check(config: StoreConfig, input: &RequestInput, source: &Path) -> Outcome {
    let operation = load_operation(input)?;
    let store = Store::new(read_json(source)?, config);
    let output = match store.check(&operation) {
        OperationAvailability::Available { fetch_time } => {
            json!({"status": "available", "fetchTime": fetch_time})
        }
        OperationAvailability::Stale => json!({"status": "stale"}),
        OperationAvailability::Missing => json!({"status": "missing"}),
    };
    let code = if output["status"] == "missing" { 2 } else { 0 };
    Ok((output, code))
}

fn load_operation(input: &RequestInput) -> Result<OperationDescriptor, Failure> {
    let request: ConcreteRequest = read_json(&input.request)?;
    let variables: Variables = serde_json::from_str(&input.variables)
        .map_err(|err| Failure::input(format!("variables must be a JSON object: {err}")))?;
    Ok(create_operation_descriptor(Arc::new(request), &variables, None))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Failure> {
    let text = std::fs::read_to_string(path).map_err(|err| Failure::io(path, err))?;
    serde_json::from_str(&text).map_err(|err| Failure::input(format!("invalid JSON in '{}': {}", path.display(), err)))
}

/// Loads the store configuration: defaults, then the config file, then
/// environment overrides.
fn load_config(path: Option<&Path>) -> Result<StoreConfig, Failure> {
    let config = match path {
        Some(path) => read_json(path)?,
        None => StoreConfig::default(),
    };
    apply_env_overrides(config, |name| std::env::var(name).ok()).map_err(Failure::input)
}

fn apply_env_overrides(
    mut config: StoreConfig,
    var: impl Fn(&str) -> Option<String>,
) -> Result<StoreConfig, String> {
    let parse = |name: &str| -> Result<Option<usize>, String> {
        var(name)
            .map(|value| {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| format!("{name} must be a non-negative integer, got '{value}'"))
            })
            .transpose()
    };
    if let Some(size) = parse("RELAY_GC_RELEASE_BUFFER_SIZE")? {
        config.gc_release_buffer_size = size;
    }
    if let Some(budget) = parse("RELAY_GC_SLICE_BUDGET")? {
        config.gc_slice_budget = budget.max(1);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let config = apply_env_overrides(
            StoreConfig::default(),
            vars(&[("RELAY_GC_RELEASE_BUFFER_SIZE", "0"), ("RELAY_GC_SLICE_BUDGET", "32")]),
        )
        .unwrap();
        assert_eq!(config.gc_release_buffer_size, 0);
        assert_eq!(config.gc_slice_budget, 32);
    }

    #[test]
    fn missing_env_keeps_config() {
        let config = apply_env_overrides(StoreConfig::default(), vars(&[])).unwrap();
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn invalid_env_value_is_rejected() {
        let err = apply_env_overrides(StoreConfig::default(), vars(&[("RELAY_GC_SLICE_BUDGET", "lots")])).unwrap_err();
        assert!(err.contains("RELAY_GC_SLICE_BUDGET"));
    }

    #[test]
    fn cli_parses_lookup() {
        let cli = Cli::try_parse_from([
            "relay-store",
            "lookup",
            "--request",
            "q.json",
            "--source",
            "s.json",
            "--variables",
            r#"{"id":"1"}"#,
        ])
        .unwrap();
        match cli.command {
            Commands::Lookup { input, source } => {
                assert_eq!(input.request, PathBuf::from("q.json"));
                assert_eq!(source, PathBuf::from("s.json"));
                assert_eq!(input.variables, r#"{"id":"1"}"#);
            }
            _ => panic!("expected lookup"),
        }
    }
}
