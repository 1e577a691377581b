//! Command-line interface parsing for stockroom
//!
//! Parses flags with clap (falling back to environment variables) and turns
//! them into a validated [`RunConfig`] before any network activity happens.

use std::num::NonZeroUsize;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;

use crate::config::{CacheConfig, DeliveryConfig, DEFAULT_DELIVERY_URL};
use crate::delivery::{DeliveryMethod, DeliveryRequest};

/// Error types for CLI argument parsing
#[derive(Debug, Error)]
pub enum CliError {
    /// A `--query` or `--field` argument is not of the form `key=value`
    #[error("Invalid key=value pair: '{0}'")]
    InvalidPair(String),

    /// The HTTP method is not recognized
    #[error("Invalid method: '{0}'. Valid methods: GET, POST, PUT, PATCH, DELETE")]
    InvalidMethod(String),
}

/// stockroom - cached proxy for the delivery-company API
#[derive(Parser, Debug)]
#[command(name = "stockroom")]
#[command(about = "Cached proxy for the delivery-company API")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Settings shared by every subcommand
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Base URL of the delivery API
    #[arg(long, env = "DELIVERY_API_URL", default_value = DEFAULT_DELIVERY_URL, global = true)]
    pub base_url: String,

    /// Bearer token for the delivery API
    #[arg(long, env = "DELIVERY_API_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// How long cached reads stay fresh, in milliseconds
    #[arg(long, env = "STOCKROOM_CACHE_TTL_MS", default_value_t = 120_000, global = true)]
    pub ttl_ms: u64,

    /// Maximum number of cached responses (unbounded when omitted)
    #[arg(long, env = "STOCKROOM_CACHE_MAX_ENTRIES", global = true)]
    pub max_entries: Option<NonZeroUsize>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Call a delivery API endpoint and print the reshaped JSON
    ///
    /// Examples:
    ///   stockroom call parcels --query page=2
    ///   stockroom call parcels --method post --field tracking=YAL-1
    ///   stockroom call wilayas --repeat 3      # later calls served from cache
    Call {
        /// Endpoint name, appended to the base URL
        endpoint: String,

        /// HTTP method
        #[arg(long, short = 'X', default_value = "GET")]
        method: String,

        /// Query parameter as key=value (repeatable)
        #[arg(long = "query", short = 'q', value_name = "KEY=VALUE")]
        query: Vec<String>,

        /// Form field as key=value (repeatable)
        #[arg(long = "field", short = 'f', value_name = "KEY=VALUE")]
        field: Vec<String>,

        /// Issue the same call this many times through the cache (at least 1)
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        repeat: u32,
    },
}

/// Validated settings for one run of the binary
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub cache: CacheConfig,
    pub delivery: DeliveryConfig,
    pub request: DeliveryRequest,
    pub repeat: u32,
}

/// Splits a `key=value` argument
///
/// The key must be non-empty; the value may be empty or contain further `=`.
pub fn parse_pair(s: &str) -> Result<(String, String), CliError> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(CliError::InvalidPair(s.to_string())),
    }
}

/// Parses a method argument into a [`DeliveryMethod`]
pub fn parse_method_arg(s: &str) -> Result<DeliveryMethod, CliError> {
    DeliveryMethod::parse(s).ok_or_else(|| CliError::InvalidMethod(s.to_string()))
}

impl RunConfig {
    /// Creates a RunConfig from parsed CLI arguments.
    ///
    /// # Returns
    /// * `Ok(RunConfig)` with cache, client and request settings
    /// * `Err(CliError)` if a pair or the method is malformed
    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        let cache = CacheConfig {
            ttl: Duration::from_millis(cli.global.ttl_ms),
            max_entries: cli.global.max_entries,
        };
        let delivery = DeliveryConfig {
            base_url: cli.global.base_url.clone(),
            token: cli.global.token.clone(),
        };

        match &cli.command {
            Command::Call {
                endpoint,
                method,
                query,
                field,
                repeat,
            } => {
                let mut request = DeliveryRequest::new(endpoint.clone(), parse_method_arg(method)?);
                for pair in query {
                    let (key, value) = parse_pair(pair)?;
                    request = request.query(key, value);
                }
                for pair in field {
                    let (key, value) = parse_pair(pair)?;
                    request = request.field(key, value);
                }

                Ok(RunConfig {
                    cache,
                    delivery,
                    request,
                    repeat: *repeat,
                })
            }
        }
    }
}
