mod api;
mod app;
mod cache;
mod config;
mod logging;
mod query;
mod render;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "airq")]
#[command(about = "Fetch and watch air-quality sensor data from the dashboard backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/airq/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Backend base URL (overrides AIRQ_BACKEND_URL and the config file)
  #[arg(short, long, global = true)]
  backend: Option<String>,

  /// Dashboard origin the backend URL is derived from when none is configured
  #[arg(long, global = true, default_value = "http://localhost")]
  origin: url::Url,

  /// Log debug output to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Print downsampled readings for a variable
  Fetch {
    variable: String,
    /// Days of history (the dashboard offers 1, 3, 7, 30)
    #[arg(short, long, default_value_t = 1)]
    days: u32,
    /// Keep outliers instead of letting the backend strip them
    #[arg(long)]
    keep_outliers: bool,
    /// Number of most recent readings to print
    #[arg(short, long, default_value_t = 24)]
    limit: usize,
    /// Print the raw JSON body
    #[arg(long)]
    json: bool,
    /// Bypass the cache and issue the request directly
    #[arg(long)]
    no_cache: bool,
  },
  /// Re-fetch a variable on an interval and print a summary each time
  Watch {
    variable: String,
    #[arg(short, long, default_value_t = 1)]
    days: u32,
    #[arg(long)]
    keep_outliers: bool,
    /// Refresh interval in seconds (default: cache freshness window)
    #[arg(short, long)]
    refresh: Option<u64>,
  },
  /// Show 24h averages as gauges
  Average {
    /// Variables to show (default: PM2.5, PM10, NO2)
    variables: Vec<String>,
  },
  /// Print the model forecast for a variable
  Forecast {
    variable: String,
    /// Days of history the model is trained on
    #[arg(short, long, default_value_t = 30)]
    days: u32,
    #[arg(short, long, default_value_t = 48)]
    limit: usize,
  },
  /// List the variables and timescales the dashboard offers
  Variables,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let _log_guard = logging::init(config.log.dir.as_deref(), args.verbose)?;

  let backend = config.backend_url(args.backend.as_deref(), &args.origin)?;

  // Initialize and run the app
  let app = app::App::new(config, backend)?;
  let result = app.run(args.command).await;
  app.shutdown();

  result
}
