use crate::api::types::{Reading, SeriesSummary, TIMESCALES, VARIABLES};
use crate::api::{endpoints, ApiClient, CachedClient, FetchError};
use crate::config::Config;
use crate::query::Query;
use crate::render;
use crate::Command;
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

const DEFAULT_AVERAGES: &[&str] = &["PM2.5", "PM10", "NO2"];
const GAUGE_WIDTH: usize = 30;

/// Main application state
pub struct App {
  /// Application configuration
  config: Config,

  /// Backend client; every command shares its cache
  client: CachedClient,

  /// Cancelled on Ctrl-C
  cancel: CancellationToken,
}

impl App {
  pub fn new(config: Config, backend: Url) -> Result<Self> {
    let api = ApiClient::new(backend, config.request_timeout())
      .map_err(|e| eyre!("Failed to create backend client: {}", e))?;
    info!(backend = %api.base(), "using backend");

    let client = CachedClient::new(api, config.cache_policy());

    Ok(Self {
      config,
      client,
      cancel: CancellationToken::new(),
    })
  }

  pub async fn run(&self, command: Command) -> Result<()> {
    let cancel = self.cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        debug!("interrupted");
        cancel.cancel();
      }
    });

    match command {
      Command::Fetch {
        variable,
        days,
        keep_outliers,
        limit,
        json,
        no_cache,
      } => {
        self
          .fetch(&variable, days, !keep_outliers, limit, json, no_cache)
          .await
      }
      Command::Watch {
        variable,
        days,
        keep_outliers,
        refresh,
      } => {
        let refresh = refresh
          .map(Duration::from_secs)
          .unwrap_or_else(|| self.config.refresh_interval());
        self.watch(&variable, days, !keep_outliers, refresh).await
      }
      Command::Average { variables } => self.averages(variables).await,
      Command::Forecast {
        variable,
        days,
        limit,
      } => self.forecast(&variable, days, limit).await,
      Command::Variables => {
        self.variables();
        Ok(())
      }
    }
  }

  pub fn shutdown(&self) {
    let service = self.client.service();
    debug!(
      cached = service.cached_len(),
      inflight = service.inflight_len(),
      "shutting down"
    );
    self.cancel.cancel();
    self.client.shutdown();
  }

  async fn fetch(
    &self,
    variable: &str,
    days: u32,
    remove_outliers: bool,
    limit: usize,
    json: bool,
    no_cache: bool,
  ) -> Result<()> {
    if json {
      let (endpoint, params) = endpoints::readings(variable, days, remove_outliers);
      let loaded = self.client.raw(&endpoint, &params, &self.cancel).await;
      let Some(result) = unless_aborted(loaded)? else {
        return Ok(());
      };
      println!("{}", serde_json::to_string_pretty(&*result.data)?);
      return Ok(());
    }

    let readings = if no_cache {
      let loaded = self
        .client
        .service()
        .fetcher()
        .readings(variable, days, remove_outliers, &self.cancel)
        .await;
      match unless_aborted(loaded)? {
        Some(readings) => readings,
        None => return Ok(()),
      }
    } else {
      let loaded = self
        .client
        .readings(variable, days, remove_outliers, &self.cancel)
        .await;
      let Some(result) = unless_aborted(loaded)? else {
        return Ok(());
      };
      debug!(
        source = render::source_label(result.source),
        age_ms = result.fetched_at.elapsed().as_millis() as u64,
        "readings loaded"
      );
      result.data
    };

    print!("{}", render::readings_table(&readings, limit));
    println!(
      "{}",
      render::summary_line(variable, SeriesSummary::from_readings(&readings).as_ref())
    );
    Ok(())
  }

  async fn watch(
    &self,
    variable: &str,
    days: u32,
    remove_outliers: bool,
    refresh: Duration,
  ) -> Result<()> {
    let (endpoint, params) = endpoints::readings(variable, days, remove_outliers);
    let mut query: Query<Vec<Reading>> =
      Query::new(self.client.service().clone(), endpoint, params).with_refresh_interval(refresh);
    if let Some(debounce) = self.config.debounce() {
      query = query.with_debounce(debounce);
    }

    query.fetch();
    loop {
      tokio::select! {
        _ = query.changed() => {
          let view = query.view();
          if !view.loading {
            println!(
              "{}",
              render::watch_line(
                variable,
                view.data.map(|readings| readings.as_slice()),
                view.error,
                query.source(),
                chrono::Utc::now(),
              )
            );
          }
        }
        _ = self.cancel.cancelled() => break,
      }
    }

    Ok(())
  }

  async fn averages(&self, variables: Vec<String>) -> Result<()> {
    let variables = if variables.is_empty() {
      DEFAULT_AVERAGES.iter().map(|v| v.to_string()).collect()
    } else {
      variables
    };

    let results = join_all(
      variables
        .iter()
        .map(|variable| self.client.average(variable, &self.cancel)),
    )
    .await;

    let mut failed = 0;
    for (variable, result) in variables.iter().zip(results) {
      match result {
        Ok(loaded) => match loaded.data {
          Some(value) => println!("{}", render::gauge(variable, value, GAUGE_WIDTH)),
          None => println!("{:<12} no data", render::truncate(variable, 12)),
        },
        Err(e) if e.is_abort() => return Ok(()),
        Err(e) => {
          failed += 1;
          eprintln!("{:<12} error: {}", render::truncate(variable, 12), e);
        }
      }
    }

    if failed == variables.len() {
      return Err(eyre!("No averages could be loaded"));
    }
    Ok(())
  }

  async fn forecast(&self, variable: &str, days: u32, limit: usize) -> Result<()> {
    let loaded = self.client.forecast(variable, days, &self.cancel).await;
    let Some(result) = unless_aborted(loaded)? else {
      return Ok(());
    };
    print!("{}", render::forecast_table(&result.data, limit));
    Ok(())
  }

  fn variables(&self) {
    println!("Variables:");
    for variable in VARIABLES {
      println!("  {}", variable);
    }
    let timescales: Vec<String> = TIMESCALES.iter().map(|d| d.to_string()).collect();
    println!("Timescales (days): {}", timescales.join(", "));
  }
}

/// `None` when the load was cancelled. Cancellation is not an error.
fn unless_aborted<T>(result: Result<T, FetchError>) -> Result<Option<T>> {
  match result {
    Ok(value) => Ok(Some(value)),
    Err(e) if e.is_abort() => {
      debug!("load cancelled");
      Ok(None)
    }
    Err(e) => Err(e.into()),
  }
}
