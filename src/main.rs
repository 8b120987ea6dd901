use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use futures_util::future::join_all;
use hdrhistogram::Histogram;
use rand::Rng;
use reqwest::{header, StatusCode};
use serde::Serialize;
use sonic_rs::{JsonValueTrait, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;

const BANNER: &str = "════════════════════════════════════════════════════════════";

/// Absolute tolerance for balance comparisons. Amounts are f64 on the wire,
/// so exact equality is not meaningful.
const BALANCE_TOLERANCE: f64 = 1e-9;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "tx-benchmark")]
#[command(about = "Transaction service load benchmark and consistency check", long_about = None)]
struct Config {
    /// Base URL of the transaction service
    #[arg(long, env = "BASE_URL", default_value = "http://localhost:8080")]
    base_url: String,

    /// Number of concurrent simulated clients
    #[arg(long, env = "CLIENTS", default_value_t = 10,
          value_parser = clap::value_parser!(u32).range(1..))]
    clients: u32,

    /// Transactions issued by each client
    #[arg(long, env = "PER_CLIENT", default_value_t = 10_000,
          value_parser = clap::value_parser!(u32).range(1..))]
    per_client: u32,

    /// Amount posted per transaction
    #[arg(long, env = "AMOUNT", default_value_t = 1.0)]
    amount: f64,

    /// Per-request timeout in seconds
    #[arg(long, env = "TIMEOUT", default_value_t = 10.0)]
    timeout: f64,

    /// Client-to-account topology to exercise
    #[arg(long, env = "SCENARIO", value_enum, default_value = "both")]
    scenario: ScenarioKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ScenarioKind {
    /// Every client posts to its own account
    Distinct,
    /// All clients post to one shared account
    Same,
    /// Run both topologies in sequence
    Both,
}

impl ScenarioKind {
    fn label(self) -> &'static str {
        match self {
            ScenarioKind::Distinct => "distinct",
            ScenarioKind::Same => "same",
            ScenarioKind::Both => "both",
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

#[derive(Debug, thiserror::Error)]
enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid json in response: {0}")]
    Json(#[from] sonic_rs::Error),
}

/// One shared connection pool for every simulated client. The base URL is
/// validated up front so a bad `--base-url` fails before any load is sent.
#[derive(Debug, Clone)]
struct ServiceClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ServiceClient {
    fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let parsed =
            Url::parse(base_url).with_context(|| format!("invalid base url: {base_url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("unsupported base url scheme: {}", parsed.scheme());
        }

        let client = reqwest::Client::builder()
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// POST a JSON payload and return the raw status code. Whether a non-2xx
    /// status is a problem is the caller's concern.
    async fn post_json<S: Serialize>(
        &self,
        path: &str,
        payload: &S,
    ) -> Result<StatusCode, TransportError> {
        let body = sonic_rs::to_string(payload)?;
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(header::CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .body(body)
            .send()
            .await?;
        Ok(response.status())
    }

    /// GET a JSON body. An empty body is `None`; an error status, a network
    /// failure, or a malformed body is a `TransportError`.
    async fn get_json(&self, path: &str) -> Result<Option<Value>, TransportError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header(header::ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        if body.is_empty() {
            return Ok(None);
        }
        Ok(Some(sonic_rs::from_str(&body)?))
    }
}

// =============================================================================
// Server Metrics
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct MetricsSnapshot {
    counter_time: u64,
    logging_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MetricsDelta {
    counter_time: u64,
    logging_time: u64,
}

/// Snapshot the service's cumulative timing counters (nanoseconds). Metrics
/// are best-effort: an unreachable endpoint or an empty body is `None` and
/// must never abort a load run.
async fn fetch_metrics(service: &ServiceClient) -> Option<MetricsSnapshot> {
    match service.get_json("/metrics").await {
        Ok(Some(value)) => Some(MetricsSnapshot {
            counter_time: value.get("counter_time").and_then(|v| v.as_u64()).unwrap_or(0),
            logging_time: value.get("logging_time").and_then(|v| v.as_u64()).unwrap_or(0),
        }),
        Ok(None) => None,
        Err(err) => {
            debug!("failed to read /metrics: {err}");
            None
        }
    }
}

/// Per-counter difference between two snapshots, clamped at zero so a counter
/// reset between snapshots cannot produce a negative delta.
fn diff_metrics(
    before: Option<&MetricsSnapshot>,
    after: Option<&MetricsSnapshot>,
) -> Option<MetricsDelta> {
    let before = before?;
    let after = after?;
    Some(MetricsDelta {
        counter_time: after.counter_time.saturating_sub(before.counter_time),
        logging_time: after.logging_time.saturating_sub(before.logging_time),
    })
}

// =============================================================================
// Client Simulation
// =============================================================================

#[derive(Debug, Serialize)]
struct TransactionRequest<'a> {
    user_id: &'a str,
    amount: f64,
}

struct ClientResult {
    ok: u64,
    fail: u64,
    latency: Histogram<u64>,
}

/// One simulated client: a fixed number of sequential transactions against a
/// single account. A transport error or a non-2xx status both count as a
/// failed attempt; nothing escapes as an error. The latency histogram records
/// microseconds for each attempt that produced a response, and stays owned by
/// this task until it returns.
async fn run_client(
    service: ServiceClient,
    user_id: String,
    per_client: u32,
    amount: f64,
    mut latency: Histogram<u64>,
) -> ClientResult {
    let payload = TransactionRequest {
        user_id: &user_id,
        amount,
    };

    let mut ok = 0;
    let mut fail = 0;
    for _ in 0..per_client {
        let started = Instant::now();
        match service.post_json("/transaction", &payload).await {
            Ok(status) => {
                latency.record(started.elapsed().as_micros() as u64).ok();
                if status.is_success() {
                    ok += 1;
                } else {
                    fail += 1;
                }
            }
            Err(_) => fail += 1,
        }
    }

    ClientResult { ok, fail, latency }
}

// =============================================================================
// Scenario Runner
// =============================================================================

struct ScenarioOutcome {
    name: String,
    total_requests: u64,
    ok_total: u64,
    fail_total: u64,
    elapsed: Duration,
    throughput: f64,
    metrics_delta: Option<MetricsDelta>,
    latency: Histogram<u64>,
}

fn throughput(total_requests: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        total_requests as f64 / secs
    } else {
        0.0
    }
}

/// Drive one task per entry in `user_ids` and aggregate their results after
/// all of them have finished. Counters and histograms are moved into the
/// tasks and collected exactly once at the join, so aggregation never races
/// with in-flight requests. A task that cannot be joined is fatal for the
/// whole run.
async fn run_scenario(
    name: &str,
    service: &ServiceClient,
    user_ids: &[String],
    per_client: u32,
    amount: f64,
) -> Result<ScenarioOutcome> {
    let total_requests = user_ids.len() as u64 * u64::from(per_client);
    let metrics_before = fetch_metrics(service).await;

    let template = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3)
        .context("failed to create latency histogram")?;

    let start = Instant::now();
    let mut tasks = Vec::with_capacity(user_ids.len());
    for user_id in user_ids {
        tasks.push(tokio::spawn(run_client(
            service.clone(),
            user_id.clone(),
            per_client,
            amount,
            template.clone(),
        )));
    }

    let mut ok_total = 0;
    let mut fail_total = 0;
    let mut latency = template;
    for joined in join_all(tasks).await {
        let result = joined.context("client task failed")?;
        ok_total += result.ok;
        fail_total += result.fail;
        latency.add(&result.latency).ok();
    }
    let elapsed = start.elapsed();

    let metrics_after = fetch_metrics(service).await;

    let outcome = ScenarioOutcome {
        name: name.to_string(),
        total_requests,
        ok_total,
        fail_total,
        elapsed,
        throughput: throughput(total_requests, elapsed),
        metrics_delta: diff_metrics(metrics_before.as_ref(), metrics_after.as_ref()),
        latency,
    };
    outcome.print_report();
    Ok(outcome)
}

impl ScenarioOutcome {
    fn print_report(&self) {
        info!("{BANNER}");
        info!("Scenario: {}", self.name);
        info!(
            "Requests: {} (ok={}, fail={})",
            self.total_requests, self.ok_total, self.fail_total
        );
        info!("Total time: {:.3}s", self.elapsed.as_secs_f64());
        info!("Throughput: {:.2} req/s", self.throughput);

        match &self.metrics_delta {
            Some(delta) => info!(
                "Metrics (delta): counter={:.6} s, logging={:.6} s",
                delta.counter_time as f64 / 1e9,
                delta.logging_time as f64 / 1e9
            ),
            None => info!("Metrics: unavailable (failed to read /metrics)"),
        }

        if self.latency.len() > 0 {
            info!(
                "Latency (ms): min={:.2} mean={:.2} p50={:.2} p95={:.2} p99={:.2} max={:.2}",
                self.latency.min() as f64 / 1000.0,
                self.latency.mean() / 1000.0,
                self.latency.value_at_quantile(0.50) as f64 / 1000.0,
                self.latency.value_at_quantile(0.95) as f64 / 1000.0,
                self.latency.value_at_quantile(0.99) as f64 / 1000.0,
                self.latency.max() as f64 / 1000.0
            );
        } else {
            info!("Latency: no samples recorded");
        }
    }
}

// =============================================================================
// Verification
// =============================================================================

#[derive(Debug)]
struct Verdict {
    passed: bool,
    message: String,
}

impl Verdict {
    fn pass() -> Self {
        Self {
            passed: true,
            message: "ok".to_string(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }

    fn status_label(&self) -> &'static str {
        if self.passed {
            "OK"
        } else {
            "FAIL"
        }
    }
}

fn within_tolerance(observed: f64, expected: f64) -> bool {
    (observed - expected).abs() <= BALANCE_TOLERANCE
}

/// Check every account in one read of the bulk `/accounts` mapping.
async fn verify_distinct_accounts(
    service: &ServiceClient,
    user_ids: &[String],
    expected_balance: f64,
) -> Verdict {
    let balances = match service.get_json("/accounts").await {
        Ok(body) => body,
        Err(_) => return Verdict::fail("failed to fetch /accounts"),
    };
    let balances = match balances {
        Some(value) if value.is_object() => value,
        _ => return Verdict::fail("unexpected /accounts response"),
    };

    for user_id in user_ids {
        let Some(balance) = balances.get(user_id.as_str()).and_then(|b| b.as_f64()) else {
            return Verdict::fail(format!("missing account {user_id}"));
        };
        if !within_tolerance(balance, expected_balance) {
            return Verdict::fail(format!(
                "account {user_id} balance {balance} != {expected_balance}"
            ));
        }
    }
    Verdict::pass()
}

/// Check one account through the per-user endpoint.
async fn verify_single_account(
    service: &ServiceClient,
    user_id: &str,
    expected_balance: f64,
) -> Verdict {
    let payload = match service.get_json(&format!("/user/{user_id}")).await {
        Ok(body) => body,
        Err(_) => return Verdict::fail(format!("failed to fetch /user/{user_id}")),
    };
    let payload = match payload {
        Some(value) if value.is_object() => value,
        _ => return Verdict::fail("unexpected /user response"),
    };

    let Some(balance) = payload.get("balance").and_then(|b| b.as_f64()) else {
        return Verdict::fail("missing balance in /user response");
    };
    if !within_tolerance(balance, expected_balance) {
        return Verdict::fail(format!("balance {balance} != {expected_balance}"));
    }
    Verdict::pass()
}

/// Same post-condition as the bulk check, but read through `/user/{id}` so a
/// divergence between the two server-side read paths shows up. Stops at the
/// first failing account.
async fn verify_users_via_user_endpoint(
    service: &ServiceClient,
    user_ids: &[String],
    expected_balance: f64,
) -> Verdict {
    for user_id in user_ids {
        let verdict = verify_single_account(service, user_id, expected_balance).await;
        if !verdict.passed {
            return verdict;
        }
    }
    Verdict::pass()
}

// =============================================================================
// Main
// =============================================================================

fn distinct_user_ids(count: usize) -> Vec<String> {
    let mut rng = rand::rng();
    (0..count)
        .map(|i| format!("distinct-{}-{:08x}", i, rng.random::<u32>()))
        .collect()
}

fn shared_user_id() -> String {
    format!("shared-{:08x}", rand::rng().random::<u32>())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    if !config.timeout.is_finite() || config.timeout <= 0.0 {
        bail!("timeout must be a positive number of seconds");
    }
    let timeout = Duration::from_secs_f64(config.timeout);
    let service = ServiceClient::new(&config.base_url, timeout)?;

    info!("{BANNER}");
    info!("           TRANSACTION LOAD BENCHMARK");
    info!("{BANNER}");
    info!("Base URL: {}", config.base_url);
    info!("Scenario: {}", config.scenario.label());
    info!("Clients: {}", config.clients);
    info!("Requests per client: {}", config.per_client);
    info!("Amount per transaction: {}", config.amount);
    info!("Request timeout: {}s", config.timeout);

    let run_distinct = matches!(config.scenario, ScenarioKind::Distinct | ScenarioKind::Both);
    let run_same = matches!(config.scenario, ScenarioKind::Same | ScenarioKind::Both);

    if run_distinct {
        let user_ids = distinct_user_ids(config.clients as usize);
        let name = format!(
            "{} clients x {} to distinct accounts",
            config.clients, config.per_client
        );
        run_scenario(&name, &service, &user_ids, config.per_client, config.amount).await?;

        let expected = f64::from(config.per_client) * config.amount;
        let verdict = verify_distinct_accounts(&service, &user_ids, expected).await;
        info!("Verification: {} ({})", verdict.status_label(), verdict.message);

        let verdict = verify_users_via_user_endpoint(&service, &user_ids, expected).await;
        info!("Verification (/user): {} ({})", verdict.status_label(), verdict.message);
    }

    if run_same {
        let shared = shared_user_id();
        let user_ids = vec![shared.clone(); config.clients as usize];
        let name = format!(
            "{} clients x {} to same account",
            config.clients, config.per_client
        );
        run_scenario(&name, &service, &user_ids, config.per_client, config.amount).await?;

        let expected = f64::from(config.clients) * f64::from(config.per_client) * config.amount;
        let verdict = verify_single_account(&service, &shared, expected).await;
        info!("Verification: {} ({})", verdict.status_label(), verdict.message);
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
