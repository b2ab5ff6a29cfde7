#![forbid(unsafe_code)]

//! Load test worker / coordinator binary.
//!
//! Worker (default): simulates this worker's share of the subscriber
//! population against the broker, prints a local summary, and optionally
//! reports its counters to a coordinator.
//!
//!   MQTT_BROKER=broker.local WORKER_INDEX=0 WORKER_COUNT=4 mqtt-swarm
//!   mqtt-swarm --broker mqtts://broker.local:8883 --users 5000 --duration 300
//!
//! Coordinator: collects every worker's snapshot and prints run totals.
//!
//!   mqtt-swarm --coordinator --expected 4

use anyhow::{Context, Result};
use mqtt_swarm::allocator::IdentityAllocator;
use mqtt_swarm::config::Config;
use mqtt_swarm::mqtt::tls;
use mqtt_swarm::report::{self, Coordinator, RunTotals, WorkerReport};
use mqtt_swarm::runtime::IoRuntime;
use mqtt_swarm::scheduler::Scheduler;
use mqtt_swarm::stats::StatsRecorder;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mqtt_swarm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut cfg = Config::from_env()?;
    let mut coordinator_mode = false;
    let mut bind = std::env::var("COORDINATOR_BIND").unwrap_or_else(|_| "0.0.0.0:9640".to_string());
    let mut expected: Option<usize> = match std::env::var("EXPECTED_WORKERS") {
        Ok(raw) => Some(raw.parse().context("invalid EXPECTED_WORKERS")?),
        Err(_) => None,
    };

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--coordinator" => {
                coordinator_mode = true;
                i += 1;
            }
            "--bind" => {
                if i + 1 < args.len() {
                    bind = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--expected" => {
                if i + 1 < args.len() {
                    expected = Some(args[i + 1].parse().context("invalid --expected")?);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--broker" | "-b" => {
                if i + 1 < args.len() {
                    cfg.apply_broker_url(&args[i + 1])?;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--users" | "-u" => {
                if i + 1 < args.len() {
                    cfg.users_per_worker = args[i + 1].parse().context("invalid --users")?;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--churn" => {
                if i + 1 < args.len() {
                    cfg.churn_users = args[i + 1].parse().context("invalid --churn")?;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--duration" | "-d" => {
                if i + 1 < args.len() {
                    let secs: u64 = args[i + 1].parse().context("invalid --duration")?;
                    cfg.run_duration = Duration::from_secs(secs);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => {
                anyhow::bail!("unknown argument {other:?} (see --help)");
            }
        }
    }

    if coordinator_mode {
        let expected = expected.unwrap_or(cfg.worker_count as usize);
        return run_coordinator(&bind, expected);
    }

    cfg.validate()?;
    run_worker(cfg)
}

fn run_worker(cfg: Config) -> Result<()> {
    info!("============================================================");
    info!("MQTT distributed load test");
    info!("============================================================");
    info!(
        "Worker: {} of {}",
        cfg.worker_index + 1,
        cfg.worker_count
    );
    info!("Broker: {}:{} (TLS: {})", cfg.broker, cfg.port, cfg.use_tls);
    info!(
        "Identity pool: {}{} to {}{}",
        cfg.user_prefix,
        cfg.user_start,
        cfg.user_prefix,
        cfg.user_start + cfg.pool_size - 1
    );
    info!(
        "Users: {} steady, {} churn; stack: {:?}",
        cfg.users_per_worker, cfg.churn_users, cfg.stack
    );
    info!(
        "Connect timeout: {}s, run duration: {}s",
        cfg.connect_timeout.as_secs(),
        cfg.run_duration.as_secs()
    );
    info!("============================================================");

    let tls = if cfg.use_tls {
        Some(tls::client_config(cfg.ca_cert_path.as_deref())?)
    } else {
        None
    };

    let rt = Arc::new(IoRuntime::start().context("failed to start io loop")?);
    let allocator = IdentityAllocator::new(cfg.partition());
    let recorder = Arc::new(StatsRecorder::new());
    let cfg = Arc::new(cfg);

    let scheduler = Scheduler::new(cfg.clone(), rt.clone(), &allocator, tls, recorder.clone());
    scheduler.run(cfg.run_duration);
    rt.shutdown();

    let stats = recorder.snapshot();
    let allocated = allocator.allocated();

    println!("\n=== Load Test Summary ===");
    println!("Worker: {} of {}", cfg.worker_index + 1, cfg.worker_count);
    println!("Identities allocated: {allocated}");
    println!("Connection attempts: {}", stats.attempts);
    println!("Successful: {}", stats.successes);
    println!("Failed: {}", stats.failures);
    println!("Auth failures: {}", stats.auth_failures);
    if let Some(rate) = stats.success_rate() {
        println!("Success rate: {rate:.1}%");
    }
    println!(
        "Messages: {} valid, {} invalid",
        stats.messages_valid, stats.messages_invalid
    );
    if let Some(latency) = recorder.connect_latency_summary() {
        println!(
            "Connect latency: avg={}ms p50={}ms p95={}ms p99={}ms (n={})",
            latency.avg_ms, latency.p50_ms, latency.p95_ms, latency.p99_ms, latency.count
        );
    }
    println!("=========================\n");

    if let Some(addr) = &cfg.report_addr {
        let payload = WorkerReport {
            worker_index: cfg.worker_index,
            identities_allocated: allocated,
            stats,
        };
        report::send_report(addr, &payload)
            .with_context(|| format!("failed to report to coordinator at {addr}"))?;
    }

    Ok(())
}

fn run_coordinator(bind: &str, expected: usize) -> Result<()> {
    let coordinator = Coordinator::bind(bind)
        .with_context(|| format!("failed to bind coordinator on {bind}"))?;
    let totals = coordinator.collect(expected)?;
    print_run_totals(&totals);
    Ok(())
}

fn print_run_totals(totals: &RunTotals) {
    let stats = &totals.stats;
    println!("\n=== Run Totals ===");
    println!("Workers reported: {}", totals.workers_reported);
    println!("Identities allocated: {}", totals.identities_allocated);
    println!("Connection attempts: {}", stats.attempts);
    println!("Successful: {}", stats.successes);
    println!("Failed: {}", stats.failures);
    println!("Auth failures: {}", stats.auth_failures);
    if let Some(rate) = stats.success_rate() {
        println!("Success rate: {rate:.1}%");
    }
    println!(
        "Messages: {} valid, {} invalid",
        stats.messages_valid, stats.messages_invalid
    );
    println!("==================\n");
}

fn print_usage() {
    println!("mqtt-swarm - distributed MQTT subscriber load generator");
    println!("\nUsage:");
    println!("  mqtt-swarm [OPTIONS]                 run as a load worker");
    println!("  mqtt-swarm --coordinator [OPTIONS]   collect worker reports");
    println!("\nOptions:");
    println!("  -b, --broker <URL>     Broker URL (mqtt://host[:port] or mqtts://host[:port])");
    println!("  -u, --users <N>        Steady users on this worker (default: 10000)");
    println!("      --churn <N>        Additional churn users (default: 0)");
    println!("  -d, --duration <SECS>  Run duration in seconds (default: 60)");
    println!("      --coordinator      Run as the report coordinator");
    println!("      --bind <ADDR>      Coordinator bind address (default: 0.0.0.0:9640)");
    println!("      --expected <N>     Worker reports to wait for (default: WORKER_COUNT)");
    println!("  -h, --help             Print this help message");
    println!("\nConfiguration is environment-variable driven; see the README for the");
    println!("full list (MQTT_BROKER, USE_TLS, USER_PREFIX, USER_POOL_SIZE,");
    println!("WORKER_INDEX, WORKER_COUNT, USERS_PER_WORKER, CONNECT_TIMEOUT, ...).");
    println!("\nExamples:");
    println!("  # 4-worker distributed run, worker 0");
    println!("  WORKER_INDEX=0 WORKER_COUNT=4 REPORT_ADDR=coord:9640 \\");
    println!("      mqtt-swarm --broker mqtts://broker.local --users 10000 --duration 300");
    println!();
    println!("  # the matching coordinator");
    println!("  mqtt-swarm --coordinator --expected 4");
}
