//! conn-churn - command line interface
//!
//! Runs the sync and concurrent churn phases against an FTP/FTPS server and
//! reports memory before and after each.

use clap::Parser;
use conn_churn::client::{FtpFactory, TargetInfo, ANONYMOUS_USER};
use conn_churn::connection::{
    ConnectionConfig, ProtocolFilter, SecurityProfile, TlsProfile, TlsVersion,
};
use conn_churn::harness::{
    EscalateOnFailure, MemoryMetric, MemorySampler, Orchestrator, RunConfig, RunReport,
    TrackingAllocator,
};
use conn_churn::{Error, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: TrackingAllocator = TrackingAllocator;

/// Exit code when a leak is suspected and `--fail-on-leak` is set
const EXIT_LEAK_SUSPECTED: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "conn-churn")]
#[command(about = "Connection-churn memory-leak harness for FTP/FTPS clients", long_about = None)]
#[command(version)]
struct Args {
    /// Target URL (ftp://, ftpes:// or ftps://); overrides --host/--port/--user/--password
    #[arg(long)]
    url: Option<String>,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Control port (default depends on the TLS profile)
    #[arg(long)]
    port: Option<u16>,

    /// Login user
    #[arg(long, default_value = ANONYMOUS_USER)]
    user: String,

    /// Login password
    #[arg(long)]
    password: Option<String>,

    /// Encryption and certificate validation preset
    #[arg(long = "tls-profile")]
    tls_profile: Option<TlsProfile>,

    /// TLS handshake timeout in milliseconds
    #[arg(long = "handshake-timeout-ms", default_value_t = 5000)]
    handshake_timeout_ms: u64,

    /// TCP connect and reply timeout in milliseconds [default: 15000]
    #[arg(long = "connect-timeout-ms")]
    connect_timeout_ms: Option<u64>,

    /// CA bundle (PEM) instead of the system roots
    #[arg(long = "ca-cert", value_name = "FILE")]
    ca_cert: Option<PathBuf>,

    /// CRL file (PEM) for revocation checking; repeatable
    #[arg(long = "crl", value_name = "FILE")]
    crl: Vec<PathBuf>,

    /// Allowed TLS versions (1.0, 1.1, 1.2, 1.3); default all supported
    #[arg(long = "tls-version", value_delimiter = ',')]
    tls_version: Vec<TlsVersion>,

    /// TLS versions to exclude
    #[arg(long = "exclude-tls-version", value_delimiter = ',')]
    exclude_tls_version: Vec<TlsVersion>,

    /// Cipher-suite policy (normal, secure256, performance)
    #[arg(long = "security-profile", default_value = "normal")]
    security_profile: SecurityProfile,

    /// Cycles per phase
    #[arg(long, default_value_t = 500)]
    cycles: u64,

    /// Delay inside each cycle, in milliseconds
    #[arg(long = "delay-ms", default_value_t = 1000)]
    delay_ms: u64,

    /// Cycles in flight at once during the concurrent phase
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Wait between the phases, in seconds
    #[arg(long = "cooldown-secs", default_value_t = 60)]
    cooldown_secs: u64,

    /// Cycles between progress lines
    #[arg(long = "progress-interval", default_value_t = 100)]
    progress_interval: u64,

    /// Wait after the last sample, in seconds (for attaching external tools)
    #[arg(long = "linger-secs", default_value_t = 0)]
    linger_secs: u64,

    /// Memory metric (resident, allocated)
    #[arg(long, default_value = "resident")]
    metric: MemoryMetric,

    /// Settle time before each heap trim, in milliseconds
    #[arg(long = "settle-ms", default_value_t = 500)]
    settle_ms: u64,

    /// Allowed post-reclamation growth between phases, in MiB
    #[arg(long = "leak-tolerance-mb", default_value_t = 8)]
    leak_tolerance_mb: u64,

    /// Exit with code 3 when a leak is suspected
    #[arg(long = "fail-on-leak")]
    fail_on_leak: bool,

    /// Abort the run on the first connect failure
    #[arg(long = "escalate-on-error")]
    escalate_on_error: bool,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    json: bool,
}

impl Args {
    fn connection_config(&self) -> Result<ConnectionConfig> {
        let mut builder = match (&self.url, &self.host) {
            (Some(url), _) => TargetInfo::parse(url)?.to_builder(),
            (None, Some(host)) => {
                let mut builder = ConnectionConfig::builder(host, &self.user);
                if let Some(password) = &self.password {
                    builder = builder.password(password);
                }
                builder
            }
            (None, None) => {
                return Err(Error::Config("either --url or --host is required".into()))
            }
        };

        if let Some(profile) = self.tls_profile {
            builder = builder.profile(profile);
        }
        if self.url.is_none() {
            if let Some(port) = self.port {
                builder = builder.port(port);
            }
        }
        if let Some(ms) = self.connect_timeout_ms {
            builder = builder.connect_timeout(Duration::from_millis(ms));
        }
        if let Some(path) = &self.ca_cert {
            builder = builder.ca_cert_path(path);
        }
        for path in &self.crl {
            builder = builder.crl_path(path);
        }

        builder
            .protocols(ProtocolFilter {
                include: self.tls_version.clone(),
                exclude: self.exclude_tls_version.clone(),
            })
            .security_profile(self.security_profile)
            .handshake_timeout(Duration::from_millis(self.handshake_timeout_ms))
            .build()
    }

    fn run_config(&self) -> Result<RunConfig> {
        RunConfig::builder()
            .target_cycles(self.cycles)
            .inter_cycle_delay(Duration::from_millis(self.delay_ms))
            .concurrency(self.concurrency)
            .cooldown(Duration::from_secs(self.cooldown_secs))
            .progress_interval(self.progress_interval)
            .linger(Duration::from_secs(self.linger_secs))
            .leak_tolerance_bytes(self.leak_tolerance_mb * 1024 * 1024)
            .build()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "conn-churn failed");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let connection = args.connection_config()?;
    let run_config = args.run_config()?;
    let tolerance = run_config.leak_tolerance_bytes;

    tracing::info!(
        address = %connection.address(),
        encryption = %connection.encryption,
        cycles = run_config.target_cycles,
        width = run_config.concurrency,
        metric = %args.metric,
        "starting"
    );

    let factory = Arc::new(FtpFactory::new(connection.clone())?);
    let sampler = MemorySampler::for_metric(args.metric, Duration::from_millis(args.settle_ms))?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping after in-flight cycles");
                cancel.cancel();
            }
        }
    });

    let mut orchestrator =
        Orchestrator::new(run_config, factory, Arc::new(connection), sampler).cancellation(cancel);
    if args.escalate_on_error {
        orchestrator = orchestrator.error_handler(EscalateOnFailure::first());
    }

    let outcome = orchestrator.run().await;
    if args.json {
        print_report(&orchestrator.report())?;
    }
    let report = outcome?;

    match report.leak_check(tolerance) {
        Some(leak) => {
            tracing::warn!(
                growth_bytes = leak.growth_bytes,
                tolerance_bytes = leak.tolerance_bytes,
                "{}",
                leak
            );
            if args.fail_on_leak {
                return Ok(ExitCode::from(EXIT_LEAK_SUSPECTED));
            }
        }
        None => tracing::info!(tolerance_bytes = tolerance, "no leak suspected"),
    }

    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &RunReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report).map_err(|e| Error::Io(e.into()))?;
    println!("{}", json);
    Ok(())
}
