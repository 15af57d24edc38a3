use clap::Parser;
use eyre::{eyre, Result};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "fleet-provisioner",
    version,
    about = "Reconciliation and bidding core for an elastic spot-instance fleet"
)]
pub struct Args {
    /// Identifier written as the `Owner` tag on every resource this process creates.
    #[arg(long, env = "FLEET_PROVISIONER_ID")]
    pub provisioner_id: String,

    /// Prepended to every worker-type name to form its key-pair name.
    #[arg(long, default_value = "fleet-")]
    pub key_prefix: String,

    /// Cloud region the provisioner is allowed to operate in. Repeatable.
    #[arg(long = "allowed-region", required = true)]
    pub allowed_regions: Vec<String>,

    /// Reconciliation cadence, in milliseconds.
    #[arg(long, default_value_t = 75_000)]
    pub iteration_interval_ms: u64,

    /// Instances older than this are terminated by the age killer, in hours.
    #[arg(long, default_value_t = 96)]
    pub max_instance_life_hours: u64,

    /// Path to the SSH public key body used by importKeyPair.
    #[arg(long)]
    pub public_key_path: PathBuf,

    /// How long an open request can sit unfulfilled before it's stalled, in seconds.
    #[arg(long, default_value_t = 1200)]
    pub stall_timeout_secs: u64,

    /// How long an in-flight bid is tracked before being dropped as timed out, in seconds.
    #[arg(long, default_value_t = 900)]
    pub in_flight_timeout_secs: u64,

    /// Iterations a departed-but-unresolved instance/request stays pending before being dropped.
    #[arg(long, default_value_t = 20)]
    pub max_iterations_for_state_resolution: u32,

    /// Per-call timeout for any single cloud-API call, in seconds.
    #[arg(long, default_value_t = 30)]
    pub region_call_timeout_secs: u64,

    /// Bound on outstanding calls per region per API during fan-out.
    #[arg(long, default_value_t = 8)]
    pub max_concurrency: usize,

    /// Endpoint for the external worker-type/instance store (consumed read-only).
    #[arg(long)]
    pub store_endpoint: Option<String>,

    /// Endpoint for the external pending-task queue.
    #[arg(long)]
    pub queue_endpoint: Option<String>,

    /// Endpoint for the telemetry/event sink. Defaults to logging via tracing only.
    #[arg(long)]
    pub telemetry_endpoint: Option<String>,

    /// Where the single-instance advisory lock file lives.
    #[arg(long, default_value = "fleet-provisioner.lock")]
    pub lock_file: PathBuf,

    /// Run a single iteration and exit.
    #[arg(long)]
    pub once: bool,

    /// Classify, diff, and log decisions without calling any mutating cloud API.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub provisioner_id: String,
    pub key_prefix: String,
    pub allowed_regions: Vec<String>,
    pub iteration_interval: Duration,
    pub max_instance_life: Duration,
    pub public_key_body: Vec<u8>,
    pub stall_timeout: Duration,
    pub in_flight_timeout: Duration,
    pub max_iterations_for_state_resolution: u32,
    pub region_call_timeout: Duration,
    pub max_concurrency: usize,
    pub lock_file: PathBuf,
    pub once: bool,
    pub dry_run: bool,
}

impl ProvisionerConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        if args.allowed_regions.is_empty() {
            return Err(eyre!("at least one --allowed-region is required"));
        }
        if args.max_concurrency == 0 {
            return Err(eyre!("--max-concurrency must be > 0"));
        }
        if args.provisioner_id.trim().is_empty() {
            return Err(eyre!("--provisioner-id must not be empty"));
        }

        let public_key_body = std::fs::read(&args.public_key_path).map_err(|e| {
            eyre!(
                "failed to read public key body at {}: {e}",
                args.public_key_path.display()
            )
        })?;

        if args.iteration_interval_ms == 0 {
            tracing::warn!("iteration_interval_ms is 0; reconciliation will run back-to-back with no pause");
        }

        Ok(Self {
            provisioner_id: args.provisioner_id.clone(),
            key_prefix: args.key_prefix.clone(),
            allowed_regions: args.allowed_regions.clone(),
            iteration_interval: Duration::from_millis(args.iteration_interval_ms),
            max_instance_life: Duration::from_secs(args.max_instance_life_hours.saturating_mul(3600)),
            public_key_body,
            stall_timeout: Duration::from_secs(args.stall_timeout_secs),
            in_flight_timeout: Duration::from_secs(args.in_flight_timeout_secs),
            max_iterations_for_state_resolution: args.max_iterations_for_state_resolution,
            region_call_timeout: Duration::from_secs(args.region_call_timeout_secs.max(1)),
            max_concurrency: args.max_concurrency,
            lock_file: args.lock_file.clone(),
            once: args.once,
            dry_run: args.dry_run,
        })
    }
}
