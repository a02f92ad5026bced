//! CLI and environment configuration for both roles
//!
//! Every flag has an environment fallback so the same binary can be
//! configured from a container spec without wrapper scripts.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::assignment::ParsePolicy;
use crate::scheduler::ReconcilerConfig;
use crate::{DEFAULT_HEALTH_PORT, DEFAULT_WEBHOOK_PORT, SCHEDULER_NAME};

/// GPU scheduler - annotation-driven Kubernetes placement for GPU workloads
#[derive(Parser, Debug)]
#[command(name = "gpu-scheduler", version, about, long_about = None)]
pub struct Cli {
    /// Role to run
    #[command(subcommand)]
    pub command: Command,
}

/// The two cooperating roles, run as independent processes
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the watch-driven scheduler that binds opted-in pods to nodes
    Scheduler(SchedulerArgs),
    /// Run the mutating admission webhook that injects CUDA_VISIBLE_DEVICES
    Webhook(WebhookArgs),
}

/// Scheduler role arguments
#[derive(Args, Debug, Clone)]
pub struct SchedulerArgs {
    /// Scheduler name pods must declare to opt in
    #[arg(long, env = "SCHEDULER_NAME", default_value = SCHEDULER_NAME)]
    pub scheduler_name: String,

    /// Consecutive watch failures tolerated before terminating
    #[arg(long, env = "MAX_RETRIES", default_value_t = 5)]
    pub max_retries: u32,

    /// Base delay for exponential backoff, in seconds
    #[arg(long, env = "BASE_DELAY_SECS", default_value_t = 1)]
    pub base_delay_secs: u64,

    /// Backoff cap, in seconds
    #[arg(long, env = "MAX_DELAY_SECS", default_value_t = 60)]
    pub max_delay_secs: u64,

    /// Server-side watch timeout in seconds (capped below the API maximum)
    #[arg(long, env = "WATCH_TIMEOUT_SECS", default_value_t = 290)]
    pub watch_timeout_secs: u32,

    /// Port for the liveness/readiness endpoints
    #[arg(long, env = "HEALTH_PORT", default_value_t = DEFAULT_HEALTH_PORT)]
    pub health_port: u16,

    /// Abort scheduling-map parsing at the first malformed ordinal instead
    /// of skipping the line
    #[arg(long, env = "ABORT_ON_MALFORMED_MAP")]
    pub abort_on_malformed_map: bool,
}

impl SchedulerArgs {
    /// Translate CLI arguments into the reconciler's config
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            scheduler_name: self.scheduler_name.clone(),
            max_retries: self.max_retries,
            base_delay: Duration::from_secs(self.base_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
            watch_timeout_secs: self.watch_timeout_secs.min(290),
            parse_policy: self.parse_policy(),
        }
    }

    /// The configured malformed-line policy
    pub fn parse_policy(&self) -> ParsePolicy {
        if self.abort_on_malformed_map {
            ParsePolicy::AbortOnMalformed
        } else {
            ParsePolicy::SkipMalformed
        }
    }
}

/// Webhook role arguments
#[derive(Args, Debug, Clone)]
pub struct WebhookArgs {
    /// Scheduler name pods must declare to be mutated
    #[arg(long, env = "SCHEDULER_NAME", default_value = SCHEDULER_NAME)]
    pub scheduler_name: String,

    /// Port for the TLS admission endpoint
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    pub port: u16,

    /// Path to the TLS certificate (provisioned externally)
    #[arg(long, env = "TLS_CERT_FILE", default_value = "/certs/tls.crt")]
    pub cert: PathBuf,

    /// Path to the TLS private key
    #[arg(long, env = "TLS_KEY_FILE", default_value = "/certs/tls.key")]
    pub key: PathBuf,

    /// Port for the plain-HTTP liveness/readiness endpoints
    #[arg(long, env = "HEALTH_PORT", default_value_t = DEFAULT_HEALTH_PORT)]
    pub health_port: u16,

    /// Abort scheduling-map parsing at the first malformed ordinal instead
    /// of skipping the line
    #[arg(long, env = "ABORT_ON_MALFORMED_MAP")]
    pub abort_on_malformed_map: bool,
}

impl WebhookArgs {
    /// The configured malformed-line policy
    pub fn parse_policy(&self) -> ParsePolicy {
        if self.abort_on_malformed_map {
            ParsePolicy::AbortOnMalformed
        } else {
            ParsePolicy::SkipMalformed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_defaults() {
        let cli = Cli::parse_from(["gpu-scheduler", "scheduler"]);
        let Command::Scheduler(args) = cli.command else {
            panic!("expected scheduler subcommand");
        };
        assert_eq!(args.scheduler_name, SCHEDULER_NAME);
        assert_eq!(args.max_retries, 5);
        assert_eq!(args.health_port, DEFAULT_HEALTH_PORT);
        assert_eq!(args.parse_policy(), ParsePolicy::SkipMalformed);
    }

    #[test]
    fn webhook_defaults() {
        let cli = Cli::parse_from(["gpu-scheduler", "webhook"]);
        let Command::Webhook(args) = cli.command else {
            panic!("expected webhook subcommand");
        };
        assert_eq!(args.port, DEFAULT_WEBHOOK_PORT);
        assert_eq!(args.cert, PathBuf::from("/certs/tls.crt"));
        assert_eq!(args.key, PathBuf::from("/certs/tls.key"));
    }

    #[test]
    fn watch_timeout_is_clamped_to_api_maximum() {
        let cli = Cli::parse_from(["gpu-scheduler", "scheduler", "--watch-timeout-secs", "3600"]);
        let Command::Scheduler(args) = cli.command else {
            panic!("expected scheduler subcommand");
        };
        assert_eq!(args.reconciler_config().watch_timeout_secs, 290);
    }

    #[test]
    fn abort_flag_selects_abort_policy() {
        let cli = Cli::parse_from(["gpu-scheduler", "webhook", "--abort-on-malformed-map"]);
        let Command::Webhook(args) = cli.command else {
            panic!("expected webhook subcommand");
        };
        assert_eq!(args.parse_policy(), ParsePolicy::AbortOnMalformed);
    }

    #[test]
    fn reconciler_config_reflects_flags() {
        let cli = Cli::parse_from([
            "gpu-scheduler",
            "scheduler",
            "--scheduler-name",
            "gpu-sched-test",
            "--max-retries",
            "3",
            "--base-delay-secs",
            "2",
        ]);
        let Command::Scheduler(args) = cli.command else {
            panic!("expected scheduler subcommand");
        };
        let config = args.reconciler_config();
        assert_eq!(config.scheduler_name, "gpu-sched-test");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay, Duration::from_secs(2));
    }
}
