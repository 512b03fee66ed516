use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::{
    config::{CoordinatorConfig, DEFAULT_CLIENT_TIMEOUT, DEFAULT_MAX_REQUEST_BYTES},
    dispatch::DispatchConfig,
    policy::Policy,
    replica::ReplicaAddress,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Forward each client request to every replica and reply with one answer.
    Coordinator(CoordinatorArgs),
    /// Run a demo replica that replies with fixed text or echoes requests.
    Replica(ReplicaArgs),
    /// Send one request to a coordinator and print the reply.
    Send(SendArgs),
    /// Serve an HTML front-end that forwards queries to a coordinator.
    Frontend(FrontendArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CoordinatorArgs {
    /// Replica addresses as host:port, or a bare port for localhost.
    #[arg(required = true, num_args = 1..)]
    pub replicas: Vec<ReplicaAddress>,

    /// Socket address the coordinator should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:0")]
    pub listen: SocketAddr,

    /// Milliseconds to wait for one replica before counting it as timed out.
    #[arg(long, default_value_t = 1000)]
    pub replica_timeout_ms: u64,

    /// Milliseconds to wait for all replicas before forcing a decision.
    #[arg(long, default_value_t = 2000)]
    pub dispatch_deadline_ms: u64,

    /// Response policy: first-success, quorum:<k> or all-agree.
    #[arg(long, default_value = "first-success")]
    pub policy: Policy,

    /// Largest request a client may send, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_REQUEST_BYTES)]
    pub max_request_bytes: usize,

    /// Milliseconds a client may take to send its request.
    #[arg(long, default_value_t = DEFAULT_CLIENT_TIMEOUT.as_millis() as u64)]
    pub client_timeout_ms: u64,
}

impl CoordinatorArgs {
    pub fn into_config(self) -> Result<CoordinatorConfig> {
        let dispatch = DispatchConfig {
            replica_timeout: Duration::from_millis(self.replica_timeout_ms),
            dispatch_deadline: Duration::from_millis(self.dispatch_deadline_ms),
            policy: self.policy,
        };
        CoordinatorConfig::new(self.listen, self.replicas, dispatch)?
            .with_max_request_bytes(self.max_request_bytes)?
            .with_client_timeout(Duration::from_millis(self.client_timeout_ms))
    }
}

#[derive(Args, Debug, Clone)]
pub struct ReplicaArgs {
    /// Socket address the replica should bind to.
    #[arg(long, default_value = "127.0.0.1:0")]
    pub listen: SocketAddr,

    /// Fixed reply text. Without it the replica echoes each request payload.
    #[arg(long)]
    pub reply: Option<String>,

    /// Milliseconds to wait before replying.
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,

    /// Upper bound of an extra random delay, in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub jitter_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    /// Coordinator address as host:port, or a bare port for localhost.
    #[arg(long)]
    pub coordinator: ReplicaAddress,

    /// Milliseconds to wait for the reply.
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,

    /// Request payload.
    pub payload: String,
}

#[derive(Args, Debug, Clone)]
pub struct FrontendArgs {
    /// Socket address the HTTP front-end should bind to.
    #[arg(long, default_value = "127.0.0.1:4000")]
    pub listen: SocketAddr,

    /// Coordinator address as host:port, or a bare port for localhost.
    #[arg(long)]
    pub coordinator: ReplicaAddress,

    /// Milliseconds to wait for the coordinator's reply.
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_takes_replicas_as_ports_or_addresses() {
        let cli = Cli::try_parse_from([
            "replica-coordinator",
            "coordinator",
            "7001",
            "10.0.0.2:7002",
            "--policy",
            "quorum:2",
        ])
        .expect("valid arguments");

        let Command::Coordinator(args) = cli.command else {
            panic!("expected coordinator command");
        };
        assert_eq!(args.policy, Policy::Quorum(2));

        let config = args.into_config().expect("valid config");
        assert_eq!(
            config.replicas(),
            &[
                ReplicaAddress::new("localhost", 7001),
                ReplicaAddress::new("10.0.0.2", 7002),
            ]
        );
        assert_eq!(config.dispatch.replica_timeout, Duration::from_millis(1000));
        assert_eq!(config.dispatch.dispatch_deadline, Duration::from_millis(2000));
    }

    #[test]
    fn coordinator_requires_a_replica() {
        assert!(Cli::try_parse_from(["replica-coordinator", "coordinator"]).is_err());
    }

    #[test]
    fn unknown_policy_is_a_parse_error() {
        assert!(
            Cli::try_parse_from(["replica-coordinator", "coordinator", "7001", "--policy", "most"])
                .is_err()
        );
    }

    #[test]
    fn oversized_quorum_fails_validation() {
        let cli = Cli::try_parse_from([
            "replica-coordinator",
            "coordinator",
            "7001",
            "--policy",
            "quorum:2",
        ])
        .expect("parses");
        let Command::Coordinator(args) = cli.command else {
            panic!("expected coordinator command");
        };
        assert!(args.into_config().is_err());
    }

    #[test]
    fn zero_client_limits_fail_validation() {
        for flag in ["--client-timeout-ms", "--max-request-bytes"] {
            let cli = Cli::try_parse_from(["replica-coordinator", "coordinator", "7001", flag, "0"])
                .expect("parses");
            let Command::Coordinator(args) = cli.command else {
                panic!("expected coordinator command");
            };
            assert!(args.into_config().is_err(), "{flag} 0 was accepted");
        }
    }
}
