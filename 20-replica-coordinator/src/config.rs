use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, ensure};

use crate::{dispatch::DispatchConfig, policy::Policy, replica::ReplicaAddress};

pub const DEFAULT_MAX_REQUEST_BYTES: usize = 64 * 1024;
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide coordinator settings. Built once at startup and never changed.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub listen: SocketAddr,
    replicas: Vec<ReplicaAddress>,
    pub dispatch: DispatchConfig,
    /// Largest request body a client may send.
    pub max_request_bytes: usize,
    /// How long a client may take to send its request.
    pub client_timeout: Duration,
}

impl CoordinatorConfig {
    pub fn new(listen: SocketAddr, replicas: Vec<ReplicaAddress>, dispatch: DispatchConfig) -> Result<Self> {
        ensure!(!replicas.is_empty(), "at least one replica address is required");
        ensure!(
            !dispatch.replica_timeout.is_zero(),
            "replica timeout must be greater than zero"
        );
        ensure!(
            !dispatch.dispatch_deadline.is_zero(),
            "dispatch deadline must be greater than zero"
        );
        if let Policy::Quorum(needed) = dispatch.policy {
            ensure!(
                (1..=replicas.len()).contains(&needed),
                "quorum size {needed} must be between 1 and the {} configured replicas",
                replicas.len()
            );
        }

        Ok(Self {
            listen,
            replicas,
            dispatch,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
        })
    }

    pub fn with_max_request_bytes(mut self, max: usize) -> Result<Self> {
        ensure!(max > 0, "max request bytes must be greater than zero");
        self.max_request_bytes = max;
        Ok(self)
    }

    pub fn with_client_timeout(mut self, timeout: Duration) -> Result<Self> {
        ensure!(!timeout.is_zero(), "client timeout must be greater than zero");
        self.client_timeout = timeout;
        Ok(self)
    }

    pub fn replicas(&self) -> &[ReplicaAddress] {
        &self.replicas
    }
}
