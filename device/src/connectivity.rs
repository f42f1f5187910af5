use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Credentials;
use crate::error::ConnectionFailed;
use crate::platform::{LinkStatus, NetworkLink};

/// How long to wait for association: `attempts` status polls, `poll_interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptBudget {
    pub attempts: u32,
    pub poll_interval: Duration,
}

impl Default for AttemptBudget {
    fn default() -> Self {
        Self {
            attempts: 30,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl AttemptBudget {
    /// Number of polls that fit in `budget`, at least one.
    pub fn from_duration(budget: Duration, poll_interval: Duration) -> Self {
        let poll_ms = poll_interval.as_millis().max(1);
        let attempts = budget.as_millis().div_ceil(poll_ms).max(1);
        Self {
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            poll_interval,
        }
    }
}

/// The link is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connected {
    pub address: Option<IpAddr>,
    /// Status polls spent; 0 when the link was already up.
    pub attempts: u32,
}

/// Brings the link up within a bounded budget. Never retries past the budget and never sleeps
/// the device; what to do after a failure is the caller's decision.
#[derive(Debug, Clone)]
pub struct ConnectivityManager {
    budget: AttemptBudget,
}

impl ConnectivityManager {
    pub fn new(budget: AttemptBudget) -> Self {
        Self { budget }
    }

    pub async fn ensure_connected<L: NetworkLink>(
        &self,
        link: &mut L,
        credentials: &Credentials,
        hostname: &str,
    ) -> Result<Connected, ConnectionFailed> {
        if link.status().await == LinkStatus::Connected {
            debug!("Already connected");
            return Ok(Connected {
                address: link.local_addr(),
                attempts: 0,
            });
        }

        info!(ssid = %credentials.ssid, hostname, "Joining network");
        link.begin(credentials, hostname).await;

        for attempt in 1..=self.budget.attempts {
            if link.status().await == LinkStatus::Connected {
                let address = link.local_addr();
                info!(address = ?address, attempts = attempt, "Network connected");
                return Ok(Connected {
                    address,
                    attempts: attempt,
                });
            }
            tokio::time::sleep(self.budget.poll_interval).await;
        }

        warn!(
            ssid = %credentials.ssid,
            attempts = self.budget.attempts,
            "Connection attempt budget exhausted"
        );
        Err(ConnectionFailed {
            ssid: credentials.ssid.clone(),
            attempts: self.budget.attempts,
        })
    }
}
