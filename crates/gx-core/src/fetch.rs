//! HTTP client construction.

use std::time::Duration;

use reqwest::blocking::Client;

use crate::errors::Result;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_IDLE_PER_HOST: usize = 10;

const USER_AGENT: &str = concat!("gx/", env!("CARGO_PKG_VERSION"));

/// Creates a blocking HTTP client with the standard gx timeouts.
pub fn new_client(timeout: Duration) -> Result<Client> {
    let client = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout.max(DEFAULT_TIMEOUT))
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(KEEPALIVE)
        .pool_idle_timeout(IDLE_TIMEOUT)
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .build()?;
    Ok(client)
}
