use std::time::Duration;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

fn connect_timeout() -> Duration {
    Duration::from_secs(env_u64("PODGATE_HTTP_CONNECT_TIMEOUT_SECS", 3).max(1))
}

fn keepalive() -> Duration {
    Duration::from_secs(env_u64("PODGATE_HTTP_TCP_KEEPALIVE_SECS", 60).max(1))
}

fn user_agent() -> String {
    format!("podgate-server/{}", env!("CARGO_PKG_VERSION"))
}

/// Base client builder shared by the pod-control, inference and auth adapters.
pub fn builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(user_agent())
        .connect_timeout(connect_timeout())
        .tcp_keepalive(keepalive())
        .pool_idle_timeout(Duration::from_secs(90))
}

pub fn client_with_timeout(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    builder().timeout(timeout).build()
}
