use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::Client;

const HTTP_USER_AGENT: &str = concat!("identity_tryon/", env!("CARGO_PKG_VERSION"));

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(HTTP_USER_AGENT)
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(180))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .expect("Failed to build HTTP client")
});

/// Shared client; per-request timeouts are set at the call site.
pub fn get_http_client() -> &'static Client {
    &HTTP_CLIENT
}
