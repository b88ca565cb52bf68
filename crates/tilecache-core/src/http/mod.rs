//! HTTP transport used by download jobs.
//!
//! The transport is deliberately narrow: one blocking GET that returns the
//! body, a redirect target, or a `FetchError`. Jobs run it on tokio's
//! blocking pool so the download manager never waits on the network.

mod client;
mod error;

pub use client::CurlClient;
pub use error::{classify_curl_error, classify_http_status, ErrorKind, FetchError};

use url::Url;

/// Identifier of the default transport, reported in the User-Agent.
pub const DEFAULT_PLUGIN_ID: &str = "CurlNetworkPlugin";

/// Result of a GET that reached the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpResponse {
    /// 2xx with the complete body.
    Body(Vec<u8>),
    /// 3xx; the absolute target URL.
    Redirect(Url),
}

/// Blocking GET primitive. Implementations must not follow redirects.
pub trait HttpClient: Send + Sync {
    fn get(&self, url: &Url, user_agent: &str) -> Result<HttpResponse, FetchError>;
}

/// User-Agent sent with every tile request: platform plus component identifiers.
///
/// Example: `tilecache/0.1.0 (linux; x86_64) CurlNetworkPlugin`.
pub fn user_agent(plugin_id: &str) -> String {
    format!(
        "tilecache/{} ({}; {}) {}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
        plugin_id
    )
}
