//! Blocking tile GET on top of libcurl.

use std::str;
use std::time::Duration;

use url::Url;

use super::{FetchError, HttpClient, HttpResponse};

/// `HttpClient` backed by a fresh curl `Easy` handle per request.
///
/// Redirects are never followed here: a 3xx response is returned as
/// `HttpResponse::Redirect` so the download manager can re-resolve the new
/// host against its policies.
#[derive(Debug, Clone)]
pub struct CurlClient {
    connect_timeout: Duration,
    /// Abort if throughput stays below 1 KiB/s for this long.
    low_speed_time: Duration,
}

impl Default for CurlClient {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            low_speed_time: Duration::from_secs(60),
        }
    }
}

impl CurlClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_low_speed_time(mut self, time: Duration) -> Self {
        self.low_speed_time = time;
        self
    }
}

impl HttpClient for CurlClient {
    fn get(&self, url: &Url, user_agent: &str) -> Result<HttpResponse, FetchError> {
        let mut body: Vec<u8> = Vec::new();
        let mut location: Option<String> = None;

        let mut easy = curl::easy::Easy::new();
        easy.url(url.as_str())?;
        easy.follow_location(false)?;
        easy.useragent(user_agent)?;
        easy.connect_timeout(self.connect_timeout)?;
        easy.low_speed_limit(1024)?;
        easy.low_speed_time(self.low_speed_time)?;

        {
            let mut transfer = easy.transfer();
            transfer.header_function(|line| {
                if let Ok(s) = str::from_utf8(line) {
                    if let Some((name, value)) = s.split_once(':') {
                        if name.trim().eq_ignore_ascii_case("location") {
                            location = Some(value.trim().to_string());
                        }
                    }
                }
                true
            })?;
            transfer.write_function(|data| {
                body.extend_from_slice(data);
                Ok(data.len())
            })?;
            transfer.perform()?;
        }

        let code = easy.response_code()?;
        match code {
            200..=299 => Ok(HttpResponse::Body(body)),
            300..=399 => {
                let target = location.ok_or(FetchError::MissingLocation(code))?;
                let next = url
                    .join(&target)
                    .map_err(|source| FetchError::InvalidRedirect { target, source })?;
                Ok(HttpResponse::Redirect(next))
            }
            _ => Err(FetchError::Http(code)),
        }
    }
}
