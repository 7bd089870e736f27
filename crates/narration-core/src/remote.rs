//! HTTP transport used by the catalog client and the resource cache.
//!
//! Everything above this module talks to the network only through
//! [`RemoteTransport`], so tests can substitute an in-process fake.

use crate::error::{Error, Result};
use reqwest::blocking::Client;
use reqwest::header::ETAG;
use std::time::Duration;
use tracing::{debug, trace};

/// Response to a metadata-only probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub etag: Option<String>,
}

impl ProbeResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Response to a full download.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Status codes that mean the resource is gone, not merely unreachable.
    pub fn is_gone(&self) -> bool {
        matches!(self.status, 404 | 410)
    }
}

/// Non-2xx statuses are returned as responses; `Err` is reserved for
/// transport-level failures (DNS, connect, timeout, body read).
pub trait RemoteTransport: Send + Sync {
    fn head(&self, url: &str) -> Result<ProbeResponse>;
    fn get(&self, url: &str) -> Result<FetchResponse>;
}

/// Blocking `reqwest` transport. Timeouts are enforced by the client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| Error::Transport {
                url: String::new(),
                message: format!("failed to build HTTP client: {err}"),
            })?;
        Ok(Self { client })
    }
}

impl RemoteTransport for HttpTransport {
    fn head(&self, url: &str) -> Result<ProbeResponse> {
        trace!(%url, "HEAD");
        let response = self.client.head(url).send().map_err(|err| transport_error(url, err))?;
        let status = response.status().as_u16();
        let etag = etag_header(response.headers());
        debug!(%url, status, etag = ?etag, "Probe finished");
        Ok(ProbeResponse { status, etag })
    }

    fn get(&self, url: &str) -> Result<FetchResponse> {
        trace!(%url, "GET");
        let response = self.client.get(url).send().map_err(|err| transport_error(url, err))?;
        let status = response.status().as_u16();
        let etag = etag_header(response.headers());
        let body = response
            .bytes()
            .map_err(|err| transport_error(url, err))?
            .to_vec();
        debug!(%url, status, bytes = body.len(), "Download finished");
        Ok(FetchResponse { status, etag, body })
    }
}

fn etag_header(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn transport_error(url: &str, err: reqwest::Error) -> Error {
    Error::Transport {
        url: url.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-process transport with per-URL responses and call counters.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub(crate) enum Route {
        Ok {
            status: u16,
            etag: Option<String>,
            body: Vec<u8>,
        },
        Down,
    }

    #[derive(Default)]
    pub(crate) struct FakeTransport {
        heads: Mutex<HashMap<String, Route>>,
        gets: Mutex<HashMap<String, Route>>,
        head_calls: Mutex<HashMap<String, usize>>,
        get_calls: Mutex<HashMap<String, usize>>,
    }

    impl FakeTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Serve `body` on GET and `etag` on both HEAD and GET.
        pub(crate) fn serve(&self, url: &str, etag: Option<&str>, body: &[u8]) {
            let etag = etag.map(str::to_string);
            self.heads.lock().unwrap().insert(
                url.to_string(),
                Route::Ok {
                    status: 200,
                    etag: etag.clone(),
                    body: Vec::new(),
                },
            );
            self.gets.lock().unwrap().insert(
                url.to_string(),
                Route::Ok {
                    status: 200,
                    etag,
                    body: body.to_vec(),
                },
            );
        }

        pub(crate) fn serve_json(&self, url: &str, json: &str) {
            self.serve(url, None, json.as_bytes());
        }

        pub(crate) fn set_head(&self, url: &str, route: Route) {
            self.heads.lock().unwrap().insert(url.to_string(), route);
        }

        pub(crate) fn set_get(&self, url: &str, route: Route) {
            self.gets.lock().unwrap().insert(url.to_string(), route);
        }

        pub(crate) fn status(&self, url: &str, status: u16) {
            let route = Route::Ok {
                status,
                etag: None,
                body: Vec::new(),
            };
            self.set_head(url, route.clone());
            self.set_get(url, route);
        }

        pub(crate) fn take_down(&self, url: &str) {
            self.set_head(url, Route::Down);
            self.set_get(url, Route::Down);
        }

        pub(crate) fn get_calls(&self, url: &str) -> usize {
            self.get_calls.lock().unwrap().get(url).copied().unwrap_or(0)
        }

        pub(crate) fn head_calls(&self, url: &str) -> usize {
            self.head_calls.lock().unwrap().get(url).copied().unwrap_or(0)
        }

        fn route(map: &Mutex<HashMap<String, Route>>, url: &str) -> Route {
            map.lock()
                .unwrap()
                .get(url)
                .cloned()
                .unwrap_or(Route::Ok {
                    status: 404,
                    etag: None,
                    body: Vec::new(),
                })
        }
    }

    impl RemoteTransport for FakeTransport {
        fn head(&self, url: &str) -> Result<ProbeResponse> {
            *self.head_calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
            match Self::route(&self.heads, url) {
                Route::Ok { status, etag, .. } => Ok(ProbeResponse { status, etag }),
                Route::Down => Err(Error::Transport {
                    url: url.to_string(),
                    message: "connection refused".to_string(),
                }),
            }
        }

        fn get(&self, url: &str) -> Result<FetchResponse> {
            *self.get_calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
            match Self::route(&self.gets, url) {
                Route::Ok { status, etag, body } => Ok(FetchResponse { status, etag, body }),
                Route::Down => Err(Error::Transport {
                    url: url.to_string(),
                    message: "connection refused".to_string(),
                }),
            }
        }
    }
}
