//! Bounded probe for the peer's local HTTP control endpoint.

use crate::config::EndpointConfig;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from [`EndpointProbe::find`].
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The HTTP client could not be constructed.
    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
    /// No port answered with the expected status.
    #[error("could not find endpoint after {tries} tries")]
    NotFound {
        /// Probes attempted.
        tries: u32,
    },
}

/// Cycles through `port_span` consecutive ports from `base_port`, up to
/// `max_tries` requests in total. The peer's endpoint answers `/` with 404.
#[derive(Debug, Clone)]
pub struct EndpointProbe {
    http: Client,
    host: String,
    base_port: u16,
    port_span: u16,
    max_tries: u32,
}

impl EndpointProbe {
    /// # Errors
    ///
    /// Returns [`ProbeError::Client`] if the HTTP client cannot be built.
    pub fn new(config: &EndpointConfig) -> Result<Self, ProbeError> {
        Self::with_host("127.0.0.1", config)
    }

    /// Probes `host` instead of the loopback address.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Client`] if the HTTP client cannot be built.
    pub fn with_host(host: &str, config: &EndpointConfig) -> Result<Self, ProbeError> {
        let http = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            host: host.to_string(),
            base_port: config.base_port,
            port_span: config.port_span.max(1),
            max_tries: config.max_tries,
        })
    }

    fn candidate(&self, attempt: u32) -> String {
        let offset = u16::try_from(attempt % u32::from(self.port_span)).unwrap_or(0);
        format!("http://{}:{}", self.host, self.base_port.saturating_add(offset))
    }

    /// Returns the first endpoint URL that answers with 404.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::NotFound`] once `max_tries` probes have failed.
    pub async fn find(&self) -> Result<String, ProbeError> {
        for attempt in 0..self.max_tries {
            let endpoint = self.candidate(attempt);
            match self.http.get(&endpoint).send().await {
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                    info!(endpoint = %endpoint, "found http endpoint");
                    return Ok(endpoint);
                }
                Ok(resp) => {
                    debug!(endpoint = %endpoint, status = %resp.status(), "endpoint probe: unexpected status");
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "endpoint probe failed");
                }
            }
        }
        Err(ProbeError::NotFound {
            tries: self.max_tries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                let resp = format!("{status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = sock.write_all(resp.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        port
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn config(base_port: u16, port_span: u16, max_tries: u32) -> EndpointConfig {
        EndpointConfig {
            base_port,
            port_span,
            max_tries,
        }
    }

    #[test]
    fn candidates_cycle_through_port_span() {
        let probe = EndpointProbe::new(&EndpointConfig::default()).unwrap();
        assert_eq!(probe.candidate(0), "http://127.0.0.1:6463");
        assert_eq!(probe.candidate(9), "http://127.0.0.1:6472");
        assert_eq!(probe.candidate(10), "http://127.0.0.1:6463");
        assert_eq!(probe.candidate(23), "http://127.0.0.1:6466");
    }

    #[tokio::test]
    async fn not_found_status_marks_the_endpoint() {
        let port = serve("HTTP/1.1 404 Not Found").await;
        let probe = EndpointProbe::new(&config(port, 1, 3)).unwrap();

        let endpoint = probe.find().await.unwrap();
        assert_eq!(endpoint, format!("http://127.0.0.1:{port}"));
    }

    #[tokio::test]
    async fn other_statuses_are_not_accepted() {
        let port = serve("HTTP/1.1 200 OK").await;
        let probe = EndpointProbe::new(&config(port, 1, 2)).unwrap();

        let err = probe.find().await.unwrap_err();
        assert!(matches!(err, ProbeError::NotFound { tries: 2 }));
    }

    #[tokio::test]
    async fn probe_gives_up_after_max_tries() {
        let port = closed_port().await;
        let probe = EndpointProbe::new(&config(port, 1, 4)).unwrap();

        let err = probe.find().await.unwrap_err();
        assert!(matches!(err, ProbeError::NotFound { tries: 4 }));
        assert_eq!(err.to_string(), "could not find endpoint after 4 tries");
    }
}
