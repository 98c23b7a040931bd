//! Retrying HTTP transport used by worker nodes and the training client.
//!
//! The broker replies 200 with a body once data is available and may reply
//! 204 while a prerequisite is missing, so both helpers treat anything other
//! than 200 as "not yet" and retry with a fixed 1 s backoff. `max_retries`
//! of `None` retries forever; a cap surfaces [`TransportError`] once
//! exhausted.

use std::time::Duration;

use bytes::Bytes;
use reqwest::{StatusCode, Url};

pub const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{method} {url} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        method: &'static str,
        url: Url,
        attempts: u32,
        last_error: String,
    },
}

pub fn endpoint(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    url.set_path(path);
    url
}

pub async fn get_data(
    http: &reqwest::Client,
    url: Url,
    max_retries: Option<u32>,
) -> Result<Bytes, TransportError> {
    let mut attempts = 0u32;
    loop {
        let last_error = match http.get(url.clone()).send().await {
            Ok(res) if res.status() == StatusCode::OK => match res.bytes().await {
                Ok(body) => return Ok(body),
                Err(err) => format!("read body: {err}"),
            },
            Ok(res) => format!("http {}", res.status()),
            Err(err) => format!("{err}"),
        };

        attempts = attempts.saturating_add(1);
        if let Some(cap) = max_retries {
            if attempts > cap {
                return Err(TransportError::RetriesExhausted {
                    method: "GET",
                    url,
                    attempts,
                    last_error,
                });
            }
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }
}

pub async fn send_data(
    http: &reqwest::Client,
    url: Url,
    body: Bytes,
    max_retries: Option<u32>,
) -> Result<(), TransportError> {
    let mut attempts = 0u32;
    loop {
        let last_error = match http.post(url.clone()).body(body.clone()).send().await {
            Ok(res) if res.status() == StatusCode::OK => return Ok(()),
            Ok(res) => format!("http {}", res.status()),
            Err(err) => format!("{err}"),
        };

        attempts = attempts.saturating_add(1);
        if let Some(cap) = max_retries {
            if attempts > cap {
                return Err(TransportError::RetriesExhausted {
                    method: "POST",
                    url,
                    attempts,
                    last_error,
                });
            }
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }
}
