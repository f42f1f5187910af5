use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use std::time::Duration;

use crate::error::TransmitError;

/// POSTs JSON to the controller below its API base.
#[derive(Debug, Clone)]
pub struct ControllerClient {
    client: Client,
    api_base: Url,
}

impl ControllerClient {
    pub fn new(api_base: Url) -> Self {
        Self {
            client: Client::new(),
            api_base,
        }
    }

    /// `{apiBase}/seg/seg/.../` with every segment percent-encoded.
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.api_base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments).push("");
        }
        url
    }

    /// Returns the response body of a 2xx answer.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: Url,
        body: &T,
        timeout: Duration,
    ) -> Result<String, TransmitError> {
        log::debug!("Calling {}", url);
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| TransmitError::from_reqwest(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransmitError::Status(status.as_u16()));
        }
        response
            .text()
            .await
            .map_err(|e| TransmitError::from_reqwest(e, timeout))
    }

    /// Downloads a firmware image. `None` when the controller has nothing newer.
    pub async fn fetch_image<T: Serialize + ?Sized>(
        &self,
        url: Url,
        body: &T,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransmitError> {
        log::info!("Downloading firmware from {}", url);
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| TransmitError::from_reqwest(e, timeout))?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED => return Ok(None),
            status if !status.is_success() => {
                return Err(TransmitError::Status(status.as_u16()))
            }
            _ => {}
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransmitError::from_reqwest(e, timeout))?;
        if bytes.is_empty() {
            return Ok(None);
        }
        log::info!("Firmware downloaded successfully ({} bytes).", bytes.len());
        Ok(Some(bytes.to_vec()))
    }
}
