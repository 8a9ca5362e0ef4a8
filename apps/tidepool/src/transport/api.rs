use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use tracing::{debug, warn};

use super::Endpoints;
use crate::error::{ErrorKind, PeerError};

/// Request/response calls to the signaling service outside the live
/// transport: identity assignment and peer discovery.
#[derive(Clone)]
pub struct SignalingApi {
    http: reqwest::Client,
    endpoints: Endpoints,
}

impl SignalingApi {
    pub fn new(http: reqwest::Client, endpoints: Endpoints) -> Self {
        Self { http, endpoints }
    }

    /// Ask the service for a fresh peer id.
    pub async fn retrieve_id(&self) -> Result<String, PeerError> {
        let url = format!("{}/id?ts={}", self.endpoints.http_base(), cache_buster());
        debug!(target = "tidepool::api", url = %url, "requesting peer id");
        let response = self.http.get(&url).send().await.map_err(|err| {
            PeerError::new(
                ErrorKind::ServerError,
                format!("could not get an id from the server: {err}"),
            )
        })?;
        if !response.status().is_success() {
            return Err(PeerError::new(
                ErrorKind::ServerError,
                format!(
                    "could not get an id from the server (status {})",
                    response.status()
                ),
            ));
        }
        let id = response.text().await.map_err(|err| {
            PeerError::new(ErrorKind::ServerError, format!("unreadable id response: {err}"))
        })?;
        let id = id.trim().to_string();
        if id.is_empty() {
            return Err(PeerError::new(
                ErrorKind::ServerError,
                "server returned an empty id",
            ));
        }
        Ok(id)
    }

    /// Ids currently connected to the service. Requires discovery to be
    /// enabled server side.
    pub async fn list_peers(&self) -> Result<Vec<String>, PeerError> {
        let url = format!("{}/peers?ts={}", self.endpoints.http_base(), cache_buster());
        let response = self.http.get(&url).send().await.map_err(|err| {
            PeerError::new(ErrorKind::ServerError, format!("could not list peers: {err}"))
        })?;
        match response.status() {
            StatusCode::OK => response.json::<Vec<String>>().await.map_err(|err| {
                PeerError::new(ErrorKind::ServerError, format!("unreadable peer list: {err}"))
            }),
            StatusCode::UNAUTHORIZED => Err(PeerError::new(
                ErrorKind::ServerError,
                "peer discovery is not enabled for this key",
            )),
            status => {
                warn!(
                    target = "tidepool::api",
                    status = %status,
                    "peer listing unavailable"
                );
                Ok(Vec::new())
            }
        }
    }
}

fn cache_buster() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    format!("{millis}{}", rand::random::<u16>())
}
