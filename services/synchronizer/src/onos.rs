//! Client for the ONOS route service REST API.

use std::time::Duration;

use tracing::{debug, error, info};

use crate::error::SyncError;
use crate::mapper::Route;
use crate::models::OnosService;

/// Status and body of a successful controller call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResponse {
    pub status: u16,
    pub body: String,
}

/// ONOS REST client.
#[derive(Debug, Clone)]
pub struct OnosClient {
    client: reqwest::Client,
}

impl OnosClient {
    /// Create a client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Route service endpoint of `onos`.
    pub fn routes_url(onos: &OnosService) -> String {
        format!("{}/onos/routeservice/routes", onos.base_url())
    }

    /// Add a route.
    pub async fn post_route(
        &self,
        onos: &OnosService,
        route: &Route,
    ) -> Result<RouteResponse, SyncError> {
        let url = Self::routes_url(onos);
        debug!(url = %url, prefix = %route.prefix, "Posting route");

        let request = self
            .client
            .post(&url)
            .basic_auth(&onos.rest_username, Some(&onos.rest_password))
            .json(route);
        Self::send(request, "post").await
    }

    /// Withdraw a route.
    pub async fn delete_route(
        &self,
        onos: &OnosService,
        route: &Route,
    ) -> Result<RouteResponse, SyncError> {
        let url = Self::routes_url(onos);
        debug!(url = %url, prefix = %route.prefix, "Deleting route");

        let request = self
            .client
            .delete(&url)
            .basic_auth(&onos.rest_username, Some(&onos.rest_password))
            .json(route);
        let response = Self::send(request, "delete").await?;
        info!(status = response.status, body = %response.body, "Route deleted");
        Ok(response)
    }

    async fn send(
        request: reqwest::RequestBuilder,
        action: &'static str,
    ) -> Result<RouteResponse, SyncError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            error!(status = %status, body = %body, action, "Route request failed");
            return Err(SyncError::Remote {
                status: status.as_u16(),
                body,
            });
        }

        Ok(RouteResponse {
            status: status.as_u16(),
            body,
        })
    }
}
