//! HTTP client for the station catalog API
//!
//! Every endpoint answers with the envelope `{success, message, data}`.
//! Station listing is paginated (`data.content`); one page of up to 100
//! stations is read.

use std::time::Duration;

use ocpp_link::{Catalog, CatalogError, ChargePoint, CommandResponse, Station};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const STATION_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    content: Vec<T>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartChargingParams<'a> {
    connector_id: u32,
    id_tag: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StopChargingParams {
    transaction_id: i32,
}

pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalog {
    pub fn new(base_url: &str) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CatalogError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, CatalogError> {
        debug!("GET {}", path);
        let response = self
            .client
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(|e| CatalogError::Request(e.to_string()))?;
        unwrap_envelope(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, CatalogError> {
        debug!("POST {}", path);
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| CatalogError::Request(e.to_string()))?;
        unwrap_envelope(response).await
    }
}

async fn unwrap_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, CatalogError> {
    let status = response.status();
    let envelope: ApiResponse<T> = response
        .json()
        .await
        .map_err(|e| CatalogError::Decode(format!("HTTP {}: {}", status, e)))?;

    if !envelope.success {
        return Err(CatalogError::Api(
            envelope.message.unwrap_or_else(|| format!("HTTP {}", status)),
        ));
    }
    envelope
        .data
        .ok_or_else(|| CatalogError::Decode("envelope without data".into()))
}

impl Catalog for HttpCatalog {
    async fn list_stations(&self) -> Result<Vec<Station>, CatalogError> {
        let query = [
            ("page", "0".to_string()),
            ("size", STATION_PAGE_SIZE.to_string()),
        ];
        let page: Page<Station> = self.get("/stations/list", &query).await?;
        Ok(page.content)
    }

    async fn station_charge_points(&self, station_id: &str) -> Result<Vec<ChargePoint>, CatalogError> {
        self.get(&format!("/stations/{}/charge-points", station_id), &[])
            .await
    }

    async fn charge_point(&self, charge_point_id: &str) -> Result<ChargePoint, CatalogError> {
        self.get(&format!("/charge-points/{}", charge_point_id), &[])
            .await
    }

    async fn start_charging(
        &self,
        charge_point_id: &str,
        connector_id: u32,
        id_tag: &str,
    ) -> Result<CommandResponse, CatalogError> {
        self.post(
            &format!("/charge-points/{}/commands/start-charging", charge_point_id),
            &StartChargingParams { connector_id, id_tag },
        )
        .await
    }

    async fn stop_charging(&self, charge_point_id: &str, transaction_id: i32) -> Result<CommandResponse, CatalogError> {
        self.post(
            &format!("/charge-points/{}/commands/stop-charging", charge_point_id),
            &StopChargingParams { transaction_id },
        )
        .await
    }
}
