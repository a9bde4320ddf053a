//! Station catalog boundary and fleet bootstrap
//!
//! The catalog is the backend that knows which stations and charge points
//! exist and relays operator commands (start/stop charging). The core only
//! reads it; it never retries catalog requests.
//!
//! `bring_fleet_online` walks the catalog, connects every charge point it
//! finds and reports how many came up.

use std::future::Future;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::LinkError;
use crate::manager::ConnectionManager;
use crate::ocpp::{ChargePointErrorCode, ChargePointStatus};

/// Connector announced as Available once a charge point is online
const INITIAL_CONNECTOR: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Station {
    pub station_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub can_provide_service: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargePoint {
    pub charge_point_id: String,
    #[serde(default)]
    pub station_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub is_online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandStatus {
    Accepted,
    Rejected,
}

/// Answer to an operator command relayed by the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    #[serde(default)]
    pub command_id: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Request(String),

    #[error("catalog rejected the request: {0}")]
    Api(String),

    #[error("catalog response not understood: {0}")]
    Decode(String),
}

/// Read and command access to the station catalog
pub trait Catalog: Send + Sync {
    fn list_stations(&self) -> impl Future<Output = Result<Vec<Station>, CatalogError>> + Send;

    fn station_charge_points(
        &self,
        station_id: &str,
    ) -> impl Future<Output = Result<Vec<ChargePoint>, CatalogError>> + Send;

    fn charge_point(
        &self,
        charge_point_id: &str,
    ) -> impl Future<Output = Result<ChargePoint, CatalogError>> + Send;

    fn start_charging(
        &self,
        charge_point_id: &str,
        connector_id: u32,
        id_tag: &str,
    ) -> impl Future<Output = Result<CommandResponse, CatalogError>> + Send;

    fn stop_charging(
        &self,
        charge_point_id: &str,
        transaction_id: i32,
    ) -> impl Future<Output = Result<CommandResponse, CatalogError>> + Send;
}

/// Result of bringing a set of charge points online
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetReport {
    pub total: usize,
    pub connected: usize,
    /// Failed because the host network was down
    pub network: usize,
    /// Failed because the open handshake timed out
    pub timeout: usize,
    pub other: usize,
}

impl FleetReport {
    fn record(&mut self, outcome: &Result<(), LinkError>) {
        self.total += 1;
        match outcome {
            Ok(()) => self.connected += 1,
            Err(LinkError::NetworkUnavailable { .. }) => self.network += 1,
            Err(LinkError::ConnectTimeout { .. }) => self.timeout += 1,
            Err(_) => self.other += 1,
        }
    }

    pub fn failed(&self) -> usize {
        self.total - self.connected
    }
}

/// Connect every charge point of every station the catalog lists
pub async fn bring_fleet_online<C: Catalog>(
    manager: &ConnectionManager,
    catalog: &C,
) -> Result<FleetReport, CatalogError> {
    let stations = catalog.list_stations().await?;
    info!("Catalog lists {} stations", stations.len());

    let mut ids = Vec::new();
    for station in &stations {
        match catalog.station_charge_points(&station.station_id).await {
            Ok(points) => ids.extend(points.into_iter().map(|p| p.charge_point_id)),
            Err(e) => warn!("Skipping station {}: {}", station.station_id, e),
        }
    }

    Ok(bring_online(manager, &ids).await)
}

/// Connect the given charge points concurrently and announce each one that
/// comes up as Available
pub async fn bring_online(manager: &ConnectionManager, ids: &[String]) -> FleetReport {
    let outcomes = join_all(ids.iter().map(|id| connect_and_announce(manager, id))).await;

    let mut report = FleetReport::default();
    for outcome in &outcomes {
        report.record(outcome);
    }
    info!(
        "{}/{} charge points online ({} network, {} timeout, {} other failures)",
        report.connected, report.total, report.network, report.timeout, report.other
    );
    report
}

async fn connect_and_announce(manager: &ConnectionManager, id: &str) -> Result<(), LinkError> {
    if let Err(e) = manager.connect(id).await {
        warn!(charge_point_id = %id, "Failed to bring online: {}", e);
        return Err(e);
    }

    // The connection is up either way; a lost announcement is only logged
    if let Err(e) = manager
        .send_status_notification(
            id,
            INITIAL_CONNECTOR,
            ChargePointStatus::Available,
            ChargePointErrorCode::NoError,
        )
        .await
    {
        warn!(charge_point_id = %id, "Initial StatusNotification failed: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::network::NetworkMonitor;
    use crate::ocpp::Action;
    use crate::transport::mock::{settle, MockOpen, MockTransport};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeCatalog {
        stations: Vec<Station>,
        points: HashMap<String, Vec<ChargePoint>>,
    }

    impl FakeCatalog {
        fn with_station(mut self, station_id: &str, ids: &[&str]) -> Self {
            self.stations.push(Station {
                station_id: station_id.to_string(),
                name: format!("Station {}", station_id),
                address: String::new(),
                status: None,
                can_provide_service: true,
            });
            let points = ids
                .iter()
                .map(|id| ChargePoint {
                    charge_point_id: id.to_string(),
                    station_id: station_id.to_string(),
                    name: id.to_string(),
                    vendor: None,
                    model: None,
                    firmware_version: None,
                    is_online: false,
                })
                .collect();
            self.points.insert(station_id.to_string(), points);
            self
        }

        /// A station whose charge point lookup fails
        fn with_broken_station(mut self, station_id: &str) -> Self {
            self.stations.push(Station {
                station_id: station_id.to_string(),
                name: String::new(),
                address: String::new(),
                status: None,
                can_provide_service: false,
            });
            self
        }
    }

    impl Catalog for FakeCatalog {
        async fn list_stations(&self) -> Result<Vec<Station>, CatalogError> {
            Ok(self.stations.clone())
        }

        async fn station_charge_points(&self, station_id: &str) -> Result<Vec<ChargePoint>, CatalogError> {
            self.points
                .get(station_id)
                .cloned()
                .ok_or_else(|| CatalogError::Api(format!("station {} not found", station_id)))
        }

        async fn charge_point(&self, charge_point_id: &str) -> Result<ChargePoint, CatalogError> {
            self.points
                .values()
                .flatten()
                .find(|p| p.charge_point_id == charge_point_id)
                .cloned()
                .ok_or_else(|| CatalogError::Api("not found".into()))
        }

        async fn start_charging(&self, _: &str, _: u32, _: &str) -> Result<CommandResponse, CatalogError> {
            Err(CatalogError::Request("not supported".into()))
        }

        async fn stop_charging(&self, _: &str, _: i32) -> Result<CommandResponse, CatalogError> {
            Err(CatalogError::Request("not supported".into()))
        }
    }

    fn manager(transport: &MockTransport, network: NetworkMonitor) -> ConnectionManager {
        let config = LinkConfig::default().with_connect_timeout(Duration::from_secs(5));
        ConnectionManager::new(config, Arc::new(transport.clone()), network)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_online_skips_broken_station() {
        let transport = MockTransport::new();
        let manager = manager(&transport, NetworkMonitor::online());
        let catalog = FakeCatalog::default()
            .with_station("S1", &["CP-1", "CP-2"])
            .with_broken_station("S2")
            .with_station("S3", &["CP-3"]);

        let report = {
            let manager = manager.clone();
            tokio::spawn(async move { bring_fleet_online(&manager, &catalog).await })
        };

        // Answer each initial StatusNotification as it arrives
        for _ in 0..10 {
            settle().await;
            for i in 0..transport.open_count() {
                let socket = transport.socket(i);
                for call in socket.calls() {
                    if call.action == Action::StatusNotification {
                        socket.reply(&call.message_id, json!({}));
                    }
                }
            }
        }

        let report = report.await.unwrap().unwrap();
        assert_eq!(
            report,
            FleetReport {
                total: 3,
                connected: 3,
                ..Default::default()
            }
        );
        assert_eq!(manager.get_connection_count(), 3);

        for i in 0..3 {
            let calls = transport.socket(i).calls();
            let status = calls
                .iter()
                .find(|c| c.action == Action::StatusNotification)
                .unwrap();
            assert_eq!(status.payload["connectorId"], 1);
            assert_eq!(status.payload["status"], "Available");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_buckets_failures() {
        let transport = MockTransport::new();
        transport.script([MockOpen::Accept, MockOpen::Hang, MockOpen::Refuse]);
        let manager = manager(&transport, NetworkMonitor::online());

        let ids: Vec<String> = ["CP-1", "CP-2", "CP-3"].iter().map(|s| s.to_string()).collect();
        let report = bring_online(&manager, &ids).await;

        assert_eq!(report.total, 3);
        assert_eq!(report.connected, 1);
        assert_eq!(report.timeout, 1);
        assert_eq!(report.other, 1);
        assert_eq!(report.failed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_fleet_counts_network_failures() {
        let transport = MockTransport::new();
        let network = NetworkMonitor::online();
        network.set_offline();
        let manager = manager(&transport, network);

        let ids = vec!["CP-1".to_string(), "CP-2".to_string()];
        let report = bring_online(&manager, &ids).await;

        assert_eq!(report.network, 2);
        assert_eq!(report.connected, 0);
        assert_eq!(transport.open_count(), 0);
    }

    #[test]
    fn test_command_response_decodes() {
        let response: CommandResponse =
            serde_json::from_value(json!({"commandId": "c-9", "status": "REJECTED", "message": "busy"}))
                .unwrap();
        assert_eq!(response.status, CommandStatus::Rejected);
        assert_eq!(response.command_id, "c-9");

        let point: ChargePoint = serde_json::from_value(json!({"chargePointId": "CP-1"})).unwrap();
        assert_eq!(point.charge_point_id, "CP-1");
        assert!(!point.is_online);
    }
}
