//! One gRPC channel per configured node, created once at startup and kept
//! for the process lifetime. Channels connect lazily and are never
//! discarded on failure; the next call simply retries over the same stub.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use http::Uri;
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, Endpoint};
use tracing::info;
use vstat_proto::node::v1::node_service_client::NodeServiceClient;
use vstat_proto::node::v1::*;

use crate::config::NodeConfig;
use crate::fleet::tls;
use crate::store::queries::NodeRec;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct NodeHandle {
	pub rec: NodeRec,
	client: NodeServiceClient<Channel>,
}

pub struct FleetClient {
	nodes: BTreeMap<String, NodeHandle>,
}

impl FleetClient {
	pub fn new(configs: &[NodeConfig], timeout: Duration) -> anyhow::Result<FleetClient> {
		let mut nodes = BTreeMap::new();
		for config in configs {
			let uri: Uri = config
				.url
				.parse()
				.with_context(|| format!("node {} url", config.node_name))?;
			let host = uri
				.host()
				.with_context(|| format!("node {} url has no host", config.node_name))?
				.to_string();
			let port = uri.port_u16().unwrap_or(443);

			let endpoint = Endpoint::from_shared(config.url.clone())?
				.timeout(timeout)
				.connect_timeout(timeout);
			let channel = match &config.mtls {
				Some(mtls) => {
					let tls_config = Arc::new(tls::client_config(mtls)?);
					let connect_host = host.clone();
					let connector = tower::service_fn(move |_: Uri| {
						let host = connect_host.clone();
						let tls_config = tls_config.clone();
						async move {
							let tcp = tokio::net::TcpStream::connect((host.as_str(), port)).await?;
							let server_name = ServerName::try_from(host).map_err(|e| {
								std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
							})?;
							let stream = TlsConnector::from(tls_config).connect(server_name, tcp).await?;
							Ok::<_, std::io::Error>(TokioIo::new(stream))
						}
					});
					endpoint.connect_with_connector_lazy(connector)
				},
				None => endpoint.connect_lazy(),
			};
			info!(
				node = %config.node_name,
				url = %config.url,
				mtls = config.mtls.is_some(),
				"node channel created"
			);
			nodes.insert(
				config.node_name.clone(),
				NodeHandle {
					rec: NodeRec {
						name: config.node_name.clone(),
						address: host,
						port,
					},
					client: NodeServiceClient::new(channel),
				},
			);
		}
		Ok(FleetClient { nodes })
	}

	pub fn get(&self, name: &str) -> Option<&NodeHandle> {
		self.nodes.get(name)
	}

	pub fn names(&self) -> Vec<String> {
		self.nodes.keys().cloned().collect()
	}

	pub fn handles(&self) -> impl Iterator<Item = &NodeHandle> {
		self.nodes.values()
	}

	pub fn records(&self) -> Vec<NodeRec> {
		self.nodes.values().map(|h| h.rec.clone()).collect()
	}
}

impl NodeHandle {
	pub async fn list_users(&self) -> Result<ListUsersResponse, tonic::Status> {
		self
			.client
			.clone()
			.list_users(ListUsersRequest {})
			.await
			.map(|r| r.into_inner())
	}

	pub async fn add_users(
		&self,
		usernames: Vec<String>,
		inbound_tag: String,
	) -> Result<AddUsersResponse, tonic::Status> {
		self
			.client
			.clone()
			.add_users(AddUsersRequest {
				usernames,
				inbound_tag,
			})
			.await
			.map(|r| r.into_inner())
	}

	pub async fn delete_users(
		&self,
		usernames: Vec<String>,
		inbound_tag: String,
	) -> Result<DeleteUsersResponse, tonic::Status> {
		self
			.client
			.clone()
			.delete_users(DeleteUsersRequest {
				usernames,
				inbound_tag,
			})
			.await
			.map(|r| r.into_inner())
	}

	pub async fn set_user_enabled(
		&self,
		username: String,
		enabled: bool,
	) -> Result<SetUserEnabledResponse, tonic::Status> {
		self
			.client
			.clone()
			.set_user_enabled(SetUserEnabledRequest { username, enabled })
			.await
			.map(|r| r.into_inner())
	}

	pub async fn get_traffic_stats(&self) -> Result<GetTrafficStatsResponse, tonic::Status> {
		self
			.client
			.clone()
			.get_traffic_stats(GetTrafficStatsRequest {})
			.await
			.map(|r| r.into_inner())
	}

	pub async fn get_log_data(&self) -> Result<GetLogDataResponse, tonic::Status> {
		self
			.client
			.clone()
			.get_log_data(GetLogDataRequest {})
			.await
			.map(|r| r.into_inner())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn channels_are_created_without_connecting() {
		let configs = vec![
			NodeConfig {
				node_name: "n1".into(),
				url: "http://203.0.113.7:50051".into(),
				mtls: None,
			},
			NodeConfig {
				node_name: "n2".into(),
				url: "http://203.0.113.8:50051".into(),
				mtls: None,
			},
		];
		let fleet = FleetClient::new(&configs, DEFAULT_RPC_TIMEOUT).unwrap();
		assert_eq!(fleet.names(), vec!["n1".to_string(), "n2".to_string()]);
		let rec = &fleet.get("n1").unwrap().rec;
		assert_eq!(rec.address, "203.0.113.7");
		assert_eq!(rec.port, 50051);
	}

	#[tokio::test]
	async fn url_without_host_is_rejected() {
		let configs = vec![NodeConfig {
			node_name: "bad".into(),
			url: "/not-a-url".into(),
			mtls: None,
		}];
		assert!(FleetClient::new(&configs, DEFAULT_RPC_TIMEOUT).is_err());
	}
}
