//! The gRPC service every node runs. One agent owns the proxy-core config
//! file, the auth file, and the access-log offset; the backend is the only
//! caller.

use std::collections::HashMap;
use std::net::SocketAddr;

use regex::Regex;
use tokio::sync::Mutex;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::{info, warn};
use vstat_core::signal::ShutdownToken;
use vstat_proto::node::v1::node_service_server::{NodeService, NodeServiceServer};
use vstat_proto::node::v1::*;

use crate::authfile::AuthFile;
use crate::config::{AgentConfig, Config};
use crate::corecfg::{CoreConfig, CoreError};
use crate::logtail::LogTailer;
use crate::stats::StatsClient;

pub struct NodeAgent {
	config: AgentConfig,
	core: CoreConfig,
	auth: Option<AuthFile>,
	stats: StatsClient,
	tailer: Mutex<LogTailer>,
	// Serializes config-file rewrites across concurrent RPCs.
	mutate: Mutex<()>,
}

impl NodeAgent {
	pub fn new(config: AgentConfig) -> anyhow::Result<NodeAgent> {
		let core = CoreConfig::new(&config.core_config);
		let auth = config.auth_lua.as_ref().map(|a| AuthFile::new(&a.path));
		let stats = StatsClient::new(&config.core_api_address)?;
		let pattern = Regex::new(&config.access_log_regex)?;
		let tailer = LogTailer::new(&config.access_log, pattern)?;
		Ok(NodeAgent {
			config,
			core,
			auth,
			stats,
			tailer: Mutex::new(tailer),
			mutate: Mutex::new(()),
		})
	}

	async fn run_restart_hooks(&self, with_auth: bool) {
		run_hook(self.config.restart_command.as_deref(), "proxy core").await;
		if with_auth {
			if let Some(auth) = &self.config.auth_lua {
				run_hook(auth.restart_command.as_deref(), "http proxy").await;
			}
		}
	}
}

async fn run_hook(command: Option<&str>, what: &str) {
	let Some(command) = command else {
		return;
	};
	match tokio::process::Command::new("sh")
		.arg("-c")
		.arg(command)
		.output()
		.await
	{
		Ok(out) if out.status.success() => info!(what, "restart hook completed"),
		Ok(out) => warn!(what, code = ?out.status.code(), "restart hook failed"),
		Err(e) => warn!(what, err = %e, "restart hook failed to run"),
	}
}

fn ok() -> Option<OpStatus> {
	Some(OpStatus {
		code: 0,
		message: "ok".to_string(),
	})
}

fn status_from(e: CoreError) -> Status {
	match e {
		CoreError::AlreadyExists(_) | CoreError::CredentialCollision(_) => {
			Status::already_exists(e.to_string())
		},
		CoreError::NotFound(_) => Status::not_found(e.to_string()),
		CoreError::InboundNotFound(_) | CoreError::UnsupportedProtocol { .. } => {
			Status::failed_precondition(e.to_string())
		},
		CoreError::Parse(_) | CoreError::Io(_) => Status::internal(e.to_string()),
	}
}

fn require_usernames(usernames: &[String]) -> Result<(), Status> {
	if usernames.is_empty() {
		return Err(Status::invalid_argument("no usernames given"));
	}
	Ok(())
}

fn require_tag(tag: &str) -> Result<(), Status> {
	if tag.is_empty() {
		return Err(Status::invalid_argument("inbound_tag is required"));
	}
	Ok(())
}

#[tonic::async_trait]
impl NodeService for NodeAgent {
	async fn list_users(
		&self,
		_request: Request<ListUsersRequest>,
	) -> Result<Response<ListUsersResponse>, Status> {
		let users = self.core.list_users().map_err(status_from)?;
		Ok(Response::new(ListUsersResponse {
			status: ok(),
			users: users
				.into_iter()
				.map(|u| NodeUser {
					user: u.name,
					enabled: u.enabled,
					credentials: u
						.credentials
						.into_iter()
						.map(|(inbound_tag, id)| Credential { inbound_tag, id })
						.collect(),
					sub_end: u.sub_end,
					traffic_cap: u.traffic_cap,
				})
				.collect(),
		}))
	}

	async fn add_users(
		&self,
		request: Request<AddUsersRequest>,
	) -> Result<Response<AddUsersResponse>, Status> {
		let req = request.into_inner();
		require_usernames(&req.usernames)?;
		require_tag(&req.inbound_tag)?;

		let _guard = self.mutate.lock().await;
		let outcome = self
			.core
			.add_users(&req.usernames, &req.inbound_tag)
			.map_err(status_from)?;
		if let Some(auth) = &self.auth {
			auth
				.add(&outcome.credentials, outcome.protocol)
				.map_err(|e| Status::internal(format!("auth file update: {e}")))?;
		}
		self.run_restart_hooks(true).await;

		Ok(Response::new(AddUsersResponse {
			status: ok(),
			credentials: outcome
				.credentials
				.into_iter()
				.map(|(user, credential)| UserCredential {
					user,
					inbound_tag: req.inbound_tag.clone(),
					credential,
				})
				.collect(),
			protocol: outcome.protocol.to_string(),
		}))
	}

	async fn delete_users(
		&self,
		request: Request<DeleteUsersRequest>,
	) -> Result<Response<DeleteUsersResponse>, Status> {
		let req = request.into_inner();
		require_usernames(&req.usernames)?;
		require_tag(&req.inbound_tag)?;

		let _guard = self.mutate.lock().await;
		let removed = self
			.core
			.delete_users(&req.usernames, &req.inbound_tag)
			.map_err(status_from)?;
		if let Some(auth) = &self.auth {
			auth
				.remove(&req.usernames)
				.map_err(|e| Status::internal(format!("auth file update: {e}")))?;
		}
		self.run_restart_hooks(true).await;

		Ok(Response::new(DeleteUsersResponse {
			status: ok(),
			removed: removed
				.into_iter()
				.map(|(user, credential)| UserCredential {
					user,
					inbound_tag: req.inbound_tag.clone(),
					credential,
				})
				.collect(),
		}))
	}

	async fn set_user_enabled(
		&self,
		request: Request<SetUserEnabledRequest>,
	) -> Result<Response<SetUserEnabledResponse>, Status> {
		let req = request.into_inner();
		if req.username.is_empty() {
			return Err(Status::invalid_argument("username is required"));
		}

		let _guard = self.mutate.lock().await;
		let affected = self
			.core
			.set_enabled(&req.username, req.enabled)
			.map_err(status_from)?;
		if affected > 0 {
			self.run_restart_hooks(false).await;
		}
		Ok(Response::new(SetUserEnabledResponse {
			status: ok(),
			affected,
		}))
	}

	async fn get_traffic_stats(
		&self,
		_request: Request<GetTrafficStatsRequest>,
	) -> Result<Response<GetTrafficStatsResponse>, Status> {
		let snapshot = self.stats.query().await?;
		Ok(Response::new(GetTrafficStatsResponse {
			status: ok(),
			bound: snapshot.bound,
			user: snapshot.user,
		}))
	}

	async fn get_log_data(
		&self,
		_request: Request<GetLogDataRequest>,
	) -> Result<Response<GetLogDataResponse>, Status> {
		let mut tailer = self.tailer.lock().await;
		tailer.maybe_truncate();
		let data = tailer
			.poll()
			.map_err(|e| Status::internal(format!("access log read: {e}")))?;
		let users: HashMap<String, UserLogData> = data
			.into_iter()
			.map(|(user, d)| {
				(
					user,
					UserLogData {
						ips: d.ips.into_iter().collect(),
						dns_counts: d.dns,
					},
				)
			})
			.collect();
		Ok(Response::new(GetLogDataResponse {
			status: ok(),
			users,
		}))
	}
}

pub async fn serve(config: Config, mut token: ShutdownToken) -> anyhow::Result<()> {
	let addr: SocketAddr = format!("{}:{}", config.agent.address, config.agent.port).parse()?;
	let agent = NodeAgent::new(config.agent.clone())?;

	let mut builder = Server::builder();
	if let Some(mtls) = &config.agent.mtls {
		let cert = std::fs::read_to_string(&mtls.cert)?;
		let key = std::fs::read_to_string(&mtls.key)?;
		let ca = std::fs::read_to_string(&mtls.ca_cert)?;
		builder = builder.tls_config(
			ServerTlsConfig::new()
				.identity(Identity::from_pem(cert, key))
				.client_ca_root(Certificate::from_pem(ca)),
		)?;
		info!(%addr, "node agent listening with mTLS");
	} else {
		info!(%addr, "node agent listening");
	}

	builder
		.add_service(NodeServiceServer::new(agent))
		.serve_with_shutdown(addr, async move { token.cancelled().await })
		.await?;
	info!("node agent stopped");
	Ok(())
}
