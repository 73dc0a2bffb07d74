//! Admin HTTP API. Bearer-authenticated when a token is configured,
//! otherwise open; every route goes through the store or the coordinator,
//! never at SQL directly.

pub mod auth;
pub mod handlers;
pub mod stats;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, patch, post};
use tracing::info;
use vstat_core::signal::ShutdownToken;

use crate::config::Config;
use crate::fleet::Coordinator;
use crate::store::Store;

#[derive(Clone)]
pub struct ApiState {
	pub store: Store,
	pub coordinator: Arc<Coordinator>,
	pub config: Arc<Config>,
}

pub fn router(state: ApiState) -> Router {
	Router::new()
		.route("/api/v1/users", get(handlers::users))
		.route("/api/v1/stats", get(handlers::stats))
		.route("/api/v1/node_stats", get(handlers::node_stats))
		.route("/api/v1/aggregate_stats", get(handlers::aggregate_stats))
		.route("/api/v1/dns_stats", get(handlers::dns_stats))
		.route("/api/v1/add_user", post(handlers::add_user))
		.route("/api/v1/delete_user", post(handlers::delete_user))
		.route("/api/v1/set_enabled", patch(handlers::set_enabled))
		.route("/api/v1/update_lim_ip", patch(handlers::update_lim_ip))
		.route("/api/v1/update_renew", patch(handlers::update_renew))
		.route("/api/v1/adjust_date", patch(handlers::adjust_date))
		.route("/api/v1/reset_traffic", post(handlers::reset_traffic))
		.route("/api/v1/reset_clients", post(handlers::reset_clients))
		.route("/api/v1/reset_dns", post(handlers::reset_dns))
		.layer(middleware::from_fn_with_state(state.clone(), auth::require_bearer))
		.with_state(state)
}

pub async fn serve(state: ApiState, addr: SocketAddr, mut token: ShutdownToken) -> anyhow::Result<()> {
	let listener = tokio::net::TcpListener::bind(addr).await?;
	info!(%addr, "api server listening");
	axum::serve(listener, router(state))
		.with_graceful_shutdown(async move { token.cancelled().await })
		.await?;
	info!("api server stopped");
	Ok(())
}
