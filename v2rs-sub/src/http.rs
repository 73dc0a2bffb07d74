//! The subscription HTTP endpoint: `GET /sub/{user}` renders the user's
//! client URIs from the streamed fleet view and the configured profile,
//! base64-encoded the way client apps expect.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{info, warn};
use vstat_core::signal::ShutdownToken;

use crate::config::{ResolvedProfile, SubscriptionTree};
use crate::stream::DataHub;

const DEFAULT_VLESS_TEMPLATE: &str =
	"vless://{credential}@{address}:{port}?encryption=none&security=tls#{node}-{user}";
const DEFAULT_TROJAN_TEMPLATE: &str =
	"trojan://{credential}@{address}:{port}?security=tls#{node}-{user}";

#[derive(Clone)]
pub struct HttpState {
	pub hub: DataHub,
	pub tree: Arc<SubscriptionTree>,
}

pub fn router(state: HttpState) -> Router {
	Router::new()
		.route("/sub/{user}", get(subscription))
		.with_state(state)
}

async fn subscription(State(state): State<HttpState>, Path(user): Path<String>) -> Response {
	let view = match state.hub.fetch().await {
		Ok(view) => view,
		Err(e) => {
			return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
		},
	};
	let profile = state.tree.resolve(&user);

	let mut links = Vec::new();
	for node in &view {
		if let Some(allowed) = &profile.nodes {
			if !allowed.contains(&node.node) {
				continue;
			}
		}
		for node_user in &node.users {
			if node_user.user != user || !node_user.enabled {
				continue;
			}
			for credential in &node_user.credentials {
				if let Some(clients) = &profile.clients {
					if !clients.contains(&credential.protocol) {
						continue;
					}
				}
				links.push(render_link(&profile, node, &user, credential));
			}
		}
	}
	if links.is_empty() {
		return (StatusCode::NOT_FOUND, "no subscription data").into_response();
	}

	let mut headers = HeaderMap::new();
	for (name, value) in &profile.headers {
		match (
			HeaderName::try_from(name.as_str()),
			HeaderValue::try_from(value.as_str()),
		) {
			(Ok(name), Ok(value)) => {
				headers.insert(name, value);
			},
			_ => warn!(header = %name, "skipping invalid subscription header"),
		}
	}
	let body = BASE64.encode(links.join("\n"));
	(StatusCode::OK, headers, body).into_response()
}

fn render_link(
	profile: &ResolvedProfile,
	node: &vstat_proto::sub::v1::NodeUsers,
	user: &str,
	credential: &vstat_proto::sub::v1::SubCredential,
) -> String {
	let template = profile
		.templates
		.get(&credential.protocol)
		.map(String::as_str)
		.unwrap_or(match credential.protocol.as_str() {
			"trojan" => DEFAULT_TROJAN_TEMPLATE,
			_ => DEFAULT_VLESS_TEMPLATE,
		});
	template
		.replace("{credential}", &credential.credential)
		.replace("{address}", &node.address)
		.replace("{port}", &node.port.to_string())
		.replace("{node}", &node.node)
		.replace("{user}", user)
		.replace("{tag}", &credential.inbound_tag)
}

pub async fn serve(state: HttpState, addr: SocketAddr, mut token: ShutdownToken) -> anyhow::Result<()> {
	let listener = tokio::net::TcpListener::bind(addr).await?;
	info!(%addr, "subscription http server listening");
	axum::serve(listener, router(state))
		.with_graceful_shutdown(async move { token.cancelled().await })
		.await?;
	info!("subscription http server stopped");
	Ok(())
}

#[cfg(test)]
mod tests {
	use vstat_proto::sub::v1::{NodeUsers, SubCredential};

	use super::*;

	#[test]
	fn links_render_from_default_templates() {
		let node = NodeUsers {
			node: "nl-1".into(),
			address: "203.0.113.7".into(),
			port: 443,
			users: Vec::new(),
		};
		let credential = SubCredential {
			inbound_tag: "vless-in".into(),
			protocol: "vless".into(),
			credential: "6c64b236-ad8a-4b44-a97c-7c7a4b1f8a60".into(),
		};
		let link = render_link(&ResolvedProfile::default(), &node, "alice", &credential);
		assert_eq!(
			link,
			"vless://6c64b236-ad8a-4b44-a97c-7c7a4b1f8a60@203.0.113.7:443?encryption=none&security=tls#nl-1-alice"
		);
	}

	#[test]
	fn custom_template_wins() {
		let node = NodeUsers {
			node: "nl-1".into(),
			address: "203.0.113.7".into(),
			port: 443,
			users: Vec::new(),
		};
		let credential = SubCredential {
			inbound_tag: "trojan-in".into(),
			protocol: "trojan".into(),
			credential: "s3cret".into(),
		};
		let profile = ResolvedProfile {
			templates: [("trojan".to_string(), "trojan://{credential}@{address}:{port}#{tag}".to_string())]
				.into_iter()
				.collect(),
			..Default::default()
		};
		let link = render_link(&profile, &node, "alice", &credential);
		assert_eq!(link, "trojan://s3cret@203.0.113.7:443#trojan-in");
	}
}
