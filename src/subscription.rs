//! Backend half of the subscription stream. The backend dials the
//! subscription service, answers its requests with the full fleet view,
//! and heartbeats every 30 s; any failure tears the stream down and the
//! outer loop reconnects with a fixed backoff.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Endpoint;
use tracing::{debug, info, warn};
use vstat_core::signal::ShutdownToken;
use vstat_proto::sub::v1::subscription_stream_client::SubscriptionStreamClient;
use vstat_proto::sub::v1::DataResponse;

use crate::store::{Store, queries};

pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(store: Store, endpoint: String, mut token: ShutdownToken) {
	loop {
		if token.is_cancelled() {
			return;
		}
		match run_stream(&store, &endpoint, token.clone()).await {
			// A clean return means we were cancelled.
			Ok(()) => return,
			Err(e) => {
				warn!(err = %e, backoff = ?RECONNECT_BACKOFF, "subscription stream down, reconnecting");
			},
		}
		tokio::select! {
			_ = token.cancelled() => return,
			_ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
		}
	}
}

async fn run_stream(store: &Store, endpoint: &str, mut token: ShutdownToken) -> anyhow::Result<()> {
	let channel = Endpoint::from_shared(endpoint.to_string())?
		.connect_timeout(CONNECT_TIMEOUT)
		.connect()
		.await?;
	let mut client = SubscriptionStreamClient::new(channel)
		.max_decoding_message_size(MAX_MESSAGE_SIZE)
		.max_encoding_message_size(MAX_MESSAGE_SIZE);

	let (tx, rx) = mpsc::channel::<DataResponse>(16);
	let mut inbound = client
		.data_stream(ReceiverStream::new(rx))
		.await?
		.into_inner();
	info!(endpoint, "subscription stream established");

	let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
	heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

	loop {
		tokio::select! {
			_ = token.cancelled() => {
				info!("subscription stream closing");
				return Ok(());
			}
			_ = heartbeat.tick() => {
				let hb = DataResponse {
					request_id: String::new(),
					is_heartbeat: true,
					node_users: Vec::new(),
				};
				if tx.send(hb).await.is_err() {
					anyhow::bail!("heartbeat send failed");
				}
			}
			message = inbound.message() => {
				let Some(request) = message? else {
					anyhow::bail!("stream closed by subscription service");
				};
				debug!(request_id = %request.request_id, "subscription request");
				match store.low(|conn| queries::node_users_view(conn)).await {
					Ok(node_users) => {
						let response = DataResponse {
							request_id: request.request_id,
							is_heartbeat: false,
							node_users,
						};
						if tx.send(response).await.is_err() {
							anyhow::bail!("response send failed");
						}
					},
					// The request times out on the far side and is served
					// from its cache.
					Err(e) => warn!(err = %e, "fleet view query failed, request dropped"),
				}
			}
		}
	}
}
