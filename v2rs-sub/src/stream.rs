//! Server half of the subscription stream. Exactly one backend may hold
//! the stream; requests carry a fresh UUID and wait on a one-shot channel
//! until the matching response arrives, times out, or the stream dies.
//! Every non-heartbeat response also refreshes the last-response cache,
//! which answers requests while the backend is away.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vstat_core::signal::ShutdownToken;
use vstat_proto::sub::v1::subscription_stream_server::{
	SubscriptionStream, SubscriptionStreamServer,
};
use vstat_proto::sub::v1::{DataRequest, DataResponse, NodeUsers};

pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
	#[error("no backend stream and no cached response")]
	Unavailable,
}

#[derive(Default)]
struct Shared {
	pending: Mutex<HashMap<String, oneshot::Sender<DataResponse>>>,
	request_tx: Mutex<Option<mpsc::Sender<DataRequest>>>,
	last_response: Mutex<Option<(DataResponse, Instant)>>,
}

/// Handle shared between the gRPC service and the HTTP side.
#[derive(Clone, Default)]
pub struct DataHub {
	shared: Arc<Shared>,
	stream_active: Arc<AtomicBool>,
}

impl DataHub {
	pub fn new() -> DataHub {
		DataHub::default()
	}

	/// Current fleet view from the backend, or the cached last response
	/// when the backend cannot answer in time.
	pub async fn fetch(&self) -> Result<Vec<NodeUsers>, FetchError> {
		let sender = self.shared.request_tx.lock().await.clone();
		let Some(sender) = sender else {
			return self.fallback("no backend stream").await;
		};

		let request_id = Uuid::new_v4().to_string();
		let (tx, rx) = oneshot::channel();
		self
			.shared
			.pending
			.lock()
			.await
			.insert(request_id.clone(), tx);
		if sender.send(DataRequest { request_id: request_id.clone() }).await.is_err() {
			self.shared.pending.lock().await.remove(&request_id);
			return self.fallback("backend stream closed").await;
		}

		match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
			Ok(Ok(response)) => Ok(response.node_users),
			// Timed out or the pending table was purged on teardown.
			_ => {
				self.shared.pending.lock().await.remove(&request_id);
				self.fallback("request timed out").await
			},
		}
	}

	async fn fallback(&self, reason: &str) -> Result<Vec<NodeUsers>, FetchError> {
		let cached = self.shared.last_response.lock().await;
		match cached.as_ref() {
			Some((response, at)) => {
				warn!(
					reason,
					age_secs = at.elapsed().as_secs(),
					"serving cached subscription data"
				);
				Ok(response.node_users.clone())
			},
			None => Err(FetchError::Unavailable),
		}
	}
}

pub struct StreamService {
	hub: DataHub,
	token: ShutdownToken,
}

#[tonic::async_trait]
impl SubscriptionStream for StreamService {
	type DataStreamStream = Pin<Box<dyn Stream<Item = Result<DataRequest, Status>> + Send>>;

	async fn data_stream(
		&self,
		request: Request<Streaming<DataResponse>>,
	) -> Result<Response<Self::DataStreamStream>, Status> {
		if self.hub.stream_active.swap(true, Ordering::SeqCst) {
			return Err(Status::already_exists("a data stream is already connected"));
		}
		info!("backend connected");

		let mut inbound = request.into_inner();
		let (request_tx, request_rx) = mpsc::channel::<DataRequest>(16);
		*self.hub.shared.request_tx.lock().await = Some(request_tx);

		let hub = self.hub.clone();
		let mut token = self.token.clone();
		tokio::spawn(async move {
			loop {
				let message = tokio::select! {
					_ = token.cancelled() => break,
					message = inbound.message() => message,
				};
				match message {
					Ok(Some(response)) => {
						if response.is_heartbeat {
							debug!("heartbeat from backend");
							continue;
						}
						let waiter = hub
							.shared
							.pending
							.lock()
							.await
							.remove(&response.request_id);
						*hub.shared.last_response.lock().await = Some((response.clone(), Instant::now()));
						match waiter {
							Some(tx) => {
								let _ = tx.send(response);
							},
							None => debug!(request_id = %response.request_id, "response for expired request"),
						}
					},
					Ok(None) => {
						info!("backend stream closed");
						break;
					},
					Err(status) => {
						warn!(err = %status.message(), "backend stream error");
						break;
					},
				}
			}
			// Teardown: pending requesters fall back to the cache, the
			// next backend connect gets a fresh slot.
			*hub.shared.request_tx.lock().await = None;
			hub.shared.pending.lock().await.clear();
			hub.stream_active.store(false, Ordering::SeqCst);
		});

		let outbound: Self::DataStreamStream =
			Box::pin(ReceiverStream::new(request_rx).map(Ok::<DataRequest, Status>));
		Ok(Response::new(outbound))
	}
}

pub async fn serve(hub: DataHub, addr: SocketAddr, token: ShutdownToken) -> anyhow::Result<()> {
	let mut shutdown_token = token.clone();
	info!(%addr, "subscription stream server listening");
	Server::builder()
		.add_service(
			SubscriptionStreamServer::new(StreamService { hub, token })
				.max_decoding_message_size(MAX_MESSAGE_SIZE)
				.max_encoding_message_size(MAX_MESSAGE_SIZE),
		)
		.serve_with_shutdown(addr, async move { shutdown_token.cancelled().await })
		.await?;
	info!("subscription stream server stopped");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn fetch_without_stream_or_cache_fails() {
		let hub = DataHub::new();
		assert!(matches!(hub.fetch().await, Err(FetchError::Unavailable)));
	}

	#[tokio::test]
	async fn fetch_serves_cache_when_stream_is_gone() {
		let hub = DataHub::new();
		let cached = DataResponse {
			request_id: "old".into(),
			is_heartbeat: false,
			node_users: vec![NodeUsers {
				node: "n1".into(),
				address: "10.0.0.1".into(),
				port: 443,
				users: Vec::new(),
			}],
		};
		*hub.shared.last_response.lock().await = Some((cached, Instant::now()));
		let view = hub.fetch().await.unwrap();
		assert_eq!(view.len(), 1);
		assert_eq!(view[0].node, "n1");
	}

	#[tokio::test]
	async fn fetch_round_trips_through_pending_table() {
		let hub = DataHub::new();
		let (request_tx, mut request_rx) = mpsc::channel::<DataRequest>(4);
		*hub.shared.request_tx.lock().await = Some(request_tx);

		// Answer the request like the inbound task would.
		let responder_hub = hub.clone();
		tokio::spawn(async move {
			let request = request_rx.recv().await.unwrap();
			let response = DataResponse {
				request_id: request.request_id.clone(),
				is_heartbeat: false,
				node_users: vec![NodeUsers {
					node: "n2".into(),
					address: "10.0.0.2".into(),
					port: 443,
					users: Vec::new(),
				}],
			};
			let waiter = responder_hub
				.shared
				.pending
				.lock()
				.await
				.remove(&request.request_id)
				.unwrap();
			let _ = waiter.send(response);
		});

		let view = hub.fetch().await.unwrap();
		assert_eq!(view[0].node, "n2");
	}
}
