use axum::extract::{Query, State};
use axum::{Form, Json};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use crate::api::ApiState;
use crate::api::stats::{DateAdjust, parse_adjust, render_table};
use crate::clock;
use crate::fleet::coordinator::{CommandError, CommandOutcome};
use crate::store::StoreError;
use crate::store::queries::{self, StatsKind, StatsQuery, StatsQueryError};

const DNS_COUNT_DEFAULT: u32 = 20;
const DNS_COUNT_MAX: u32 = 1000;

fn error_json(code: StatusCode, message: impl Into<String>) -> Response {
	(code, Json(json!({ "error": message.into() }))).into_response()
}

fn store_error(e: StoreError) -> Response {
	error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn command_error(e: CommandError) -> Response {
	match e {
		CommandError::InvalidUsername(_) | CommandError::UnknownNode(_) | CommandError::NoNodes => {
			error_json(StatusCode::BAD_REQUEST, e.to_string())
		},
		CommandError::UserNotFound(_) => error_json(StatusCode::NOT_FOUND, e.to_string()),
		CommandError::Store(_) => error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
	}
}

/// 200 `{usernames, results, message, credentials?}`,
/// 207 `{usernames, results, errors, credentials?}`,
/// 500 `{usernames, errors}`.
fn command_response(usernames: Vec<String>, outcome: CommandOutcome) -> Response {
	let status = outcome.http_status();
	let mut body = json!({ "usernames": usernames });
	if !outcome.results.is_empty() {
		body["results"] = json!(outcome.results);
	}
	if !outcome.errors.is_empty() {
		body["errors"] = json!(outcome.errors);
	}
	if !outcome.credentials.is_empty() {
		body["credentials"] = json!(outcome.credentials);
	}
	if status == StatusCode::OK {
		body["message"] = json!("all nodes succeeded");
	}
	(status, Json(body)).into_response()
}

pub async fn users(State(state): State<ApiState>) -> Response {
	match state.store.low(|conn| queries::users_grouped(conn)).await {
		Ok(groups) => Json(groups).into_response(),
		Err(e) => store_error(e),
	}
}

#[derive(Debug, Deserialize)]
pub struct StatsParams {
	pub node: Option<String>,
	pub user: Option<String>,
	pub sort_by: Option<String>,
	pub sort_order: Option<String>,
	#[serde(default)]
	pub aggregate: Option<bool>,
}

// serde_urlencoded cannot flatten, so this repeats the stats params.
#[derive(Debug, Deserialize)]
pub struct NodeStatsParams {
	pub node_name: String,
	pub user: Option<String>,
	pub sort_by: Option<String>,
	pub sort_order: Option<String>,
	#[serde(default)]
	pub aggregate: Option<bool>,
}

fn parse_config_sort(sort: &str) -> (String, bool) {
	let mut parts = sort.split_whitespace();
	let column = parts.next().unwrap_or("rate").to_string();
	let desc = parts
		.next()
		.map(|o| o.eq_ignore_ascii_case("DESC"))
		.unwrap_or(false);
	(column, desc)
}

async fn render_stats(state: &ApiState, params: StatsParams, aggregate: bool) -> Response {
	let order_override = match params.sort_order.as_deref() {
		None => None,
		Some(o) if o.eq_ignore_ascii_case("ASC") => Some(false),
		Some(o) if o.eq_ignore_ascii_case("DESC") => Some(true),
		Some(o) => return error_json(StatusCode::BAD_REQUEST, format!("bad sort_order {o:?}")),
	};
	let aggregate = params.aggregate.unwrap_or(aggregate);

	// sort_by is validated as strictly as sort_order: an unknown column is
	// a 400, never a silent fall-back to the configured default.
	let build = |kind: StatsKind, columns: &[String], config_sort: &str| -> Result<StatsQuery, Response> {
		let (mut sort_by, mut sort_desc) = parse_config_sort(config_sort);
		if let Some(requested) = &params.sort_by {
			if !queries::is_valid_column(kind, requested) {
				return Err(error_json(
					StatusCode::BAD_REQUEST,
					format!("unknown column {requested:?}"),
				));
			}
			sort_by = requested.clone();
		}
		if let Some(desc) = order_override {
			sort_desc = desc;
		}
		Ok(StatsQuery {
			kind,
			columns: columns.to_vec(),
			sort_by,
			sort_desc,
			node: params.node.clone(),
			user: params.user.clone(),
			aggregate,
		})
	};
	let server_query = match build(
		StatsKind::Server,
		&state.config.stats_columns.server.columns,
		&state.config.stats_columns.server.sort,
	) {
		Ok(query) => query,
		Err(response) => return response,
	};
	let client_query = match build(
		StatsKind::Client,
		&state.config.stats_columns.client.columns,
		&state.config.stats_columns.client.sort,
	) {
		Ok(query) => query,
		Err(response) => return response,
	};

	let tables = state
		.store
		.low(move |conn| {
			Ok((
				queries::stats_table(conn, &server_query),
				queries::stats_table(conn, &client_query),
			))
		})
		.await;
	let (server, client) = match tables {
		Ok(tables) => tables,
		Err(e) => return store_error(e),
	};
	let mut out = String::new();
	for (title, table) in [("Server stats:", server), ("Client stats:", client)] {
		match table {
			Ok((headers, rows)) => {
				out.push_str(title);
				out.push('\n');
				out.push_str(&render_table(&headers, &rows));
				out.push('\n');
			},
			Err(StatsQueryError::UnknownColumn(col)) => {
				return error_json(StatusCode::BAD_REQUEST, format!("unknown column {col:?}"));
			},
			Err(StatsQueryError::Sql(e)) => {
				return error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
			},
		}
	}
	out.into_response()
}

pub async fn stats(State(state): State<ApiState>, Query(params): Query<StatsParams>) -> Response {
	render_stats(&state, params, false).await
}

pub async fn node_stats(
	State(state): State<ApiState>,
	Query(params): Query<NodeStatsParams>,
) -> Response {
	let known = state
		.config
		.v2ray_stat
		.nodes
		.iter()
		.any(|n| n.node_name == params.node_name);
	if !known {
		return error_json(
			StatusCode::BAD_REQUEST,
			format!("unknown node {:?}", params.node_name),
		);
	}
	let rest = StatsParams {
		node: Some(params.node_name),
		user: params.user,
		sort_by: params.sort_by,
		sort_order: params.sort_order,
		aggregate: params.aggregate,
	};
	render_stats(&state, rest, false).await
}

pub async fn aggregate_stats(
	State(state): State<ApiState>,
	Query(params): Query<StatsParams>,
) -> Response {
	render_stats(&state, params, true).await
}

#[derive(Debug, Deserialize)]
pub struct DnsStatsParams {
	pub node: Option<String>,
	pub user: Option<String>,
	pub domain: Option<String>,
	pub count: Option<u32>,
}

pub async fn dns_stats(
	State(state): State<ApiState>,
	Query(params): Query<DnsStatsParams>,
) -> Response {
	let count = params.count.unwrap_or(DNS_COUNT_DEFAULT);
	if count < 1 || count > DNS_COUNT_MAX {
		return error_json(
			StatusCode::BAD_REQUEST,
			format!("count must be between 1 and {DNS_COUNT_MAX}"),
		);
	}
	let result = state
		.store
		.low(move |conn| {
			queries::dns_stats(
				conn,
				params.node.as_deref(),
				params.user.as_deref(),
				params.domain.as_deref(),
				count,
			)
		})
		.await;
	match result {
		Ok(rows) => Json(rows).into_response(),
		Err(e) => store_error(e),
	}
}

#[derive(Debug, Deserialize)]
pub struct UserCommandRequest {
	pub users: Vec<String>,
	pub inbound_tag: String,
	#[serde(default)]
	pub nodes: Option<Vec<String>>,
}

pub async fn add_user(
	State(state): State<ApiState>,
	Json(request): Json<UserCommandRequest>,
) -> Response {
	let usernames = request.users.clone();
	match state
		.coordinator
		.add_users(request.users, request.inbound_tag, request.nodes)
		.await
	{
		Ok(outcome) => command_response(usernames, outcome),
		Err(e) => command_error(e),
	}
}

pub async fn delete_user(
	State(state): State<ApiState>,
	Json(request): Json<UserCommandRequest>,
) -> Response {
	let usernames = request.users.clone();
	match state
		.coordinator
		.delete_users(request.users, request.inbound_tag, request.nodes)
		.await
	{
		Ok(outcome) => command_response(usernames, outcome),
		Err(e) => command_error(e),
	}
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
	pub username: String,
	pub enabled: bool,
	#[serde(default)]
	pub nodes: Option<Vec<String>>,
}

pub async fn set_enabled(
	State(state): State<ApiState>,
	Json(request): Json<SetEnabledRequest>,
) -> Response {
	let usernames = vec![request.username.clone()];
	match state
		.coordinator
		.set_enabled(request.username, request.enabled, request.nodes)
		.await
	{
		Ok(outcome) => command_response(usernames, outcome),
		Err(e) => command_error(e),
	}
}

#[derive(Debug, Deserialize)]
pub struct UpdateLimIpRequest {
	pub user: String,
	pub lim_ip: u32,
}

pub async fn update_lim_ip(
	State(state): State<ApiState>,
	Json(request): Json<UpdateLimIpRequest>,
) -> Response {
	if request.lim_ip > 100 {
		return error_json(StatusCode::BAD_REQUEST, "lim_ip must be between 0 and 100");
	}
	let user = request.user.clone();
	let result = state
		.store
		.high(move |conn| queries::update_lim_ip(conn, &user, request.lim_ip))
		.await;
	match result {
		Ok(0) => error_json(StatusCode::NOT_FOUND, format!("user {:?} not found", request.user)),
		Ok(_) => Json(json!({ "user": request.user, "lim_ip": request.lim_ip })).into_response(),
		Err(e) => store_error(e),
	}
}

#[derive(Debug, Deserialize)]
pub struct UpdateRenewForm {
	pub user: String,
	pub renew: u32,
}

pub async fn update_renew(
	State(state): State<ApiState>,
	Form(form): Form<UpdateRenewForm>,
) -> Response {
	let user = form.user.clone();
	let result = state
		.store
		.high(move |conn| queries::update_renew(conn, &user, form.renew))
		.await;
	match result {
		Ok(0) => error_json(StatusCode::NOT_FOUND, format!("user {:?} not found", form.user)),
		Ok(_) => Json(json!({ "user": form.user, "renew": form.renew })).into_response(),
		Err(e) => store_error(e),
	}
}

#[derive(Debug, Deserialize)]
pub struct AdjustDateForm {
	pub user: String,
	pub sub_end: String,
}

pub async fn adjust_date(
	State(state): State<ApiState>,
	Form(form): Form<AdjustDateForm>,
) -> Response {
	let Some(adjust) = parse_adjust(&form.sub_end) else {
		return error_json(
			StatusCode::BAD_REQUEST,
			format!("bad sub_end offset {:?}", form.sub_end),
		);
	};
	let user = form.user.clone();
	let result = state
		.store
		.high(move |conn| {
			let Some(current) = queries::get_sub_end(conn, &user)? else {
				return Ok(None);
			};
			let value = match adjust {
				DateAdjust::Clear => 0,
				DateAdjust::Delta(delta) => {
					// Offsets extend from the current expiry, or from now
					// once the subscription already lapsed.
					let base = current.max(clock::now_unix());
					(base + delta).max(0)
				},
			};
			queries::set_sub_end(conn, &user, value)?;
			Ok(Some(value))
		})
		.await;
	match result {
		Ok(Some(value)) => Json(json!({ "user": form.user, "sub_end": value })).into_response(),
		Ok(None) => error_json(StatusCode::NOT_FOUND, format!("user {:?} not found", form.user)),
		Err(e) => store_error(e),
	}
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetRequest {
	#[serde(default)]
	pub nodes: Option<Vec<String>>,
}

pub async fn reset_traffic(
	State(state): State<ApiState>,
	request: Option<Json<ResetRequest>>,
) -> Response {
	let nodes = request.map(|Json(r)| r.nodes).unwrap_or_default();
	let result = state
		.store
		.high(move |conn| queries::reset_bound_traffic(conn, &nodes))
		.await;
	match result {
		Ok(n) => Json(json!({ "reset": n })).into_response(),
		Err(e) => store_error(e),
	}
}

pub async fn reset_clients(
	State(state): State<ApiState>,
	request: Option<Json<ResetRequest>>,
) -> Response {
	let nodes = request.map(|Json(r)| r.nodes).unwrap_or_default();
	let result = state
		.store
		.high(move |conn| queries::reset_user_traffic(conn, &nodes))
		.await;
	match result {
		Ok(n) => Json(json!({ "reset": n })).into_response(),
		Err(e) => store_error(e),
	}
}

pub async fn reset_dns(
	State(state): State<ApiState>,
	request: Option<Json<ResetRequest>>,
) -> Response {
	let nodes = request.map(|Json(r)| r.nodes).unwrap_or_default();
	let result = state
		.store
		.high(move |conn| queries::reset_dns(conn, &nodes))
		.await;
	match result {
		Ok(n) => Json(json!({ "reset": n })).into_response(),
		Err(e) => store_error(e),
	}
}
