//! HTTP + WebSocket transport over the [`Orchestrator`].

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anvil_process::{
    BackupId, InstanceEvent, InstanceId, UploadId, WorldGenerationSettings,
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        DefaultBodyLimit, Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::{
    error::AnvilError,
    error_payload::ErrorPayload,
    orchestrator::{CommandOutcome, Orchestrator, PlayerAction},
    registry::WorldSource,
    scheduler::{OperationKind, OperationTicket},
};

const SERVER_LIST_POLL: Duration = Duration::from_secs(5);
const DEFAULT_LOG_LIMIT: usize = 500;
const MAX_LOG_LIMIT: usize = 5000;

pub type AppState = Arc<Orchestrator>;

/// Error side of every handler.
#[derive(Debug)]
pub struct ApiError(pub AnvilError);

impl From<AnvilError> for ApiError {
    fn from(value: AnvilError) -> Self {
        ApiError(value)
    }
}

pub fn status_for(err: &AnvilError) -> StatusCode {
    match err {
        AnvilError::NotFound { .. } => StatusCode::NOT_FOUND,
        AnvilError::InvalidTransition { .. }
        | AnvilError::OperationInProgress { .. }
        | AnvilError::InstanceRunning { .. }
        | AnvilError::ProcessNotRunning(_)
        | AnvilError::NameConflict(_)
        | AnvilError::Cancelled => StatusCode::CONFLICT,
        AnvilError::InvalidArchiveShape(_)
        | AnvilError::InvalidWorldSource(_)
        | AnvilError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        AnvilError::Spawn(_) | AnvilError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %format!("{:#}", self.0), code = self.0.code(), "request failed");
        } else {
            tracing::debug!(error = %self.0, code = self.0.code(), "request rejected");
        }
        (status, Json(ErrorPayload::from(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct Accepted {
    instance_id: InstanceId,
    operation: OperationKind,
}

#[derive(Debug, Default, Deserialize)]
struct WaitQuery {
    #[serde(default)]
    wait: bool,
}

/// 202 with the operation, or the operation's result when the caller asked to wait.
async fn respond<T: Serialize>(ticket: OperationTicket<T>, q: &WaitQuery) -> ApiResult<Response> {
    if q.wait {
        let value = ticket.wait().await?;
        return Ok(Json(value).into_response());
    }
    let body = Accepted {
        instance_id: ticket.instance_id.clone(),
        operation: ticket.kind,
    };
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

pub fn router(state: AppState) -> Router {
    let upload_limit = state.config().upload_max_bytes;
    Router::new()
        .route("/api/available_versions", get(available_versions))
        .route("/api/servers", get(list_servers).post(create_server))
        .route("/api/servers/ws", get(servers_ws))
        .route("/api/servers/:sid", get(get_server).delete(delete_server))
        .route("/api/servers/:sid/install", post(install))
        .route("/api/servers/:sid/start", post(start))
        .route("/api/servers/:sid/stop", post(stop))
        .route("/api/servers/:sid/cancel", post(cancel))
        .route("/api/servers/:sid/command", post(command))
        .route("/api/servers/:sid/logs", get(logs))
        .route("/api/servers/:sid/players", get(players))
        .route("/api/servers/:sid/players/:action", post(player_action))
        .route(
            "/api/servers/:sid/properties",
            get(get_properties).patch(patch_properties),
        )
        .route("/api/servers/:sid/worlds", get(list_worlds).post(create_world))
        .route("/api/servers/:sid/worlds/import", post(import_world))
        .route("/api/servers/:sid/worlds/:world/activate", post(change_world))
        .route("/api/servers/:sid/worlds/:world/copy", post(copy_world))
        .route("/api/servers/:sid/worlds/:world/backup", post(create_backup))
        .route("/api/servers/:sid/backups", get(server_backups))
        .route("/api/servers/:sid/websocket", get(instance_ws))
        .route("/api/backups", get(all_backups))
        .route("/api/backups/:bid", get(get_backup).delete(delete_backup))
        .route("/api/backups/:bid/restore", post(restore_backup))
        .route(
            "/api/upload_world",
            post(upload_world).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .with_state(state)
}

async fn available_versions(State(o): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(o.available_versions().await?))
}

async fn list_servers(State(o): State<AppState>) -> impl IntoResponse {
    Json(o.list_instances())
}

#[derive(Debug, Default, Deserialize)]
struct WorldSpec {
    #[serde(default)]
    upload_id: Option<String>,
    #[serde(flatten)]
    generation: WorldGenerationSettings,
}

#[derive(Debug, Deserialize)]
struct CreateServer {
    name: String,
    version: String,
    #[serde(default)]
    world: WorldSpec,
}

async fn create_server(
    State(o): State<AppState>,
    Json(body): Json<CreateServer>,
) -> ApiResult<impl IntoResponse> {
    let world = match body.world.upload_id {
        Some(id) => WorldSource::Uploaded(UploadId(id)),
        None => WorldSource::Generate(body.world.generation),
    };
    let summary = o.create_instance(&body.name, &body.version, world).await?;
    // Creation succeeded even if the install cannot be scheduled.
    if let Err(e) = o.install(&summary.id) {
        tracing::warn!(instance_id = %summary.id, error = %e, "install after create not scheduled");
    }
    Ok((StatusCode::CREATED, Json(o.get_instance(&summary.id)?)))
}

async fn get_server(
    State(o): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(o.get_instance(&InstanceId(sid))?))
}

async fn delete_server(
    State(o): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<StatusCode> {
    o.delete_instance(&InstanceId(sid)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn install(
    State(o): State<AppState>,
    Path(sid): Path<String>,
    Query(q): Query<WaitQuery>,
) -> ApiResult<Response> {
    respond(o.install(&InstanceId(sid))?, &q).await
}

async fn start(
    State(o): State<AppState>,
    Path(sid): Path<String>,
    Query(q): Query<WaitQuery>,
) -> ApiResult<Response> {
    respond(o.start(&InstanceId(sid))?, &q).await
}

async fn stop(
    State(o): State<AppState>,
    Path(sid): Path<String>,
    Query(q): Query<WaitQuery>,
) -> ApiResult<Response> {
    respond(o.stop(&InstanceId(sid))?, &q).await
}

#[derive(Debug, Serialize)]
struct Cancelled {
    cancelled: Option<OperationKind>,
}

async fn cancel(
    State(o): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let cancelled = o.cancel_operation(&InstanceId(sid))?;
    Ok(Json(Cancelled { cancelled }))
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    command: String,
}

async fn command(
    State(o): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<CommandBody>,
) -> ApiResult<Response> {
    match o.send_command(&InstanceId(sid), &body.command).await? {
        CommandOutcome::Sent => Ok(StatusCode::NO_CONTENT.into_response()),
        CommandOutcome::Stopping(ticket) => respond(ticket, &WaitQuery::default()).await,
    }
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    cursor: u64,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogsPage {
    lines: Vec<String>,
    cursor: u64,
}

async fn logs(
    State(o): State<AppState>,
    Path(sid): Path<String>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    let (lines, cursor) = o.logs(&InstanceId(sid), q.cursor, limit)?;
    Ok(Json(LogsPage { lines, cursor }))
}

async fn players(
    State(o): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(o.players(&InstanceId(sid))?))
}

#[derive(Debug, Deserialize)]
struct PlayerBody {
    player: String,
}

async fn player_action(
    State(o): State<AppState>,
    Path((sid, action)): Path<(String, String)>,
    Json(body): Json<PlayerBody>,
) -> ApiResult<impl IntoResponse> {
    let action = match action.as_str() {
        "op" => PlayerAction::Op,
        "deop" => PlayerAction::Deop,
        "ban" => PlayerAction::Ban,
        "pardon" => PlayerAction::Pardon,
        other => {
            return Err(AnvilError::InvalidArgument(format!("unknown player action {other:?}")).into());
        }
    };
    Ok(Json(
        o.update_player(&InstanceId(sid), action, &body.player)
            .await?,
    ))
}

async fn get_properties(
    State(o): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(o.properties(&InstanceId(sid))?))
}

#[derive(Debug, Serialize)]
struct PropertiesUpdated {
    fails: BTreeMap<String, String>,
}

async fn patch_properties(
    State(o): State<AppState>,
    Path(sid): Path<String>,
    Json(patch): Json<BTreeMap<String, serde_json::Value>>,
) -> ApiResult<impl IntoResponse> {
    let fails = o.update_properties(&InstanceId(sid), &patch).await?;
    Ok(Json(PropertiesUpdated { fails }))
}

async fn list_worlds(
    State(o): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(o.worlds(&InstanceId(sid))?))
}

#[derive(Debug, Deserialize)]
struct CreateWorld {
    name: String,
    #[serde(flatten)]
    generation: WorldGenerationSettings,
}

async fn create_world(
    State(o): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<CreateWorld>,
) -> ApiResult<impl IntoResponse> {
    let info = o
        .create_world(&InstanceId(sid), &body.name, body.generation)
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn change_world(
    State(o): State<AppState>,
    Path((sid, world)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    o.change_world(&InstanceId(sid), &world).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CopyWorld {
    dst: String,
}

async fn copy_world(
    State(o): State<AppState>,
    Path((sid, world)): Path<(String, String)>,
    Query(q): Query<WaitQuery>,
    Json(body): Json<CopyWorld>,
) -> ApiResult<Response> {
    respond(o.copy_world(&InstanceId(sid), &world, &body.dst)?, &q).await
}

#[derive(Debug, Deserialize)]
struct ImportWorld {
    upload_id: String,
}

async fn import_world(
    State(o): State<AppState>,
    Path(sid): Path<String>,
    Query(q): Query<WaitQuery>,
    Json(body): Json<ImportWorld>,
) -> ApiResult<Response> {
    respond(
        o.import_world(&InstanceId(sid), &UploadId(body.upload_id))?,
        &q,
    )
    .await
}

async fn create_backup(
    State(o): State<AppState>,
    Path((sid, world)): Path<(String, String)>,
    Query(q): Query<WaitQuery>,
) -> ApiResult<Response> {
    respond(o.create_backup(&InstanceId(sid), &world)?, &q).await
}

async fn server_backups(
    State(o): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(o.list_backups(Some(&InstanceId(sid)))?))
}

async fn all_backups(State(o): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(o.list_backups(None)?))
}

async fn get_backup(
    State(o): State<AppState>,
    Path(bid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(o.get_backup(&BackupId(bid))?))
}

async fn delete_backup(
    State(o): State<AppState>,
    Path(bid): Path<String>,
) -> ApiResult<StatusCode> {
    o.delete_backup(&BackupId(bid)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restore_backup(
    State(o): State<AppState>,
    Path(bid): Path<String>,
    Query(q): Query<WaitQuery>,
) -> ApiResult<Response> {
    respond(o.restore_backup(&BackupId(bid))?, &q).await
}

#[derive(Debug, Serialize)]
struct Uploaded {
    upload_id: UploadId,
    created: bool,
}

async fn upload_world(State(o): State<AppState>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let (upload_id, created) = o.upload_world(body.to_vec()).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(Uploaded { upload_id, created })))
}

async fn servers_ws(State(o): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_servers_socket(o, socket))
}

async fn handle_servers_socket(o: AppState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut last = String::new();
    let mut tick = tokio::time::interval(SERVER_LIST_POLL);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let Ok(text) = serde_json::to_string(&o.list_instances()) else {
                    continue;
                };
                if text != last {
                    if sender.send(Message::Text(text.clone())).await.is_err() {
                        break;
                    }
                    last = text;
                }
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn instance_ws(
    State(o): State<AppState>,
    Path(sid): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let id = InstanceId(sid);
    // Resolve before upgrading so an unknown id is a plain 404.
    let attached = o.attach(&id)?;
    Ok(ws.on_upgrade(move |socket| {
        handle_instance_socket(socket, attached)
            .instrument(tracing::info_span!("instance_ws", instance_id = %id))
    }))
}

#[derive(Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum Frame<'a> {
    Snapshot(&'a anvil_process::InstanceSnapshot),
}

async fn handle_instance_socket(
    socket: WebSocket,
    (snapshot, mut subs): (anvil_process::InstanceSnapshot, crate::instance::Attached),
) {
    let (mut sender, mut receiver) = socket.split();
    let Ok(first) = serde_json::to_string(&Frame::Snapshot(&snapshot)) else {
        return;
    };
    if sender.send(Message::Text(first)).await.is_err() {
        return;
    }
    drop(snapshot);

    loop {
        let event: Option<InstanceEvent> = tokio::select! {
            e = subs.output.recv() => e,
            e = subs.metrics.recv() => e,
            e = subs.players.recv() => e,
            e = subs.status.recv() => e,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        };
        let Some(event) = event else {
            // Instance was deleted.
            break;
        };
        let Ok(text) = serde_json::to_string(&event) else {
            continue;
        };
        if sender.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
    tracing::debug!(
        dropped = subs.output.dropped() + subs.metrics.dropped() + subs.players.dropped() + subs.status.dropped(),
        "instance websocket closed"
    );
}
