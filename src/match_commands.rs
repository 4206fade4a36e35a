use crate::config::now_ms;
use crate::draft::ResultInput;
use crate::error::{MatchError, MatchResult};
use crate::friendly::FriendlyStart;
use crate::orchestrator::{CleanMode, Orchestrator, StartCheckIn, StuckMatch};
use crate::overlay::OverlayServerState;
use crate::pool_generator::{parse_tier_catalogs, GeneratedPools};
use crate::rounds::RoundInfo;
use crate::session::InputWindow;
use crate::types::*;
use axum::{
    extract::State as AxumState,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ── Helpers ─────────────────────────────────────────────────────────────

/// A rejected action, rendered as `{ "error": ..., "kind": ... }`.
#[derive(Debug)]
pub struct CommandError(pub MatchError);

impl From<MatchError> for CommandError {
    fn from(e: MatchError) -> Self {
        CommandError(e)
    }
}

pub fn status_for(error: &MatchError) -> StatusCode {
    match error {
        MatchError::Validation(_) | MatchError::Config(_) => StatusCode::BAD_REQUEST,
        MatchError::Conflict(_) => StatusCode::CONFLICT,
        MatchError::NotFound(_) => StatusCode::NOT_FOUND,
        MatchError::Stalled(_) => StatusCode::LOCKED,
        MatchError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
        MatchError::Resume(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for CommandError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.0.to_string(), "kind": self.0.kind() });
        (status_for(&self.0), Json(body)).into_response()
    }
}

type CommandResult<T> = Result<Json<T>, CommandError>;

/// Lock the orchestrator, then call `f` with `(&mut Orchestrator, now_ms)`.
fn with_orchestrator<F, R>(state: &OverlayServerState, f: F) -> CommandResult<R>
where
    F: FnOnce(&mut Orchestrator, u64) -> MatchResult<R>,
{
    let now = now_ms();
    let mut guard = state.orchestrator.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard, now).map(Json).map_err(CommandError)
}

// ── Bodies ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameBody {
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedBody {
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefereeBody {
    pub referee_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInBody {
    pub slot: Slot,
    pub player_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanOrderBody {
    pub player_id: String,
    pub go_first: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerChartBody {
    pub player_id: String,
    pub chart: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerBody {
    pub player_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndBody {
    pub referee_id: String,
    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartBody {
    pub referee_id: String,
    pub match_id: u64,
    pub channel_ref: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanBody {
    pub mode: CleanMode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendlyChartBody {
    pub referee_id: String,
    pub slot: Slot,
    pub chart: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendlySlotBody {
    pub referee_id: String,
    pub slot: Slot,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendlyResultBody {
    pub referee_id: String,
    #[serde(flatten)]
    pub result: ResultInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSummary {
    pub charts: usize,
}

// ── Routes ──────────────────────────────────────────────────────────────

pub fn api_router() -> Router<OverlayServerState> {
    Router::new()
        .route("/events", get(list_events).post(create_event))
        .route("/events/switch", post(switch_event))
        .route("/rounds", get(list_rounds))
        .route("/catalogs", post(upload_catalogs))
        .route("/catalogs/reload", post(reload_catalogs))
        .route("/pools", get(get_pools))
        .route("/pools/generate", post(generate_pools))
        .route("/match/start", post(start_check_in))
        .route("/match/check-in", post(check_in))
        .route("/match/approve", post(approve))
        .route("/match/reject", post(reject))
        .route("/match/ban-order", post(choose_ban_order))
        .route("/match/ban", post(ban))
        .route("/match/pick", post(pick))
        .route("/match/ready", post(ready))
        .route("/match/result", post(submit_result))
        .route("/match/end", post(end_match))
        .route("/match/rearm", post(rearm))
        .route("/match/restart", post(restart_match))
        .route("/match/window", get(current_window))
        .route("/match/stuck", get(stuck_matches))
        .route("/match/clean", post(clean_stuck))
        .route("/friendly/start", post(start_friendly))
        .route("/friendly/ban", post(friendly_ban))
        .route("/friendly/pick", post(friendly_pick))
        .route("/friendly/ready", post(friendly_ready))
        .route("/friendly/result", post(friendly_result))
        .route("/friendly/end", post(end_friendly))
        .route("/friendly/rearm", post(rearm_friendly))
}

// ── Events, catalogs, pools ─────────────────────────────────────────────

async fn list_events(AxumState(state): AxumState<OverlayServerState>) -> CommandResult<Vec<Event>> {
    with_orchestrator(&state, |orch, _| Ok(orch.list_events()))
}

async fn create_event(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<NameBody>,
) -> CommandResult<Event> {
    with_orchestrator(&state, |orch, now| orch.create_event(&body.name, now))
}

async fn switch_event(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<NameBody>,
) -> CommandResult<Event> {
    with_orchestrator(&state, |orch, _| orch.switch_event(&body.name))
}

async fn list_rounds(AxumState(state): AxumState<OverlayServerState>) -> CommandResult<Vec<RoundInfo>> {
    with_orchestrator(&state, |orch, _| Ok(orch.rounds().to_vec()))
}

/// Body is a catalog file: a JSON object of tier number to chart list.
async fn upload_catalogs(AxumState(state): AxumState<OverlayServerState>, body: String) -> CommandResult<CatalogSummary> {
    with_orchestrator(&state, |orch, _| {
        let catalogs = parse_tier_catalogs(&body).map_err(MatchError::Config)?;
        Ok(CatalogSummary { charts: orch.set_catalogs(catalogs)? })
    })
}

async fn reload_catalogs(AxumState(state): AxumState<OverlayServerState>) -> CommandResult<CatalogSummary> {
    with_orchestrator(&state, |orch, _| Ok(CatalogSummary { charts: orch.reload_catalogs()? }))
}

async fn get_pools(AxumState(state): AxumState<OverlayServerState>) -> CommandResult<Option<GeneratedPools>> {
    with_orchestrator(&state, |orch, _| Ok(orch.pools().cloned()))
}

async fn generate_pools(
    AxumState(state): AxumState<OverlayServerState>,
    body: Option<Json<SeedBody>>,
) -> CommandResult<GeneratedPools> {
    let seed = body.and_then(|Json(body)| body.seed);
    with_orchestrator(&state, |orch, now| orch.generate_pools(seed, now))
}

// ── Ranked ──────────────────────────────────────────────────────────────

async fn start_check_in(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<StartCheckIn>,
) -> CommandResult<MatchDoc> {
    with_orchestrator(&state, |orch, now| orch.start_check_in(body, now))
}

async fn check_in(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<CheckInBody>,
) -> CommandResult<MatchDoc> {
    with_orchestrator(&state, |orch, now| orch.check_in(body.slot, &body.player_id, now))
}

async fn approve(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<RefereeBody>,
) -> CommandResult<MatchDoc> {
    with_orchestrator(&state, |orch, now| orch.approve(&body.referee_id, now))
}

async fn reject(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<RefereeBody>,
) -> CommandResult<Value> {
    with_orchestrator(&state, |orch, _| {
        orch.reject(&body.referee_id)?;
        Ok(json!({ "cancelled": true }))
    })
}

async fn choose_ban_order(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<BanOrderBody>,
) -> CommandResult<MatchDoc> {
    with_orchestrator(&state, |orch, now| orch.choose_ban_order(&body.player_id, body.go_first, now))
}

async fn ban(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<PlayerChartBody>,
) -> CommandResult<MatchDoc> {
    with_orchestrator(&state, |orch, now| orch.ban(&body.player_id, &body.chart, now))
}

async fn pick(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<PlayerChartBody>,
) -> CommandResult<MatchDoc> {
    with_orchestrator(&state, |orch, now| orch.pick(&body.player_id, &body.chart, now))
}

async fn ready(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<PlayerBody>,
) -> CommandResult<MatchDoc> {
    with_orchestrator(&state, |orch, now| orch.ready(&body.player_id, now))
}

async fn submit_result(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<ResultInput>,
) -> CommandResult<MatchDoc> {
    with_orchestrator(&state, |orch, now| orch.submit_result(&body, now))
}

async fn end_match(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<EndBody>,
) -> CommandResult<Option<MatchDoc>> {
    with_orchestrator(&state, |orch, now| orch.end_match(&body.referee_id, body.delete, now))
}

async fn rearm(AxumState(state): AxumState<OverlayServerState>) -> CommandResult<Option<InputWindow>> {
    with_orchestrator(&state, |orch, now| orch.rearm(now))
}

async fn restart_match(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<RestartBody>,
) -> CommandResult<MatchDoc> {
    with_orchestrator(&state, |orch, now| {
        orch.restart_match(&body.referee_id, body.match_id, &body.channel_ref, now)
    })
}

async fn current_window(AxumState(state): AxumState<OverlayServerState>) -> CommandResult<Option<InputWindow>> {
    with_orchestrator(&state, |orch, _| Ok(orch.window()))
}

async fn stuck_matches(AxumState(state): AxumState<OverlayServerState>) -> CommandResult<Vec<StuckMatch>> {
    with_orchestrator(&state, |orch, _| orch.stuck_matches())
}

async fn clean_stuck(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<CleanBody>,
) -> CommandResult<Vec<u64>> {
    with_orchestrator(&state, |orch, now| orch.clean_stuck(body.mode, now))
}

// ── Friendly ────────────────────────────────────────────────────────────

async fn start_friendly(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<FriendlyStart>,
) -> CommandResult<MatchDoc> {
    with_orchestrator(&state, |orch, now| orch.start_friendly(body, now))
}

async fn friendly_ban(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<FriendlyChartBody>,
) -> CommandResult<MatchDoc> {
    with_orchestrator(&state, |orch, now| orch.friendly_ban(&body.referee_id, body.slot, &body.chart, now))
}

async fn friendly_pick(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<FriendlyChartBody>,
) -> CommandResult<MatchDoc> {
    with_orchestrator(&state, |orch, now| orch.friendly_pick(&body.referee_id, body.slot, &body.chart, now))
}

async fn friendly_ready(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<FriendlySlotBody>,
) -> CommandResult<MatchDoc> {
    with_orchestrator(&state, |orch, now| orch.friendly_ready(&body.referee_id, body.slot, now))
}

async fn friendly_result(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<FriendlyResultBody>,
) -> CommandResult<MatchDoc> {
    with_orchestrator(&state, |orch, now| orch.friendly_result(&body.referee_id, &body.result, now))
}

async fn end_friendly(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<EndBody>,
) -> CommandResult<Option<MatchDoc>> {
    with_orchestrator(&state, |orch, now| orch.end_friendly(&body.referee_id, body.delete, now))
}

async fn rearm_friendly(
    AxumState(state): AxumState<OverlayServerState>,
    Json(body): Json<RefereeBody>,
) -> CommandResult<Option<InputWindow>> {
    with_orchestrator(&state, |orch, now| orch.rearm_friendly(&body.referee_id, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::make_orchestrator;
    use crate::store::MemoryStore;
    use std::sync::{Arc, Mutex};

    fn command_state() -> OverlayServerState {
        let orchestrator = make_orchestrator(&MemoryStore::new());
        let publisher = orchestrator.publisher().clone();
        OverlayServerState {
            orchestrator: Arc::new(Mutex::new(orchestrator)),
            publisher,
        }
    }

    #[test]
    fn test_error_kinds_map_to_status_codes() {
        assert_eq!(status_for(&MatchError::validation("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&MatchError::conflict("x")), StatusCode::CONFLICT);
        assert_eq!(status_for(&MatchError::not_found("x")), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&MatchError::Stalled("Pick".into())), StatusCode::LOCKED);
        assert_eq!(status_for(&MatchError::Persistence("x".into())), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_rejection_body_carries_message_and_kind() {
        let response = CommandError(MatchError::conflict("A match is already in progress for this event!"))
            .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["kind"], "conflict");
        assert_eq!(body["error"], "A match is already in progress for this event!");
    }

    #[tokio::test]
    async fn test_start_then_duplicate_start_conflicts() {
        let state = command_state();
        let request: StartCheckIn = serde_json::from_value(json!({
            "refereeId": "ref",
            "channelRef": "channel-1",
            "round": "test – bo3",
            "matchNumber": 1,
            "playerNames": ["Alice", "Bob"],
        }))
        .unwrap();
        let Json(doc) = start_check_in(AxumState(state.clone()), Json(request.clone())).await.unwrap();
        assert_eq!(doc.meta.best_of, 3);

        let err = start_check_in(AxumState(state), Json(request)).await.unwrap_err();
        assert!(matches!(err.0, MatchError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_friendly_result_body_flattens_scores() {
        let body: FriendlyResultBody = serde_json::from_value(json!({
            "refereeId": "ref-a",
            "score1": 100,
            "score2": 90,
            "fc1": true,
        }))
        .unwrap();
        assert_eq!(body.result.score1, 100);
        assert!(body.result.fc1);
        assert!(!body.result.pfc2);

        let state = command_state();
        let err = friendly_result(AxumState(state), Json(body)).await.unwrap_err();
        assert!(matches!(err.0, MatchError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_events_listed_newest_first() {
        let state = command_state();
        create_event(AxumState(state.clone()), Json(NameBody { name: "Summer Cup".into() }))
            .await
            .unwrap();
        let Json(events) = list_events(AxumState(state)).await.unwrap();
        let names: Vec<&str> = events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Summer Cup", "Spring Cup"]);
    }
}
