use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde::{Deserialize, Serialize};

use crate::agents::catalog::SKILLS;
use crate::agents::LedgerOutcome;
use crate::controllers::{error_response, payment_required_response};
use crate::middleware::session_auth::{authenticate, require_admin, AuthContext};
use crate::models::{BoostEventRequest, ClaimAgentRequest, PrizeRequest, PurchaseSkillRequest, RecommendRequest, TipRequest};
use crate::points::Action;
use crate::AppState;

const DEFAULT_TX_LIMIT: i64 = 50;
const MAX_TX_LIMIT: i64 = 500;

#[derive(Deserialize)]
pub struct TransactionsQuery {
    limit: Option<i64>,
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/agents")
            .route("/claim", web::post().to(claim))
            .route("/skills", web::get().to(list_skills))
            .route("/me", web::get().to(my_agent))
            .route("/{slot}", web::get().to(get_agent))
            .route("/{slot}/purchase", web::post().to(purchase))
            .route("/{slot}/boost", web::post().to(boost))
            .route("/{slot}/recommend", web::post().to(recommend))
            .route("/{slot}/tip", web::post().to(tip))
            .route("/{slot}/transactions", web::get().to(transactions))
            .route("/{slot}/prize", web::post().to(prize))
            .route("/{slot}/ledger", web::get().to(ledger_check)),
    );
}

fn outcome_response<T: Serialize>(outcome: LedgerOutcome<T>) -> HttpResponse {
    match outcome {
        LedgerOutcome::Completed(value) => HttpResponse::Ok().json(value),
        LedgerOutcome::PaymentRequired(required) => payment_required_response(&required),
    }
}

/// Session plus ownership of the slot in the path
fn owner_of(state: &AppState, req: &HttpRequest, slot: i64) -> Result<AuthContext, HttpResponse> {
    let auth = authenticate(state, req)?;
    state
        .agents
        .authorize(slot, &auth.canonical_id)
        .map_err(|e| error_response(&e))?;
    Ok(auth)
}

async fn claim(state: web::Data<AppState>, req: HttpRequest, body: web::Json<ClaimAgentRequest>) -> impl Responder {
    let auth = match authenticate(&state, &req) {
        Ok(auth) => auth,
        Err(resp) => return resp,
    };

    match state.agents.claim(&auth.canonical_id, body.display_name.as_deref()) {
        Ok(agent) => {
            state
                .tasks
                .award(&auth.platform_user_id, auth.platform, Action::AgentClaimed, None);
            HttpResponse::Created().json(agent)
        }
        Err(e) => error_response(&e),
    }
}

async fn list_skills() -> impl Responder {
    HttpResponse::Ok().json(&SKILLS)
}

async fn my_agent(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    let auth = match authenticate(&state, &req) {
        Ok(auth) => auth,
        Err(resp) => return resp,
    };

    match state.agents.owned_by(&auth.canonical_id) {
        Ok(Some(agent)) => HttpResponse::Ok().json(agent),
        Ok(None) => HttpResponse::NotFound().json(serde_json::json!({
            "error": "No agent claimed yet"
        })),
        Err(e) => error_response(&e),
    }
}

async fn get_agent(state: web::Data<AppState>, path: web::Path<i64>) -> impl Responder {
    match state.agents.get(path.into_inner()) {
        Ok(agent) => HttpResponse::Ok().json(agent),
        Err(e) => error_response(&e),
    }
}

async fn purchase(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    body: web::Json<PurchaseSkillRequest>,
) -> impl Responder {
    let slot = path.into_inner();
    if let Err(resp) = owner_of(&state, &req, slot) {
        return resp;
    }

    match state
        .agents
        .purchase(slot, &body.skill, body.payment_tx.as_deref())
        .await
    {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => error_response(&e),
    }
}

async fn boost(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    body: web::Json<BoostEventRequest>,
) -> impl Responder {
    let slot = path.into_inner();
    if let Err(resp) = owner_of(&state, &req, slot) {
        return resp;
    }

    match state.agents.boost_event(slot, &body.event_id) {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => error_response(&e),
    }
}

async fn recommend(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    body: web::Json<RecommendRequest>,
) -> impl Responder {
    let slot = path.into_inner();
    if let Err(resp) = owner_of(&state, &req, slot) {
        return resp;
    }

    match state.agents.recommend(slot, body.target_slot) {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => error_response(&e),
    }
}

async fn tip(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    body: web::Json<TipRequest>,
) -> impl Responder {
    let slot = path.into_inner();
    if let Err(resp) = owner_of(&state, &req, slot) {
        return resp;
    }

    let body = body.into_inner();
    match state.agents.tip(slot, body.to_slot, body.amount, body.note) {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => error_response(&e),
    }
}

async fn transactions(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    query: web::Query<TransactionsQuery>,
) -> impl Responder {
    let slot = path.into_inner();
    if let Err(resp) = owner_of(&state, &req, slot) {
        return resp;
    }

    let limit = query.limit.unwrap_or(DEFAULT_TX_LIMIT).clamp(1, MAX_TX_LIMIT);
    match state.agents.transactions(slot, limit) {
        Ok(txs) => HttpResponse::Ok().json(txs),
        Err(e) => error_response(&e),
    }
}

async fn prize(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    body: web::Json<PrizeRequest>,
) -> impl Responder {
    if let Err(resp) = require_admin(&state, &req) {
        return resp;
    }

    match state.agents.prize(path.into_inner(), body.amount, &body.reason) {
        Ok(tx) => HttpResponse::Ok().json(tx),
        Err(e) => error_response(&e),
    }
}

async fn ledger_check(state: web::Data<AppState>, req: HttpRequest, path: web::Path<i64>) -> impl Responder {
    if let Err(resp) = require_admin(&state, &req) {
        return resp;
    }

    match state.agents.ledger_check(path.into_inner()) {
        Ok(check) => HttpResponse::Ok().json(check),
        Err(e) => error_response(&e),
    }
}
