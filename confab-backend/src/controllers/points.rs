use actix_web::{web, HttpRequest, HttpResponse, Responder};
use chrono::Utc;
use serde::Deserialize;

use crate::controllers::error_response;
use crate::middleware::session_auth::authenticate;
use crate::models::{AwardContext, PendingAction};
use crate::points::Action;
use crate::AppState;

#[derive(Deserialize)]
pub struct ClaimActionRequest {
    action: String,
}

#[derive(Deserialize)]
pub struct ClaimPendingRequest {
    #[serde(default)]
    actions: Vec<PendingAction>,
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/points")
            .route("/me", web::get().to(my_points))
            .route("/award", web::post().to(claim_action))
            .route("/claim-pending", web::post().to(claim_pending)),
    );
}

/// Points summed over every account linked to the caller
async fn my_points(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    let auth = match authenticate(&state, &req) {
        Ok(auth) => auth,
        Err(resp) => return resp,
    };

    match state.points.aggregate(&auth.canonical_id) {
        Ok(summary) => HttpResponse::Ok().json(summary),
        Err(e) => error_response(&e),
    }
}

async fn claim_action(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<ClaimActionRequest>,
) -> impl Responder {
    let auth = match authenticate(&state, &req) {
        Ok(auth) => auth,
        Err(resp) => return resp,
    };

    let action = match body.action.parse::<Action>() {
        Ok(action) => action,
        Err(_) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": format!("Unknown action '{}'", body.action)
            }));
        }
    };
    // Everything else is awarded by the server when the thing actually happens
    if !action.client_claimable() {
        return HttpResponse::Forbidden().json(serde_json::json!({
            "error": format!("{} cannot be claimed by the client", action)
        }));
    }

    match state
        .points
        .award(&auth.platform_user_id, auth.platform, action, &AwardContext::default())
    {
        Ok(result) => HttpResponse::Ok().json(result),
        Err(e) => error_response(&e),
    }
}

async fn claim_pending(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<ClaimPendingRequest>,
) -> impl Responder {
    let auth = match authenticate(&state, &req) {
        Ok(auth) => auth,
        Err(resp) => return resp,
    };

    match state
        .points
        .claim_pending(&auth.platform_user_id, auth.platform, &body.actions, Utc::now())
    {
        Ok(result) => HttpResponse::Ok().json(result),
        Err(e) => error_response(&e),
    }
}
