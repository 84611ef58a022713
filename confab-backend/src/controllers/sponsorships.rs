use actix_web::{web, HttpRequest, HttpResponse, Responder};

use crate::controllers::error_response;
use crate::middleware::session_auth::{authenticate, require_admin};
use crate::models::{SubmitSponsorshipRequest, TargetType};
use crate::AppState;

pub fn config(cfg: &mut web::ServiceConfig) {
    // Literal paths go before the `{id}` matcher
    cfg.service(
        web::scope("/api/sponsorships")
            .route("", web::post().to(submit))
            .route("/featured", web::get().to(featured))
            .route("/totals/{target_type}/{target_id}", web::get().to(totals))
            .route("/{id}", web::get().to(get_sponsorship))
            .route("/{id}/reverify", web::post().to(reverify)),
    );
}

/// Store the claim as pending; the chain check runs on the task queue
async fn submit(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<SubmitSponsorshipRequest>,
) -> impl Responder {
    let auth = match authenticate(&state, &req) {
        Ok(auth) => auth,
        Err(resp) => return resp,
    };

    match state.verifier.submit(
        &auth.platform_user_id,
        &body.target_type,
        &body.target_id,
        body.amount,
        &body.tx_reference,
    ) {
        Ok(sponsorship) => HttpResponse::Accepted().json(sponsorship),
        Err(e) => error_response(&e),
    }
}

async fn get_sponsorship(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.verifier.get(&path.into_inner()) {
        Ok(sponsorship) => HttpResponse::Ok().json(sponsorship),
        Err(e) => error_response(&e),
    }
}

async fn featured(state: web::Data<AppState>) -> impl Responder {
    match state.verifier.current_featured() {
        Ok(featured) => HttpResponse::Ok().json(serde_json::json!({ "featured": featured })),
        Err(e) => error_response(&e),
    }
}

async fn totals(state: web::Data<AppState>, path: web::Path<(String, String)>) -> impl Responder {
    let (target_type, target_id) = path.into_inner();
    let target_type = match target_type.parse::<TargetType>() {
        Ok(t) => t,
        Err(_) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": format!("Unknown target type '{}'", target_type)
            }));
        }
    };

    match state.verifier.sponsor_total(target_type, &target_id) {
        Ok(total) => HttpResponse::Ok().json(total),
        Err(e) => error_response(&e),
    }
}

async fn reverify(state: web::Data<AppState>, req: HttpRequest, path: web::Path<String>) -> impl Responder {
    if let Err(resp) = require_admin(&state, &req) {
        return resp;
    }

    match state.verifier.reverify(&path.into_inner()) {
        Ok(sponsorship) => HttpResponse::Accepted().json(sponsorship),
        Err(e) => error_response(&e),
    }
}
