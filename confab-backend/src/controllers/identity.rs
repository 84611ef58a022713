use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde::Serialize;

use crate::controllers::error_response;
use crate::middleware::session_auth::{authenticate, require_provider};
use crate::models::{IdentityResponse, LinkageRecord, Platform, ProviderLoginRequest, ResolveHints};
use crate::points::Action;
use crate::AppState;

#[derive(Serialize)]
struct ProviderLoginResponse {
    token: String,
    expires_at: i64,
    platform_user_id: String,
    identity: IdentityResponse,
}

#[derive(Serialize)]
struct MeResponse {
    #[serde(flatten)]
    identity: IdentityResponse,
    missing_platforms: Vec<Platform>,
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/identities")
            .route("/login", web::post().to(provider_login))
            .route("/merge", web::post().to(merge))
            .route("/me", web::get().to(me)),
    );
}

/// A login provider has verified a platform user; resolve and sign them in
async fn provider_login(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<ProviderLoginRequest>,
) -> impl Responder {
    if let Err(resp) = require_provider(&state, &req) {
        return resp;
    }

    let native_id = body.native_id.trim();
    if native_id.is_empty() {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "native_id is required"
        }));
    }
    let platform_user_id = body.platform.user_id(native_id);
    let hints = ResolveHints {
        external_auth_id: body.external_auth_id.clone(),
        display_name: body.display_name.clone(),
    };

    let canonical_id = match state.identities.resolve(&platform_user_id, &hints) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    let linked = match state.identities.linked_accounts(&canonical_id) {
        Ok(linked) => linked,
        Err(e) => return error_response(&e),
    };

    match state.db.create_session(&platform_user_id, state.config.session_ttl_hours) {
        Ok(session) => {
            state
                .tasks
                .award(&platform_user_id, body.platform, Action::DailyLogin, None);
            HttpResponse::Ok().json(ProviderLoginResponse {
                token: session.token,
                expires_at: session.expires_at.timestamp(),
                platform_user_id,
                identity: IdentityResponse::from(&linked),
            })
        }
        Err(e) => {
            log::error!("Failed to create session for {}: {}", platform_user_id, e);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "Failed to create session"
            }))
        }
    }
}

/// Apply the auth provider's full linkage record
async fn merge(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<LinkageRecord>,
) -> impl Responder {
    if let Err(resp) = require_provider(&state, &req) {
        return resp;
    }

    let outcome = match state.identities.merge_all(&body) {
        Ok(outcome) => outcome,
        Err(e) => return error_response(&e),
    };

    // Each account earns the linking bonus once per person it joins
    if outcome.platform_user_ids.len() > 1 {
        for credential in &body.accounts {
            state.tasks.award(
                &credential.platform_user_id(),
                credential.platform,
                Action::AccountLinked,
                Some(outcome.canonical_id.clone()),
            );
        }
    }

    match state.identities.linked_accounts(&outcome.canonical_id) {
        Ok(linked) => HttpResponse::Ok().json(IdentityResponse::from(&linked)),
        Err(e) => error_response(&e),
    }
}

async fn me(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    let auth = match authenticate(&state, &req) {
        Ok(auth) => auth,
        Err(resp) => return resp,
    };

    match state.identities.linked_accounts(&auth.canonical_id) {
        Ok(linked) => HttpResponse::Ok().json(MeResponse {
            identity: IdentityResponse::from(&linked),
            missing_platforms: linked.missing_platforms(),
        }),
        Err(e) => error_response(&e),
    }
}
