// Request authentication helpers.
// Handlers call these directly; the resulting AuthContext is passed down
// explicitly instead of living in any shared state.

use actix_web::{HttpRequest, HttpResponse};

use crate::controllers::error_response;
use crate::models::Platform;
use crate::AppState;

pub const PROVIDER_KEY_HEADER: &str = "X-Provider-Key";
pub const ADMIN_KEY_HEADER: &str = "X-Admin-Key";

/// Who is calling, resolved per request from the bearer token
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub platform_user_id: String,
    pub platform: Platform,
    pub canonical_id: String,
}

pub fn extract_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim_start_matches("Bearer ").to_string())
        .filter(|s| !s.is_empty())
}

pub fn authenticate(state: &AppState, req: &HttpRequest) -> Result<AuthContext, HttpResponse> {
    let token = extract_token(req).ok_or_else(|| {
        HttpResponse::Unauthorized().json(serde_json::json!({
            "error": "No authorization token provided"
        }))
    })?;

    let session = match state.db.validate_session(&token) {
        Ok(Some(session)) => session,
        Ok(None) => {
            return Err(HttpResponse::Unauthorized().json(serde_json::json!({
                "error": "Invalid or expired session"
            })));
        }
        Err(e) => {
            log::error!("Session validation error: {}", e);
            return Err(HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "Internal server error"
            })));
        }
    };

    let platform = Platform::from_user_id(&session.platform_user_id).ok_or_else(|| {
        log::error!("Session bound to malformed user id {}", session.platform_user_id);
        HttpResponse::Unauthorized().json(serde_json::json!({
            "error": "Invalid session"
        }))
    })?;

    // Merges can re-point the account, so look the canonical id up every time
    let canonical_id = state
        .identities
        .canonical_of(&session.platform_user_id)
        .map_err(|e| error_response(&e))?;

    Ok(AuthContext {
        platform_user_id: session.platform_user_id,
        platform,
        canonical_id,
    })
}

fn require_key(req: &HttpRequest, header: &str, expected: &str) -> Result<(), HttpResponse> {
    let presented = req.headers().get(header).and_then(|h| h.to_str().ok());
    match presented {
        Some(key) if !expected.is_empty() && key == expected => Ok(()),
        _ => Err(HttpResponse::Unauthorized().json(serde_json::json!({
            "error": format!("Missing or invalid {}", header)
        }))),
    }
}

/// Login providers authenticate with a shared key
pub fn require_provider(state: &AppState, req: &HttpRequest) -> Result<(), HttpResponse> {
    require_key(req, PROVIDER_KEY_HEADER, &state.config.provider_api_key)
}

pub fn require_admin(state: &AppState, req: &HttpRequest) -> Result<(), HttpResponse> {
    require_key(req, ADMIN_KEY_HEADER, &state.config.admin_api_key)
}
