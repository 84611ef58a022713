//! Wallet sign-in for the web platform: sign a server challenge with an
//! Ethereum key and receive a bearer token bound to `web_<address>`.

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use chrono::Utc;
use ethers::core::types::Signature;
use ethers::utils::hash_message;
use serde::{Deserialize, Serialize};

use crate::middleware::session_auth::extract_token;
use crate::models::{Platform, ResolveHints};
use crate::points::Action;
use crate::AppState;

const SERVICE_NAME: &str = "Confab";

#[derive(Deserialize)]
pub struct GenerateChallengeRequest {
    public_address: String,
}

#[derive(Serialize)]
pub struct ChallengeResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    challenge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Deserialize)]
pub struct ValidateAuthRequest {
    public_address: String,
    challenge: String,
    signature: String,
}

#[derive(Serialize, Default)]
pub struct LoginResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    canonical_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl LoginResponse {
    fn failed(error: &str) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Deserialize)]
pub struct LogoutRequest {
    token: String,
}

#[derive(Serialize)]
pub struct LogoutResponse {
    success: bool,
}

#[derive(Serialize)]
pub struct ValidateResponse {
    valid: bool,
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/auth")
            .route("/generate_challenge", web::post().to(generate_challenge))
            .route("/validate_auth", web::post().to(validate_auth))
            .route("/logout", web::post().to(logout))
            .route("/validate", web::get().to(validate)),
    );
}

fn generate_challenge_text(public_address: &str, unix_timestamp: i64) -> String {
    format!(
        "Signing in to {} as {} at {}",
        SERVICE_NAME,
        public_address.to_lowercase(),
        unix_timestamp
    )
}

fn is_address(value: &str) -> bool {
    value.len() == 42 && value.starts_with("0x") && value[2..].chars().all(|c| c.is_ascii_hexdigit())
}

fn recover_address(msg: &str, signature: &str) -> Option<String> {
    let sig_bytes = hex::decode(signature.strip_prefix("0x").unwrap_or(signature)).ok()?;
    let sig = Signature::try_from(sig_bytes.as_slice()).ok()?;

    let msg_hash = hash_message(msg);
    let recovered = sig.recover(msg_hash).ok()?;

    Some(format!("{:?}", recovered).to_lowercase())
}

async fn generate_challenge(
    state: web::Data<AppState>,
    body: web::Json<GenerateChallengeRequest>,
) -> impl Responder {
    let public_address = body.public_address.trim().to_lowercase();

    if !is_address(&public_address) {
        return HttpResponse::BadRequest().json(ChallengeResponse {
            success: false,
            challenge: None,
            error: Some("Invalid public address".to_string()),
        });
    }

    let challenge = generate_challenge_text(&public_address, Utc::now().timestamp());

    match state.db.create_or_update_challenge(&public_address, &challenge) {
        Ok(_) => HttpResponse::Ok().json(ChallengeResponse {
            success: true,
            challenge: Some(challenge),
            error: None,
        }),
        Err(e) => {
            log::error!("Failed to create challenge: {}", e);
            HttpResponse::InternalServerError().json(ChallengeResponse {
                success: false,
                challenge: None,
                error: Some("Database error".to_string()),
            })
        }
    }
}

async fn validate_auth(
    state: web::Data<AppState>,
    body: web::Json<ValidateAuthRequest>,
) -> impl Responder {
    let public_address = body.public_address.trim().to_lowercase();

    if !is_address(&public_address) {
        return HttpResponse::BadRequest().json(LoginResponse::failed("Invalid public address"));
    }

    match state.db.get_challenge(&public_address) {
        Ok(Some(stored)) if stored == body.challenge => {}
        Ok(_) => {
            return HttpResponse::Unauthorized()
                .json(LoginResponse::failed("No active challenge found or challenge mismatch"));
        }
        Err(e) => {
            log::error!("Failed to load challenge: {}", e);
            return HttpResponse::InternalServerError().json(LoginResponse::failed("Database error"));
        }
    }

    let recovered_address = recover_address(&body.challenge, &body.signature);
    if recovered_address.as_deref() != Some(public_address.as_str()) {
        return HttpResponse::Unauthorized().json(LoginResponse::failed("Invalid signature"));
    }

    // Challenges are single use
    if let Err(e) = state.db.delete_challenge(&public_address) {
        log::warn!("Failed to delete used challenge for {}: {}", public_address, e);
    }

    let platform_user_id = Platform::Web.user_id(&public_address);
    let canonical_id = match state.identities.resolve(&platform_user_id, &ResolveHints::default()) {
        Ok(id) => id,
        Err(e) => {
            log::error!("Failed to resolve identity for {}: {}", platform_user_id, e);
            return HttpResponse::ServiceUnavailable().json(LoginResponse::failed("Identity unavailable"));
        }
    };

    match state.db.create_session(&platform_user_id, state.config.session_ttl_hours) {
        Ok(session) => {
            state
                .tasks
                .award(&platform_user_id, Platform::Web, Action::DailyLogin, None);
            HttpResponse::Ok().json(LoginResponse {
                success: true,
                token: Some(session.token),
                expires_at: Some(session.expires_at.timestamp()),
                canonical_id: Some(canonical_id),
                error: None,
            })
        }
        Err(e) => {
            log::error!("Failed to create session: {}", e);
            HttpResponse::InternalServerError().json(LoginResponse::failed("Failed to create session"))
        }
    }
}

async fn logout(state: web::Data<AppState>, body: web::Json<LogoutRequest>) -> impl Responder {
    match state.db.delete_session(&body.token) {
        Ok(_) => HttpResponse::Ok().json(LogoutResponse { success: true }),
        Err(e) => {
            log::error!("Failed to delete session: {}", e);
            HttpResponse::InternalServerError().json(LogoutResponse { success: false })
        }
    }
}

async fn validate(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    let Some(token) = extract_token(&req) else {
        return HttpResponse::Ok().json(ValidateResponse { valid: false });
    };

    match state.db.validate_session(&token) {
        Ok(Some(_)) => HttpResponse::Ok().json(ValidateResponse { valid: true }),
        Ok(None) => HttpResponse::Ok().json(ValidateResponse { valid: false }),
        Err(e) => {
            log::error!("Failed to validate session: {}", e);
            HttpResponse::Ok().json(ValidateResponse { valid: false })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::{LocalWallet, Signer};

    #[test]
    fn test_challenge_text() {
        assert_eq!(
            generate_challenge_text("0xABCDEF0000000000000000000000000000000001", 1700000000),
            "Signing in to Confab as 0xabcdef0000000000000000000000000000000001 at 1700000000"
        );
    }

    #[test]
    fn test_address_shape() {
        assert!(is_address("0x1111111111111111111111111111111111111111"));
        assert!(!is_address("0x11"));
        assert!(!is_address("0xzz11111111111111111111111111111111111111"));
    }

    #[tokio::test]
    async fn test_recover_signed_challenge() {
        let wallet: LocalWallet = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
            .parse()
            .unwrap();
        let address = format!("{:?}", wallet.address()).to_lowercase();
        let challenge = generate_challenge_text(&address, 1700000000);
        let signature = wallet.sign_message(&challenge).await.unwrap();

        let recovered = recover_address(&challenge, &signature.to_string());
        assert_eq!(recovered.as_deref(), Some(address.as_str()));
        assert_ne!(
            recover_address("something else", &signature.to_string()).as_deref(),
            Some(address.as_str())
        );
    }
}
