pub mod activity;
pub mod agents;
pub mod auth;
pub mod health;
pub mod identity;
pub mod points;
pub mod sponsorships;

use actix_web::HttpResponse;

use crate::error::CoreError;
use crate::models::PaymentRequired;

/// Map a core failure onto an HTTP answer
pub fn error_response(err: &CoreError) -> HttpResponse {
    match err {
        CoreError::NotFound(_) => HttpResponse::NotFound().json(serde_json::json!({
            "error": err.to_string()
        })),
        CoreError::Forbidden(_) => HttpResponse::Forbidden().json(serde_json::json!({
            "error": err.to_string()
        })),
        CoreError::Conflict(_) => HttpResponse::Conflict().json(serde_json::json!({
            "error": err.to_string()
        })),
        CoreError::InvalidInput(_) | CoreError::Invariant(_) => HttpResponse::BadRequest().json(serde_json::json!({
            "error": err.to_string()
        })),
        CoreError::Unavailable(_) => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "error": err.to_string(),
            "retryable": true
        })),
        CoreError::Store(e) => {
            log::error!("Storage error: {}", e);
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "error": "Storage temporarily unavailable",
                "retryable": true
            }))
        }
    }
}

pub fn payment_required_response(required: &PaymentRequired) -> HttpResponse {
    HttpResponse::PaymentRequired().json(serde_json::json!({
        "error": "Insufficient agent balance",
        "payment": required
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (CoreError::NotFound("agent 9".into()), StatusCode::NOT_FOUND),
            (CoreError::Forbidden("not yours".into()), StatusCode::FORBIDDEN),
            (CoreError::Conflict("taken".into()), StatusCode::CONFLICT),
            (CoreError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (CoreError::Invariant("negative".into()), StatusCode::BAD_REQUEST),
            (CoreError::Unavailable("rpc".into()), StatusCode::SERVICE_UNAVAILABLE),
            (
                CoreError::Store(rusqlite::Error::QueryReturnedNoRows),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(error_response(&err).status(), status, "{:?}", err);
        }
    }

    #[test]
    fn test_payment_required_status() {
        let required = PaymentRequired {
            price: crate::domain_types::Usdc::from_micros(50_000),
            currency: "USDC".to_string(),
            pay_to: "0x1111111111111111111111111111111111111111".to_string(),
            network: "base".to_string(),
            balance: crate::domain_types::Usdc::ZERO,
        };
        assert_eq!(payment_required_response(&required).status(), StatusCode::PAYMENT_REQUIRED);
    }
}
