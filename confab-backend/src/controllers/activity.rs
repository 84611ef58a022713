//! Attendee activity: RSVPs, check-ins and chat messages.
//! Rows are stored against the canonical id; the matching points go out on
//! the task queue so a slow award never holds up the request.

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use chrono::Utc;

use crate::controllers::error_response;
use crate::error::CoreError;
use crate::middleware::session_auth::authenticate;
use crate::models::{CheckinRequest, RsvpRequest, ScheduledEvent};
use crate::points::Action;
use crate::AppState;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/activity")
            .route("/rsvp", web::post().to(rsvp))
            .route("/checkin", web::post().to(checkin))
            .route("/message", web::post().to(message)),
    );
}

async fn rsvp(state: web::Data<AppState>, req: HttpRequest, body: web::Json<RsvpRequest>) -> impl Responder {
    let auth = match authenticate(&state, &req) {
        Ok(auth) => auth,
        Err(resp) => return resp,
    };

    let event_id = body.event_id.trim();
    if event_id.is_empty() {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "event_id is required"
        }));
    }
    let event = ScheduledEvent {
        event_id: event_id.to_string(),
        title: body.title.clone(),
        starts_at: body.starts_at,
    };

    match state.db.record_rsvp(&auth.canonical_id, &event) {
        Ok(recorded) => {
            state.tasks.award(
                &auth.platform_user_id,
                auth.platform,
                Action::Rsvp,
                Some(event.event_id.clone()),
            );
            HttpResponse::Ok().json(serde_json::json!({
                "recorded": recorded,
                "event": event
            }))
        }
        Err(e) => error_response(&CoreError::from(e)),
    }
}

async fn checkin(state: web::Data<AppState>, req: HttpRequest, body: web::Json<CheckinRequest>) -> impl Responder {
    let auth = match authenticate(&state, &req) {
        Ok(auth) => auth,
        Err(resp) => return resp,
    };

    let location_id = body.location_id.trim();
    if location_id.is_empty() {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "location_id is required"
        }));
    }

    let now = Utc::now();
    match state.db.record_checkin(&auth.canonical_id, location_id, now) {
        Ok(checkin) => {
            // One check-in bonus per location per day
            let key = format!("{}:{}", location_id, now.format("%Y-%m-%d"));
            state
                .tasks
                .award(&auth.platform_user_id, auth.platform, Action::Checkin, Some(key));
            HttpResponse::Ok().json(checkin)
        }
        Err(e) => error_response(&CoreError::from(e)),
    }
}

async fn message(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    let auth = match authenticate(&state, &req) {
        Ok(auth) => auth,
        Err(resp) => return resp,
    };

    state
        .tasks
        .award(&auth.platform_user_id, auth.platform, Action::Message, None);
    HttpResponse::Accepted().json(serde_json::json!({ "queued": true }))
}
