//! HTTP routes for the chatbot widget and the admin pages.

pub mod handlers;

use actix_web::{error::InternalError, web, HttpResponse};

use crate::error::AppError;

/// Malformed JSON or query strings get the same error body as everything else.
fn bad_request(message: String) -> actix_web::Error {
    let err = AppError::ValidationError(message);
    let response = actix_web::ResponseError::error_response(&err);
    InternalError::from_response(err, response).into()
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _| bad_request(err.to_string())))
        .app_data(web::QueryConfig::default().error_handler(|err, _| bad_request(err.to_string())))
        .app_data(web::PathConfig::default().error_handler(|err, _| bad_request(err.to_string())))
        .route("/health", web::get().to(crate::health_check))
        .service(
            web::scope("/api")
                .route("/config", web::get().to(handlers::get_config))
                .route("/status", web::get().to(handlers::get_status))
                .route("/question", web::post().to(handlers::ask_question))
                .route("/rate", web::post().to(handlers::rate_answer)),
        )
        .service(
            web::scope("/admin")
                .route("/settings", web::get().to(handlers::get_settings))
                .route("/settings", web::put().to(handlers::put_settings))
                .route("/rag-config", web::get().to(handlers::get_rag_config))
                .route("/rag-config", web::put().to(handlers::put_rag_config))
                .route("/slugs", web::get().to(handlers::list_slugs))
                .route("/slugs/{slug}", web::put().to(handlers::put_slug))
                .route("/slugs/{slug}", web::delete().to(handlers::delete_slug))
                .route("/banned-words", web::get().to(handlers::list_banned_words))
                .route("/banned-words", web::post().to(handlers::create_banned_word))
                .route("/banned-words/{id}", web::get().to(handlers::get_banned_word))
                .route("/banned-words/{id}", web::put().to(handlers::update_banned_word))
                .route("/banned-words/{id}", web::delete().to(handlers::delete_banned_word))
                .route("/search", web::post().to(handlers::test_search)),
        )
        .default_service(web::to(|| async {
            HttpResponse::NotFound().json(serde_json::json!({
                "error": { "status": 404, "message": "Not found" }
            }))
        }));
}
