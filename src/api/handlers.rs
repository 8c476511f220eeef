use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info, instrument, warn};

use crate::auth::{Right, Rights};
use crate::banned_words::BannedWordInput;
use crate::eligibility::{SamplingOutcome, UNLIMITED_REMAINING};
use crate::error::AppError;
use crate::identity::{Identity, VisitorId};
use crate::proxy::rag::ASKED_FROM_TESTING;
use crate::proxy::{RagConfig, RatingRequest, SearchRequest};
use crate::settings::GeneralSettings;
use crate::slugs::{SlugTexts, BANNED_WORD_FOUND};
use crate::{AppState, Result};

#[derive(Debug, Deserialize)]
pub struct ConfigQuery {
    pub uuid: Option<String>,
    pub kzchatbot_access: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QuestionRequest {
    pub uuid: String,
    pub question: String,
    pub page_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerResponse {
    pub answer: String,
    pub docs: Vec<serde_json::Value>,
    pub conversation_id: String,
    pub questions_remaining: i64,
}

#[derive(Debug, Deserialize)]
pub struct RateRequest {
    pub uuid: String,
    pub conversation_id: String,
    pub liked: bool,
    pub feedback: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TestSearchRequest {
    pub query: String,
    pub page_id: Option<String>,
    pub rephrase: Option<bool>,
    pub include_debug_data: Option<bool>,
    pub send_complete_pages_to_llm: Option<bool>,
}

/// Limits and links the widget needs to render.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_character_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback_character_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_help_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_url: Option<String>,
}

impl From<&GeneralSettings> for UiSettings {
    fn from(settings: &GeneralSettings) -> Self {
        Self {
            question_character_limit: settings.question_character_limit(),
            feedback_character_limit: settings.feedback_character_limit(),
            usage_help_url: settings.usage_help_url().map(str::to_string),
            terms_of_service_url: settings.terms_of_service_url().map(str::to_string),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorConfig {
    pub id: VisitorId,
    pub enrolled: bool,
    pub questions_remaining: i64,
    pub cookie_expiry: DateTime<Utc>,
    #[serde(flatten)]
    pub ui: UiSettings,
    pub slugs: BTreeMap<&'static str, Option<String>>,
}

/// `Excluded` serializes as `{"id": false}`: the client stores it as a
/// long-lived cookie and stops asking.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ConfigResponse {
    Visitor(VisitorConfig),
    Excluded { id: bool },
}

impl ConfigResponse {
    fn excluded() -> Self {
        ConfigResponse::Excluded { id: false }
    }
}

/// Address of the visitor, honouring `Forwarded`/`X-Forwarded-For` from the
/// wiki's reverse proxy.
fn client_ip(req: &HttpRequest) -> Option<IpAddr> {
    let info = req.connection_info();
    let raw = info.realip_remote_addr()?;
    raw.parse::<SocketAddr>()
        .map(|addr| addr.ip())
        .or_else(|_| raw.parse::<IpAddr>())
        .ok()
}

fn check_length(text: &str, limit: Option<usize>, what: &str) -> Result<()> {
    match limit {
        Some(limit) if text.chars().count() > limit => Err(AppError::ValidationError(format!(
            "{} exceeds {} characters",
            what, limit
        ))),
        _ => Ok(()),
    }
}

async fn resolve(state: &AppState, raw: &str) -> Result<Identity> {
    let id: VisitorId = raw.parse()?;
    state
        .identities
        .find(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no identity for {}", id)))
}

fn visitor_config(
    state: &AppState,
    identity: Identity,
    settings: &GeneralSettings,
    slugs: &SlugTexts,
    unlimited: bool,
) -> ConfigResponse {
    let questions_remaining = state.quota.remaining_for(&identity, settings, unlimited);
    // The widget rewrites its cookie on every load, so the expiry slides forward.
    let cookie_expiry = state.clock.now() + Duration::days(settings.cookie_expiry_days());
    ConfigResponse::Visitor(VisitorConfig {
        id: identity.id,
        enrolled: identity.enrolled,
        questions_remaining,
        cookie_expiry,
        ui: UiSettings::from(settings),
        slugs: slugs.render(settings),
    })
}

/// Status lookup and first contact. A known id returns its state; an absent
/// or unknown id goes through the enrollment lottery.
#[instrument(skip(req, state, query))]
pub async fn get_config(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<ConfigQuery>,
) -> Result<HttpResponse> {
    let rights = state.auth.rights_for(&req);
    let unlimited = rights.has(Right::NoLimits);
    let bypass = state.bypass.should_bypass(query.kzchatbot_access.as_deref());
    let settings = state.settings.get().await?;
    let slugs = state.slugs.get().await?;

    if let Some(raw) = query.uuid.as_deref().filter(|raw| !raw.trim().is_empty()) {
        let id: VisitorId = raw.parse()?;
        if let Some(mut identity) = state.identities.find(&id).await? {
            if bypass && !identity.enrolled && state.identities.mark_enrolled(&identity.id).await? {
                info!(id = %identity.id, "bypass token promoted visitor");
                identity.enrolled = true;
            }
            return Ok(HttpResponse::Ok().json(visitor_config(&state, identity, &settings, &slugs, unlimited)));
        }
        debug!(id = %id, "unknown id, treating as first contact");
    }

    let ip = client_ip(&req);
    let now = state.clock.now();
    let mut slot = None;
    if !bypass {
        if let (Some(limit), Some(ip)) = (settings.uuid_request_limit(), ip) {
            if !state.limiter.try_acquire(ip, limit, now).await {
                warn!(%ip, limit, "new identity limit reached for address");
                return Err(AppError::Throttled(
                    "too many new visitors from this address, try again later".into(),
                ));
            }
            slot = Some(ip);
        }
    }

    let outcome = state.sampler.decide(ip, bypass).await;
    if let (Some(ip), Ok(SamplingOutcome::Declined(_)) | Err(_)) = (slot, &outcome) {
        state.limiter.release(ip, now).await;
    }

    let response = match outcome? {
        SamplingOutcome::Enrolled(identity) => visitor_config(&state, identity, &settings, &slugs, unlimited),
        SamplingOutcome::Declined(reason) => {
            debug!(?reason, "visitor declined");
            ConfigResponse::excluded()
        }
    };
    Ok(HttpResponse::Ok().json(response))
}

pub async fn get_status(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<StatusQuery>,
) -> Result<HttpResponse> {
    let raw = query
        .uuid
        .as_deref()
        .ok_or_else(|| AppError::ValidationError("uuid is required".into()))?;
    let identity = resolve(&state, raw).await?;
    let unlimited = state.auth.rights_for(&req).has(Right::NoLimits);
    let settings = state.settings.get().await?;
    let remaining = state.quota.remaining_for(&identity, &settings, unlimited);

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "id": identity.id,
        "enrolled": identity.enrolled,
        "questionsRemaining": remaining
    })))
}

#[instrument(skip(req, state, body))]
pub async fn ask_question(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<QuestionRequest>,
) -> Result<HttpResponse> {
    let body = body.into_inner();
    let identity = resolve(&state, &body.uuid).await?;
    if !identity.enrolled {
        return Err(AppError::Forbidden("visitor is not enrolled".into()));
    }

    let settings = state.settings.get().await?;
    let question = body.question.trim();
    if question.is_empty() {
        return Err(AppError::ValidationError("question must not be empty".into()));
    }
    check_length(question, settings.question_character_limit(), "question")?;

    // Checked before the quota so a rejected question costs nothing.
    if let Some(word) = state.banned_words.find_match(question).await? {
        info!(id = %identity.id, word = word.id, "question matched a banned word");
        let reply = match word.reply_message.filter(|reply| !reply.trim().is_empty()) {
            Some(reply) => reply,
            None => state
                .slugs
                .get()
                .await?
                .text(BANNED_WORD_FOUND)
                .unwrap_or("Please rephrase the question")
                .to_string(),
        };
        return Err(AppError::Rejected(reply));
    }

    let unlimited = state.auth.rights_for(&req).has(Right::NoLimits);
    let remaining = state.quota.remaining_for(&identity, &settings, unlimited);
    if remaining <= 0 {
        return Err(AppError::QuotaExceeded);
    }

    let charge_first = state.config.quota.charge_before_answer;
    if charge_first {
        state.quota.consume_question(&identity.id).await?;
    }

    let answer = state
        .rag
        .search(&SearchRequest::from_chatbot(question, body.page_id))
        .await?;

    if !charge_first {
        state.quota.consume_question(&identity.id).await?;
    }

    Ok(HttpResponse::Ok().json(AnswerResponse {
        answer: answer.gpt_result,
        docs: answer.docs,
        conversation_id: answer.conversation_id,
        questions_remaining: if unlimited { UNLIMITED_REMAINING } else { remaining - 1 },
    }))
}

pub async fn rate_answer(
    state: web::Data<AppState>,
    body: web::Json<RateRequest>,
) -> Result<HttpResponse> {
    let body = body.into_inner();
    resolve(&state, &body.uuid).await?;

    let settings = state.settings.get().await?;
    let feedback = body
        .feedback
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty());
    if let Some(text) = &feedback {
        check_length(text, settings.feedback_character_limit(), "feedback")?;
    }

    state
        .rag
        .rate(&RatingRequest {
            conversation_id: body.conversation_id,
            liked: body.liked,
            text: feedback,
        })
        .await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({ "status": "ok" })))
}

fn require_view(rights: &Rights) -> Result<()> {
    if rights.can_view_settings() {
        Ok(())
    } else {
        Err(AppError::Forbidden("missing right to view chatbot settings".into()))
    }
}

pub async fn get_settings(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse> {
    require_view(&state.auth.rights_for(&req))?;
    let settings = state.settings.get().await?;
    Ok(HttpResponse::Ok().json(settings.to_map()))
}

/// Form fields may arrive as numbers or strings; everything is stored as text
/// and `null` clears a value.
fn setting_value(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub async fn put_settings(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<HashMap<String, serde_json::Value>>,
) -> Result<HttpResponse> {
    state.auth.rights_for(&req).require(Right::EditSettings)?;
    let values = body
        .into_inner()
        .into_iter()
        .map(|(name, value)| (name, setting_value(value)))
        .collect();
    let saved = state.settings.save(values).await?;
    Ok(HttpResponse::Ok().json(saved.to_map()))
}

pub async fn get_rag_config(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse> {
    if !state.auth.rights_for(&req).can_view_rag_settings() {
        return Err(AppError::Forbidden("missing right to view RAG settings".into()));
    }
    let config = state.rag.get_config().await?;
    Ok(HttpResponse::Ok().json(config))
}

/// Normalises the submitted tunables and pushes them to the backend, unless
/// they match what the backend already runs with.
#[instrument(skip(req, state, body))]
pub async fn put_rag_config(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse> {
    state.auth.rights_for(&req).require(Right::EditRagSettings)?;
    let config = RagConfig::from_value(&body);
    config.validate()?;

    let current = RagConfig::from_value(&state.rag.get_config().await?);
    if current == config {
        return Err(AppError::ValidationError("configuration has not changed".into()));
    }

    let reply = state.rag.set_config(&config).await?;
    info!(model = %config.model, "RAG configuration updated");
    Ok(HttpResponse::Ok().json(reply))
}

pub async fn list_slugs(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse> {
    require_view(&state.auth.rights_for(&req))?;
    let slugs = state.slugs.get().await?;
    Ok(HttpResponse::Ok().json(slugs.entries()))
}

#[derive(Debug, Deserialize)]
pub struct SlugUpdate {
    pub text: String,
}

pub async fn put_slug(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<SlugUpdate>,
) -> Result<HttpResponse> {
    state.auth.rights_for(&req).require(Right::EditSettings)?;
    let slug = path.into_inner();
    state.slugs.save(&slug, &body.text).await?;
    let slugs = state.slugs.get().await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "slug": slug,
        "text": slugs.text(&slug)
    })))
}

pub async fn delete_slug(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    state.auth.rights_for(&req).require(Right::EditSettings)?;
    state.slugs.reset(&path).await?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn list_banned_words(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse> {
    require_view(&state.auth.rights_for(&req))?;
    Ok(HttpResponse::Ok().json(state.banned_words.list().await?))
}

pub async fn get_banned_word(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    require_view(&state.auth.rights_for(&req))?;
    Ok(HttpResponse::Ok().json(state.banned_words.get(path.into_inner()).await?))
}

pub async fn create_banned_word(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<BannedWordInput>,
) -> Result<HttpResponse> {
    state.auth.rights_for(&req).require(Right::EditSettings)?;
    let word = state.banned_words.create(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(word))
}

pub async fn update_banned_word(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<i64>,
    body: web::Json<BannedWordInput>,
) -> Result<HttpResponse> {
    state.auth.rights_for(&req).require(Right::EditSettings)?;
    let word = state
        .banned_words
        .update(path.into_inner(), body.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(word))
}

pub async fn delete_banned_word(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    state.auth.rights_for(&req).require(Right::EditSettings)?;
    state.banned_words.delete(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// Search from the testing interface. Not tied to a visitor and not counted
/// against any quota.
pub async fn test_search(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<TestSearchRequest>,
) -> Result<HttpResponse> {
    state.auth.rights_for(&req).require(Right::Testing)?;
    let body = body.into_inner();
    if body.query.trim().is_empty() {
        return Err(AppError::ValidationError("query must not be empty".into()));
    }

    let response = state
        .rag
        .search(&SearchRequest {
            query: body.query,
            asked_from: ASKED_FROM_TESTING.to_string(),
            page_id: body.page_id,
            rephrase: body.rephrase,
            include_debug_data: body.include_debug_data,
            send_complete_pages_to_llm: body.send_complete_pages_to_llm,
        })
        .await?;
    Ok(HttpResponse::Ok().json(response))
}
