use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{instrument, warn};
use url::Url;

use crate::error::{AppError, ProxyError};

/// `asked_from` value for questions coming from the public widget.
pub const ASKED_FROM_CHATBOT: &str = "chatbot";
/// `asked_from` value for the admin testing interface.
pub const ASKED_FROM_TESTING: &str = "testing interface";

const CONFIG_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchRequest {
    pub query: String,
    pub asked_from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rephrase: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_debug_data: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_complete_pages_to_llm: Option<bool>,
}

impl SearchRequest {
    pub fn from_chatbot(query: impl Into<String>, page_id: Option<String>) -> Self {
        Self {
            query: query.into(),
            asked_from: ASKED_FROM_CHATBOT.to_string(),
            page_id,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub gpt_result: String,
    #[serde(default)]
    pub docs: Vec<serde_json::Value>,
    pub conversation_id: String,
    /// Debug data and anything else the backend adds.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RatingRequest {
    pub conversation_id: String,
    pub liked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Backend tunables edited from the admin pages and pushed with `set_config`.
///
/// Built leniently from JSON, since form posts carry numbers as strings and
/// the backend's `get_config` may omit fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RagConfig {
    pub model: String,
    pub num_of_pages: i64,
    pub add_current_page_to_search: bool,
    pub temperature: f64,
    pub system_prompt: String,
    pub user_prompt: String,
    pub banned_fields: String,
    pub rephrase_prompt: String,
    pub version: String,
}

fn text_field(value: &serde_json::Value, name: &str) -> String {
    match value.get(name) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn number_field(value: &serde_json::Value, name: &str) -> Option<f64> {
    match value.get(name)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn flag_field(value: &serde_json::Value, name: &str) -> bool {
    match value.get(name) {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => !matches!(s.trim(), "" | "0" | "false"),
        Some(serde_json::Value::Number(n)) => n.as_f64().map_or(false, |n| n != 0.0),
        _ => false,
    }
}

impl RagConfig {
    pub fn from_value(value: &serde_json::Value) -> Self {
        Self {
            model: text_field(value, "model"),
            num_of_pages: number_field(value, "num_of_pages").map_or(1, |n| n as i64),
            add_current_page_to_search: flag_field(value, "add_current_page_to_search"),
            temperature: number_field(value, "temperature").unwrap_or(0.0),
            system_prompt: text_field(value, "system_prompt").trim().to_string(),
            user_prompt: text_field(value, "user_prompt").trim().to_string(),
            banned_fields: text_field(value, "banned_fields").trim().to_string(),
            rephrase_prompt: text_field(value, "rephrase_prompt").trim().to_string(),
            version: text_field(value, "version"),
        }
    }

    /// `banned_fields` is empty or a comma-separated list without blank entries.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.banned_fields.is_empty() {
            return Ok(());
        }
        if self.banned_fields.split(',').any(|field| field.trim().is_empty()) {
            return Err(AppError::ValidationError(
                "banned_fields must be a comma-separated list of field names".into(),
            ));
        }
        Ok(())
    }
}

/// JSON client for the retrieval-augmented answer backend.
#[derive(Clone)]
pub struct RagClient {
    http: Client,
    base: Url,
}

impl RagClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let mut base = Url::parse(base_url)
            .map_err(|e| AppError::ConfigError(format!("invalid chatbot.rag_api_url: {}", e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, name: &str) -> Result<Url, ProxyError> {
        self.base
            .join(name)
            .map_err(|e| ProxyError::RequestFailed(e.to_string()))
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ProxyError> {
        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "backend returned an error status");
            return Err(ProxyError::Status(status.as_u16()));
        }
        Ok(response.json::<T>().await?)
    }

    #[instrument(skip(self, request), fields(asked_from = %request.asked_from))]
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, ProxyError> {
        let response = self
            .http
            .post(self.endpoint("search")?)
            .header("Accept", "application/json")
            .json(request)
            .send()
            .await?;
        Self::read_json(response).await
    }

    pub async fn rate(&self, rating: &RatingRequest) -> Result<(), ProxyError> {
        let response = self
            .http
            .post(self.endpoint("rating")?)
            .json(rating)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ProxyError::ResponseError("unknown conversation".into())),
            status => Err(ProxyError::Status(status.as_u16())),
        }
    }

    /// The backend's own configuration, shown read-only to admins.
    pub async fn get_config(&self) -> Result<serde_json::Value, ProxyError> {
        let response = self
            .http
            .get(self.endpoint("get_config")?)
            .timeout(CONFIG_TIMEOUT)
            .send()
            .await?;
        let value: serde_json::Value = Self::read_json(response).await?;
        if !value.is_object() {
            return Err(ProxyError::ResponseError("configuration is not an object".into()));
        }
        Ok(value)
    }

    /// Pushes new tunables. Any JSON reply counts as accepted.
    #[instrument(skip(self, config), fields(model = %config.model))]
    pub async fn set_config(&self, config: &RagConfig) -> Result<serde_json::Value, ProxyError> {
        let response = self
            .http
            .post(self.endpoint("set_config")?)
            .header("Accept", "application/json")
            .timeout(CONFIG_TIMEOUT)
            .json(config)
            .send()
            .await?;
        Self::read_json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> RagClient {
        RagClient::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_search_posts_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_json(json!({
                "query": "How do I apply for unemployment benefits?",
                "asked_from": "chatbot",
                "page_id": "1234"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "gpt_result": "Apply through the employment service.",
                "docs": [{"title": "Unemployment benefits", "url": "https://example.com/doc1"}],
                "conversation_id": "c0ffee",
                "debug": {"elapsed_ms": 12}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = client(&server)
            .search(&SearchRequest::from_chatbot(
                "How do I apply for unemployment benefits?",
                Some("1234".to_string()),
            ))
            .await
            .unwrap();

        assert_eq!(response.gpt_result, "Apply through the employment service.");
        assert_eq!(response.docs.len(), 1);
        assert_eq!(response.conversation_id, "c0ffee");
        assert!(response.extra.contains_key("debug"));
    }

    #[tokio::test]
    async fn test_base_url_with_path_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rag/get_config"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"model": "gpt-4o"})))
            .mount(&server)
            .await;

        let client = RagClient::new(&format!("{}/rag", server.uri()), Duration::from_secs(5)).unwrap();
        let config = client.get_config().await.unwrap();
        assert_eq!(config["model"], "gpt-4o");
    }

    #[tokio::test]
    async fn test_server_error_maps_to_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server)
            .search(&SearchRequest::from_chatbot("hello", None))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Status(503)));
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = client(&server)
            .search(&SearchRequest::from_chatbot("hello", None))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ResponseError(_)));
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = RagClient::new(&server.uri(), Duration::from_millis(200)).unwrap();
        let err = client
            .search(&SearchRequest::from_chatbot("hello", None))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Timeout));
    }

    #[tokio::test]
    async fn test_rating() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rating"))
            .and(body_json(json!({"conversation_id": "c0ffee", "liked": false, "text": "Outdated"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .rate(&RatingRequest {
                conversation_id: "c0ffee".to_string(),
                liked: false,
                text: Some("Outdated".to_string()),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_set_config_posts_normalised_values() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/set_config"))
            .and(body_json(json!({
                "model": "gpt-4o",
                "num_of_pages": 3,
                "add_current_page_to_search": true,
                "temperature": 0.2,
                "system_prompt": "Answer in Hebrew.",
                "user_prompt": "",
                "banned_fields": "phone, email",
                "rephrase_prompt": "",
                "version": "7"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .expect(1)
            .mount(&server)
            .await;

        let config = RagConfig::from_value(&json!({
            "model": "gpt-4o",
            "num_of_pages": "3",
            "add_current_page_to_search": "1",
            "temperature": "0.2",
            "system_prompt": "  Answer in Hebrew.\n",
            "banned_fields": " phone, email ",
            "version": 7
        }));
        let reply = client(&server).set_config(&config).await.unwrap();
        assert_eq!(reply["status"], "ok");
    }

    #[tokio::test]
    async fn test_set_config_rejects_non_json_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/set_config"))
            .respond_with(ResponseTemplate::new(200).set_body_string("saved"))
            .mount(&server)
            .await;

        let err = client(&server)
            .set_config(&RagConfig::from_value(&json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ResponseError(_)));
    }

    #[test]
    fn test_rag_config_defaults_and_banned_fields() {
        let config = RagConfig::from_value(&json!({}));
        assert_eq!(config.num_of_pages, 1);
        assert!(!config.add_current_page_to_search);
        assert!(config.validate().is_ok());

        let config = RagConfig::from_value(&json!({"banned_fields": "phone,,email"}));
        assert!(config.validate().is_err());
        let config = RagConfig::from_value(&json!({"banned_fields": "phone, email"}));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            RagClient::new("not a url", Duration::from_secs(1)),
            Err(AppError::ConfigError(_))
        ));
    }
}
