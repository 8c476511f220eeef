#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use kzchatbot_server::auth::{AuthService, Right};
use kzchatbot_server::eligibility::{ManualClock, RandomSource};
use kzchatbot_server::{AppState, MemoryStore, Settings, Storage};
use std::sync::Arc;
use wiremock::MockServer;

pub const BYPASS_TOKEN: &str = "let-me-in";

/// Always draws the same lottery number.
pub struct FixedDraw(pub u32);

impl RandomSource for FixedDraw {
    fn draw_percent(&self) -> u32 {
        self.0
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub rag: MockServer,
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-03-14T10:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// App state over in-memory storage seeded with `settings`, a RAG mock
/// server, and a clock fixed at [`start_time`].
pub async fn test_app(settings: &[(&str, &str)], draw: u32) -> TestApp {
    let rag = MockServer::start().await;
    let mut config = Settings::new_for_test().expect("Failed to load test config");
    config.chatbot.rag_api_url = rag.uri();
    config.chatbot.bypass_token = Some(BYPASS_TOKEN.to_string());

    let store = Arc::new(MemoryStore::with_settings(settings.iter().copied()));
    let clock = Arc::new(ManualClock::new(start_time()));
    let state = AppState::from_parts(
        config,
        Storage::shared(store.clone()),
        clock.clone(),
        Arc::new(FixedDraw(draw)),
        None,
    )
    .expect("Failed to build app state");

    TestApp {
        state,
        store,
        clock,
        rag,
    }
}

pub fn bearer(rights: &[Right]) -> (&'static str, String) {
    let token = AuthService::new("test_secret".to_string())
        .generate_token("WikiSysop", rights, Duration::minutes(5))
        .expect("Failed to sign token");
    ("Authorization", format!("Bearer {}", token))
}
