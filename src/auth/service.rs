use actix_web::HttpRequest;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use crate::error::AppError;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,  // Wiki user name
    pub exp: i64,     // Expiration time
    pub iat: i64,     // Issued at
    #[serde(default)]
    pub rights: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Right {
    NoLimits,
    ViewSettings,
    EditSettings,
    ViewRagSettings,
    EditRagSettings,
    Testing,
}

impl Right {
    pub fn as_str(&self) -> &'static str {
        match self {
            Right::NoLimits => "kzchatbot-no-limits",
            Right::ViewSettings => "kzchatbot-view-settings",
            Right::EditSettings => "kzchatbot-edit-settings",
            Right::ViewRagSettings => "kzchatbot-view-rag-settings",
            Right::EditRagSettings => "kzchatbot-edit-rag-settings",
            Right::Testing => "kzchatbot-testing",
        }
    }

    const ALL: [Right; 6] = [
        Right::NoLimits,
        Right::ViewSettings,
        Right::EditSettings,
        Right::ViewRagSettings,
        Right::EditRagSettings,
        Right::Testing,
    ];

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|right| right.as_str() == name)
    }
}

/// Rights held by the caller of a single request. Anonymous visitors hold none.
#[derive(Debug, Clone, Default)]
pub struct Rights {
    granted: HashSet<Right>,
}

impl Rights {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn has(&self, right: Right) -> bool {
        self.granted.contains(&right)
    }

    pub fn can_view_settings(&self) -> bool {
        self.has(Right::ViewSettings) || self.has(Right::EditSettings)
    }

    pub fn can_view_rag_settings(&self) -> bool {
        self.has(Right::ViewRagSettings) || self.has(Right::EditRagSettings)
    }

    pub fn require(&self, right: Right) -> Result<(), AppError> {
        if self.has(right) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!("missing right {}", right.as_str())))
        }
    }
}

impl FromIterator<Right> for Rights {
    fn from_iter<I: IntoIterator<Item = Right>>(iter: I) -> Self {
        Self {
            granted: iter.into_iter().collect(),
        }
    }
}

/// Verifies the short-lived tokens the wiki issues to signed-in users.
pub struct AuthService {
    jwt_secret: String,
}

impl AuthService {
    pub fn new(jwt_secret: String) -> Self {
        Self { jwt_secret }
    }

    pub fn generate_token(&self, subject: &str, rights: &[Right], ttl: Duration) -> Result<String, AppError> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
            rights: rights.iter().map(|r| r.as_str().to_string()).collect(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|e| AppError::InternalError(format!("failed to sign token: {}", e)))
    }

    pub fn decode_token(&self, token: &str) -> Result<Claims, AppError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|e| AppError::Forbidden(format!("invalid token: {}", e)))?;

        Ok(data.claims)
    }

    /// Rights carried by the request's bearer token. A missing or invalid
    /// token yields no rights rather than an error, since visitors are
    /// anonymous by default.
    pub fn rights_for(&self, req: &HttpRequest) -> Rights {
        let Some(token) = req
            .headers()
            .get("Authorization")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
        else {
            return Rights::anonymous();
        };

        match self.decode_token(token) {
            Ok(claims) => claims
                .rights
                .iter()
                .filter_map(|name| Right::from_name(name))
                .collect(),
            Err(e) => {
                debug!(error = %e, "ignoring invalid rights token");
                Rights::anonymous()
            }
        }
    }
}
