use sha2::{Digest, Sha256};

/// Query parameter carrying the bypass secret.
pub const BYPASS_PARAM: &str = "kzchatbot_access";

/// Forces enrollment for requests that present the shared secret.
#[derive(Clone)]
pub struct BypassAuthority {
    token: Option<String>,
}

impl BypassAuthority {
    /// An absent or blank token disables bypass entirely.
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    pub fn should_bypass(&self, param: Option<&str>) -> bool {
        match (&self.token, param) {
            (Some(token), Some(param)) => constant_time_eq(token.as_bytes(), param.as_bytes()),
            _ => false,
        }
    }
}

impl std::fmt::Debug for BypassAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BypassAuthority")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Compares fixed-length digests so timing does not depend on where the
/// inputs first differ, nor on their lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let a = Sha256::digest(a);
    let b = Sha256::digest(b);
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
