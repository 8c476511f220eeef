use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::banned_words::BannedWord;
use crate::identity::{Identity, VisitorId};

/// Row of `chatbot_users`, column for column.
#[derive(Debug, Clone, FromRow)]
pub struct IdentityRow {
    pub id: String,
    pub ip_address: Option<Vec<u8>>,
    pub enrolled: bool,
    pub cookie_expiry: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub questions_last_active_day: i64,
}

impl From<IdentityRow> for Identity {
    fn from(row: IdentityRow) -> Self {
        Self {
            id: VisitorId::from_storage_key(&row.id),
            ip: row.ip_address.as_deref().and_then(ip_from_bytes),
            enrolled: row.enrolled,
            cookie_expiry: row.cookie_expiry,
            last_active_at: row.last_active,
            questions_used_today: row.questions_last_active_day,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SettingRow {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct TextRow {
    pub slug: String,
    pub text: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct BannedWordRow {
    pub id: i64,
    pub pattern: String,
    pub description: Option<String>,
    pub reply_message: Option<String>,
}

impl From<BannedWordRow> for BannedWord {
    fn from(row: BannedWordRow) -> Self {
        Self {
            id: row.id,
            pattern: row.pattern,
            description: row.description,
            reply_message: row.reply_message,
        }
    }
}

/// Network-order octets, 4 for v4 and 16 for v6.
pub fn ip_to_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

pub fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Some(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    <[u8; 16]>::try_from(bytes)
        .ok()
        .map(|octets| IpAddr::V6(Ipv6Addr::from(octets)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_binary_form() {
        let v4: IpAddr = "192.168.1.20".parse().unwrap();
        assert_eq!(ip_to_bytes(v4), vec![192, 168, 1, 20]);
        assert_eq!(ip_from_bytes(&ip_to_bytes(v4)), Some(v4));

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(ip_to_bytes(v6).len(), 16);
        assert_eq!(ip_from_bytes(&ip_to_bytes(v6)), Some(v6));

        assert_eq!(ip_from_bytes(&[1, 2, 3]), None);
    }

    #[test]
    fn test_row_conversion_displays_hyphenated_id() {
        let now = Utc::now();
        let row = IdentityRow {
            id: "0b3f2c1e8d4a4c5b9e6f1a2b3c4d5e6f".to_string(),
            ip_address: Some(vec![10, 0, 0, 1]),
            enrolled: true,
            cookie_expiry: now,
            last_active: now,
            questions_last_active_day: 2,
        };
        let identity = Identity::from(row);
        assert_eq!(identity.id.to_string(), "0b3f2c1e-8d4a-4c5b-9e6f-1a2b3c4d5e6f");
        assert_eq!(identity.ip, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(identity.questions_used_today, 2);
    }
}
