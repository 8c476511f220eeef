//! Rights of signed-in wiki users.
//!
//! The wiki signs a short-lived HS256 token listing the caller's chatbot
//! rights. Visitors without one are anonymous.

mod service;

pub use service::{AuthService, Claims, Right, Rights};
