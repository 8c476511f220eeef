//! Who sees the chatbot, and how much they may ask.
//!
//! First contact goes through the [`EligibilitySampler`]; every question
//! from an enrolled visitor goes through the [`QuotaEnforcer`]. The
//! [`BypassAuthority`] lets testers skip the lottery and the capacity check.

pub mod bypass;
pub mod clock;
pub mod quota;
pub mod sampler;
pub mod throttle;

pub use bypass::{BypassAuthority, BYPASS_PARAM};
pub use clock::{Clock, ManualClock, SystemClock};
pub use quota::{QuotaEnforcer, UNLIMITED_REMAINING};
pub use sampler::{DeclineReason, EligibilitySampler, OsRandom, RandomSource, SamplingOutcome};
pub use throttle::IdentityRequestLimiter;
