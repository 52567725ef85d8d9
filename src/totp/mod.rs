//! TOTP second factor: enrollment material, code verification, replay cache.

pub mod engine;
pub mod replay;

pub use engine::{Enrollment, TotpEngine, TOTP_DIGITS, TOTP_SKEW, TOTP_STEP_SECONDS};
pub use replay::SeenCodeCache;
