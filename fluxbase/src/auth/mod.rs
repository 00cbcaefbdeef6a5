//! Credential flows
//!
//! Everything that turns credentials into sessions: password sign-up and
//! sign-in with lockout, email verification, password reset, magic-link /
//! OTP sign-in, invitations, OAuth bridging and SAML bridging.

pub mod flows;
pub mod oauth;
pub mod saml;

pub use flows::{AuthService, FlowConfig};
