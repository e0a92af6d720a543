//! # lxr-registration
//!
//! CI control-plane client for lxr.
//!
//! Exchanges a long-lived API credential for a one-time runner registration
//! token, scoped to a repository or an organization. The token is consumed
//! when the in-sandbox agent is configured.

mod client;
mod token;

pub use client::{parse_token_response, token_endpoint, RegistrationClient};
pub use token::RegistrationToken;
