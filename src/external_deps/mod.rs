//! Integrations that rely on third-party services.
//!
//! This module groups the adapters for the paid captcha solving services that
//! feed the token bank.

pub mod captcha;
