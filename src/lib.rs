//! # captchabank-rs
//!
//! A pool of pre-solved captcha tokens for scraping clients facing DataDome.
//!
//! Solving a captcha through a paid service takes seconds and every token
//! expires after two minutes, so the bank harvests in the background and
//! serves tokens on demand.
//!
//! ## Features
//!
//! - TTL-aware FIFO token store with periodic sweeping
//! - Multi-worker harvesting with pause, resume and stop
//! - AntiCaptcha, CapMonster and 2Captcha adapters behind one trait
//! - Bounded proxy rotation for proxied solving tasks
//! - DataDome challenge flow producing a session cookie
//! - Event hooks for size notifications, logging and metrics
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use captchabank_rs::{ReqwestTransport, Settings, TokenBank};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::from_path("captchabank.json")?;
//!     let transport = Arc::new(ReqwestTransport::new()?);
//!     let bank = TokenBank::builder().with_settings(&settings, transport).build();
//!
//!     let harvester = bank.clone();
//!     let workers = settings.harvest.workers;
//!     let max = settings.harvest.max_outstanding;
//!     tokio::spawn(async move { harvester.harvest(workers, max).await });
//!
//!     if let Some(token) = bank.get_token().await {
//!         println!("token: {token}");
//!     }
//!     bank.stop();
//!     Ok(())
//! }
//! ```

mod captcha_bank;

pub mod challenges;
pub mod config;
pub mod external_deps;
pub mod modules;

pub use crate::captcha_bank::{BankError, BankResult, BankSnapshot, TokenBank, TokenBankBuilder};

pub use crate::challenges::core::{
    HttpTransport,
    ReqwestTransport,
    TransportError,
    TransportResponse,
};

pub use crate::challenges::datadome::{
    ChallengeParams,
    DatadomeError,
    DatadomeOutcome,
    DatadomeRequest,
    DatadomeSolver,
    parse_challenge,
};

pub use crate::config::{
    BankConfig,
    CaptchaSettings,
    ConfigError,
    HarvestSettings,
    Settings,
    TimingSettings,
};

pub use crate::external_deps::captcha::{
    AntiCaptchaProvider,
    CapMonsterProvider,
    CaptchaConfig,
    CaptchaError,
    CaptchaProvider,
    CaptchaResult,
    CaptchaTask,
    TwoCaptchaProvider,
    providers_from_settings,
};

pub use crate::modules::{
    BankEvent,
    EventDispatcher,
    EventHandler,
    LifecycleEvent,
    LoggingHandler,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    ProxyDescriptor,
    ProxyGroup,
    ProxyRotation,
    SizeEvent,
    SolveEvent,
    TOKEN_TTL,
    Token,
    TokenOrigin,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
