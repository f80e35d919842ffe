//! # Softphone
//!
//! Drives a long-lived SIP engine process (pjsua) through its console and
//! turns its free-text output into a strict session and call lifecycle.
//!
//! ```text
//! engine output ─► lines ─► classify ─► Events ─┐
//!                                               ├─► PhoneController ─► notifications
//! intents (PhoneHandle) ────────────────────────┘          │
//!                                                          ▼
//!                                        CommandDispatcher ─► engine input
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use softphone::{LoginRequest, PhoneController, PhoneSettings, PtyLauncher};
//!
//! # async fn demo() -> Result<(), softphone::PhoneError> {
//! let phone = PhoneController::spawn(PtyLauncher::default(), PhoneSettings::default());
//! let mut notifications = phone.subscribe();
//!
//! phone
//!     .login(LoginRequest {
//!         server: "10.20.25.111".into(),
//!         username: "1000".into(),
//!         password: "1234".into(),
//!         port: 5070,
//!     })
//!     .await?;
//!
//! while let Ok(notification) = notifications.recv().await {
//!     println!("{:?}", notification);
//! }
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod classifier;
pub mod config;
pub mod console;
pub mod controller;
pub mod dispatcher;
pub mod engine;
mod error;
pub mod event;
pub mod ports;
pub mod session;
pub mod timers;

pub use call::{Call, CallState};
pub use classifier::classify;
pub use config::{ConfigStore, PhoneConfig};
pub use controller::{PhoneController, PhoneHandle, PhoneNotification, PhoneSettings, PhoneSnapshot};
pub use dispatcher::{EngineLink, Launcher};
pub use engine::PtyLauncher;
pub use error::PhoneError;
pub use event::{AckKind, Event};
pub use session::{Account, LoginRequest, Session, SessionState};
pub use timers::TimerKind;
