//! Registration lifecycle.
//!
//! `Disconnected → Connecting → Registered → Disconnecting → Disconnected`.
//! The machine is pure: it validates intents, applies events, and returns the
//! timer effects the controller must carry out.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::call::CallState;
use crate::error::PhoneError;
use crate::timers::{Effect, TimerKind};

pub const MIN_LOCAL_PORT: u16 = 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Registered,
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Registered => "registered",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub server: String,
    pub local_port: u16,
    pub sip_uri: String,
    /// Set once the engine itself reported both username and server
    pub resolved: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub state: SessionState,
    pub account: Account,
    pub started_at: Option<DateTime<Utc>>,
}

/// Credentials and local port for one login attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginRequest {
    pub server: String,
    pub username: String,
    pub password: String,
    pub port: u16,
}

impl LoginRequest {
    /// Trimmed copy of the request, or `InvalidInput`
    pub fn validate(&self) -> Result<LoginRequest, PhoneError> {
        let server = self.server.trim();
        let username = self.username.trim();

        if server.is_empty() {
            return Err(PhoneError::InvalidInput("server must not be empty".into()));
        }
        if username.is_empty() {
            return Err(PhoneError::InvalidInput(
                "username must not be empty".into(),
            ));
        }
        if self.port < MIN_LOCAL_PORT {
            return Err(PhoneError::InvalidInput(format!(
                "local port {} is outside {}-65535",
                self.port, MIN_LOCAL_PORT
            )));
        }

        Ok(LoginRequest {
            server: server.to_string(),
            username: username.to_string(),
            password: self.password.clone(),
            port: self.port,
        })
    }

    pub fn sip_uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.server)
    }
}

#[derive(Debug, Default)]
pub struct SessionMachine {
    session: Session,
    /// Server from the login request; dial URIs are built against it
    registrar: Option<String>,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn registrar(&self) -> Option<&str> {
        self.registrar.as_deref()
    }

    pub fn check_can_login(&self, call: CallState) -> Result<(), PhoneError> {
        match self.session.state {
            SessionState::Disconnected => Ok(()),
            session => Err(PhoneError::InvalidState {
                operation: "login",
                session,
                call,
            }),
        }
    }

    /// Engine launched for `request`; wait for registration
    pub fn connecting(&mut self, request: &LoginRequest) -> Vec<Effect> {
        self.session = Session {
            state: SessionState::Connecting,
            account: Account {
                username: request.username.clone(),
                server: request.server.clone(),
                local_port: request.port,
                sip_uri: request.sip_uri(),
                resolved: false,
            },
            started_at: None,
        };
        self.registrar = Some(request.server.clone());
        vec![Effect::Schedule(TimerKind::LoginConfirm)]
    }

    /// `None` when the event does not move the session (already registered,
    /// or no login in flight).
    pub fn on_registered(&mut self, now: DateTime<Utc>) -> Option<Vec<Effect>> {
        if self.session.state != SessionState::Connecting {
            return None;
        }

        self.session.state = SessionState::Registered;
        self.session.started_at = Some(now);
        Some(vec![
            Effect::Cancel(TimerKind::LoginConfirm),
            Effect::Schedule(TimerKind::StatusPoll),
            Effect::QueryStatus,
        ])
    }

    /// Returns true when the account changed
    pub fn on_account_info(&mut self, username: &str, server: &str, raw_uri: &str) -> bool {
        let account = &mut self.session.account;
        if account.resolved
            && account.username == username
            && account.server == server
            && account.sip_uri == raw_uri
        {
            return false;
        }

        account.username = username.to_string();
        account.server = server.to_string();
        account.sip_uri = raw_uri.to_string();
        account.resolved = true;
        true
    }

    /// Confirmation timer fired while still connecting. `registered_in_history`
    /// is the result of re-scanning recent output.
    pub fn on_login_confirm(
        &mut self,
        registered_in_history: bool,
        now: DateTime<Utc>,
    ) -> Vec<Effect> {
        if self.session.state != SessionState::Connecting {
            return Vec::new();
        }
        if registered_in_history {
            return self.on_registered(now).unwrap_or_default();
        }
        vec![
            Effect::QueryStatus,
            Effect::Schedule(TimerKind::LoginConfirm),
        ]
    }

    pub fn on_status_poll(&self) -> Vec<Effect> {
        if self.session.state != SessionState::Registered {
            return Vec::new();
        }
        vec![Effect::QueryStatus, Effect::Schedule(TimerKind::StatusPoll)]
    }

    pub fn begin_unregister(&mut self) -> Result<(), PhoneError> {
        if self.session.state != SessionState::Registered {
            return Err(PhoneError::NotRegistered);
        }
        self.session.state = SessionState::Disconnecting;
        Ok(())
    }

    /// Back to a blank `Disconnected` session
    pub fn reset(&mut self) {
        self.session = Session::default();
        self.registrar = None;
    }
}
