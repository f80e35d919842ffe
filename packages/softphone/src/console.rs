//! Line-oriented console front-end for `phone run`.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::PhoneConfig;
use crate::controller::{PhoneController, PhoneHandle, PhoneNotification, PhoneSettings};
use crate::engine::{PtyLauncher, locate_engine};
use crate::ports::suggest_port;
use crate::session::LoginRequest;

const HELP: &str = "commands: login | dial <number> | hangup | unregister | status | show | help | quit";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Login,
    Dial(String),
    Hangup,
    Unregister,
    Status,
    Show,
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();

    let command = match (verb, rest.as_slice()) {
        ("login", []) => ConsoleCommand::Login,
        ("dial" | "call", [number]) => ConsoleCommand::Dial(number.to_string()),
        ("dial" | "call", _) => return Err("usage: dial <number>".to_string()),
        ("hangup" | "h", []) => ConsoleCommand::Hangup,
        ("unregister" | "logout", []) => ConsoleCommand::Unregister,
        ("status" | "d", []) => ConsoleCommand::Status,
        ("show", []) => ConsoleCommand::Show,
        ("help" | "?", []) => ConsoleCommand::Help,
        ("quit" | "exit" | "q", []) => ConsoleCommand::Quit,
        (other, []) => return Err(format!("unknown command '{}'", other)),
        (other, _) => return Err(format!("'{}' takes no arguments", other)),
    };
    Ok(Some(command))
}

/// Human-readable rendering; `None` for notifications the console keeps quiet about
pub fn describe(notification: &PhoneNotification, show_raw: bool) -> Option<String> {
    let text = match notification {
        PhoneNotification::SessionChanged { session } => {
            format!("session: {}", session.state)
        }
        PhoneNotification::CallChanged { call } => match &call.destination {
            Some(destination) => format!("call: {} ({})", call.state, destination),
            None => format!("call: {}", call.state),
        },
        PhoneNotification::AccountResolved { account } => {
            format!("account: {}", account.sip_uri)
        }
        PhoneNotification::RawLine { text, .. } if show_raw => format!("  | {}", text),
        PhoneNotification::RawLine { .. } => return None,
        PhoneNotification::ProcessExited => "engine exited".to_string(),
        PhoneNotification::CallDuration { display, .. } => format!("duration: {}", display),
        PhoneNotification::DialFailed { detail } => format!("dial failed: {}", detail),
        PhoneNotification::IncomingCall => "incoming call".to_string(),
        PhoneNotification::Failure { code, message } => format!("error [{}]: {}", code, message),
    };
    Some(text)
}

#[derive(Clone, Debug, Default)]
pub struct ConsoleOptions {
    /// Fixed local port; otherwise config decides
    pub port: Option<u16>,
    pub show_raw: bool,
    pub json: bool,
}

pub async fn run_console(config: &PhoneConfig, options: ConsoleOptions) -> Result<()> {
    let mut settings = PhoneSettings::from_config(config);
    match locate_engine(&config.engine.path) {
        Some(path) => settings.engine_path = path.display().to_string(),
        None => warn!(
            "Engine '{}' not found in the working directory or PATH",
            config.engine.path
        ),
    }

    let phone = PhoneController::spawn(PtyLauncher::default(), settings);
    let printer = tokio::spawn(print_notifications(
        phone.subscribe(),
        options.show_raw,
        options.json,
    ));

    println!("{}", HELP);
    if config.account.auto_login {
        login(&phone, config, options.port).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{}", message);
                continue;
            }
        };

        let result = match command {
            ConsoleCommand::Login => {
                login(&phone, config, options.port).await;
                Ok(())
            }
            ConsoleCommand::Dial(number) => phone.dial(&number).await,
            ConsoleCommand::Hangup => phone.hangup().await,
            ConsoleCommand::Unregister => phone.unregister().await,
            ConsoleCommand::Status => phone.query_status().await,
            ConsoleCommand::Show => {
                let snapshot = phone.snapshot().await?;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
                Ok(())
            }
            ConsoleCommand::Help => {
                println!("{}", HELP);
                Ok(())
            }
            ConsoleCommand::Quit => break,
        };

        if let Err(e) = result {
            println!("error [{}]: {}", e.error_code(), e);
        }
    }

    info!("Shutting down");
    phone.shutdown().await?;
    printer.abort();
    Ok(())
}

async fn login(phone: &PhoneHandle, config: &PhoneConfig, port_override: Option<u16>) {
    let port = match port_override {
        Some(port) => port,
        None if config.engine.randomize_port => suggest_port().unwrap_or_else(|e| {
            warn!("Could not pick a free port ({}), using {}", e, config.engine.port);
            config.engine.port
        }),
        None => config.engine.port,
    };

    let request = LoginRequest {
        server: config.account.server.clone(),
        username: config.account.username.clone(),
        password: config.account.password.clone(),
        port,
    };

    if let Err(e) = phone.login(request).await {
        println!("error [{}]: {}", e.error_code(), e);
    }
}

async fn print_notifications(
    mut notifications: broadcast::Receiver<PhoneNotification>,
    show_raw: bool,
    json: bool,
) {
    loop {
        match notifications.recv().await {
            Ok(notification) => {
                if json {
                    if let Ok(line) = serde_json::to_string(&notification) {
                        println!("{}", line);
                    }
                } else if let Some(text) = describe(&notification, show_raw) {
                    println!("{}", text);
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Console fell behind, {} notifications skipped", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{Call, CallState};
    use crate::session::{Session, SessionState};

    #[test]
    fn parses_intents() {
        assert_eq!(parse_command("login"), Ok(Some(ConsoleCommand::Login)));
        assert_eq!(
            parse_command("  dial 1003 "),
            Ok(Some(ConsoleCommand::Dial("1003".into())))
        );
        assert_eq!(parse_command("hangup"), Ok(Some(ConsoleCommand::Hangup)));
        assert_eq!(parse_command("unregister"), Ok(Some(ConsoleCommand::Unregister)));
        assert_eq!(parse_command("status"), Ok(Some(ConsoleCommand::Status)));
        assert_eq!(parse_command("quit"), Ok(Some(ConsoleCommand::Quit)));
        assert_eq!(parse_command("   "), Ok(None));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_command("dial").is_err());
        assert!(parse_command("dial 1003 1004").is_err());
        assert!(parse_command("hangup now").is_err());
        assert_eq!(
            parse_command("answer"),
            Err("unknown command 'answer'".to_string())
        );
    }

    #[test]
    fn describes_state_changes() {
        let session = PhoneNotification::SessionChanged {
            session: Session {
                state: SessionState::Registered,
                ..Default::default()
            },
        };
        assert_eq!(describe(&session, false).as_deref(), Some("session: registered"));

        let call = PhoneNotification::CallChanged {
            call: Call {
                state: CallState::Dialing,
                destination: Some("1003".into()),
                started_at: None,
            },
        };
        assert_eq!(describe(&call, false).as_deref(), Some("call: dialing (1003)"));
    }

    #[test]
    fn raw_lines_only_when_asked() {
        let raw = PhoneNotification::RawLine {
            text: "SIP/2.0 180 Ringing".into(),
            timestamp: 0,
        };
        assert_eq!(describe(&raw, false), None);
        assert_eq!(describe(&raw, true).as_deref(), Some("  | SIP/2.0 180 Ringing"));
    }
}
