//! Command Dispatcher
//!
//! Every byte written to the engine goes through here. Intents become fixed
//! command sequences; the engine's console reader drops input that arrives
//! too quickly after a prompt, so multi-line groups are paced with short
//! delays between steps.

use std::future::Future;
use std::time::Duration;

use engine_process::{EngineOutput, ProcessError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::PhoneError;
use crate::session::LoginRequest;

/// Write side of a running engine
pub trait EngineLink: Send + Sync + 'static {
    /// Write one line plus terminator, flushed before returning
    fn send_line(&self, line: &str) -> impl Future<Output = Result<(), ProcessError>> + Send;

    /// Ask the engine to stop, escalating after `grace`
    fn shutdown(&self, grace: Duration) -> impl Future<Output = Result<(), ProcessError>> + Send;
}

/// Starts engine processes
pub trait Launcher: Send + 'static {
    type Link: EngineLink;

    fn launch(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<(Self::Link, mpsc::Receiver<EngineOutput>), ProcessError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineCommand {
    StatusQuery,
    MakeCall,
    Hangup,
    Unregister,
    Quit,
}

impl EngineCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusQuery => "d",
            Self::MakeCall => "m",
            Self::Hangup => "h",
            Self::Unregister => "ru",
            Self::Quit => "q",
        }
    }
}

/// Engine command line for one login
pub fn launch_args(request: &LoginRequest, log_level: u8) -> Vec<String> {
    vec![
        format!("--id={}", request.sip_uri()),
        format!("--registrar=sip:{}", request.server),
        "--realm=*".to_string(),
        format!("--username={}", request.username),
        format!("--password={}", request.password),
        format!("--log-level={}", log_level),
        format!("--app-log-level={}", log_level),
        format!("--local-port={}", request.port),
    ]
}

/// Pacing between the lines of a command group
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pacing {
    pub dial_step: Duration,
    pub hangup_confirm: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            dial_step: Duration::from_millis(100),
            hangup_confirm: Duration::from_millis(100),
        }
    }
}

pub struct CommandDispatcher<L> {
    link: Option<L>,
    pacing: Pacing,
}

impl<L: EngineLink> CommandDispatcher<L> {
    pub fn new(pacing: Pacing) -> Self {
        Self { link: None, pacing }
    }

    pub fn attach(&mut self, link: L) {
        self.link = Some(link);
    }

    pub fn detach(&mut self) -> Option<L> {
        self.link.take()
    }

    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }

    pub async fn query_status(&self) -> Result<(), PhoneError> {
        self.send(EngineCommand::StatusQuery.as_str()).await
    }

    /// Blank line to clear the engine's input buffer, `m`, then the URI
    pub async fn dial(&self, uri: &str) -> Result<(), PhoneError> {
        self.send("").await?;
        tokio::time::sleep(self.pacing.dial_step).await;
        self.send(EngineCommand::MakeCall.as_str()).await?;
        tokio::time::sleep(self.pacing.dial_step).await;
        self.send(uri).await
    }

    /// `h` followed by the blank line that confirms it
    pub async fn hangup(&self) -> Result<(), PhoneError> {
        self.send(EngineCommand::Hangup.as_str()).await?;
        tokio::time::sleep(self.pacing.hangup_confirm).await;
        self.send("").await
    }

    pub async fn unregister(&self) -> Result<(), PhoneError> {
        self.send(EngineCommand::Unregister.as_str()).await
    }

    pub async fn quit(&self) -> Result<(), PhoneError> {
        self.send(EngineCommand::Quit.as_str()).await
    }

    /// Drop the link and make sure the process is gone
    pub async fn force_cleanup(&mut self, grace: Duration) {
        if let Some(link) = self.link.take() {
            if let Err(e) = link.shutdown(grace).await {
                warn!("Engine shutdown failed: {}", e);
            }
        }
    }

    async fn send(&self, line: &str) -> Result<(), PhoneError> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| PhoneError::Write("engine is not running".into()))?;

        debug!(line, "-> engine");
        link.send_line(line).await.map_err(PhoneError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[derive(Clone, Default)]
    struct RecordingLink {
        writes: Arc<Mutex<Vec<(String, Instant)>>>,
        fail: bool,
        shut_down: Arc<Mutex<Option<Duration>>>,
    }

    impl RecordingLink {
        fn lines(&self) -> Vec<String> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .map(|(l, _)| l.clone())
                .collect()
        }
    }

    impl EngineLink for RecordingLink {
        async fn send_line(&self, line: &str) -> Result<(), ProcessError> {
            if self.fail {
                return Err(ProcessError::WriteFailed("broken pipe".into()));
            }
            self.writes
                .lock()
                .unwrap()
                .push((line.to_string(), Instant::now()));
            Ok(())
        }

        async fn shutdown(&self, grace: Duration) -> Result<(), ProcessError> {
            *self.shut_down.lock().unwrap() = Some(grace);
            Ok(())
        }
    }

    fn attached(link: &RecordingLink) -> CommandDispatcher<RecordingLink> {
        let mut dispatcher = CommandDispatcher::new(Pacing::default());
        dispatcher.attach(link.clone());
        dispatcher
    }

    #[tokio::test(start_paused = true)]
    async fn dial_writes_paced_sequence() {
        let link = RecordingLink::default();
        let dispatcher = attached(&link);

        dispatcher.dial("sip:1003@10.20.25.111").await.unwrap();

        let writes = link.writes.lock().unwrap().clone();
        let lines: Vec<_> = writes.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(lines, vec!["", "m", "sip:1003@10.20.25.111"]);
        assert!(writes[1].1 - writes[0].1 >= Duration::from_millis(100));
        assert!(writes[2].1 - writes[1].1 >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn hangup_confirms_with_blank_line() {
        let link = RecordingLink::default();
        let dispatcher = attached(&link);

        dispatcher.hangup().await.unwrap();
        assert_eq!(link.lines(), vec!["h", ""]);
    }

    #[tokio::test]
    async fn single_line_commands() {
        let link = RecordingLink::default();
        let dispatcher = attached(&link);

        dispatcher.query_status().await.unwrap();
        dispatcher.unregister().await.unwrap();
        dispatcher.quit().await.unwrap();
        assert_eq!(link.lines(), vec!["d", "ru", "q"]);
    }

    #[tokio::test]
    async fn write_failure_stops_the_group() {
        let link = RecordingLink {
            fail: true,
            ..Default::default()
        };
        let dispatcher = attached(&link);

        let err = dispatcher.dial("sip:1003@host").await.unwrap_err();
        assert_eq!(err.error_code(), "write_error");
        assert!(link.lines().is_empty());
    }

    #[tokio::test]
    async fn detached_dispatcher_refuses_writes() {
        let dispatcher = CommandDispatcher::<RecordingLink>::new(Pacing::default());
        assert!(!dispatcher.is_attached());
        assert!(matches!(
            dispatcher.query_status().await,
            Err(PhoneError::Write(_))
        ));
    }

    #[tokio::test]
    async fn force_cleanup_shuts_link_down_once() {
        let link = RecordingLink::default();
        let mut dispatcher = attached(&link);

        dispatcher.force_cleanup(Duration::from_secs(2)).await;
        assert_eq!(*link.shut_down.lock().unwrap(), Some(Duration::from_secs(2)));
        assert!(!dispatcher.is_attached());

        *link.shut_down.lock().unwrap() = None;
        dispatcher.force_cleanup(Duration::from_secs(2)).await;
        assert!(link.shut_down.lock().unwrap().is_none());
    }

    #[test]
    fn launch_args_follow_engine_cli() {
        let request = LoginRequest {
            server: "10.20.25.111".into(),
            username: "1000".into(),
            password: "1234".into(),
            port: 5070,
        };
        assert_eq!(
            launch_args(&request, 4),
            vec![
                "--id=sip:1000@10.20.25.111",
                "--registrar=sip:10.20.25.111",
                "--realm=*",
                "--username=1000",
                "--password=1234",
                "--log-level=4",
                "--app-log-level=4",
                "--local-port=5070",
            ]
        );
    }
}
