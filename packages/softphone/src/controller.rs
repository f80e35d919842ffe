//! Phone Controller
//!
//! A single actor task owns the session, the call, every timer, and the
//! dispatcher. Engine lines and timer firings arrive on one bounded queue and
//! are handled strictly in arrival order; intents arrive on a separate command
//! channel and are answered over oneshot replies. Nothing outside the actor
//! mutates state. Observers get [`PhoneNotification`]s over a broadcast
//! channel.
//!
//! Each launched engine gets a generation number. Output tagged with an older
//! generation than the current one is dropped, so a late line from a process
//! that was already torn down can never move the new session.

use std::collections::VecDeque;

use chrono::Utc;
use engine_process::EngineOutput;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::call::{Call, CallMachine, CallState, format_elapsed};
use crate::classifier::{classify, history_indicates_registration};
use crate::config::{PhoneConfig, Timing};
use crate::dispatcher::{CommandDispatcher, Launcher, launch_args};
use crate::error::PhoneError;
use crate::event::Event;
use crate::session::{Account, LoginRequest, Session, SessionMachine, SessionState};
use crate::timers::{Effect, TimerFired, TimerKind, Timers};

const COMMAND_CAPACITY: usize = 32;
const LOOP_QUEUE_CAPACITY: usize = 256;
const NOTIFICATION_CAPACITY: usize = 256;

/// Outward notifications, in the order the controller produced them
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhoneNotification {
    SessionChanged { session: Session },
    CallChanged { call: Call },
    AccountResolved { account: Account },
    /// Every engine line, classified or not
    RawLine { text: String, timestamp: i64 },
    ProcessExited,
    CallDuration { elapsed_secs: u64, display: String },
    DialFailed { detail: String },
    IncomingCall,
    /// Background failure that no intent was waiting on
    Failure { code: String, message: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PhoneSnapshot {
    pub session: Session,
    pub call: Call,
    pub call_elapsed_secs: Option<u64>,
    pub pending_timers: Vec<TimerKind>,
    pub engine_running: bool,
}

/// Controller settings resolved from configuration
#[derive(Clone, Debug)]
pub struct PhoneSettings {
    pub engine_path: String,
    pub log_level: u8,
    pub timing: Timing,
}

impl PhoneSettings {
    pub fn from_config(config: &PhoneConfig) -> Self {
        Self {
            engine_path: config.engine.path.clone(),
            log_level: config.engine.log_level,
            timing: Timing::from_file(&config.timing),
        }
    }
}

impl Default for PhoneSettings {
    fn default() -> Self {
        Self::from_config(&PhoneConfig::default())
    }
}

enum PhoneCommand {
    Login {
        request: LoginRequest,
        respond_to: oneshot::Sender<Result<(), PhoneError>>,
    },
    Dial {
        destination: String,
        respond_to: oneshot::Sender<Result<(), PhoneError>>,
    },
    Hangup {
        respond_to: oneshot::Sender<Result<(), PhoneError>>,
    },
    Unregister {
        respond_to: oneshot::Sender<Result<(), PhoneError>>,
    },
    QueryStatus {
        respond_to: oneshot::Sender<Result<(), PhoneError>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
    Snapshot {
        respond_to: oneshot::Sender<PhoneSnapshot>,
    },
}

/// Handle to the controller actor
#[derive(Clone)]
pub struct PhoneHandle {
    sender: mpsc::Sender<PhoneCommand>,
    notifications: broadcast::Sender<PhoneNotification>,
}

impl PhoneHandle {
    pub async fn login(&self, request: LoginRequest) -> Result<(), PhoneError> {
        self.ask(|respond_to| PhoneCommand::Login {
            request,
            respond_to,
        })
        .await?
    }

    pub async fn dial(&self, destination: &str) -> Result<(), PhoneError> {
        let destination = destination.to_string();
        self.ask(|respond_to| PhoneCommand::Dial {
            destination,
            respond_to,
        })
        .await?
    }

    pub async fn hangup(&self) -> Result<(), PhoneError> {
        self.ask(|respond_to| PhoneCommand::Hangup { respond_to })
            .await?
    }

    pub async fn unregister(&self) -> Result<(), PhoneError> {
        self.ask(|respond_to| PhoneCommand::Unregister { respond_to })
            .await?
    }

    pub async fn query_status(&self) -> Result<(), PhoneError> {
        self.ask(|respond_to| PhoneCommand::QueryStatus { respond_to })
            .await?
    }

    /// Tear everything down from whatever state the phone is in
    pub async fn shutdown(&self) -> Result<(), PhoneError> {
        self.ask(|respond_to| PhoneCommand::Shutdown { respond_to })
            .await
    }

    pub async fn snapshot(&self) -> Result<PhoneSnapshot, PhoneError> {
        self.ask(|respond_to| PhoneCommand::Snapshot { respond_to })
            .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PhoneNotification> {
        self.notifications.subscribe()
    }

    async fn ask<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> PhoneCommand,
    ) -> Result<T, PhoneError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| PhoneError::ControllerGone)?;
        rx.await.map_err(|_| PhoneError::ControllerGone)
    }
}

/// Everything the control loop reacts to besides intents
enum LoopEvent {
    Engine { generation: u64, output: EngineOutput },
    Timer(TimerFired),
}

impl From<TimerFired> for LoopEvent {
    fn from(fired: TimerFired) -> Self {
        LoopEvent::Timer(fired)
    }
}

pub struct PhoneController<L: Launcher> {
    launcher: L,
    settings: PhoneSettings,
    commands: mpsc::Receiver<PhoneCommand>,
    queue: mpsc::Receiver<LoopEvent>,
    queue_tx: mpsc::Sender<LoopEvent>,
    notifications: broadcast::Sender<PhoneNotification>,
    dispatcher: CommandDispatcher<L::Link>,
    session: SessionMachine,
    call: CallMachine,
    timers: Timers<LoopEvent>,
    /// Recent engine lines for the login re-check
    history: VecDeque<String>,
    generation: u64,
    current: Option<u64>,
    forwarder: Option<JoinHandle<()>>,
}

impl<L: Launcher> PhoneController<L> {
    /// Start the controller task and return its handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(launcher: L, settings: PhoneSettings) -> PhoneHandle {
        let (sender, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (queue_tx, queue) = mpsc::channel(LOOP_QUEUE_CAPACITY);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let controller = PhoneController {
            launcher,
            dispatcher: CommandDispatcher::new(settings.timing.pacing),
            history: VecDeque::with_capacity(settings.timing.history_lines),
            settings,
            commands,
            queue,
            timers: Timers::new(queue_tx.clone()),
            queue_tx,
            notifications: notifications.clone(),
            session: SessionMachine::new(),
            call: CallMachine::new(),
            generation: 0,
            current: None,
            forwarder: None,
        };

        tokio::spawn(controller.run());

        PhoneHandle {
            sender,
            notifications,
        }
    }

    async fn run(mut self) {
        debug!("Phone controller started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.queue.recv() => self.handle_loop_event(event).await,
            }
        }

        // Every handle is gone; leave no engine behind
        self.shutdown().await;
        debug!("Phone controller stopped");
    }

    async fn handle_command(&mut self, command: PhoneCommand) {
        match command {
            PhoneCommand::Login {
                request,
                respond_to,
            } => {
                let result = self.login(request).await;
                let _ = respond_to.send(result);
            }

            PhoneCommand::Dial {
                destination,
                respond_to,
            } => {
                let result = self.dial(&destination).await;
                let _ = respond_to.send(result);
            }

            PhoneCommand::Hangup { respond_to } => {
                let result = self.hangup().await;
                let _ = respond_to.send(result);
            }

            PhoneCommand::Unregister { respond_to } => {
                let result = self.unregister().await;
                let _ = respond_to.send(result);
            }

            PhoneCommand::QueryStatus { respond_to } => {
                let result = self.query_status().await;
                let _ = respond_to.send(result);
            }

            PhoneCommand::Shutdown { respond_to } => {
                self.shutdown().await;
                let _ = respond_to.send(());
            }

            PhoneCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    // ── Intents ────────────────────────────────────────────────────

    async fn login(&mut self, request: LoginRequest) -> Result<(), PhoneError> {
        let request = request.validate()?;
        self.session.check_can_login(self.call.state())?;

        // Whatever is left of an earlier engine goes first
        self.timers.cancel_all();
        self.teardown_engine().await;
        self.history.clear();

        let args = launch_args(&request, self.settings.log_level);
        let (link, output) = self
            .launcher
            .launch(&self.settings.engine_path, &args)
            .map_err(|e| {
                error!(
                    "Failed to start engine '{}': {}",
                    self.settings.engine_path, e
                );
                PhoneError::from(e)
            })?;

        self.generation += 1;
        let generation = self.generation;
        self.current = Some(generation);
        self.forwarder = Some(spawn_forwarder(generation, output, self.queue_tx.clone()));
        self.dispatcher.attach(link);

        info!(
            "Engine started for {} (local port {}), waiting for registration",
            request.sip_uri(),
            request.port
        );

        let effects = self.session.connecting(&request);
        self.publish_session();
        self.apply(effects).await;
        Ok(())
    }

    async fn dial(&mut self, destination: &str) -> Result<(), PhoneError> {
        let destination = self.call.check_can_dial(self.session.state(), destination)?;
        let registrar = self
            .session
            .registrar()
            .ok_or(PhoneError::NotRegistered)?;
        let uri = format!("sip:{}@{}", destination, registrar);

        info!("Dialing {}", uri);
        if let Err(e) = self.dispatcher.dial(&uri).await {
            self.on_write_failure(&e).await;
            return Err(e);
        }

        self.call.dialing(destination);
        self.publish_call();
        Ok(())
    }

    async fn hangup(&mut self) -> Result<(), PhoneError> {
        self.call.check_can_hangup(self.session.state())?;

        info!("Hanging up");
        if let Err(e) = self.send_hangup().await {
            self.on_write_failure(&e).await;
            return Err(e);
        }
        Ok(())
    }

    /// Send `h` and move the call to `Terminating` under the forced-hangup timer
    async fn send_hangup(&mut self) -> Result<(), PhoneError> {
        self.dispatcher.hangup().await?;
        if self.call.state() != CallState::Terminating {
            let effects = self.call.terminating();
            self.publish_call();
            self.apply(effects).await;
        }
        Ok(())
    }

    async fn unregister(&mut self) -> Result<(), PhoneError> {
        self.session.begin_unregister()?;
        self.publish_session();
        info!("Unregistering");

        if self.call.state() != CallState::Idle {
            if let Err(e) = self.send_hangup().await {
                warn!("Hang-up before unregister failed: {}", e);
            }
        }

        match self.dispatcher.unregister().await {
            Ok(()) => tokio::time::sleep(self.settings.timing.unregister_settle).await,
            Err(e) => warn!("Unregister command failed: {}", e),
        }

        self.timers.cancel_all();
        self.clear_call();
        self.quit_engine().await;
        self.reset_session();
        Ok(())
    }

    async fn query_status(&mut self) -> Result<(), PhoneError> {
        if !self.dispatcher.is_attached() {
            return Err(PhoneError::InvalidState {
                operation: "query status",
                session: self.session.state(),
                call: self.call.state(),
            });
        }

        if let Err(e) = self.dispatcher.query_status().await {
            self.on_write_failure(&e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        if self.call.state() != CallState::Idle && self.dispatcher.is_attached() {
            if let Err(e) = self.dispatcher.hangup().await {
                debug!("Hang-up during shutdown failed: {}", e);
            }
        }

        self.timers.cancel_all();
        self.clear_call();
        self.quit_engine().await;
        self.reset_session();
    }

    fn snapshot(&self) -> PhoneSnapshot {
        PhoneSnapshot {
            session: self.session.session().clone(),
            call: self.call.call().clone(),
            call_elapsed_secs: self.call.elapsed_secs(Instant::now()),
            pending_timers: self.timers.pending(),
            engine_running: self.dispatcher.is_attached(),
        }
    }

    // ── Loop events ────────────────────────────────────────────────

    async fn handle_loop_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Engine { generation, output } => {
                if self.current != Some(generation) {
                    debug!(generation, "Dropping output from a previous engine");
                    return;
                }
                match output {
                    EngineOutput::Line { text, timestamp } => {
                        self.on_line(generation, text, timestamp).await
                    }
                    EngineOutput::Exited => self.apply_event(Event::ProcessExited).await,
                }
            }

            LoopEvent::Timer(fired) => {
                if self.timers.accept(&fired) {
                    self.on_timer(fired.kind).await;
                }
            }
        }
    }

    async fn on_line(&mut self, generation: u64, text: String, timestamp: i64) {
        debug!("<- {}", text);

        if self.history.len() >= self.settings.timing.history_lines {
            self.history.pop_front();
        }
        self.history.push_back(text.clone());

        let events = classify(&text);
        self.publish(PhoneNotification::RawLine { text, timestamp });

        for event in events {
            // A write failure part way through tears the engine down
            if self.current != Some(generation) {
                break;
            }
            self.apply_event(event).await;
        }
    }

    async fn apply_event(&mut self, event: Event) {
        match event {
            Event::RegistrationSucceeded => self.on_registered().await,

            Event::AccountInfo {
                username,
                server,
                raw_uri,
            } => {
                if self.session.on_account_info(&username, &server, &raw_uri) {
                    info!("Account resolved: {}", raw_uri);
                    let account = self.session.session().account.clone();
                    self.publish(PhoneNotification::AccountResolved { account });
                }
            }

            Event::IncomingCall => {
                info!("Incoming call");
                self.publish(PhoneNotification::IncomingCall);
            }

            Event::Ringing => {
                if self.call.on_ringing() {
                    info!("Remote is ringing");
                    self.publish_call();
                }
            }

            Event::CallEstablished => {
                if let Some(effects) = self.call.on_established(Instant::now(), Utc::now()) {
                    info!("Call established");
                    self.publish_call();
                    self.publish_duration(0);
                    self.apply(effects).await;
                }
            }

            Event::CallDisconnected => self.end_call(false).await,

            Event::DialFailed { detail } => {
                if self.call.on_dial_failed() {
                    warn!("Dial failed: {}", detail);
                    self.publish(PhoneNotification::DialFailed { detail });
                    self.publish_call();
                }
            }

            Event::ProcessExited => self.on_process_exited().await,

            Event::RemoteAnswered => debug!("Remote answered"),

            Event::CommandAck { kind } => debug!(?kind, "Engine acknowledged command"),

            Event::UnclassifiedLine { .. } => {}
        }
    }

    async fn on_registered(&mut self) {
        if let Some(effects) = self.session.on_registered(Utc::now()) {
            info!("Registered");
            self.publish_session();
            self.apply(effects).await;
        }
    }

    async fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::LoginConfirm => {
                let found =
                    history_indicates_registration(self.history.iter().map(String::as_str));
                if found {
                    info!("Registration found in recent engine output");
                } else {
                    debug!("Registration not confirmed yet, polling status");
                }

                let before = self.session.state();
                let effects = self.session.on_login_confirm(found, Utc::now());
                if self.session.state() != before {
                    self.publish_session();
                }
                self.apply(effects).await;
            }

            TimerKind::StatusPoll => {
                let effects = self.session.on_status_poll();
                self.apply(effects).await;
            }

            TimerKind::CallTick => {
                if let Some((elapsed, effects)) = self.call.tick(Instant::now()) {
                    self.publish_duration(elapsed);
                    self.apply(effects).await;
                }
            }

            TimerKind::ForcedHangup => self.end_call(true).await,
        }
    }

    async fn end_call(&mut self, forced: bool) {
        let effects = if forced {
            self.call.on_forced_timeout()
        } else {
            self.call.on_disconnected()
        };

        if let Some(effects) = effects {
            if forced {
                warn!("Engine never confirmed the hang-up, forcing the call to idle");
            } else {
                info!("Call disconnected");
            }
            self.apply(effects).await;
            self.publish_call();
            self.publish_duration(0);
        }
    }

    async fn on_process_exited(&mut self) {
        let was_running = self.current.is_some() || self.dispatcher.is_attached();

        self.timers.cancel_all();
        self.teardown_engine().await;
        self.clear_call();
        self.reset_session();

        if was_running {
            info!("Engine process exited");
            self.publish(PhoneNotification::ProcessExited);
        }
    }

    async fn on_write_failure(&mut self, err: &PhoneError) {
        warn!("Engine write failed, tearing the session down: {}", err);
        self.publish(PhoneNotification::Failure {
            code: err.error_code().to_string(),
            message: err.to_string(),
        });
        self.on_process_exited().await;
    }

    // ── Plumbing ───────────────────────────────────────────────────

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Schedule(kind) => {
                    let delay = delay_for(&self.settings.timing, kind);
                    self.timers.schedule(kind, delay);
                }
                Effect::Cancel(kind) => {
                    self.timers.cancel(kind);
                }
                Effect::QueryStatus => {
                    if let Err(e) = self.dispatcher.query_status().await {
                        self.on_write_failure(&e).await;
                        return;
                    }
                }
            }
        }
    }

    /// Politely quit the engine if one is attached, then make sure it is gone
    async fn quit_engine(&mut self) {
        if self.dispatcher.is_attached() {
            match self.dispatcher.quit().await {
                Ok(()) => tokio::time::sleep(self.settings.timing.quit_grace).await,
                Err(e) => debug!("Quit command failed: {}", e),
            }
        }
        self.teardown_engine().await;
    }

    async fn teardown_engine(&mut self) {
        self.current = None;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.dispatcher
            .force_cleanup(self.settings.timing.terminate_grace)
            .await;
    }

    fn clear_call(&mut self) {
        if self.call.state() != CallState::Idle {
            self.call.clear();
            self.publish_call();
            self.publish_duration(0);
        }
    }

    fn reset_session(&mut self) {
        let was_idle = self.session.session() == &Session::default();
        self.session.reset();
        if !was_idle {
            self.publish_session();
        }
    }

    fn publish(&self, notification: PhoneNotification) {
        // No subscribers is fine
        let _ = self.notifications.send(notification);
    }

    fn publish_session(&self) {
        self.publish(PhoneNotification::SessionChanged {
            session: self.session.session().clone(),
        });
    }

    fn publish_call(&self) {
        self.publish(PhoneNotification::CallChanged {
            call: self.call.call().clone(),
        });
    }

    fn publish_duration(&self, elapsed_secs: u64) {
        self.publish(PhoneNotification::CallDuration {
            elapsed_secs,
            display: format_elapsed(elapsed_secs),
        });
    }
}

fn delay_for(timing: &Timing, kind: TimerKind) -> Duration {
    match kind {
        TimerKind::LoginConfirm => timing.login_confirm,
        TimerKind::StatusPoll => timing.status_poll,
        TimerKind::CallTick => timing.call_tick,
        TimerKind::ForcedHangup => timing.forced_hangup,
    }
}

/// Moves one engine's output into the loop queue, tagged with its generation.
/// A full queue blocks here, which in turn blocks the engine's reader.
fn spawn_forwarder(
    generation: u64,
    mut output: mpsc::Receiver<EngineOutput>,
    queue: mpsc::Sender<LoopEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(output) = output.recv().await {
            let exited = output == EngineOutput::Exited;
            if queue
                .send(LoopEvent::Engine { generation, output })
                .await
                .is_err()
                || exited
            {
                return;
            }
        }

        // Supervisor vanished without reporting the exit
        let _ = queue
            .send(LoopEvent::Engine {
                generation,
                output: EngineOutput::Exited,
            })
            .await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_follow_timing() {
        let timing = Timing::default();
        assert_eq!(delay_for(&timing, TimerKind::LoginConfirm), Duration::from_secs(5));
        assert_eq!(delay_for(&timing, TimerKind::StatusPoll), Duration::from_secs(10));
        assert_eq!(delay_for(&timing, TimerKind::CallTick), Duration::from_secs(1));
        assert_eq!(delay_for(&timing, TimerKind::ForcedHangup), Duration::from_secs(5));
    }

    #[test]
    fn notifications_serialize_with_type_tag() {
        let json = serde_json::to_value(PhoneNotification::CallDuration {
            elapsed_secs: 61,
            display: format_elapsed(61),
        })
        .unwrap();
        assert_eq!(json["type"], "call_duration");
        assert_eq!(json["display"], "00:01:01");

        let json = serde_json::to_value(PhoneNotification::ProcessExited).unwrap();
        assert_eq!(json["type"], "process_exited");
    }

    #[tokio::test]
    async fn forwarder_synthesizes_exit_when_supervisor_vanishes() {
        let (engine_tx, engine_rx) = mpsc::channel(4);
        let (queue_tx, mut queue_rx) = mpsc::channel(4);
        let task = spawn_forwarder(7, engine_rx, queue_tx);

        engine_tx
            .send(EngineOutput::Line {
                text: "hello".into(),
                timestamp: 0,
            })
            .await
            .unwrap();
        drop(engine_tx);
        task.await.unwrap();

        let mut outputs = Vec::new();
        while let Ok(LoopEvent::Engine { generation, output }) = queue_rx.try_recv() {
            assert_eq!(generation, 7);
            outputs.push(output);
        }
        assert_eq!(
            outputs,
            vec![
                EngineOutput::Line {
                    text: "hello".into(),
                    timestamp: 0
                },
                EngineOutput::Exited
            ]
        );
    }
}
