//! Engine Process - supervision of a line-oriented console program
//!
//! Runs an external engine (such as a SIP user agent) inside a PTY, so it sees
//! an interactive console and its stdout/stderr arrive as one stream. Output is
//! decoded into lines and delivered in order on a bounded channel; a slow
//! consumer blocks the reader instead of losing lines. Exactly one
//! [`EngineOutput::Exited`] follows the last line.
//!
//! # Example
//!
//! ```no_run
//! use engine_process::{EngineActor, EngineConfig, EngineOutput, DEFAULT_TERMINATE_GRACE};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig {
//!         program: "pjsua".to_string(),
//!         args: vec!["--local-port=5070".to_string()],
//!         ..Default::default()
//!     };
//!
//!     let (engine, mut output) = EngineActor::spawn(config).unwrap();
//!     engine.write_line("d").await.unwrap();
//!
//!     while let Some(event) = output.recv().await {
//!         match event {
//!             EngineOutput::Line { text, .. } => println!("{}", text),
//!             EngineOutput::Exited => break,
//!         }
//!     }
//!
//!     engine.terminate(DEFAULT_TERMINATE_GRACE).await.unwrap();
//! }
//! ```

mod error;
pub mod lines;
pub mod process;

pub use error::ProcessError;
pub use lines::LineDecoder;
pub use process::{
    DEFAULT_TERMINATE_GRACE, EngineActor, EngineConfig, EngineHandle, EngineOutput, EngineState,
    LINE_TERMINATOR,
};
