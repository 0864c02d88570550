//! Kitchen Voice - hands-free voice controller for a kitchen assistant
//!
//! Listens for a wake phrase (or a manual toggle), captures a spoken
//! command, sends it to a conversational backend and plays the spoken
//! reply, looping until the user stops or the conversation runs out of
//! retries.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Console toggle  │  Microphone / typed lines         │
//! └────────┬─────────┴──────────────┬────────────────────┘
//!          │       one event queue  │
//! ┌────────▼────────────────────────▼────────────────────┐
//! │  Daemon: executes effects, owns devices and timers   │
//! │  Session: state machine, retry budget, resource ids  │
//! └────────┬──────────────────┬──────────────────────────┘
//!          │                  │
//! ┌────────▼───────┐  ┌───────▼──────────┐
//! │ Backend (HTTP) │  │ Playback (cpal)  │
//! └────────────────┘  └──────────────────┘
//! ```

pub mod backend;
pub mod config;
pub mod daemon;
pub mod error;
pub mod presentation;
pub mod voice;

pub use backend::{Backend, HttpBackend};
pub use config::Config;
pub use daemon::{Control, Daemon};
pub use error::{BackendError, Error, PlaybackError, RecognitionError, Result};
pub use presentation::{ConsolePresenter, Notice, Presenter};
