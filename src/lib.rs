#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! s2c-middleware library — translates a line-oriented TCP client protocol
//! into the AT-command protocol of an S2C-family acoustic underwater modem,
//! and carries a parallel file-transfer channel over its own connection.
//!
//! - `types` — wire-level value types: client commands/responses, modem
//!   messages, the measurement-kind dictionary
//! - `config` — INI configuration loading and AT mnemonic table
//! - `queues` — bounded inter-task channels and shared signal flags
//! - `command_server` / `interrupt_server` — the two client-facing TCP
//!   servers
//! - `modem_link` — the command-channel connection to the modem (TCP or
//!   RS-232)
//! - `file_link` — the independent file-transfer connection to the modem
//! - `message_handler` — AT traffic classifier and router
//! - `interrupt_dispatcher` — instant-message event decoder
//! - `file_handler` — sender/receiver state machines for file transfer
//! - `dispatcher` — client verb dispatch table

pub mod command_server;
pub mod config;
pub mod dispatcher;
pub mod file_handler;
pub mod file_link;
pub mod interrupt_dispatcher;
pub mod interrupt_server;
pub mod message_handler;
pub mod modem_link;
pub mod queues;
pub mod types;

pub use config::Config;
pub use queues::Signals;
