//! # deck-sync
//!
//! A reconciliation and package-generation engine that keeps a spreadsheet
//! of vocabulary items synchronized with a local Anki collection and emits a
//! portable `.apkg` export on every run.
//!
//! The engine matches external records to local notes by guid, preserves
//! existing review/scheduling history verbatim, synthesizes derived audio
//! assets idempotently, and writes freshly assigned guids back to the
//! spreadsheet as one batch.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────┐
//! │ RecordSource │──▶│ Reconciliation │◀─▶│  Collection  │
//! │  (sheets)    │   │    Engine      │   │   (SQLite)   │
//! └──────┬───────┘   └───────┬────────┘   └──────────────┘
//!        ▲                   │        ╲
//!        │ guid write-back   ▼         ╲ side channel
//!        │            ┌──────────┐   ┌────────────┐
//!        └────────────│ Package  │   │ AudioCache │
//!                     │ (.apkg)  │   │   (TTS)    │
//!                     └──────────┘   └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and validation policy |
//! | [`models`] | Core data types |
//! | [`record`] | Record kinds, column tables, normalization |
//! | [`identity`] | Guid derivation and identity resolution |
//! | [`store`] | Local collection adapter |
//! | [`engine`] | Reconciliation run orchestration |
//! | [`audio`] | Idempotent audio asset cache |
//! | [`package`] | `.apkg` export artifact |
//! | [`sheets`] | Spreadsheet source and write-back |
//! | [`stats`] | Run statistics and collection overview |

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod models;
pub mod package;
pub mod record;
pub mod sheets;
pub mod stats;
pub mod store;

pub use error::{Result, SyncError};
