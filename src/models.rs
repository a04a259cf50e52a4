//! Core data models used throughout deck-sync.
//!
//! These types represent the external records, persisted note/card/revlog
//! rows, and transient run outputs that flow through the reconciliation
//! pipeline.

use std::collections::BTreeMap;

use crate::record::EntryKind;

/// Raw item produced by a record source before normalization.
///
/// One per external row. `external_id` is the guid column value and may be
/// empty; `location` is the cell the guid would be written back to
/// (e.g. `Words!A7`).
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub kind: EntryKind,
    pub location: String,
    pub external_id: String,
    pub columns: BTreeMap<String, String>,
}

/// A row of the `notes` relation, bit-exact with the collection schema.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteRow {
    pub id: i64,
    pub guid: String,
    pub mid: i64,
    pub modified: i64,
    pub usn: i64,
    pub tags: String,
    pub fields: String,
    pub sort_field: String,
    pub checksum: i64,
    pub flags: i64,
    pub data: String,
}

/// A row of the `cards` relation. Carried forward verbatim for notes that
/// already exist; freshly zeroed for new notes.
#[derive(Debug, Clone, PartialEq)]
pub struct CardRow {
    pub id: i64,
    pub note_id: i64,
    pub deck_id: i64,
    pub ordinal: i64,
    pub modified: i64,
    pub usn: i64,
    pub card_type: i64,
    pub queue: i64,
    pub due: i64,
    pub interval: i64,
    pub factor: i64,
    pub reps: i64,
    pub lapses: i64,
    pub left: i64,
    pub original_due: i64,
    pub original_deck_id: i64,
    pub flags: i64,
    pub data: String,
}

/// A row of the `revlog` relation. Immutable review history; only ever
/// copied forward.
#[derive(Debug, Clone, PartialEq)]
pub struct RevlogRow {
    pub id: i64,
    pub card_id: i64,
    pub usn: i64,
    pub ease: i64,
    pub interval: i64,
    pub last_interval: i64,
    pub factor: i64,
    pub taken_ms: i64,
    pub kind: i64,
}

/// A derived audio requirement: the phrase to speak and the filename the
/// result is cached under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AudioRequest {
    pub phrase: String,
    pub filename: String,
}

/// A guid that must be propagated back to the external source because the
/// corresponding record carried no external id at the start of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub location: String,
    pub guid: String,
}

/// Outcome of resolving one external guid against the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub local_id: i64,
    pub existed: bool,
}

/// A note together with its scheduling state, ready for packaging.
///
/// For matched notes `cards` and `revlog` are the pre-run rows, untouched.
/// For new notes they are freshly initialized with zeroed scheduling.
#[derive(Debug, Clone)]
pub struct ResolvedNote {
    pub note: NoteRow,
    pub cards: Vec<CardRow>,
    pub revlog: Vec<RevlogRow>,
    pub audio: Option<AudioRequest>,
    pub existed: bool,
}

/// Diagnostic partition of external vs. local guid sets. Reporting only;
/// never drives reconciliation decisions.
#[derive(Debug, Clone, Default)]
pub struct DriftReport {
    pub in_both: usize,
    pub only_external: usize,
    pub only_local: usize,
}
