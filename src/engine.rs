//! Reconciliation engine.
//!
//! Drives one run: normalize external records, resolve identities against
//! the local store, carry existing scheduling history forward untouched,
//! create zero-state cards for new notes, collect guid write-backs, trigger
//! idempotent audio synthesis, and hand the resolved note set to the package
//! builder. The whole run is one store transaction: commit happens only
//! after the package is on disk, otherwise everything rolls back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::audio::{self, AudioCache};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::identity::{self, IdAllocator};
use crate::models::{
    AudioRequest, CardRow, DriftReport, NoteRow, PendingWrite, ResolvedNote, SourceRecord,
};
use crate::package;
use crate::record::{self, Entry};
use crate::stats::RunStats;
use crate::store::Collection;

/// Run lifecycle. `Failed` is reachable from any state; everything before
/// `Done` still holds the store transaction open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Resolving,
    Merging,
    Synthesizing,
    Packaging,
    Done,
    Failed,
}

/// What a completed run produced, beyond the artifact itself.
#[derive(Debug)]
pub struct RunOutcome {
    pub stats: RunStats,
    pub pending_writes: Vec<PendingWrite>,
    pub drift: DriftReport,
}

/// One run's reconciliation state. Owns the id allocator and the audio
/// cache handle for the duration of the run; the store connection is
/// borrowed exclusively.
pub struct Engine {
    allocator: IdAllocator,
    audio: Arc<AudioCache>,
    state: RunState,
}

impl Engine {
    /// The allocator is injected so tests can pin the id space and so the
    /// seed is chosen exactly once per run by the caller.
    pub fn new(allocator: IdAllocator, audio: Arc<AudioCache>) -> Self {
        Self {
            allocator,
            audio,
            state: RunState::Pending,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "run state");
        self.state = next;
    }

    /// Execute one full run over `records`.
    ///
    /// On success the store transaction is committed and the package is at
    /// its output path. On error the transaction is rolled back; no partial
    /// note or card writes survive. Audio files already on disk stay as
    /// reusable cache entries either way.
    pub async fn run(
        &mut self,
        store: &mut Collection,
        config: &Config,
        records: Vec<SourceRecord>,
    ) -> Result<RunOutcome> {
        store.begin().await?;

        match self.run_inner(store, config, records).await {
            Ok(outcome) => {
                store.commit().await?;
                self.transition(RunState::Done);
                Ok(outcome)
            }
            Err(e) => {
                self.transition(RunState::Failed);
                let _ = store.rollback().await;
                Err(e)
            }
        }
    }

    async fn run_inner(
        &mut self,
        store: &mut Collection,
        config: &Config,
        records: Vec<SourceRecord>,
    ) -> Result<RunOutcome> {
        let mut stats = RunStats::default();
        stats.records_read = records.len() as u64;

        let local_guids: HashSet<String> = store.all_guids().await?.into_iter().collect();

        // ── Resolving ────────────────────────────────────────────────
        self.transition(RunState::Resolving);

        let mut resolved_guids: HashMap<String, i64> = HashMap::new();
        let mut used_ids: HashSet<i64> = HashSet::new();
        let mut resolutions: Vec<(Entry, i64, bool)> = Vec::new();

        for source in &records {
            let entry = match record::normalize(source, &config.validation) {
                Ok(entry) => entry,
                Err(issue) => {
                    debug!(location = %source.location, issue = ?issue, "record skipped");
                    stats.count_error(issue.category());
                    stats.records_skipped += 1;
                    continue;
                }
            };

            if resolved_guids.contains_key(&entry.guid) {
                // Two rows collapsing onto one guid in a single run; the
                // first occurrence wins, the rest are reported.
                stats.count_error("duplicate_guid");
                stats.records_skipped += 1;
                continue;
            }

            let resolution = identity::resolve(store, &entry.guid, &mut self.allocator).await?;

            if !used_ids.insert(resolution.local_id) {
                let first_guid = resolved_guids
                    .iter()
                    .find(|(_, id)| **id == resolution.local_id)
                    .map(|(guid, _)| guid.clone())
                    .unwrap_or_default();
                return Err(SyncError::IdentityConflict {
                    id: resolution.local_id,
                    first_guid,
                    second_guid: entry.guid.clone(),
                });
            }
            resolved_guids.insert(entry.guid.clone(), resolution.local_id);

            resolutions.push((entry, resolution.local_id, resolution.existed));
        }

        // ── Merging ──────────────────────────────────────────────────
        self.transition(RunState::Merging);

        let now = chrono::Utc::now().timestamp();
        let deck_id = package::deck_id_for(&config.deck.name);
        let mut resolved_notes: Vec<ResolvedNote> = Vec::new();
        let mut pending_writes: Vec<PendingWrite> = Vec::new();

        for (entry, local_id, existed) in resolutions {
            if entry.external_id.is_empty() {
                // Re-emitted on every run until the write-back lands.
                pending_writes.push(PendingWrite {
                    location: entry.location.clone(),
                    guid: entry.guid.clone(),
                });
            }

            let resolved = if existed {
                self.merge_existing(store, &entry, local_id, now).await?
            } else {
                self.create_note(store, &entry, local_id, deck_id, now).await?
            };

            if resolved.existed {
                stats.records_matched += 1;
            } else {
                stats.records_created += 1;
            }
            resolved_notes.push(resolved);
        }

        // ── Synthesizing ─────────────────────────────────────────────
        self.transition(RunState::Synthesizing);

        let requests: Vec<AudioRequest> = resolved_notes
            .iter()
            .filter_map(|n| n.audio.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        audio::synthesize_many(&self.audio, requests).await;
        stats.audio_generated = self.audio.generated();
        stats.audio_errors = self.audio.errors();

        let drift = drift_report(&local_guids, &resolved_notes);

        // ── Packaging ────────────────────────────────────────────────
        self.transition(RunState::Packaging);

        package::build(
            &config.deck.name,
            &resolved_notes,
            config.audio.media_dir.as_deref(),
            &config.package.output,
        )
        .await?;

        stats.pending_writes = pending_writes.len() as u64;
        info!(
            created = stats.records_created,
            matched = stats.records_matched,
            skipped = stats.records_skipped,
            "run reconciled"
        );

        Ok(RunOutcome {
            stats,
            pending_writes,
            drift,
        })
    }

    /// A matched note: content payload is refreshed, scheduling state is
    /// fetched only to be carried into the package verbatim.
    async fn merge_existing(
        &mut self,
        store: &mut Collection,
        entry: &Entry,
        note_id: i64,
        now: i64,
    ) -> Result<ResolvedNote> {
        store
            .update_note_content(
                note_id,
                &entry.tag_string(),
                &entry.joined_fields(),
                entry.sort_field(),
                "",
                now,
            )
            .await?;

        let cards = store.cards_by_note(note_id).await?;
        let mut revlog = Vec::new();
        for card in &cards {
            revlog.extend(store.revlog_by_card(card.id).await?);
        }

        Ok(ResolvedNote {
            note: NoteRow {
                id: note_id,
                guid: entry.guid.clone(),
                mid: entry.kind.model_id(),
                modified: now,
                usn: -1,
                tags: entry.tag_string(),
                fields: entry.joined_fields(),
                sort_field: entry.sort_field().to_string(),
                checksum: 0,
                flags: 0,
                data: String::new(),
            },
            cards,
            revlog,
            audio: entry.audio.clone(),
            existed: true,
        })
    }

    /// A new note: fresh row plus one zero-state card per template whose
    /// required-field gate passes.
    async fn create_note(
        &mut self,
        store: &mut Collection,
        entry: &Entry,
        note_id: i64,
        deck_id: i64,
        now: i64,
    ) -> Result<ResolvedNote> {
        let note = NoteRow {
            id: note_id,
            guid: entry.guid.clone(),
            mid: entry.kind.model_id(),
            modified: now,
            usn: -1,
            tags: entry.tag_string(),
            fields: entry.joined_fields(),
            sort_field: entry.sort_field().to_string(),
            checksum: 0,
            flags: 0,
            data: String::new(),
        };
        store.insert_note(&note).await?;

        let mut cards = Vec::new();
        for ordinal in entry.card_ordinals() {
            let card = CardRow {
                id: self.allocator.next(),
                note_id,
                deck_id,
                ordinal,
                modified: now,
                usn: -1,
                card_type: 0,
                queue: 0,
                due: 0,
                interval: 0,
                factor: 0,
                reps: 0,
                lapses: 0,
                left: 0,
                original_due: 0,
                original_deck_id: 0,
                flags: 0,
                data: String::new(),
            };
            store.insert_card(&card).await?;
            cards.push(card);
        }

        Ok(ResolvedNote {
            note,
            cards,
            revlog: Vec::new(),
            audio: entry.audio.clone(),
            existed: false,
        })
    }
}

/// Set-difference diagnostics between the pre-run local guid set and the
/// guids this run's records resolved to.
fn drift_report(local_guids: &HashSet<String>, resolved: &[ResolvedNote]) -> DriftReport {
    let external: HashSet<&str> = resolved.iter().map(|n| n.note.guid.as_str()).collect();

    DriftReport {
        in_both: external.iter().filter(|g| local_guids.contains(**g)).count(),
        only_external: external.iter().filter(|g| !local_guids.contains(**g)).count(),
        only_local: local_guids
            .iter()
            .filter(|g| !external.contains(g.as_str()))
            .count(),
    }
}
