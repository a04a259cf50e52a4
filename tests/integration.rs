//! End-to-end reconciliation runs against a temporary collection, with an
//! injected counting synthesizer and in-memory record construction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};
use tempfile::TempDir;

use deck_sync::audio::{AudioCache, Synthesizer};
use deck_sync::config::{
    AudioConfig, Config, DeckConfig, PackageConfig, SourceConfig, StoreConfig, TabConfig,
};
use deck_sync::engine::Engine;
use deck_sync::identity::IdAllocator;
use deck_sync::models::{CardRow, NoteRow, RevlogRow, SourceRecord};
use deck_sync::record::{EntryKind, ValidationPolicy};
use deck_sync::store::{self, Collection};
use deck_sync::Result;

struct CountingSynthesizer {
    calls: AtomicU32,
}

impl CountingSynthesizer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Synthesizer for CountingSynthesizer {
    async fn synthesize(&self, _text: &str, dest: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::fs::write(dest, b"mp3")?;
        Ok(())
    }
}

async fn raw_conn(path: &Path) -> SqliteConnection {
    SqliteConnection::connect_with(
        &SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .unwrap()
            .create_if_missing(true),
    )
    .await
    .unwrap()
}

/// Create an empty collection database on disk.
async fn seed_empty_collection(path: &Path) {
    let mut conn = raw_conn(path).await;
    store::create_base_schema(&mut conn).await.unwrap();
    conn.close().await.unwrap();
}

/// Create a collection holding one reviewed note with real scheduling state.
async fn seed_reviewed_note(path: &Path, guid: &str) -> (NoteRow, Vec<CardRow>, Vec<RevlogRow>) {
    let mut conn = raw_conn(path).await;
    store::create_base_schema(&mut conn).await.unwrap();

    let note = NoteRow {
        id: 5001,
        guid: guid.to_string(),
        mid: EntryKind::Word.model_id(),
        modified: 1_600_000_000,
        usn: -1,
        tags: " class::noun ".to_string(),
        fields: "house\u{1f}σπίτι\u{1f}noun\u{1f}neuter\u{1f}[sound:σπίτι.mp3]".to_string(),
        sort_field: "house".to_string(),
        checksum: 0,
        flags: 0,
        data: String::new(),
    };
    store::insert_note_into(&mut conn, &note).await.unwrap();

    let cards = vec![
        CardRow {
            id: 6001,
            note_id: note.id,
            deck_id: 1,
            ordinal: 0,
            modified: 1_600_000_100,
            usn: -1,
            card_type: 2,
            queue: 2,
            due: 245,
            interval: 15,
            factor: 2500,
            reps: 3,
            lapses: 0,
            left: 0,
            original_due: 0,
            original_deck_id: 0,
            flags: 0,
            data: String::new(),
        },
        CardRow {
            id: 6002,
            note_id: note.id,
            deck_id: 1,
            ordinal: 1,
            modified: 1_600_000_200,
            usn: -1,
            card_type: 2,
            queue: 2,
            due: 250,
            interval: 21,
            factor: 2350,
            reps: 5,
            lapses: 1,
            left: 0,
            original_due: 0,
            original_deck_id: 0,
            flags: 0,
            data: String::new(),
        },
    ];
    for card in &cards {
        store::insert_card_into(&mut conn, card).await.unwrap();
    }

    let revlog = vec![
        RevlogRow {
            id: 7001,
            card_id: 6001,
            usn: -1,
            ease: 3,
            interval: 15,
            last_interval: 7,
            factor: 2500,
            taken_ms: 4200,
            kind: 1,
        },
        RevlogRow {
            id: 7002,
            card_id: 6002,
            usn: -1,
            ease: 2,
            interval: 21,
            last_interval: 15,
            factor: 2350,
            taken_ms: 6100,
            kind: 1,
        },
    ];
    for entry in &revlog {
        store::insert_revlog_into(&mut conn, entry).await.unwrap();
    }

    conn.close().await.unwrap();
    (note, cards, revlog)
}

fn test_config(dir: &TempDir, media_dir: Option<PathBuf>) -> Config {
    Config {
        store: StoreConfig {
            path: dir.path().join("collection.anki2"),
        },
        deck: DeckConfig {
            name: "Greek Vocabulary".to_string(),
        },
        package: PackageConfig {
            output: dir.path().join("greek.apkg"),
        },
        source: SourceConfig {
            sheet_id: "test-sheet".to_string(),
            tabs: vec![TabConfig {
                name: "Words".to_string(),
                kind: EntryKind::Word,
            }],
        },
        audio: AudioConfig {
            media_dir,
            ..AudioConfig::default()
        },
        validation: ValidationPolicy::default(),
    }
}

fn word_record(row: usize, columns: &[(&str, &str)]) -> SourceRecord {
    let columns: BTreeMap<String, String> = columns
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    SourceRecord {
        kind: EntryKind::Word,
        location: format!("Words!A{}", row),
        external_id: columns.get("GUID").cloned().unwrap_or_default(),
        columns,
    }
}

fn engine_with_media(seed: i64, media_dir: &Path, synth: &Arc<CountingSynthesizer>) -> Engine {
    let cache = Arc::new(AudioCache::new(
        Some(media_dir.to_path_buf()),
        synth.clone() as Arc<dyn Synthesizer>,
        2,
    ));
    Engine::new(IdAllocator::new(seed), cache)
}

fn engine_without_media(seed: i64) -> Engine {
    Engine::new(IdAllocator::new(seed), Arc::new(AudioCache::disabled()))
}

#[tokio::test]
async fn test_new_record_creates_note_cards_and_pending_write() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, None);
    seed_empty_collection(&config.store.path).await;

    let records = vec![word_record(
        2,
        &[("Greek", "σπίτι"), ("English", "house"), ("Gender", "neuter")],
    )];

    let mut store = Collection::open(&config.store.path).await.unwrap();
    let mut engine = engine_without_media(1_800_000_000_000);
    let outcome = engine.run(&mut store, &config, records).await.unwrap();

    assert_eq!(outcome.stats.records_created, 1);
    assert_eq!(outcome.stats.records_matched, 0);
    assert_eq!(outcome.pending_writes.len(), 1);
    assert_eq!(outcome.pending_writes[0].location, "Words!A2");
    assert_eq!(outcome.pending_writes[0].guid.chars().count(), 10);

    let note_id = store
        .note_id_by_guid(&outcome.pending_writes[0].guid)
        .await
        .unwrap()
        .expect("new note committed");
    let cards = store.cards_by_note(note_id).await.unwrap();
    assert!(!cards.is_empty());
    for card in &cards {
        assert_eq!(card.interval, 0);
        assert_eq!(card.reps, 0);
        assert_eq!(card.factor, 0);
        assert_eq!(card.queue, 0);
    }

    assert!(config.package.output.exists());
}

#[tokio::test]
async fn test_history_preserved_for_matched_note() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, None);
    let (note, cards_before, revlog_before) =
        seed_reviewed_note(&config.store.path, "abcde12345").await;

    let records = vec![word_record(
        2,
        &[
            ("GUID", "abcde12345"),
            ("Greek", "σπίτι"),
            ("English", "the house"),
            ("Gender", "neuter"),
        ],
    )];

    let mut store = Collection::open(&config.store.path).await.unwrap();
    let mut engine = engine_without_media(1_800_000_100_000);
    let outcome = engine.run(&mut store, &config, records).await.unwrap();

    assert_eq!(outcome.stats.records_matched, 1);
    assert_eq!(outcome.stats.records_created, 0);
    assert!(outcome.pending_writes.is_empty());

    // Scheduling state is carried forward field-for-field.
    let cards_after = store.cards_by_note(note.id).await.unwrap();
    assert_eq!(cards_after, cards_before);
    for (card, expected) in cards_after.iter().zip(revlog_before.iter()) {
        let revlog = store.revlog_by_card(card.id).await.unwrap();
        assert_eq!(revlog, vec![expected.clone()]);
    }
}

#[tokio::test]
async fn test_crash_before_write_back_self_heals() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, None);
    seed_empty_collection(&config.store.path).await;

    let records = vec![word_record(
        2,
        &[("Greek", "σπίτι"), ("English", "house"), ("Gender", "neuter")],
    )];

    // Run 1 commits locally; the write-back "crashes" by never happening.
    let mut store = Collection::open(&config.store.path).await.unwrap();
    let mut engine = engine_without_media(1_800_000_200_000);
    let first = engine.run(&mut store, &config, records.clone()).await.unwrap();
    assert_eq!(first.stats.records_created, 1);
    store.close().await.unwrap();

    // Run 2 sees the same still-unupdated rows. Content-derived guids
    // converge on the committed note instead of minting a duplicate.
    let mut store = Collection::open(&config.store.path).await.unwrap();
    let mut engine = engine_without_media(1_800_000_300_000);
    let second = engine.run(&mut store, &config, records).await.unwrap();

    assert_eq!(second.stats.records_created, 0);
    assert_eq!(second.stats.records_matched, 1);
    // The batch is re-attempted with the identical guid.
    assert_eq!(second.pending_writes, first.pending_writes);

    let (notes, _, _) = store.counts().await.unwrap();
    assert_eq!(notes, 1);
}

#[tokio::test]
async fn test_written_back_guid_stops_pending_writes() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, None);
    seed_empty_collection(&config.store.path).await;

    let mut store = Collection::open(&config.store.path).await.unwrap();
    let mut engine = engine_without_media(1_800_000_400_000);
    let first = engine
        .run(
            &mut store,
            &config,
            vec![word_record(2, &[("Greek", "σπίτι"), ("English", "house")])],
        )
        .await
        .unwrap();
    let guid = first.pending_writes[0].guid.clone();
    let note_id = store.note_id_by_guid(&guid).await.unwrap().unwrap();
    store.close().await.unwrap();

    // As if the batch write landed: the row now carries its guid.
    let mut store = Collection::open(&config.store.path).await.unwrap();
    let mut engine = engine_without_media(1_800_000_500_000);
    let second = engine
        .run(
            &mut store,
            &config,
            vec![word_record(
                2,
                &[("GUID", guid.as_str()), ("Greek", "σπίτι"), ("English", "house")],
            )],
        )
        .await
        .unwrap();

    assert!(second.pending_writes.is_empty());
    assert_eq!(second.stats.records_matched, 1);
    assert_eq!(store.note_id_by_guid(&guid).await.unwrap(), Some(note_id));
}

#[tokio::test]
async fn test_distinct_records_get_distinct_ids() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, None);
    seed_empty_collection(&config.store.path).await;

    let records = vec![
        word_record(2, &[("Greek", "σπίτι"), ("English", "house")]),
        word_record(3, &[("Greek", "πόρτα"), ("English", "door")]),
        word_record(4, &[("Greek", "κλειδί"), ("English", "key")]),
    ];

    let mut store = Collection::open(&config.store.path).await.unwrap();
    let mut engine = engine_without_media(1_800_000_600_000);
    let outcome = engine.run(&mut store, &config, records).await.unwrap();

    assert_eq!(outcome.stats.records_created, 3);
    let mut ids = Vec::new();
    for write in &outcome.pending_writes {
        ids.push(store.note_id_by_guid(&write.guid).await.unwrap().unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn test_invalid_record_skipped_run_completes() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, None);
    seed_empty_collection(&config.store.path).await;

    let records = vec![
        word_record(2, &[("English", "house")]), // no Greek
        word_record(3, &[("Greek", "πόρτα"), ("English", "door")]),
    ];

    let mut store = Collection::open(&config.store.path).await.unwrap();
    let mut engine = engine_without_media(1_800_000_700_000);
    let outcome = engine.run(&mut store, &config, records).await.unwrap();

    assert_eq!(engine.state(), deck_sync::engine::RunState::Done);
    assert_eq!(outcome.stats.records_skipped, 1);
    assert_eq!(outcome.stats.records_created, 1);
    assert_eq!(outcome.stats.errors.get("missing_required_field"), Some(&1));
    assert!(config.package.output.exists());
}

#[tokio::test]
async fn test_synthesis_idempotent_across_runs() {
    let dir = TempDir::new().unwrap();
    let media_dir = dir.path().join("media");
    std::fs::create_dir_all(&media_dir).unwrap();
    let config = test_config(&dir, Some(media_dir.clone()));
    seed_empty_collection(&config.store.path).await;

    let synth = CountingSynthesizer::new();
    let records = vec![word_record(
        2,
        &[("Greek", "σπίτι"), ("English", "house"), ("Gender", "neuter")],
    )];

    let mut store = Collection::open(&config.store.path).await.unwrap();
    let mut engine = engine_with_media(1_800_000_800_000, &media_dir, &synth);
    let first = engine.run(&mut store, &config, records.clone()).await.unwrap();
    assert_eq!(first.stats.audio_generated, 1);
    assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
    assert!(media_dir.join("σπίτι.mp3").exists());
    store.close().await.unwrap();

    // Second run: the file persists, so the collaborator is not invoked.
    let mut store = Collection::open(&config.store.path).await.unwrap();
    let mut engine = engine_with_media(1_800_000_900_000, &media_dir, &synth);
    let second = engine.run(&mut store, &config, records).await.unwrap();
    assert_eq!(second.stats.audio_generated, 0);
    assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shared_audio_filename_synthesized_once() {
    let dir = TempDir::new().unwrap();
    let media_dir = dir.path().join("media");
    std::fs::create_dir_all(&media_dir).unwrap();
    let config = test_config(&dir, Some(media_dir.clone()));
    seed_empty_collection(&config.store.path).await;

    let synth = CountingSynthesizer::new();
    // Same headword, distinct translations: two notes, one audio filename.
    let records = vec![
        word_record(2, &[("Greek", "σπίτι"), ("English", "house")]),
        word_record(3, &[("Greek", "σπίτι"), ("English", "home")]),
    ];

    let mut store = Collection::open(&config.store.path).await.unwrap();
    let mut engine = engine_with_media(1_800_001_000_000, &media_dir, &synth);
    let outcome = engine.run(&mut store, &config, records).await.unwrap();

    assert_eq!(outcome.stats.records_created, 2);
    assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_drift_reports_only_local_notes() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, None);
    seed_reviewed_note(&config.store.path, "localonly1").await;

    let records = vec![word_record(2, &[("Greek", "πόρτα"), ("English", "door")])];

    let mut store = Collection::open(&config.store.path).await.unwrap();
    let mut engine = engine_without_media(1_800_001_100_000);
    let outcome = engine.run(&mut store, &config, records).await.unwrap();

    assert_eq!(outcome.drift.only_external, 1);
    assert_eq!(outcome.drift.only_local, 1);
    assert_eq!(outcome.drift.in_both, 0);
}

#[tokio::test]
async fn test_missing_store_aborts_before_any_writes() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, None);

    let err = Collection::open(&config.store.path).await.unwrap_err();
    assert!(matches!(err, deck_sync::SyncError::StoreNotFound(_)));
    assert!(!config.package.output.exists());
}

#[tokio::test]
async fn test_package_holds_export_of_all_resolved_notes() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, None);
    seed_reviewed_note(&config.store.path, "abcde12345").await;

    let records = vec![
        word_record(
            2,
            &[("GUID", "abcde12345"), ("Greek", "σπίτι"), ("English", "house")],
        ),
        word_record(3, &[("Greek", "πόρτα"), ("English", "door")]),
    ];

    let mut store = Collection::open(&config.store.path).await.unwrap();
    let mut engine = engine_without_media(1_800_001_200_000);
    engine.run(&mut store, &config, records).await.unwrap();

    // Unzip the artifact and query the embedded export database.
    let file = std::fs::File::open(&config.package.output).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let export_path = dir.path().join("exported.anki2");
    {
        let mut entry = archive.by_name("collection.anki2").unwrap();
        let mut out = std::fs::File::create(&export_path).unwrap();
        std::io::copy(&mut entry, &mut out).unwrap();
    }

    let mut conn = raw_conn(&export_path).await;
    let notes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notes")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(notes, 2);

    // The matched note's scheduling history rides along verbatim.
    let (interval, factor, reps): (i64, i64, i64) =
        sqlx::query_as("SELECT ivl, factor, reps FROM cards WHERE id = 6001")
            .fetch_one(&mut conn)
            .await
            .unwrap();
    assert_eq!((interval, factor, reps), (15, 2500, 3));

    let revlog: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM revlog")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(revlog, 2);
    conn.close().await.unwrap();
}
