//! Portable export package assembly.
//!
//! Builds the `.apkg` artifact: a zip container holding a relational export
//! of the resolved notes, cards, and review history (`collection.anki2`)
//! plus the referenced media files under numbered entries with a `media`
//! manifest. The archive is assembled at a temporary sibling path and
//! renamed into place, so a failure mid-assembly leaves any previously
//! produced package untouched.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::ResolvedNote;
use crate::record::{EntryKind, Gate, SHARED_CSS};
use crate::store;

/// Stable deck id for a deck name.
pub fn deck_id_for(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let folded = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
    (folded % 10u64.pow(10)) as i64
}

/// Assemble the package at `output`.
///
/// Cards are exported with their deck id rewritten to this package's deck;
/// everything else is written exactly as resolved. Missing media files are
/// warned about and skipped, never fatal.
pub async fn build(
    deck_name: &str,
    notes: &[ResolvedNote],
    media_dir: Option<&Path>,
    output: &Path,
) -> Result<()> {
    let deck_id = deck_id_for(deck_name);

    let scratch = std::env::temp_dir().join(format!("decksync-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&scratch)?;

    let result = assemble(deck_name, deck_id, notes, media_dir, output, &scratch).await;

    // Scratch cleanup is best effort; the tmp archive is removed on failure
    // so no partial output lingers next to the real artifact.
    let _ = std::fs::remove_dir_all(&scratch);
    result
}

async fn assemble(
    deck_name: &str,
    deck_id: i64,
    notes: &[ResolvedNote],
    media_dir: Option<&Path>,
    output: &Path,
    scratch: &Path,
) -> Result<()> {
    let db_path = scratch.join("collection.anki2");
    write_export_db(&db_path, deck_name, deck_id, notes).await?;
    let db_bytes = std::fs::read(&db_path)?;

    let media = collect_media(notes, media_dir);

    let tmp_path = tmp_sibling(output);
    if let Err(e) = write_archive(&tmp_path, &db_bytes, &media) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }

    std::fs::rename(&tmp_path, output)?;
    debug!(output = %output.display(), notes = notes.len(), media = media.len(), "package written");
    Ok(())
}

fn tmp_sibling(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "package.apkg".to_string());
    name.push_str(".tmp");
    output.with_file_name(name)
}

fn write_archive(tmp_path: &Path, db_bytes: &[u8], media: &[(String, Vec<u8>)]) -> Result<()> {
    let file = std::fs::File::create(tmp_path)?;
    let mut archive = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    archive.start_file("collection.anki2", options)?;
    archive.write_all(db_bytes)?;

    let manifest: serde_json::Map<String, serde_json::Value> = media
        .iter()
        .enumerate()
        .map(|(idx, (name, _))| (idx.to_string(), serde_json::Value::String(name.clone())))
        .collect();
    archive.start_file("media", options)?;
    archive.write_all(serde_json::to_string(&manifest)?.as_bytes())?;

    for (idx, (_, bytes)) in media.iter().enumerate() {
        archive.start_file(idx.to_string(), options)?;
        archive.write_all(bytes)?;
    }

    archive.finish()?;
    Ok(())
}

/// Gather referenced media files. A note whose audio file is absent still
/// exports; its sound reference just stays dangling until a later run
/// synthesizes the file.
fn collect_media(notes: &[ResolvedNote], media_dir: Option<&Path>) -> Vec<(String, Vec<u8>)> {
    let Some(media_dir) = media_dir else {
        return Vec::new();
    };

    let mut media: Vec<(String, Vec<u8>)> = Vec::new();
    for resolved in notes {
        let Some(audio) = &resolved.audio else {
            continue;
        };
        if media.iter().any(|(name, _)| name == &audio.filename) {
            continue;
        }

        let path = media_dir.join(&audio.filename);
        match std::fs::read(&path) {
            Ok(bytes) => media.push((audio.filename.clone(), bytes)),
            Err(_) => warn!(
                filename = %audio.filename,
                note = %resolved.note.guid,
                "media file missing, packaging note without it"
            ),
        }
    }
    media
}

async fn write_export_db(
    db_path: &Path,
    deck_name: &str,
    deck_id: i64,
    notes: &[ResolvedNote],
) -> Result<()> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true);
    let mut conn = SqliteConnection::connect_with(&options).await?;

    store::create_base_schema(&mut conn).await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS col (
            id INTEGER PRIMARY KEY,
            crt INTEGER NOT NULL,
            mod INTEGER NOT NULL,
            scm INTEGER NOT NULL,
            ver INTEGER NOT NULL,
            dty INTEGER NOT NULL,
            usn INTEGER NOT NULL,
            ls INTEGER NOT NULL,
            conf TEXT NOT NULL,
            models TEXT NOT NULL,
            decks TEXT NOT NULL,
            dconf TEXT NOT NULL,
            tags TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut conn)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS graves (usn INTEGER NOT NULL, oid INTEGER NOT NULL, type INTEGER NOT NULL)",
    )
    .execute(&mut conn)
    .await?;

    let now = chrono::Utc::now().timestamp();
    let kinds = kinds_present(notes);

    sqlx::query("INSERT INTO col VALUES (1, ?, ?, ?, 11, 0, 0, 0, ?, ?, ?, ?, '{}')")
        .bind(now)
        .bind(now)
        .bind(now * 1000)
        .bind(conf_json(&kinds).to_string())
        .bind(models_json(&kinds, deck_id, now).to_string())
        .bind(decks_json(deck_name, deck_id, now).to_string())
        .bind(dconf_json().to_string())
        .execute(&mut conn)
        .await?;

    for resolved in notes {
        store::insert_note_into(&mut conn, &resolved.note).await?;
        for card in &resolved.cards {
            let mut card = card.clone();
            card.deck_id = deck_id;
            store::insert_card_into(&mut conn, &card).await?;
        }
        for entry in &resolved.revlog {
            store::insert_revlog_into(&mut conn, entry).await?;
        }
    }

    conn.close().await?;
    Ok(())
}

fn kinds_present(notes: &[ResolvedNote]) -> Vec<EntryKind> {
    let all = [EntryKind::Word, EntryKind::Verb];
    let present: Vec<EntryKind> = all
        .into_iter()
        .filter(|kind| notes.iter().any(|n| n.note.mid == kind.model_id()))
        .collect();
    if present.is_empty() {
        // An empty run still needs one model for the col row to be valid.
        vec![EntryKind::Word]
    } else {
        present
    }
}

fn conf_json(kinds: &[EntryKind]) -> serde_json::Value {
    serde_json::json!({
        "activeDecks": [1],
        "curDeck": 1,
        "newSpread": 0,
        "collapseTime": 1200,
        "timeLim": 0,
        "estTimes": true,
        "dueCounts": true,
        "curModel": kinds[0].model_id().to_string(),
        "nextPos": 1,
        "sortType": "noteFld",
        "sortBackwards": false,
        "addToCur": true,
    })
}

fn models_json(kinds: &[EntryKind], deck_id: i64, now: i64) -> serde_json::Value {
    let mut models = serde_json::Map::new();
    for kind in kinds {
        let fields: Vec<serde_json::Value> = kind
            .field_specs()
            .iter()
            .enumerate()
            .map(|(ord, spec)| {
                serde_json::json!({
                    "name": spec.name,
                    "ord": ord,
                    "sticky": false,
                    "rtl": false,
                    "font": "Arial",
                    "size": 20,
                    "media": [],
                })
            })
            .collect();

        let templates: Vec<serde_json::Value> = kind
            .templates()
            .iter()
            .map(|tmpl| {
                serde_json::json!({
                    "name": tmpl.name,
                    "ord": tmpl.ordinal,
                    "qfmt": tmpl.question,
                    "afmt": tmpl.answer,
                    "bqfmt": "",
                    "bafmt": "",
                    "did": null,
                })
            })
            .collect();

        let req: Vec<serde_json::Value> = kind
            .templates()
            .iter()
            .map(|tmpl| {
                let gate = match tmpl.gate {
                    Gate::All => "all",
                    Gate::Any => "any",
                };
                serde_json::json!([tmpl.ordinal, gate, tmpl.required])
            })
            .collect();

        models.insert(
            kind.model_id().to_string(),
            serde_json::json!({
                "id": kind.model_id(),
                "name": kind.model_name(),
                "type": 0,
                "mod": now,
                "usn": -1,
                "sortf": 0,
                "did": deck_id,
                "flds": fields,
                "tmpls": templates,
                "css": SHARED_CSS,
                "latexPre": "\\documentclass[12pt]{article}\n\\begin{document}\n",
                "latexPost": "\\end{document}",
                "req": req,
                "tags": [],
                "vers": [],
            }),
        );
    }
    serde_json::Value::Object(models)
}

fn decks_json(deck_name: &str, deck_id: i64, now: i64) -> serde_json::Value {
    let deck = |id: i64, name: &str| {
        serde_json::json!({
            "id": id,
            "name": name,
            "desc": "",
            "mod": now,
            "usn": -1,
            "collapsed": false,
            "browserCollapsed": false,
            "dyn": 0,
            "extendNew": 10,
            "extendRev": 50,
            "conf": 1,
            "newToday": [0, 0],
            "revToday": [0, 0],
            "lrnToday": [0, 0],
            "timeToday": [0, 0],
        })
    };

    serde_json::json!({
        "1": deck(1, "Default"),
        deck_id.to_string(): deck(deck_id, deck_name),
    })
}

fn dconf_json() -> serde_json::Value {
    serde_json::json!({
        "1": {
            "id": 1,
            "name": "Default",
            "replayq": true,
            "timer": 0,
            "maxTaken": 60,
            "autoplay": true,
            "mod": 0,
            "usn": 0,
            "new": {
                "bury": true,
                "delays": [1, 10],
                "initialFactor": 2500,
                "ints": [1, 4, 7],
                "order": 1,
                "perDay": 20,
                "separate": true,
            },
            "rev": {
                "bury": true,
                "ease4": 1.3,
                "fuzz": 0.05,
                "ivlFct": 1.0,
                "maxIvl": 36500,
                "minSpace": 1,
                "perDay": 100,
            },
            "lapse": {
                "delays": [10],
                "leechAction": 0,
                "leechFails": 8,
                "minInt": 1,
                "mult": 0.0,
            },
        }
    })
}
