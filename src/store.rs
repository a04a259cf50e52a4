//! Typed access to the local collection database.
//!
//! All reads and writes for one run go through a single [`Collection`]
//! connection wrapped in one explicit transaction: commit happens only when
//! the whole run succeeds, otherwise everything rolls back and no partial
//! note or card writes survive.
//!
//! The relations are the collection schema as persisted on disk:
//!
//! ```text
//! notes(id, guid, mid, mod, usn, tags, flds, sfld, csum, flags, data)
//! cards(id, nid, did, ord, mod, usn, type, queue, due, ivl, factor,
//!       reps, lapses, left, odue, odid, flags, data)
//! revlog(id, cid, usn, ease, ivl, lastIvl, factor, time, type)
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, Row, SqliteConnection};

use crate::error::{Result, SyncError};
use crate::models::{CardRow, NoteRow, RevlogRow};

/// A read-write handle on the local collection.
#[derive(Debug)]
pub struct Collection {
    conn: SqliteConnection,
    path: PathBuf,
}

impl Collection {
    /// Open the collection at `path`. Fails fast with
    /// [`SyncError::StoreNotFound`] when the path does not reference an
    /// existing store; the engine never creates one.
    pub async fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(SyncError::StoreNotFound(path.to_path_buf()));
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(false);
        let conn = SqliteConnection::connect_with(&options).await?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start the run transaction.
    pub async fn begin(&mut self) -> Result<()> {
        sqlx::query("BEGIN IMMEDIATE").execute(&mut self.conn).await?;
        Ok(())
    }

    /// Commit the run transaction.
    pub async fn commit(&mut self) -> Result<()> {
        sqlx::query("COMMIT").execute(&mut self.conn).await?;
        Ok(())
    }

    /// Roll the run transaction back, discarding every write of this run.
    pub async fn rollback(&mut self) -> Result<()> {
        sqlx::query("ROLLBACK").execute(&mut self.conn).await?;
        Ok(())
    }

    /// Look up a note id by guid. `None` is a normal outcome, not an error.
    pub async fn note_id_by_guid(&mut self, guid: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar("SELECT id FROM notes WHERE guid = ?")
            .bind(guid)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(id)
    }

    /// All guids currently in the store, for drift diagnostics.
    pub async fn all_guids(&mut self) -> Result<Vec<String>> {
        let guids = sqlx::query_scalar("SELECT guid FROM notes")
            .fetch_all(&mut self.conn)
            .await?;
        Ok(guids)
    }

    /// Scheduling rows owned by a note, in template order.
    pub async fn cards_by_note(&mut self, note_id: i64) -> Result<Vec<CardRow>> {
        let rows = sqlx::query("SELECT * FROM cards WHERE nid = ? ORDER BY ord")
            .bind(note_id)
            .fetch_all(&mut self.conn)
            .await?;
        Ok(rows.iter().map(card_from_row).collect())
    }

    /// Review history owned by a card, oldest first.
    pub async fn revlog_by_card(&mut self, card_id: i64) -> Result<Vec<RevlogRow>> {
        let rows = sqlx::query("SELECT * FROM revlog WHERE cid = ? ORDER BY id")
            .bind(card_id)
            .fetch_all(&mut self.conn)
            .await?;
        Ok(rows.iter().map(revlog_from_row).collect())
    }

    pub async fn insert_note(&mut self, note: &NoteRow) -> Result<()> {
        sqlx::query("INSERT INTO notes VALUES (?,?,?,?,?,?,?,?,?,?,?)")
            .bind(note.id)
            .bind(&note.guid)
            .bind(note.mid)
            .bind(note.modified)
            .bind(note.usn)
            .bind(&note.tags)
            .bind(&note.fields)
            .bind(&note.sort_field)
            .bind(note.checksum)
            .bind(note.flags)
            .bind(&note.data)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    /// Update the content payload of a matched note. Scheduling state is
    /// deliberately out of reach here: cards and revlog have no update path.
    pub async fn update_note_content(
        &mut self,
        note_id: i64,
        tags: &str,
        fields: &str,
        sort_field: &str,
        data: &str,
        modified: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE notes SET tags = ?, flds = ?, sfld = ?, data = ?, mod = ? WHERE id = ?")
            .bind(tags)
            .bind(fields)
            .bind(sort_field)
            .bind(data)
            .bind(modified)
            .bind(note_id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    pub async fn insert_card(&mut self, card: &CardRow) -> Result<()> {
        insert_card_into(&mut self.conn, card).await
    }

    /// Note / card / revlog totals, for the stats command.
    pub async fn counts(&mut self) -> Result<(i64, i64, i64)> {
        let notes = sqlx::query_scalar("SELECT COUNT(*) FROM notes")
            .fetch_one(&mut self.conn)
            .await?;
        let cards = sqlx::query_scalar("SELECT COUNT(*) FROM cards")
            .fetch_one(&mut self.conn)
            .await?;
        let revlog = sqlx::query_scalar("SELECT COUNT(*) FROM revlog")
            .fetch_one(&mut self.conn)
            .await?;
        Ok((notes, cards, revlog))
    }

    pub async fn close(self) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

/// Create the notes/cards/revlog relations on a connection.
///
/// Shared between the package builder (fresh export database) and test
/// setups that seed a local store from scratch.
pub async fn create_base_schema(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notes (
            id INTEGER PRIMARY KEY,
            guid TEXT NOT NULL,
            mid INTEGER NOT NULL,
            mod INTEGER NOT NULL,
            usn INTEGER NOT NULL,
            tags TEXT NOT NULL,
            flds TEXT NOT NULL,
            sfld TEXT NOT NULL,
            csum INTEGER NOT NULL,
            flags INTEGER NOT NULL,
            data TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cards (
            id INTEGER PRIMARY KEY,
            nid INTEGER NOT NULL,
            did INTEGER NOT NULL,
            ord INTEGER NOT NULL,
            mod INTEGER NOT NULL,
            usn INTEGER NOT NULL,
            type INTEGER NOT NULL,
            queue INTEGER NOT NULL,
            due INTEGER NOT NULL,
            ivl INTEGER NOT NULL,
            factor INTEGER NOT NULL,
            reps INTEGER NOT NULL,
            lapses INTEGER NOT NULL,
            left INTEGER NOT NULL,
            odue INTEGER NOT NULL,
            odid INTEGER NOT NULL,
            flags INTEGER NOT NULL,
            data TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS revlog (
            id INTEGER PRIMARY KEY,
            cid INTEGER NOT NULL,
            usn INTEGER NOT NULL,
            ease INTEGER NOT NULL,
            ivl INTEGER NOT NULL,
            lastIvl INTEGER NOT NULL,
            factor INTEGER NOT NULL,
            time INTEGER NOT NULL,
            type INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS ix_notes_guid ON notes (guid)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS ix_cards_nid ON cards (nid)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS ix_revlog_cid ON revlog (cid)")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Insert a card row on an arbitrary connection. Used both for local-store
/// writes and for populating the export database.
pub async fn insert_card_into(conn: &mut SqliteConnection, card: &CardRow) -> Result<()> {
    sqlx::query("INSERT INTO cards VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)")
        .bind(card.id)
        .bind(card.note_id)
        .bind(card.deck_id)
        .bind(card.ordinal)
        .bind(card.modified)
        .bind(card.usn)
        .bind(card.card_type)
        .bind(card.queue)
        .bind(card.due)
        .bind(card.interval)
        .bind(card.factor)
        .bind(card.reps)
        .bind(card.lapses)
        .bind(card.left)
        .bind(card.original_due)
        .bind(card.original_deck_id)
        .bind(card.flags)
        .bind(&card.data)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Insert a note row on an arbitrary connection (export database path).
pub async fn insert_note_into(conn: &mut SqliteConnection, note: &NoteRow) -> Result<()> {
    sqlx::query("INSERT INTO notes VALUES (?,?,?,?,?,?,?,?,?,?,?)")
        .bind(note.id)
        .bind(&note.guid)
        .bind(note.mid)
        .bind(note.modified)
        .bind(note.usn)
        .bind(&note.tags)
        .bind(&note.fields)
        .bind(&note.sort_field)
        .bind(note.checksum)
        .bind(note.flags)
        .bind(&note.data)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Insert a revlog row on an arbitrary connection (export database path).
pub async fn insert_revlog_into(conn: &mut SqliteConnection, entry: &RevlogRow) -> Result<()> {
    sqlx::query("INSERT INTO revlog VALUES (?,?,?,?,?,?,?,?,?)")
        .bind(entry.id)
        .bind(entry.card_id)
        .bind(entry.usn)
        .bind(entry.ease)
        .bind(entry.interval)
        .bind(entry.last_interval)
        .bind(entry.factor)
        .bind(entry.taken_ms)
        .bind(entry.kind)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn card_from_row(row: &sqlx::sqlite::SqliteRow) -> CardRow {
    CardRow {
        id: row.get("id"),
        note_id: row.get("nid"),
        deck_id: row.get("did"),
        ordinal: row.get("ord"),
        modified: row.get("mod"),
        usn: row.get("usn"),
        card_type: row.get("type"),
        queue: row.get("queue"),
        due: row.get("due"),
        interval: row.get("ivl"),
        factor: row.get("factor"),
        reps: row.get("reps"),
        lapses: row.get("lapses"),
        left: row.get("left"),
        original_due: row.get("odue"),
        original_deck_id: row.get("odid"),
        flags: row.get("flags"),
        data: row.get("data"),
    }
}

fn revlog_from_row(row: &sqlx::sqlite::SqliteRow) -> RevlogRow {
    RevlogRow {
        id: row.get("id"),
        card_id: row.get("cid"),
        usn: row.get("usn"),
        ease: row.get("ease"),
        interval: row.get("ivl"),
        last_interval: row.get("lastIvl"),
        factor: row.get("factor"),
        taken_ms: row.get("time"),
        kind: row.get("type"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_collection(dir: &tempfile::TempDir) -> Collection {
        let path = dir.path().join("collection.anki2");
        let mut conn = SqliteConnection::connect_with(
            &SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
                .unwrap()
                .create_if_missing(true),
        )
        .await
        .unwrap();
        create_base_schema(&mut conn).await.unwrap();
        conn.close().await.unwrap();

        Collection::open(&path).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_missing_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.anki2");
        let err = Collection::open(&missing).await.unwrap_err();
        assert!(matches!(err, SyncError::StoreNotFound(_)));
    }

    #[tokio::test]
    async fn test_note_roundtrip_and_guid_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_collection(&dir).await;

        let note = NoteRow {
            id: 42,
            guid: "abcde12345".to_string(),
            mid: 1607392319,
            modified: 1_700_000_000,
            usn: -1,
            tags: " class::noun ".to_string(),
            fields: "house\u{1f}σπίτι".to_string(),
            sort_field: "house".to_string(),
            checksum: 0,
            flags: 0,
            data: String::new(),
        };

        store.begin().await.unwrap();
        store.insert_note(&note).await.unwrap();
        store.commit().await.unwrap();

        assert_eq!(store.note_id_by_guid("abcde12345").await.unwrap(), Some(42));
        assert_eq!(store.note_id_by_guid("zzzzzzzzzz").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_collection(&dir).await;

        let note = NoteRow {
            id: 7,
            guid: "rollbackme".to_string(),
            mid: 1607392319,
            modified: 0,
            usn: -1,
            tags: String::new(),
            fields: "a\u{1f}b".to_string(),
            sort_field: "a".to_string(),
            checksum: 0,
            flags: 0,
            data: String::new(),
        };

        store.begin().await.unwrap();
        store.insert_note(&note).await.unwrap();
        store.rollback().await.unwrap();

        assert_eq!(store.note_id_by_guid("rollbackme").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cards_ordered_by_ordinal() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_collection(&dir).await;

        let card = |id: i64, ord: i64| CardRow {
            id,
            note_id: 1,
            deck_id: 1,
            ordinal: ord,
            modified: 0,
            usn: -1,
            card_type: 2,
            queue: 2,
            due: 120,
            interval: 15,
            factor: 2500,
            reps: 3,
            lapses: 0,
            left: 0,
            original_due: 0,
            original_deck_id: 0,
            flags: 0,
            data: String::new(),
        };

        store.begin().await.unwrap();
        store.insert_card(&card(11, 1)).await.unwrap();
        store.insert_card(&card(10, 0)).await.unwrap();
        store.commit().await.unwrap();

        let cards = store.cards_by_note(1).await.unwrap();
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].ordinal, 0);
        assert_eq!(cards[1].ordinal, 1);
        assert_eq!(cards[0].interval, 15);
        assert_eq!(cards[0].factor, 2500);
    }
}
