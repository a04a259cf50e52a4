//! External record source: spreadsheet rows in, guid write-backs out.
//!
//! The engine only sees the [`RecordSource`] trait; the HTTP implementation
//! talks to the Google Sheets `values` API with a bearer token. Tests swap
//! in an in-memory source.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::models::{PendingWrite, SourceRecord};
use crate::record::{EntryKind, GUID_COLUMN};

/// A spreadsheet-like collaborator: ordered records addressable by row
/// location, plus a batched guid write-back.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch one tab as ordered records. The first row is the header.
    async fn fetch(&self, tab: &str, kind: EntryKind) -> Result<Vec<SourceRecord>>;

    /// Write new guids back to their source cells as one batch. All rows in
    /// the batch succeed or the batch fails as a unit.
    async fn batch_write(&self, updates: &[PendingWrite]) -> Result<()>;
}

/// Google Sheets REST client.
pub struct SheetsClient {
    client: reqwest::Client,
    sheet_id: String,
    token: String,
}

#[derive(Deserialize)]
struct ValuesResponse {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

impl SheetsClient {
    pub fn new(sheet_id: String, token: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            sheet_id,
            token,
        })
    }
}

#[async_trait]
impl RecordSource for SheetsClient {
    async fn fetch(&self, tab: &str, kind: EntryKind) -> Result<Vec<SourceRecord>> {
        let url = format!(
            "https://sheets.googleapis.com/v4/spreadsheets/{}/values/{}",
            self.sheet_id, tab
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SyncError::Source(format!(
                "fetching tab '{}' failed: HTTP {}",
                tab,
                response.status()
            )));
        }

        let body: ValuesResponse = response.json().await?;
        let mut rows = body.values.into_iter();
        let Some(header) = rows.next() else {
            return Ok(Vec::new());
        };

        let records = rows
            .enumerate()
            .map(|(idx, row)| {
                let columns: BTreeMap<String, String> = header
                    .iter()
                    .zip(row.iter())
                    .filter(|(name, _)| !name.trim().is_empty())
                    .map(|(name, value)| (name.trim().to_string(), value.clone()))
                    .collect();

                let external_id = columns
                    .get(GUID_COLUMN)
                    .map(|v| v.trim().to_string())
                    .unwrap_or_default();

                SourceRecord {
                    kind,
                    // Guid lives in column A; header occupies row 1.
                    location: format!("{}!A{}", tab, idx + 2),
                    external_id,
                    columns,
                }
            })
            .collect::<Vec<_>>();

        debug!(tab, rows = records.len(), "fetched source records");
        Ok(records)
    }

    async fn batch_write(&self, updates: &[PendingWrite]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let url = format!(
            "https://sheets.googleapis.com/v4/spreadsheets/{}/values:batchUpdate",
            self.sheet_id
        );

        let data: Vec<serde_json::Value> = updates
            .iter()
            .map(|update| {
                serde_json::json!({
                    "range": update.location,
                    "values": [[update.guid]],
                })
            })
            .collect();

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "valueInputOption": "USER_ENTERED",
                "data": data,
            }))
            .send()
            .await
            .map_err(|e| SyncError::BatchWrite(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncError::BatchWrite(format!("HTTP {}", response.status())));
        }

        debug!(updates = updates.len(), "guid write-back batch applied");
        Ok(())
    }
}
