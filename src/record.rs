//! Record kinds and normalization of raw source rows.
//!
//! Each spreadsheet tab maps to one [`EntryKind`]. A kind is a tagged
//! variant in a closed set; every variant declares its column table, note
//! field order, card templates, and audio derivation. Normalization maps a
//! raw [`SourceRecord`] through the declared table into an [`Entry`],
//! enforcing the configured validation policy instead of inferring one from
//! the data.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::identity::derive_guid;
use crate::models::{AudioRequest, SourceRecord};

/// Column holding the external guid in every tab.
pub const GUID_COLUMN: &str = "GUID";

/// Shared card styling, carried into the packaged note models.
pub const SHARED_CSS: &str = ".card { font-family: arial; font-size: 20px; text-align: center; \
     color: black; background-color: white; } .note_type { font-size: 0.8em; color: grey; }";

/// The closed set of note kinds a source tab can map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Word,
    Verb,
}

/// One declared note field and the sheet column it is read from.
/// `column: None` marks a derived field (the sound reference).
pub struct FieldSpec {
    pub name: &'static str,
    pub column: Option<&'static str>,
}

/// Whether a template requires all of its field ordinals or any one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    All,
    Any,
}

/// One card template and its generation rule: the card exists only when the
/// gate over the required field ordinals is satisfied.
pub struct TemplateSpec {
    pub name: &'static str,
    pub ordinal: i64,
    pub gate: Gate,
    pub required: &'static [usize],
    pub question: &'static str,
    pub answer: &'static str,
}

const WORD_FIELDS: &[FieldSpec] = &[
    FieldSpec { name: "English", column: Some("English") },
    FieldSpec { name: "Greek", column: Some("Greek") },
    FieldSpec { name: "Class", column: Some("Class") },
    FieldSpec { name: "Gender", column: Some("Gender") },
    FieldSpec { name: "Audio", column: None },
];

const WORD_TEMPLATES: &[TemplateSpec] = &[
    TemplateSpec {
        name: "English → Greek",
        ordinal: 0,
        gate: Gate::All,
        required: &[0, 1],
        question: "{{English}}",
        answer: "{{FrontSide}}<hr id=\"answer\">{{Greek}}<br>{{Audio}}",
    },
    TemplateSpec {
        name: "Greek → English",
        ordinal: 1,
        gate: Gate::Any,
        required: &[1, 4],
        question: "{{Greek}}<br>{{Audio}}",
        answer: "{{FrontSide}}<hr id=\"answer\">{{English}}",
    },
];

const VERB_FIELDS: &[FieldSpec] = &[
    FieldSpec { name: "English", column: Some("English") },
    FieldSpec { name: "Greek", column: Some("Greek") },
    FieldSpec { name: "Group", column: Some("Group") },
    FieldSpec { name: "Present", column: Some("Present") },
    FieldSpec { name: "Past Simple", column: Some("Past Simple") },
    FieldSpec { name: "Past Continuous", column: Some("Past Continuous") },
    FieldSpec { name: "Future Simple", column: Some("Future Simple") },
    FieldSpec { name: "Future Continuous", column: Some("Future Continuous") },
    FieldSpec { name: "Audio", column: None },
];

const VERB_TEMPLATES: &[TemplateSpec] = &[
    TemplateSpec {
        name: "English → Greek",
        ordinal: 0,
        gate: Gate::All,
        required: &[0, 1],
        question: "{{English}}",
        answer: "{{FrontSide}}<hr id=\"answer\">{{Greek}}<br>{{Audio}}",
    },
    TemplateSpec {
        name: "Tenses",
        ordinal: 1,
        gate: Gate::Any,
        required: &[3, 4, 5, 6, 7],
        question: "{{Greek}}",
        answer: "{{FrontSide}}<hr id=\"answer\">{{Present}}<br>{{Past Simple}}<br>\
                 {{Past Continuous}}<br>{{Future Simple}}<br>{{Future Continuous}}",
    },
];

/// Trailing columns that compile into hierarchical tags, in sheet order.
const TAG_COLUMNS: &[&str] = &["Category", "Subcategory"];

impl EntryKind {
    pub fn tag(&self) -> &'static str {
        match self {
            EntryKind::Word => "word",
            EntryKind::Verb => "verb",
        }
    }

    /// Note model id. Stable across runs so re-imports match.
    pub fn model_id(&self) -> i64 {
        match self {
            EntryKind::Word => 1607392319,
            EntryKind::Verb => 1607392320,
        }
    }

    pub fn model_name(&self) -> &'static str {
        match self {
            EntryKind::Word => "Deck-Sync Basic Eng-Gr",
            EntryKind::Verb => "Deck-Sync Verb Eng-Gr",
        }
    }

    pub fn field_specs(&self) -> &'static [FieldSpec] {
        match self {
            EntryKind::Word => WORD_FIELDS,
            EntryKind::Verb => VERB_FIELDS,
        }
    }

    pub fn templates(&self) -> &'static [TemplateSpec] {
        match self {
            EntryKind::Word => WORD_TEMPLATES,
            EntryKind::Verb => VERB_TEMPLATES,
        }
    }

    /// Columns considered declared for this kind; anything else is subject
    /// to the unknown-column policy.
    fn known_columns(&self) -> Vec<&'static str> {
        let mut known = vec![GUID_COLUMN];
        known.extend(self.field_specs().iter().filter_map(|f| f.column));
        known.extend(TAG_COLUMNS);
        known
    }

    /// Required columns when the policy does not name this kind explicitly.
    fn default_required(&self) -> &'static [&'static str] {
        &["Greek", "English"]
    }
}

/// How to treat sheet columns that no field or tag declaration names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownColumns {
    #[default]
    Ignore,
    Reject,
}

/// Versioned validation policy. The source history never converged on one
/// set of mandatory columns, so the policy is explicit configuration rather
/// than something inferred per run.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationPolicy {
    #[serde(default = "default_policy_version")]
    pub version: u32,
    #[serde(default)]
    pub unknown_columns: UnknownColumns,
    /// Required column names keyed by kind tag (`word`, `verb`).
    #[serde(default)]
    pub required: BTreeMap<String, Vec<String>>,
}

fn default_policy_version() -> u32 {
    1
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            version: default_policy_version(),
            unknown_columns: UnknownColumns::default(),
            required: BTreeMap::new(),
        }
    }
}

impl ValidationPolicy {
    fn required_for(&self, kind: EntryKind) -> Vec<String> {
        match self.required.get(kind.tag()) {
            Some(columns) => columns.clone(),
            None => kind.default_required().iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Why a record was rejected during normalization. Recorded per run and
/// skipped; never aborts the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordIssue {
    MissingRequired { column: String },
    UnknownColumn { column: String },
}

impl RecordIssue {
    /// Stats bucket this issue is counted under.
    pub fn category(&self) -> &'static str {
        match self {
            RecordIssue::MissingRequired { .. } => "missing_required_field",
            RecordIssue::UnknownColumn { .. } => "unknown_column",
        }
    }
}

/// A normalized external record: guid settled, fields ordered, tags
/// compiled, audio requirement derived.
#[derive(Debug, Clone)]
pub struct Entry {
    pub kind: EntryKind,
    pub location: String,
    /// Guid as it appeared in the source row; empty means the row needs a
    /// write-back.
    pub external_id: String,
    /// Settled guid: the external one, or a content-derived key.
    pub guid: String,
    pub fields: Vec<String>,
    pub tags: Vec<String>,
    pub audio: Option<AudioRequest>,
}

impl Entry {
    /// Field values joined with the collection's 0x1f separator.
    pub fn joined_fields(&self) -> String {
        self.fields.join("\u{1f}")
    }

    pub fn sort_field(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or("")
    }

    /// Tag string in collection format: space-separated, space-padded.
    pub fn tag_string(&self) -> String {
        if self.tags.is_empty() {
            String::new()
        } else {
            format!(" {} ", self.tags.join(" "))
        }
    }

    /// Ordinals of the template cards this entry generates: a template
    /// passes when its gate over the declared required ordinals holds.
    pub fn card_ordinals(&self) -> Vec<i64> {
        self.kind
            .templates()
            .iter()
            .filter(|tmpl| {
                let filled = |ord: &usize| !self.fields.get(*ord).map_or(true, String::is_empty);
                match tmpl.gate {
                    Gate::All => tmpl.required.iter().all(filled),
                    Gate::Any => tmpl.required.iter().any(filled),
                }
            })
            .map(|tmpl| tmpl.ordinal)
            .collect()
    }
}

/// Greek article by gender, used only for the spoken phrase.
fn article_for(gender: &str) -> &'static str {
    match gender.trim().to_lowercase().as_str() {
        "masculine" => "ο",
        "feminine" => "η",
        "neuter" => "το",
        "masculine pl." | "feminine pl." => "οι",
        "neuter pl." => "τα",
        _ => "",
    }
}

fn column<'a>(record: &'a SourceRecord, name: &str) -> &'a str {
    record.columns.get(name).map(String::as_str).unwrap_or("").trim()
}

/// Normalize a raw source row into an [`Entry`] under the given policy.
pub fn normalize(record: &SourceRecord, policy: &ValidationPolicy) -> Result<Entry, RecordIssue> {
    let kind = record.kind;

    if policy.unknown_columns == UnknownColumns::Reject {
        let known = kind.known_columns();
        for name in record.columns.keys() {
            if !known.contains(&name.as_str()) {
                return Err(RecordIssue::UnknownColumn { column: name.clone() });
            }
        }
    }

    for required in policy.required_for(kind) {
        if column(record, &required).is_empty() {
            return Err(RecordIssue::MissingRequired { column: required });
        }
    }

    let audio = derive_audio(record);
    let sound_field = audio
        .as_ref()
        .map(|a| format!("[sound:{}]", a.filename))
        .unwrap_or_default();

    let fields: Vec<String> = kind
        .field_specs()
        .iter()
        .map(|spec| match spec.column {
            Some(name) => column(record, name).to_string(),
            None => sound_field.clone(),
        })
        .collect();

    let tags = compile_tags(record);

    let external_id = record.external_id.trim().to_string();
    let guid = if external_id.is_empty() {
        derive_guid(kind, &[column(record, "English"), column(record, "Greek")])
    } else {
        external_id.clone()
    };

    Ok(Entry {
        kind,
        location: record.location.clone(),
        external_id,
        guid,
        fields,
        tags,
        audio,
    })
}

/// Derive the spoken phrase and cache filename for a record.
///
/// Words are spoken with their article (`το σπίτι`) but cached under the
/// bare headword (`σπίτι.mp3`); verbs are spoken as their citation form.
fn derive_audio(record: &SourceRecord) -> Option<AudioRequest> {
    let greek = column(record, "Greek");
    if greek.is_empty() {
        return None;
    }

    let phrase = match record.kind {
        EntryKind::Word => {
            let article = article_for(column(record, "Gender"));
            if article.is_empty() || greek.starts_with(&format!("{} ", article)) {
                greek.to_string()
            } else {
                format!("{} {}", article, greek)
            }
        }
        EntryKind::Verb => greek.to_string(),
    };

    Some(AudioRequest {
        phrase,
        filename: format!("{}.mp3", greek),
    })
}

/// Compile class/gender/group facet tags plus the hierarchical tag columns.
///
/// Hierarchy stops at the first empty cell and emits every prefix
/// (`food`, `food::fruit`, …); spaces become NBSP so the collection treats
/// each tag as a single token. Result is sorted and deduplicated.
fn compile_tags(record: &SourceRecord) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();

    let facet = |prefix: &str, value: &str| -> Option<String> {
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            Some(format!("{}::{}", prefix, value).replace(' ', "\u{a0}"))
        }
    };

    match record.kind {
        EntryKind::Word => {
            tags.extend(facet("class", column(record, "Class")));
            let gender = column(record, "Gender");
            if let Some(base) = gender.split_whitespace().next() {
                tags.extend(facet("gender", base));
            }
        }
        EntryKind::Verb => {
            tags.extend(facet("group", column(record, "Group")));
        }
    }

    let mut hierarchy: Vec<String> = Vec::new();
    for name in TAG_COLUMNS {
        let cell = column(record, name);
        if cell.is_empty() {
            break;
        }
        hierarchy.push(cell.replace(' ', "\u{a0}"));
        tags.push(hierarchy.join("::"));
    }

    tags.sort();
    tags.dedup();
    tags
}
