//! Identity resolution between external records and local notes.
//!
//! Maps an external guid to a stable local note id, detecting new vs.
//! existing records. Fresh local ids come from a monotonic allocator that is
//! injected per run (seeded from the wall clock in milliseconds by the
//! caller) so it can never collide with the legacy sequential ids already in
//! the store and is trivially safe to call repeatedly within one run.

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::models::Resolution;
use crate::record::EntryKind;
use crate::store::Collection;

/// Alphabet used by Anki for note guids. Derived guids must stay inside it
/// so the collection accepts them unchanged.
const GUID_ALPHABET: &[u8] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ!#$%&*+,-.:;=?@^_|~";

/// Length of a derived guid, matching the 10-character guids the original
/// sheet rows carry.
const GUID_LEN: usize = 10;

/// Monotonic local-id allocator, confined to one run.
///
/// Millisecond-epoch seeding keeps fresh ids far above the ids of any
/// collection created by a normal Anki client, and strictly increasing
/// allocation keeps ids unique within the run.
#[derive(Debug)]
pub struct IdAllocator {
    next: i64,
}

impl IdAllocator {
    pub fn new(seed: i64) -> Self {
        Self { next: seed }
    }

    /// Hand out the next id. Never repeats within a run.
    pub fn next(&mut self) -> i64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Derive a stable guid for a record that carries none.
///
/// The key is a SHA-256 over the kind tag and the record's identifying
/// fields, folded into [`GUID_ALPHABET`]. Content-derived guids make a
/// re-run over a source row whose write-back never landed converge on the
/// note committed by the previous run instead of minting a duplicate.
pub fn derive_guid(kind: EntryKind, key_fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.tag().as_bytes());
    for field in key_fields {
        hasher.update([0x1f]);
        hasher.update(field.as_bytes());
    }
    let digest = hasher.finalize();

    // Fold the first 8 digest bytes into a u64, then emit base-N digits.
    let mut acc = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
    let base = GUID_ALPHABET.len() as u64;
    let mut out = Vec::with_capacity(GUID_LEN);
    for _ in 0..GUID_LEN {
        out.push(GUID_ALPHABET[(acc % base) as usize]);
        acc /= base;
    }
    String::from_utf8(out).expect("alphabet is ASCII")
}

/// Resolve a guid against the local store.
///
/// Resolution never fails on its own: an empty guid and an unknown guid are
/// both normal outcomes that allocate a fresh local id. Only store I/O
/// errors propagate.
pub async fn resolve(
    store: &mut Collection,
    guid: &str,
    alloc: &mut IdAllocator,
) -> Result<Resolution> {
    if guid.is_empty() {
        return Ok(Resolution {
            local_id: alloc.next(),
            existed: false,
        });
    }

    match store.note_id_by_guid(guid).await? {
        Some(id) => Ok(Resolution {
            local_id: id,
            existed: true,
        }),
        // A record can carry a written-back guid whose note was deleted or
        // never created locally; that is a fresh note, not an error.
        None => Ok(Resolution {
            local_id: alloc.next(),
            existed: false,
        }),
    }
}
