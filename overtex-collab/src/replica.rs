//! Replicated text state for one document.
//!
//! A [`Replica`] is a set of named [`SubDocument`]s, one per file path. Each
//! sub-document owns its own `yrs::Doc` with a single text root, so edits to
//! different files never contend on the same transaction.
//!
//! Offsets are UTF-8 byte offsets (the `yrs` default) and must fall on
//! character boundaries.

use std::collections::HashMap;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

/// Name of the text root inside every sub-document.
const CONTENT_TEXT_NAME: &str = "content";

/// v1 encoding of an update with no structs and no deletions.
const EMPTY_UPDATE: &[u8] = &[0, 0];

/// Whether an encoded v1 update carries nothing.
pub fn is_empty_update(update: &[u8]) -> bool {
    update.is_empty() || update == EMPTY_UPDATE
}

/// A local text edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextEdit {
    Insert { at: u32, text: String },
    Delete { at: u32, len: u32 },
    /// Replace the whole content; converted to a minimal prefix/suffix edit
    Replace { content: String },
}

/// Replica errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaError {
    /// Payload is not a valid encoded update or state vector
    Decode(String),
    /// The merge engine refused a decoded update
    Apply(String),
    /// Offset past the end of the text or inside a multi-byte character
    InvalidOffset { offset: u32, len: u32 },
}

impl std::fmt::Display for ReplicaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "Failed to decode payload: {e}"),
            Self::Apply(e) => write!(f, "Failed to apply update: {e}"),
            Self::InvalidOffset { offset, len } => {
                write!(f, "Invalid offset {offset} for text of {len} bytes")
            }
        }
    }
}

impl std::error::Error for ReplicaError {}

/// The mergeable text body of one file.
pub struct SubDocument {
    doc: Doc,
    text: TextRef,
}

impl Default for SubDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl SubDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(CONTENT_TEXT_NAME);
        Self { doc, text }
    }

    /// Merge an encoded v1 update. Duplicate and out-of-order delivery are
    /// absorbed by the merge engine.
    pub fn apply_remote_delta(&self, update: &[u8]) -> Result<(), ReplicaError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| ReplicaError::Apply(e.to_string()))
    }

    /// Encoded summary of what this replica holds.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// The update a peer holding `remote_state_vector` needs to converge.
    pub fn diff_since(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Whether the peer's state vector covers content this replica lacks.
    pub fn lacks(&self, remote_state_vector: &[u8]) -> Result<bool, ReplicaError> {
        let remote = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let local = self.doc.transact().state_vector();
        Ok(remote.iter().any(|(client, clock)| local.get(client) < *clock))
    }

    /// Full state as a single update, used for snapshots.
    pub fn full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Apply a local edit and return the delta to broadcast, or `None` if the
    /// edit changed nothing.
    pub fn local_edit(&self, edit: &TextEdit) -> Result<Option<Vec<u8>>, ReplicaError> {
        let sv_before = self.doc.transact().state_vector();

        {
            let mut txn = self.doc.transact_mut();
            let current = self.text.get_string(&txn);
            match edit {
                TextEdit::Insert { at, text } => {
                    check_boundary(&current, *at)?;
                    if !text.is_empty() {
                        self.text.insert(&mut txn, *at, text);
                    }
                }
                TextEdit::Delete { at, len } => {
                    check_boundary(&current, *at)?;
                    check_boundary(&current, at.saturating_add(*len))?;
                    if *len > 0 {
                        self.text.remove_range(&mut txn, *at, *len);
                    }
                }
                TextEdit::Replace { content } => {
                    if let Some((at, delete, insert)) = minimal_edit(&current, content) {
                        if delete > 0 {
                            self.text.remove_range(&mut txn, at, delete);
                        }
                        if !insert.is_empty() {
                            self.text.insert(&mut txn, at, insert);
                        }
                    }
                }
            }
        }

        let update = self.doc.transact().encode_state_as_update_v1(&sv_before);
        Ok((!is_empty_update(&update)).then_some(update))
    }

    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Length in bytes.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_boundary(text: &str, offset: u32) -> Result<(), ReplicaError> {
    if text.is_char_boundary(offset as usize) {
        Ok(())
    } else {
        Err(ReplicaError::InvalidOffset { offset, len: text.len() as u32 })
    }
}

/// Common prefix/suffix diff on character boundaries.
///
/// Returns `(byte offset, bytes to delete, text to insert)`, or `None` when
/// the strings are equal.
pub fn minimal_edit<'a>(current: &str, target: &'a str) -> Option<(u32, u32, &'a str)> {
    if current == target {
        return None;
    }

    let prefix: usize = current
        .chars()
        .zip(target.chars())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();

    let max_suffix = (current.len() - prefix).min(target.len() - prefix);
    let suffix: usize = current[prefix..]
        .chars()
        .rev()
        .zip(target[prefix..].chars().rev())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .scan(0usize, |acc, n| {
            *acc += n;
            (*acc <= max_suffix).then_some(n)
        })
        .sum();

    let delete = current.len() - prefix - suffix;
    let insert = &target[prefix..target.len() - suffix];
    Some((prefix as u32, delete as u32, insert))
}

/// All sub-documents of one document, materialized on first access.
#[derive(Default)]
pub struct Replica {
    files: HashMap<String, SubDocument>,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sub-document for `file`, created empty if it does not exist yet.
    pub fn sub_doc(&mut self, file: &str) -> &SubDocument {
        self.files.entry(file.to_string()).or_default()
    }

    pub fn get(&self, file: &str) -> Option<&SubDocument> {
        self.files.get(file)
    }

    pub fn contains(&self, file: &str) -> bool {
        self.files.contains_key(file)
    }

    /// Materialized file names, sorted.
    pub fn files(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Full state of every sub-document, for snapshots.
    pub fn snapshots(&self) -> Vec<(String, Vec<u8>)> {
        self.files()
            .into_iter()
            .filter_map(|name| {
                let state = self.files.get(&name)?.full_state();
                Some((name, state))
            })
            .collect()
    }
}
