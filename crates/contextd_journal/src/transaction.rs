//! Transaction requests and committed transaction objects.
//!
//! A [`TransactionRequest`] is a caller's intent. Once the commit path has
//! assigned it a csn and linked it to the previous entry it becomes a
//! [`TransactionObject`], which is what the journal stores and what gets
//! broadcast to every replica.
//!
//! # Wire form
//!
//! Both types travel as canonical maps:
//!
//! | Key | Present on | Value |
//! |---|---|---|
//! | `type` | request | `insert`, `update`, `delete`, `truncate`, `restore`, `begin_import`, ... |
//! | `target` | request | document id (empty for batch markers) |
//! | `new` | insert, restore | document |
//! | `before` | update, delete | document |
//! | `operator` | update | update operator document |
//! | `atomicId` | request, optional | batch correlation id |
//! | `csn` | object | integer ≥ 1 |
//! | `datetime` | object | timestamp |
//! | `beforeDigest` | object | hex digest of entry `csn - 1` |
//! | `digest` | object | hex digest of every other field |

use crate::digest::Digest;
use crate::error::{JournalError, JournalResult};
use crate::operator::apply_operator;
use contextd_codec::{from_cbor, to_canonical_cbor, CodecError, CodecResult, Decode, Encode, Value};

const KEY_TYPE: &str = "type";
const KEY_TARGET: &str = "target";
const KEY_NEW: &str = "new";
const KEY_BEFORE: &str = "before";
const KEY_OPERATOR: &str = "operator";
const KEY_CORRELATION: &str = "atomicId";
const KEY_CSN: &str = "csn";
const KEY_DATETIME: &str = "datetime";
const KEY_BEFORE_DIGEST: &str = "beforeDigest";
const KEY_DIGEST: &str = "digest";

/// What a transaction does, with exactly the fields its type requires.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionType {
    /// Create a document.
    Insert {
        /// The new document.
        new: Value,
    },
    /// Modify a document.
    Update {
        /// The document as the caller last read it.
        before: Value,
        /// Update operator or replacement document.
        operator: Value,
    },
    /// Remove a document.
    Delete {
        /// The document as the caller last read it.
        before: Value,
    },
    /// Remove every document.
    Truncate,
    /// Re-create a document during a restore.
    Restore {
        /// The restored document.
        new: Value,
    },
    /// Opens an import batch.
    BeginImport,
    /// Closes an import batch.
    EndImport,
    /// Discards an import batch.
    AbortImport,
    /// Opens a restore batch.
    BeginRestore,
    /// Closes a restore batch.
    EndRestore,
    /// Discards a restore batch.
    AbortRestore,
}

impl TransactionType {
    /// Returns the wire name of this type.
    pub fn name(&self) -> &'static str {
        match self {
            TransactionType::Insert { .. } => "insert",
            TransactionType::Update { .. } => "update",
            TransactionType::Delete { .. } => "delete",
            TransactionType::Truncate => "truncate",
            TransactionType::Restore { .. } => "restore",
            TransactionType::BeginImport => "begin_import",
            TransactionType::EndImport => "end_import",
            TransactionType::AbortImport => "abort_import",
            TransactionType::BeginRestore => "begin_restore",
            TransactionType::EndRestore => "end_restore",
            TransactionType::AbortRestore => "abort_restore",
        }
    }

    /// Returns true for the batch bracketing markers.
    pub fn is_marker(&self) -> bool {
        matches!(
            self,
            TransactionType::BeginImport
                | TransactionType::EndImport
                | TransactionType::AbortImport
                | TransactionType::BeginRestore
                | TransactionType::EndRestore
                | TransactionType::AbortRestore
        )
    }

    /// Returns true if this entry invalidates every earlier read.
    pub fn resets_context(&self) -> bool {
        matches!(
            self,
            TransactionType::Truncate | TransactionType::Restore { .. }
        )
    }

    /// Returns true if this type acts on a single named document.
    pub fn needs_target(&self) -> bool {
        matches!(
            self,
            TransactionType::Insert { .. }
                | TransactionType::Update { .. }
                | TransactionType::Delete { .. }
        )
    }

    /// Builds a field-less type from its wire name.
    fn unit(name: &str) -> Option<Self> {
        Some(match name {
            "truncate" => TransactionType::Truncate,
            "begin_import" => TransactionType::BeginImport,
            "end_import" => TransactionType::EndImport,
            "abort_import" => TransactionType::AbortImport,
            "begin_restore" => TransactionType::BeginRestore,
            "end_restore" => TransactionType::EndRestore,
            "abort_restore" => TransactionType::AbortRestore,
            _ => return None,
        })
    }
}

/// A caller's intent, not yet ordered.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRequest {
    /// Id of the affected document.
    pub target: String,
    /// Type and type-specific payload.
    pub kind: TransactionType,
    /// Batch correlation id shared by import/restore brackets.
    pub correlation_id: Option<String>,
}

impl TransactionRequest {
    /// Creates a request.
    pub fn new(target: impl Into<String>, kind: TransactionType) -> Self {
        Self {
            target: target.into(),
            kind,
            correlation_id: None,
        }
    }

    /// Creates an insert request.
    pub fn insert(target: impl Into<String>, new: Value) -> Self {
        Self::new(target, TransactionType::Insert { new })
    }

    /// Creates an update request.
    pub fn update(target: impl Into<String>, before: Value, operator: Value) -> Self {
        Self::new(target, TransactionType::Update { before, operator })
    }

    /// Creates a delete request.
    pub fn delete(target: impl Into<String>, before: Value) -> Self {
        Self::new(target, TransactionType::Delete { before })
    }

    /// Creates a target-less request such as a batch marker.
    pub fn marker(kind: TransactionType) -> Self {
        Self::new("", kind)
    }

    /// Sets the batch correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Resolves the document this request produces.
    ///
    /// Inserts and restores yield `new`, deletes yield `before`, updates
    /// apply `operator` to `before`. Truncates and batch markers yield an
    /// empty document.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Request`] if the update operator cannot be
    /// applied.
    pub fn resolve_update_object(&self) -> JournalResult<Value> {
        match &self.kind {
            TransactionType::Insert { new } | TransactionType::Restore { new } => Ok(new.clone()),
            TransactionType::Update { before, operator } => apply_operator(before, operator),
            TransactionType::Delete { before } => Ok(before.clone()),
            TransactionType::Truncate
            | TransactionType::BeginImport
            | TransactionType::EndImport
            | TransactionType::AbortImport
            | TransactionType::BeginRestore
            | TransactionType::EndRestore
            | TransactionType::AbortRestore => Ok(Value::empty_map()),
        }
    }

    /// Converts to the wire map.
    pub fn to_value(&self) -> Value {
        let mut pairs = vec![
            (KEY_TYPE, Value::from(self.kind.name())),
            (KEY_TARGET, Value::from(self.target.as_str())),
        ];
        match &self.kind {
            TransactionType::Insert { new } | TransactionType::Restore { new } => {
                pairs.push((KEY_NEW, new.clone()));
            }
            TransactionType::Update { before, operator } => {
                pairs.push((KEY_BEFORE, before.clone()));
                pairs.push((KEY_OPERATOR, operator.clone()));
            }
            TransactionType::Delete { before } => pairs.push((KEY_BEFORE, before.clone())),
            _ => {}
        }
        if let Some(id) = &self.correlation_id {
            pairs.push((KEY_CORRELATION, Value::from(id.as_str())));
        }
        Value::map(pairs)
    }

    /// Parses the wire map.
    ///
    /// Type names are matched case-insensitively. Fields the type does not
    /// use are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Request`] if the type is unknown, the target
    /// is missing, or a field the type requires is missing or not a map.
    pub fn from_value(value: &Value) -> JournalResult<Self> {
        if value.as_map().is_none() {
            return Err(JournalError::request(format!(
                "request must be a map, got {}",
                value.type_name()
            )));
        }

        let type_name = value
            .get(KEY_TYPE)
            .and_then(Value::as_text)
            .ok_or_else(|| JournalError::request("missing type"))?
            .to_ascii_lowercase();

        let target = match value.get(KEY_TARGET) {
            Some(Value::Text(t)) => t.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => {
                return Err(JournalError::request(format!(
                    "target must be text, got {}",
                    other.type_name()
                )))
            }
        };

        let document = |key: &str| -> JournalResult<Value> {
            match value.get(key) {
                Some(doc @ Value::Map(_)) => Ok(doc.clone()),
                Some(other) => Err(JournalError::request(format!(
                    "{type_name}: {key} must be a document, got {}",
                    other.type_name()
                ))),
                None => Err(JournalError::request(format!("{type_name}: missing {key}"))),
            }
        };

        let kind = match type_name.as_str() {
            "insert" => TransactionType::Insert {
                new: document(KEY_NEW)?,
            },
            "update" => TransactionType::Update {
                before: document(KEY_BEFORE)?,
                operator: document(KEY_OPERATOR)?,
            },
            "delete" => TransactionType::Delete {
                before: document(KEY_BEFORE)?,
            },
            "restore" => TransactionType::Restore {
                new: document(KEY_NEW)?,
            },
            other => TransactionType::unit(other)
                .ok_or_else(|| JournalError::request(format!("unknown type {other:?}")))?,
        };

        if kind.needs_target() && target.is_empty() {
            return Err(JournalError::request(format!("{type_name}: missing target")));
        }

        let correlation_id = match value.get(KEY_CORRELATION) {
            Some(Value::Text(id)) => Some(id.clone()),
            Some(Value::Null) | None => None,
            Some(other) => {
                return Err(JournalError::request(format!(
                    "atomicId must be text, got {}",
                    other.type_name()
                )))
            }
        };

        Ok(Self {
            target,
            kind,
            correlation_id,
        })
    }
}

/// A committed, csn-ordered journal entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionObject {
    /// Position in the journal, starting at 1.
    pub csn: u64,
    /// Commit time in milliseconds since the Unix epoch.
    pub datetime: i64,
    /// The request this entry commits.
    pub request: TransactionRequest,
    /// Digest of the entry at `csn - 1`, or [`Digest::GENESIS`].
    pub before_digest: Digest,
    /// Digest over every other field.
    pub digest: Digest,
}

impl TransactionObject {
    /// Promotes a request to a journal entry and computes its digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be canonically encoded.
    pub fn seal(
        request: TransactionRequest,
        csn: u64,
        datetime: i64,
        before_digest: Digest,
    ) -> CodecResult<Self> {
        let mut txn = Self {
            csn,
            datetime,
            request,
            before_digest,
            digest: Digest::GENESIS,
        };
        txn.digest = txn.calc_digest()?;
        Ok(txn)
    }

    /// Computes the digest over every field except `digest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be canonically encoded.
    pub fn calc_digest(&self) -> CodecResult<Digest> {
        let bytes = to_canonical_cbor(&self.content_value())?;
        Ok(Digest::of(&bytes))
    }

    /// Returns true if the stored digest matches the content.
    pub fn verify_digest(&self) -> bool {
        self.calc_digest().is_ok_and(|d| d == self.digest)
    }

    /// Converts to the wire map, including `digest`.
    pub fn to_value(&self) -> Value {
        let mut value = self.content_value();
        value.insert(KEY_DIGEST, Value::Text(self.digest.to_hex()));
        value
    }

    /// Parses the wire map.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidStructure`] if a field is missing or
    /// malformed.
    pub fn from_value(value: &Value) -> CodecResult<Self> {
        let csn = value
            .get(KEY_CSN)
            .and_then(Value::as_integer)
            .and_then(|n| u64::try_from(n).ok())
            .filter(|&n| n >= 1)
            .ok_or_else(|| CodecError::invalid_structure("missing or invalid csn"))?;
        let datetime = value
            .get(KEY_DATETIME)
            .and_then(Value::as_timestamp)
            .ok_or_else(|| CodecError::invalid_structure("missing or invalid datetime"))?;
        let digest_field = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_text)
                .and_then(Digest::from_hex)
                .ok_or_else(|| CodecError::invalid_structure(format!("missing or invalid {key}")))
        };
        let before_digest = digest_field(KEY_BEFORE_DIGEST)?;
        let digest = digest_field(KEY_DIGEST)?;
        let request = TransactionRequest::from_value(value)
            .map_err(|e| CodecError::invalid_structure(e.to_string()))?;

        Ok(Self {
            csn,
            datetime,
            request,
            before_digest,
            digest,
        })
    }

    #[allow(clippy::cast_possible_wrap)]
    fn content_value(&self) -> Value {
        let mut value = self.request.to_value();
        value.insert(KEY_CSN, Value::Integer(self.csn as i64));
        value.insert(KEY_DATETIME, Value::Timestamp(self.datetime));
        value.insert(KEY_BEFORE_DIGEST, Value::Text(self.before_digest.to_hex()));
        value
    }
}

impl Encode for TransactionObject {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_canonical_cbor(&self.to_value())
    }
}

impl Decode for TransactionObject {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        Self::from_value(&from_cbor(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contextd_codec::json::parse_json;

    fn doc(json: &str) -> Value {
        parse_json(json).unwrap()
    }

    fn sealed(csn: u64, before: Digest) -> TransactionObject {
        let request = TransactionRequest::insert("t1", doc(r#"{"x": 1}"#));
        TransactionObject::seal(request, csn, 1_700_000_000_000, before).unwrap()
    }

    #[test]
    fn parse_insert() {
        let request =
            TransactionRequest::from_value(&doc(r#"{"type": "INSERT", "target": "t1", "new": {"x": 1}}"#))
                .unwrap();
        assert_eq!(request.target, "t1");
        assert_eq!(
            request.kind,
            TransactionType::Insert {
                new: doc(r#"{"x": 1}"#)
            }
        );
        assert_eq!(request.correlation_id, None);
    }

    #[test]
    fn parse_rejects_missing_fields() {
        for body in [
            r#"{"target": "t1"}"#,
            r#"{"type": "update", "target": "t1", "before": {"a": 1}}"#,
            r#"{"type": "delete", "target": "t1"}"#,
            r#"{"type": "insert", "new": {"x": 1}}"#,
            r#"{"type": "insert", "target": "t1", "new": 5}"#,
            r#"{"type": "merge", "target": "t1"}"#,
        ] {
            let err = TransactionRequest::from_value(&doc(body)).unwrap_err();
            assert!(matches!(err, JournalError::Request(_)), "{body}: {err}");
        }
    }

    #[test]
    fn markers_parse_without_target() {
        let request =
            TransactionRequest::from_value(&doc(r#"{"type": "begin_import", "atomicId": "b-1"}"#))
                .unwrap();
        assert_eq!(request.kind, TransactionType::BeginImport);
        assert!(request.kind.is_marker());
        assert_eq!(request.correlation_id.as_deref(), Some("b-1"));
    }

    #[test]
    fn resolve_by_type() {
        let update = TransactionRequest::update(
            "t1",
            doc(r#"{"a": 1, "b": 2}"#),
            doc(r#"{"$set": {"b": 3}}"#),
        );
        assert_eq!(
            update.resolve_update_object().unwrap(),
            doc(r#"{"a": 1, "b": 3}"#)
        );

        let delete = TransactionRequest::delete("t1", doc(r#"{"a": 1}"#));
        assert_eq!(delete.resolve_update_object().unwrap(), doc(r#"{"a": 1}"#));

        for kind in [
            TransactionType::Truncate,
            TransactionType::BeginRestore,
            TransactionType::AbortImport,
        ] {
            let marker = TransactionRequest::marker(kind);
            assert_eq!(marker.resolve_update_object().unwrap(), Value::empty_map());
        }
    }

    #[test]
    fn digest_chains_and_verifies() {
        let first = sealed(1, Digest::GENESIS);
        let second = sealed(2, first.digest);
        assert!(first.verify_digest());
        assert!(second.verify_digest());
        assert_eq!(second.before_digest, first.digest);
        assert_ne!(first.digest, second.digest);
    }

    #[test]
    fn tampering_breaks_digest() {
        let mut txn = sealed(1, Digest::GENESIS);
        txn.request.target = "t2".into();
        assert!(!txn.verify_digest());
    }

    #[test]
    fn correlation_id_is_covered() {
        let plain = sealed(1, Digest::GENESIS);
        let mut tagged = plain.clone();
        tagged.request.correlation_id = Some("batch".into());
        assert_ne!(tagged.calc_digest().unwrap(), plain.digest);
    }

    #[test]
    fn encode_decode_preserves_digest() {
        let txn = sealed(3, Digest::of(b"prev"));
        let decoded = TransactionObject::decode(&txn.encode().unwrap()).unwrap();
        assert_eq!(decoded, txn);
        assert!(decoded.verify_digest());
    }

    #[test]
    fn decode_rejects_zero_csn() {
        let mut value = sealed(1, Digest::GENESIS).to_value();
        value.insert("csn", Value::Integer(0));
        assert!(TransactionObject::from_value(&value).is_err());
    }
}
