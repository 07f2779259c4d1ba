//! Dump command implementation.

use contextd_codec::format_rfc3339;
use contextd_codec::json::to_json;
use contextd_journal::{journal_path, read_journal_file, TransactionObject};
use serde::Serialize;
use std::path::Path;

/// Journal entry representation for output.
#[derive(Debug, Serialize)]
pub struct EntryInfo {
    /// Commit sequence number.
    pub csn: u64,
    /// Commit time, RFC 3339.
    pub datetime: String,
    /// Transaction type.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Target document id, empty for context-wide entries.
    pub target: String,
    /// Batch correlation id.
    #[serde(rename = "atomicId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Digest of the previous entry.
    #[serde(rename = "beforeDigest")]
    pub before_digest: String,
    /// Digest of this entry.
    pub digest: String,
    /// Full request as extended JSON.
    pub request: serde_json::Value,
}

impl EntryInfo {
    fn from_entry(entry: &TransactionObject) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            csn: entry.csn,
            datetime: format_rfc3339(entry.datetime)?,
            kind: entry.request.kind.name(),
            target: entry.request.target.clone(),
            correlation_id: entry.request.correlation_id.clone(),
            before_digest: entry.before_digest.to_hex(),
            digest: entry.digest.to_hex(),
            request: to_json(&entry.request.to_value())?,
        })
    }
}

/// Reads up to `limit` entries starting at csn `from`.
pub fn read_entries(
    dir: &Path,
    from: u64,
    limit: Option<usize>,
) -> Result<Vec<EntryInfo>, Box<dyn std::error::Error>> {
    let path = journal_path(dir);
    if !path.exists() {
        return Err("journal file not found".into());
    }

    let file = read_journal_file(&path)?;
    file.entries
        .iter()
        .filter(|e| e.csn >= from)
        .take(limit.unwrap_or(usize::MAX))
        .map(EntryInfo::from_entry)
        .collect()
}

/// Runs the dump command.
pub fn run(
    dir: &Path,
    from: u64,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let entries = read_entries(dir, from, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            print_text_output(&entries);
        }
    }

    Ok(())
}

fn print_text_output(entries: &[EntryInfo]) {
    println!("Journal entries ({} total)", entries.len());
    println!("================");
    println!();

    for entry in entries {
        print!(
            "[{:08}] {} {:13} digest={}",
            entry.csn,
            entry.datetime,
            entry.kind,
            &entry.digest[..12]
        );
        if !entry.target.is_empty() {
            print!(" target={}", entry.target);
        }
        if let Some(ref id) = entry.correlation_id {
            print!(" atomicId={id}");
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contextd_codec::Value;
    use contextd_journal::{ContextDir, Digest, JournalStore, TransactionRequest, TransactionType};

    #[tokio::test]
    async fn reads_window() {
        let temp = tempfile::tempdir().unwrap();
        let dir = ContextDir::open(temp.path(), "db").unwrap();
        let (journal, _) = dir.open_stores().unwrap();

        let mut before = Digest::GENESIS;
        let requests = [
            TransactionRequest::marker(TransactionType::BeginImport).with_correlation_id("b1"),
            TransactionRequest::insert("t1", Value::empty_map()).with_correlation_id("b1"),
            TransactionRequest::marker(TransactionType::EndImport).with_correlation_id("b1"),
        ];
        for (i, request) in requests.into_iter().enumerate() {
            let txn = TransactionObject::seal(request, i as u64 + 1, 0, before).unwrap();
            journal.insert(&txn).await.unwrap();
            before = txn.digest;
        }

        let entries = read_entries(dir.path(), 2, Some(1)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].csn, 2);
        assert_eq!(entries[0].kind, "insert");
        assert_eq!(entries[0].datetime, "1970-01-01T00:00:00.000Z");

        let json = serde_json::to_value(&entries[0]).unwrap();
        assert_eq!(json["atomicId"], "b1");
        assert_eq!(json["request"]["target"], "t1");
    }
}
