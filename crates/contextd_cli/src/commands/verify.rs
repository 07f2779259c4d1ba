//! Verify command implementation.

use contextd_journal::{
    journal_path, read_journal_file, read_sequence_file, sequence_path, verify_chain, ChainReport,
};
use std::path::Path;

/// Verification result.
#[derive(Debug)]
pub struct VerifyResult {
    /// Chain check over every journal entry.
    pub chain: ChainReport,
    /// Highest csn in the journal.
    pub last_csn: u64,
    /// Counter stored in the sequence file, if there is one.
    pub sequence: Option<u64>,
    /// Bytes after the last complete journal record.
    pub torn_bytes: u64,
}

impl VerifyResult {
    /// Problems found beyond chain violations.
    pub fn errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Some(sequence) = self.sequence {
            if sequence < self.last_csn {
                errors.push(format!(
                    "sequence {sequence} is behind journal csn {}",
                    self.last_csn
                ));
            }
        }
        errors
    }

    fn is_ok(&self) -> bool {
        self.chain.is_valid() && self.errors().is_empty()
    }
}

/// Checks the journal and sequence files in a context directory.
///
/// # Errors
///
/// Returns an error if the journal is missing or a record is damaged.
pub fn check(dir: &Path) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let journal = journal_path(dir);
    if !journal.exists() {
        return Err(format!("journal file not found at {}", journal.display()).into());
    }
    let file = read_journal_file(&journal)?;

    let sequence = sequence_path(dir);
    let sequence = if sequence.exists() {
        Some(read_sequence_file(&sequence)?)
    } else {
        None
    };

    Ok(VerifyResult {
        chain: verify_chain(&file.entries),
        last_csn: file.entries.last().map_or(0, |e| e.csn),
        sequence,
        torn_bytes: file.torn_bytes,
    })
}

/// Runs the verify command.
pub fn run(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying context at {}", dir.display());
    println!();

    let result = check(dir)?;
    println!(
        "  entries checked: {}, last csn: {}, violations: {}",
        result.chain.checked,
        result.last_csn,
        result.chain.violations.len()
    );
    if let Some(sequence) = result.sequence {
        println!("  sequence: {sequence}");
    }
    if result.torn_bytes > 0 {
        println!(
            "  torn tail: {} bytes (dropped on next open)",
            result.torn_bytes
        );
    }
    for violation in &result.chain.violations {
        println!("    ERROR: {violation}");
    }
    for error in result.errors() {
        println!("    ERROR: {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Journal verification passed");
        Ok(())
    } else {
        println!("✗ Journal verification failed");
        Err("Verification failed".into())
    }
}
