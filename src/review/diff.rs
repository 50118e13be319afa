//! Unified diff parsing.
//!
//! The review engine needs two things from a diff: the set of changed
//! (added) line numbers per file, to validate model findings against, and
//! the hunk text itself, as prompt context.

use std::collections::{BTreeMap, BTreeSet};

/// Changed portion of one file in a pull-request diff.
#[derive(Debug, Clone, Default)]
pub struct ChangedFile {
    /// 1-based line numbers (in the new file) that this diff adds or changes.
    pub changed_lines: BTreeSet<u32>,
    /// Raw hunk text, concatenated, for prompt context.
    pub hunks: String,
}

/// Parse a unified diff into per-file changed-line sets.
///
/// Deleted files (new side is `/dev/null`) are skipped — there are no lines
/// to anchor findings to.
pub fn parse(diff: &str) -> BTreeMap<String, ChangedFile> {
    let mut files: BTreeMap<String, ChangedFile> = BTreeMap::new();
    let mut current: Option<String> = None;
    let mut new_line: u32 = 0;

    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("+++ ") {
            if rest == "/dev/null" {
                current = None;
            } else {
                let path = rest.strip_prefix("b/").unwrap_or(rest).to_string();
                files.entry(path.clone()).or_default();
                current = Some(path);
            }
            continue;
        }
        let Some(path) = current.as_ref() else {
            continue;
        };
        let file = files.get_mut(path).expect("current file always present");

        if line.starts_with("@@") {
            // "@@ -a,b +c,d @@" — c is the first new-file line of the hunk.
            new_line = line
                .split('+')
                .nth(1)
                .and_then(|s| {
                    s.split(|c: char| c == ',' || c == ' ')
                        .next()
                        .and_then(|n| n.parse().ok())
                })
                .unwrap_or(0);
            file.hunks.push_str(line);
            file.hunks.push('\n');
        } else if let Some(added) = line.strip_prefix('+') {
            file.changed_lines.insert(new_line);
            new_line += 1;
            file.hunks.push('+');
            file.hunks.push_str(added);
            file.hunks.push('\n');
        } else if line.starts_with("--- ") {
            // Old-side header of the next file; stop attributing lines until
            // its "+++" header names the new side.
            current = None;
        } else if line.starts_with('-') {
            // Removed line: old side only, new-file counter does not move.
            file.hunks.push_str(line);
            file.hunks.push('\n');
        } else if line.starts_with(' ') || line.is_empty() {
            new_line += 1;
            file.hunks.push_str(line);
            file.hunks.push('\n');
        }
        // "diff --git" and "index" headers fall through untracked.
    }
    files
}
