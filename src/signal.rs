use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::config::SentinelConfig;
use crate::types::CompletionSignal;

/// Signal extracted from one agent turn's output, with the blocked
/// reason when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedSignal {
    pub signal: CompletionSignal,
    pub blocked_reason: Option<String>,
}

/// Extract the phase signal from agent output.
///
/// The phase is complete iff the output contains the completion marker
/// on some line; blocked iff a line starts the blocked marker. When
/// both appear, blocked wins. Neither marker means `Continue`.
pub fn extract_signal(output: &str, sentinel: &SentinelConfig) -> ExtractedSignal {
    let mut complete = false;
    let mut blocked_reason: Option<String> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = find_after(trimmed, &sentinel.blocked_marker) {
            if blocked_reason.is_none() {
                let reason = rest.trim();
                blocked_reason = Some(if reason.is_empty() {
                    "(no reason given)".to_string()
                } else {
                    reason.to_string()
                });
            }
        } else if trimmed.contains(sentinel.complete_marker.as_str()) {
            complete = true;
        }
    }

    if let Some(reason) = blocked_reason {
        return ExtractedSignal {
            signal: CompletionSignal::Blocked,
            blocked_reason: Some(reason),
        };
    }
    if complete {
        return ExtractedSignal {
            signal: CompletionSignal::Complete,
            blocked_reason: None,
        };
    }
    ExtractedSignal {
        signal: CompletionSignal::Continue,
        blocked_reason: None,
    }
}

fn find_after<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.find(marker).map(|idx| &line[idx + marker.len()..])
}

// --- Failure classification and signatures ---

/// Lines matching any of these are treated as failure evidence: test
/// failures, compiler/runtime errors, panics, tracebacks.
fn failure_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(^|\s)(error(\[[A-Z0-9]+\])?:|FAILED|test result: FAILED|panicked at|Traceback \(most recent call last\)|assertion .*failed|fatal:|exit code [1-9])",
        )
        .expect("failure pattern is valid")
    })
}

fn path_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Absolute unix paths; workspace prefixes vary per worktree so they
    // must not influence the fingerprint.
    RE.get_or_init(|| Regex::new(r"/[A-Za-z0-9._/-]+").expect("path pattern is valid"))
}

fn timestamp_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?([+-]\d{2}:?\d{2}|Z)?")
            .expect("timestamp pattern is valid")
    })
}

fn hex_addr_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"0x[0-9a-fA-F]+").expect("hex pattern is valid"))
}

fn hex_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Commit shas, uuids fragments, other volatile hex identifiers.
    RE.get_or_init(|| Regex::new(r"\b[0-9a-f]{7,40}\b").expect("hex id pattern is valid"))
}

/// Compute the error signature for an iteration's output: `None` when
/// the output reports no recognizable failure, otherwise a stable hash
/// of the normalized failure lines.
pub fn error_signature(output: &str) -> Option<String> {
    let failing: Vec<&str> = output
        .lines()
        .filter(|line| failure_pattern().is_match(line))
        .collect();

    if failing.is_empty() {
        return None;
    }

    let normalized = normalize_failure_text(&failing.join("\n"));
    Some(fingerprint(&normalized))
}

/// Strip volatile content so the same underlying failure always hashes
/// to the same signature: absolute paths, timestamps, addresses, hex
/// identifiers.
pub fn normalize_failure_text(text: &str) -> String {
    let text = timestamp_pattern().replace_all(text, "<ts>");
    let text = hex_addr_pattern().replace_all(&text, "<addr>");
    let text = path_pattern().replace_all(&text, "<path>");
    let text = hex_id_pattern().replace_all(&text, "<hex>");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Signature used when an agent call times out, so repeated timeouts
/// trip the stuck detector like any other repeated failure.
pub fn timeout_signature() -> String {
    fingerprint("agent iteration timeout")
}

/// Unconditional fingerprint of arbitrary failure text (protocol
/// errors and the like that may not match the failure patterns).
pub fn fingerprint_text(text: &str) -> String {
    fingerprint(&normalize_failure_text(text))
}

fn fingerprint(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..8])
}
