// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Finalization sanity check on streamed content: runaway repetition loops,
//! unexpectedly non-Latin output, and absurd length.

/// Ceiling on finalized content; anything longer is truncated.
const MAX_CONTENT_CHARS: usize = 200_000;

/// Window checked for degenerate repetition at the tail of the content.
const REPEAT_PROBE: usize = 48;
const REPEAT_MIN_COUNT: usize = 12;

/// Share of non-ASCII letters above which content is flagged.
const NON_LATIN_RATIO: f32 = 0.6;

#[derive(Debug, Clone, Default)]
pub struct SafetyReport {
    pub issues: Vec<String>,
    pub had_repetition: bool,
    pub had_non_english: bool,
    pub truncated: bool,
    /// Replacement content when the check tripped.
    pub sanitized: Option<String>,
}

impl SafetyReport {
    pub fn tripped(&self) -> bool {
        !self.issues.is_empty()
    }
}

/// Inspect finalized content and produce sanitized replacement text when a
/// degenerate pattern is detected.
pub fn check_content_safety(content: &str) -> SafetyReport {
    let mut report = SafetyReport::default();

    if content.chars().count() > MAX_CONTENT_CHARS {
        report.truncated = true;
        report.issues.push("content exceeded maximum length".into());
    }

    if has_repetition_loop(content) {
        report.had_repetition = true;
        report.issues.push("repetition loop detected".into());
    }

    if is_mostly_non_latin(content) {
        report.had_non_english = true;
        report
            .issues
            .push("content is mostly non-Latin script".into());
    }

    if report.tripped() {
        let mut sanitized: String = content.chars().take(MAX_CONTENT_CHARS).collect();
        if report.had_repetition {
            sanitized = trim_repetition(&sanitized);
        }
        report.sanitized = Some(sanitized);
    }
    report
}

/// True when the tail of the content is one short fragment repeated over and
/// over — the signature of a decoding loop.
fn has_repetition_loop(content: &str) -> bool {
    let chars: Vec<char> = content.chars().collect();
    if chars.len() < REPEAT_PROBE * REPEAT_MIN_COUNT {
        return false;
    }
    let tail: String = chars[chars.len() - REPEAT_PROBE * REPEAT_MIN_COUNT..]
        .iter()
        .collect();
    for width in 4..=REPEAT_PROBE {
        let frag: String = tail.chars().rev().take(width).collect::<Vec<_>>().iter().rev().collect();
        if frag.trim().is_empty() {
            continue;
        }
        let count = tail.matches(&frag).count();
        if count >= REPEAT_MIN_COUNT {
            return true;
        }
    }
    false
}

/// Drop trailing copies of the repeated fragment, keeping the first.
fn trim_repetition(content: &str) -> String {
    let chars: Vec<char> = content.chars().collect();
    for width in (4..=REPEAT_PROBE).rev() {
        if chars.len() < width * 2 {
            continue;
        }
        let frag: String = chars[chars.len() - width..].iter().collect();
        if frag.trim().is_empty() {
            continue;
        }
        let mut end = chars.len();
        let mut copies = 0;
        while end >= width && chars[end - width..end].iter().collect::<String>() == frag {
            end -= width;
            copies += 1;
        }
        if copies >= REPEAT_MIN_COUNT {
            let mut kept: String = chars[..end].iter().collect();
            kept.push_str(&frag);
            return kept;
        }
    }
    content.to_string()
}

fn is_mostly_non_latin(content: &str) -> bool {
    let letters: Vec<char> = content.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() < 40 {
        return false;
    }
    let non_ascii = letters.iter().filter(|c| !c.is_ascii()).count();
    non_ascii as f32 / letters.len() as f32 > NON_LATIN_RATIO
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
