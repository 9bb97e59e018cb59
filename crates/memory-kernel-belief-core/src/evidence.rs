use std::fmt::{Display, Formatter};
use std::path::{Component, Path, PathBuf};

use crate::model::Evidence;
use crate::BeliefError;

const QUOTE_PREVIEW_CHARS: usize = 80;

/// A 1-based inclusive line range written as `L<start>-L<end>`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    /// Parses a `L<start>-L<end>` citation.
    ///
    /// # Errors
    /// Returns [`BeliefError::EvidenceViolation`] when the citation is malformed,
    /// `start` is zero, or `end < start`.
    pub fn parse(raw: &str) -> Result<Self, BeliefError> {
        let bounds = raw
            .strip_prefix('L')
            .and_then(|rest| rest.split_once("-L"))
            .and_then(|(start, end)| Some((parse_line_number(start)?, parse_line_number(end)?)));

        let Some((start, end)) = bounds else {
            return Err(BeliefError::EvidenceViolation(format!(
                "bad lines value: {raw}"
            )));
        };
        if start == 0 || end < start {
            return Err(BeliefError::EvidenceViolation(format!(
                "bad lines range: {raw}"
            )));
        }

        Ok(Self { start, end })
    }
}

impl Display for LineRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}-L{}", self.start, self.end)
    }
}

fn parse_line_number(value: &str) -> Option<usize> {
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Proves every citation is grounded in workspace source text.
///
/// Each entry must name a file inside `workspace`, carry a valid line range
/// within the file, and quote text that appears in the concatenation of the
/// cited lines.
///
/// # Errors
/// Returns [`BeliefError::EvidenceViolation`] for the first entry that fails,
/// naming its path and range.
pub fn verify_evidence(evidence: &[Evidence], workspace: &Path) -> Result<(), BeliefError> {
    if evidence.is_empty() {
        return Ok(());
    }
    let root = canonical_root(workspace)?;

    for entry in evidence {
        if entry.path.trim().is_empty() {
            return Err(BeliefError::EvidenceViolation(
                "evidence missing path".to_string(),
            ));
        }
        let full = resolve_inside(&root, &entry.path)?;
        let range = LineRange::parse(&entry.lines)?;

        let quote = entry.quote.trim();
        if quote.is_empty() {
            return Err(BeliefError::EvidenceViolation(format!(
                "evidence quote missing: {} {}",
                entry.path, entry.lines
            )));
        }

        let lines = read_lines(&full, &entry.path)?;
        if range.end > lines.len() {
            return Err(BeliefError::EvidenceViolation(format!(
                "evidence line range out of bounds: {} {} (file has {} lines)",
                entry.path,
                entry.lines,
                lines.len()
            )));
        }

        let snippet: String = lines[range.start - 1..range.end].concat();
        if !snippet.contains(quote) {
            let preview: String = quote.chars().take(QUOTE_PREVIEW_CHARS).collect();
            return Err(BeliefError::EvidenceViolation(format!(
                "evidence quote not found in cited range: {} {} (quote='{preview}...')",
                entry.path, entry.lines
            )));
        }
    }

    Ok(())
}

/// Finds the line range citing `quote` inside a workspace file.
///
/// The first line containing the trimmed quote wins; otherwise the whole text
/// is searched so multi-line quotes map to their starting line. The range is
/// widened to `window` lines, bounded by the file length.
///
/// # Errors
/// Returns [`BeliefError::EvidenceViolation`] when the path escapes the
/// workspace or is missing, and [`BeliefError::InputMissing`] for an empty
/// quote.
pub fn locate_quote(
    workspace: &Path,
    path: &str,
    quote: &str,
    window: usize,
) -> Result<Option<LineRange>, BeliefError> {
    let root = canonical_root(workspace)?;
    let full = resolve_inside(&root, path)?;

    let quote = quote.trim();
    if quote.is_empty() {
        return Err(BeliefError::InputMissing("empty quote".to_string()));
    }

    let lines = read_lines(&full, path)?;
    let span = window.max(1);
    let widen = |start: usize| LineRange {
        start,
        end: lines.len().min(start + span - 1),
    };

    if let Some(index) = lines.iter().position(|line| line.contains(quote)) {
        return Ok(Some(widen(index + 1)));
    }

    let text = lines.concat();
    Ok(text
        .find(quote)
        .map(|offset| widen(text[..offset].matches('\n').count() + 1)))
}

fn canonical_root(workspace: &Path) -> Result<PathBuf, BeliefError> {
    workspace.canonicalize().map_err(|err| {
        BeliefError::EvidenceViolation(format!(
            "workspace root not accessible: {}: {err}",
            workspace.display()
        ))
    })
}

fn resolve_inside(root: &Path, relative: &str) -> Result<PathBuf, BeliefError> {
    let candidate = Path::new(relative);
    let escapes_lexically = candidate.is_absolute()
        || candidate
            .components()
            .any(|component| matches!(component, Component::ParentDir));

    let Ok(full) = root.join(candidate).canonicalize() else {
        if escapes_lexically {
            return Err(BeliefError::EvidenceViolation(format!(
                "evidence path escapes workspace: {relative}"
            )));
        }
        return Err(BeliefError::EvidenceViolation(format!(
            "evidence file not found: {relative}"
        )));
    };

    if !full.starts_with(root) {
        return Err(BeliefError::EvidenceViolation(format!(
            "evidence path escapes workspace: {relative}"
        )));
    }
    if !full.is_file() {
        return Err(BeliefError::EvidenceViolation(format!(
            "evidence file not found: {relative}"
        )));
    }

    Ok(full)
}

/// Reads a file as lines that keep their trailing newline, so the
/// concatenation of a range reproduces the source text.
fn read_lines(full: &Path, label: &str) -> Result<Vec<String>, BeliefError> {
    let bytes = std::fs::read(full).map_err(|err| {
        BeliefError::EvidenceViolation(format!("evidence file unreadable: {label}: {err}"))
    })?;
    let text = String::from_utf8_lossy(&bytes).replace("\r\n", "\n");
    Ok(text.split_inclusive('\n').map(str::to_string).collect())
}
