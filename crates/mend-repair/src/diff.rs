//! Unified diffs: rendering for review, parsing and applying reasoner output.

use crate::types::GenerateError;

const CONTEXT: usize = 3;
/// Above this many cells the middle section is diffed as one replacement.
const MAX_LCS_CELLS: usize = 4_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal(usize, usize),
    Remove(usize),
    Add(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based first line in the original.
    pub old_start: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    fn expected(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    fn replacement(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Add(s) => Some(s.as_str()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub path: String,
    pub hunks: Vec<Hunk>,
}

/// Render a unified diff of `old` -> `new`. Empty when equal.
pub fn unified_diff(path: &str, old: &str, new: &str) -> String {
    if old == new {
        return String::new();
    }
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();
    let ops = diff_ops(&a, &b);

    let mut out = format!("--- a/{path}\n+++ b/{path}\n");
    for (start, end) in hunk_ranges(&ops) {
        let slice = &ops[start..end];
        let old_start = slice
            .iter()
            .find_map(|op| match op {
                Op::Equal(i, _) | Op::Remove(i) => Some(*i),
                Op::Add(_) => None,
            })
            .unwrap_or_else(|| preceding_old(&ops, start));
        let new_start = slice
            .iter()
            .find_map(|op| match op {
                Op::Equal(_, j) | Op::Add(j) => Some(*j),
                Op::Remove(_) => None,
            })
            .unwrap_or(0);
        let old_len = slice.iter().filter(|op| !matches!(op, Op::Add(_))).count();
        let new_len = slice.iter().filter(|op| !matches!(op, Op::Remove(_))).count();
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            header_start(old_start, old_len),
            old_len,
            header_start(new_start, new_len),
            new_len
        ));
        for op in slice {
            match *op {
                Op::Equal(i, _) => out.push_str(&format!(" {}\n", a[i])),
                Op::Remove(i) => out.push_str(&format!("-{}\n", a[i])),
                Op::Add(j) => out.push_str(&format!("+{}\n", b[j])),
            }
        }
    }
    out
}

fn header_start(zero_based: usize, len: usize) -> usize {
    if len == 0 {
        zero_based
    } else {
        zero_based + 1
    }
}

fn preceding_old(ops: &[Op], before: usize) -> usize {
    ops[..before]
        .iter()
        .rev()
        .find_map(|op| match op {
            Op::Equal(i, _) | Op::Remove(i) => Some(*i + 1),
            Op::Add(_) => None,
        })
        .unwrap_or(0)
}

fn diff_ops(a: &[&str], b: &[&str]) -> Vec<Op> {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let a_mid = &a[prefix..a.len() - suffix];
    let b_mid = &b[prefix..b.len() - suffix];

    let mut ops: Vec<Op> = (0..prefix).map(|i| Op::Equal(i, i)).collect();
    if a_mid.len().saturating_mul(b_mid.len()) > MAX_LCS_CELLS {
        ops.extend((0..a_mid.len()).map(|i| Op::Remove(prefix + i)));
        ops.extend((0..b_mid.len()).map(|j| Op::Add(prefix + j)));
    } else {
        ops.extend(lcs_ops(a_mid, b_mid).into_iter().map(|op| match op {
            Op::Equal(i, j) => Op::Equal(prefix + i, prefix + j),
            Op::Remove(i) => Op::Remove(prefix + i),
            Op::Add(j) => Op::Add(prefix + j),
        }));
    }
    let a_tail = a.len() - suffix;
    let b_tail = b.len() - suffix;
    ops.extend((0..suffix).map(|k| Op::Equal(a_tail + k, b_tail + k)));
    ops
}

fn lcs_ops(a: &[&str], b: &[&str]) -> Vec<Op> {
    let (n, m) = (a.len(), b.len());
    let mut table = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }
    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            ops.push(Op::Equal(i, j));
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            ops.push(Op::Remove(i));
            i += 1;
        } else {
            ops.push(Op::Add(j));
            j += 1;
        }
    }
    ops.extend((i..n).map(Op::Remove));
    ops.extend((j..m).map(Op::Add));
    ops
}

/// Op-index ranges of hunks: changes plus up to CONTEXT equal lines around
/// them, merged when the gap between changes is small.
fn hunk_ranges(ops: &[Op]) -> Vec<(usize, usize)> {
    let changes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, Op::Equal(..)))
        .map(|(i, _)| i)
        .collect();
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for idx in changes {
        let start = idx.saturating_sub(CONTEXT);
        let end = (idx + CONTEXT + 1).min(ops.len());
        match ranges.last_mut() {
            Some(last) if start <= last.1 => last.1 = end,
            _ => ranges.push((start, end)),
        }
    }
    ranges
}

/// Parse a (possibly multi-file) unified diff.
pub fn parse_patch(text: &str) -> Result<Vec<FilePatch>, GenerateError> {
    let mut patches: Vec<FilePatch> = Vec::new();
    let mut lines = text.lines().peekable();
    while let Some(line) = lines.next() {
        if let Some(rest) = line.strip_prefix("+++ ") {
            let path = rest.trim();
            let path = path.strip_prefix("b/").unwrap_or(path);
            patches.push(FilePatch {
                path: path.split('\t').next().unwrap_or(path).to_string(),
                hunks: Vec::new(),
            });
        } else if let Some(header) = line.strip_prefix("@@ ") {
            let patch = patches
                .last_mut()
                .ok_or_else(|| GenerateError::Diff("hunk before file header".to_string()))?;
            let (old_start, old_len, new_len) = parse_hunk_header(header)?;
            let mut hunk = Hunk {
                old_start,
                lines: Vec::new(),
            };
            let (mut seen_old, mut seen_new) = (0, 0);
            while seen_old < old_len || seen_new < new_len {
                let Some(body) = lines.next() else {
                    return Err(GenerateError::Diff(format!("truncated hunk at -{old_start}")));
                };
                match body.chars().next() {
                    Some('+') => {
                        hunk.lines.push(HunkLine::Add(body[1..].to_string()));
                        seen_new += 1;
                    }
                    Some('-') => {
                        hunk.lines.push(HunkLine::Remove(body[1..].to_string()));
                        seen_old += 1;
                    }
                    Some(' ') => {
                        hunk.lines.push(HunkLine::Context(body[1..].to_string()));
                        seen_old += 1;
                        seen_new += 1;
                    }
                    // blank context line with its leading space stripped
                    None => {
                        hunk.lines.push(HunkLine::Context(String::new()));
                        seen_old += 1;
                        seen_new += 1;
                    }
                    Some('\\') => {}
                    Some(_) => {
                        return Err(GenerateError::Diff(format!("unexpected hunk line: {body}")));
                    }
                }
            }
            patch.hunks.push(hunk);
        }
    }
    if patches.is_empty() {
        return Err(GenerateError::Diff("no file headers found".to_string()));
    }
    Ok(patches)
}

fn parse_hunk_header(header: &str) -> Result<(usize, usize, usize), GenerateError> {
    let bad = || GenerateError::Diff(format!("bad hunk header: @@ {header}"));
    let mut parts = header.split_whitespace();
    let old = parts.next().and_then(|p| p.strip_prefix('-')).ok_or_else(bad)?;
    let new = parts.next().and_then(|p| p.strip_prefix('+')).ok_or_else(bad)?;
    let range = |r: &str| -> Option<(usize, usize)> {
        match r.split_once(',') {
            Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
            None => Some((r.parse().ok()?, 1)),
        }
    };
    let (old_start, old_len) = range(old).ok_or_else(bad)?;
    let (_, new_len) = range(new).ok_or_else(bad)?;
    Ok((old_start, old_len, new_len))
}

/// Apply one file's hunks to `original`. Hunks must match exactly, at their
/// stated line or at a unique position elsewhere in the file.
pub fn apply_patch(original: &str, patch: &FilePatch) -> Result<String, GenerateError> {
    let old: Vec<&str> = original.lines().collect();
    let mut out: Vec<&str> = Vec::with_capacity(old.len());
    let mut cursor = 0;

    for hunk in &patch.hunks {
        let expected = hunk.expected();
        let stated = if expected.is_empty() {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let at = if matches_at(&old, stated, &expected) && stated >= cursor {
            stated
        } else {
            let found: Vec<usize> = (cursor..=old.len().saturating_sub(expected.len()))
                .filter(|&i| matches_at(&old, i, &expected))
                .collect();
            match found.as_slice() {
                [only] => *only,
                [] => {
                    return Err(GenerateError::Diff(format!(
                        "{}: hunk at line {} does not match",
                        patch.path, hunk.old_start
                    )))
                }
                _ => {
                    return Err(GenerateError::Diff(format!(
                        "{}: hunk at line {} matches {} places",
                        patch.path,
                        hunk.old_start,
                        found.len()
                    )))
                }
            }
        };
        out.extend_from_slice(&old[cursor..at]);
        out.extend(hunk.replacement());
        cursor = at + expected.len();
    }
    out.extend_from_slice(&old[cursor.min(old.len())..]);

    let mut text = out.join("\n");
    if original.ends_with('\n') || (original.is_empty() && !text.is_empty()) {
        text.push('\n');
    }
    Ok(text)
}

fn matches_at(old: &[&str], at: usize, expected: &[&str]) -> bool {
    at + expected.len() <= old.len() && old[at..at + expected.len()] == *expected
}
