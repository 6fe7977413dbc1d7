//! Generic-parameter inspection and bound insertion on signature text.
//!
//! Inspection works on the node model (`generics` and `bounds`). Rewriting
//! edits the signature text at bracket depth so nested generics, closures
//! and `Fn() -> T` bounds are left alone.

use mend_core::types::{GenericKind, InterfaceNode, NodeKind, WherePredicate};
use serde::{Deserialize, Serialize};

use crate::types::PatternError;

/// How new bounds are written into a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundPlacement {
    /// `<F: Send>` on the declaring generic list.
    #[default]
    Inline,
    /// `where F: Send` after the parameter list.
    WhereClause,
}

/// Bounds from `wanted` that `param` does not already carry.
pub fn missing_bounds(node: &InterfaceNode, param: &str, wanted: &[String]) -> Vec<String> {
    let have = node.effective_bounds(param);
    wanted
        .iter()
        .map(|b| b.trim().to_string())
        .filter(|b| !have.contains(b))
        .collect()
}

/// The word that precedes an item's own generic list.
pub fn generic_anchor(node: &InterfaceNode) -> String {
    match node.kind {
        NodeKind::Function | NodeKind::Test => format!("fn {}", node.name),
        NodeKind::Impl => "impl".to_string(),
        _ => node.name.clone(),
    }
}

/// Add `bounds` to `param` on `node`, in both the model and the signature text.
/// Returns the rewritten node with a refreshed UID.
pub fn with_added_bounds(
    node: &InterfaceNode,
    param: &str,
    bounds: &[String],
    placement: BoundPlacement,
) -> Result<InterfaceNode, PatternError> {
    let missing = missing_bounds(node, param, bounds);
    if missing.is_empty() {
        return Ok(node.clone());
    }
    let mut out = node.clone();
    match placement {
        BoundPlacement::Inline => {
            out.signature = add_bounds_inline(&node.signature, &generic_anchor(node), param, &missing)?;
            let generic = out
                .generics
                .iter_mut()
                .find(|g| g.name == param)
                .ok_or_else(|| PatternError::Rewrite(format!("{param} is not declared on {}", node.name)))?;
            generic.bounds.extend(missing);
        }
        BoundPlacement::WhereClause => {
            out.signature = add_bounds_where(&node.signature, param, &missing)?;
            out.bounds.push(WherePredicate {
                subject: param.to_string(),
                bounds: missing,
            });
        }
    }
    out.refresh_uid();
    Ok(out)
}

/// Insert bounds on `param` inside the generic list that follows `anchor`.
pub fn add_bounds_inline(
    signature: &str,
    anchor: &str,
    param: &str,
    bounds: &[String],
) -> Result<String, PatternError> {
    let (open, close) = generic_list_span(signature, anchor)
        .ok_or_else(|| PatternError::Rewrite(format!("no generic list after `{anchor}`")))?;
    let inner = &signature[open + 1..close];
    let (start, end) = split_top_level(inner, ',')
        .into_iter()
        .find(|&(s, e)| param_name(&inner[s..e]) == Some(param))
        .ok_or_else(|| PatternError::Rewrite(format!("generic `{param}` not in `<{inner}>`")))?;

    let entry = &inner[start..end];
    let trimmed_end = start + entry.trim_end().len();
    let entry = &inner[start..trimmed_end];
    let (decl, default) = match find_top_level(entry, '=') {
        Some(i) => (entry[..i].trim_end(), Some(&entry[i..])),
        None => (entry, None),
    };
    let joined = bounds.join(" + ");
    let mut rewritten = if find_top_level(decl, ':').is_some() {
        format!("{decl} + {joined}")
    } else {
        format!("{decl}: {joined}")
    };
    if let Some(default) = default {
        rewritten.push(' ');
        rewritten.push_str(default);
    }

    let abs_start = open + 1 + start;
    let abs_end = open + 1 + trimmed_end;
    Ok(format!("{}{}{}", &signature[..abs_start], rewritten, &signature[abs_end..]))
}

/// Append `param: bounds` to the signature's `where` clause, creating one if needed.
pub fn add_bounds_where(signature: &str, param: &str, bounds: &[String]) -> Result<String, PatternError> {
    if param.is_empty() || bounds.is_empty() {
        return Err(PatternError::Rewrite("empty where predicate".to_string()));
    }
    let predicate = format!("{param}: {}", bounds.join(" + "));
    let body_start = trailing_delimiter(signature);
    let head = signature[..body_start].trim_end();
    let tail = &signature[body_start..];

    let rewritten = if find_top_level_word(head, "where").is_some() {
        let head = head.trim_end_matches(',').trim_end();
        format!("{head}, {predicate}")
    } else {
        format!("{head} where {predicate}")
    };
    if tail.is_empty() {
        Ok(rewritten)
    } else {
        Ok(format!("{rewritten} {tail}"))
    }
}

/// Byte offsets of `<` and its matching `>` directly following `anchor`.
pub fn generic_list_span(signature: &str, anchor: &str) -> Option<(usize, usize)> {
    let mut from = 0;
    while let Some(pos) = signature[from..].find(anchor) {
        let at = from + pos;
        let after = at + anchor.len();
        let bounded_before = signature[..at]
            .chars()
            .next_back()
            .map_or(true, |c| !is_ident(c));
        let bounded_after = signature[after..].chars().next().map_or(true, |c| !is_ident(c));
        if bounded_before && bounded_after {
            let rest = &signature[after..];
            let skipped = rest.len() - rest.trim_start().len();
            let open = after + skipped;
            if signature[open..].starts_with('<') {
                return matching_angle(signature, open).map(|close| (open, close));
            }
            return None;
        }
        from = after;
    }
    None
}

/// Declared name of one generic-list entry (`'a`, `T`, `const N`).
pub fn param_name(entry: &str) -> Option<&str> {
    let entry = entry.trim();
    let entry = entry.strip_prefix("const ").map(str::trim_start).unwrap_or(entry);
    let end = entry
        .char_indices()
        .find(|&(i, c)| !(is_ident(c) || (i == 0 && c == '\'')))
        .map_or(entry.len(), |(i, _)| i);
    (end > 0).then(|| &entry[..end])
}

/// Classify a generic-list entry.
pub fn param_kind(entry: &str) -> GenericKind {
    let entry = entry.trim();
    if entry.starts_with('\'') {
        GenericKind::Lifetime
    } else if entry.starts_with("const ") {
        GenericKind::Const
    } else {
        GenericKind::Type
    }
}

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn matching_angle(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut prev = '\0';
    for (i, c) in s[open..].char_indices() {
        match c {
            '<' => depth += 1,
            '>' if prev != '-' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
        prev = c;
    }
    None
}

/// Ranges of `s` separated by `sep` at bracket depth zero.
fn split_top_level(s: &str, sep: char) -> Vec<(usize, usize)> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, c, depth) in depth_walk(s) {
        if c == sep && depth == 0 {
            parts.push((start, i));
            start = i + c.len_utf8();
        }
    }
    if !s[start..].trim().is_empty() {
        parts.push((start, s.len()));
    }
    parts
}

fn find_top_level(s: &str, needle: char) -> Option<usize> {
    depth_walk(s)
        .into_iter()
        .find(|&(_, c, depth)| c == needle && depth == 0)
        .map(|(i, _, _)| i)
}

fn find_top_level_word(s: &str, word: &str) -> Option<usize> {
    let walk = depth_walk(s);
    walk.iter().find_map(|&(i, _, depth)| {
        if depth != 0 || !s[i..].starts_with(word) {
            return None;
        }
        let before = s[..i].chars().next_back().map_or(true, |c| !is_ident(c));
        let after = s[i + word.len()..].chars().next().map_or(true, |c| !is_ident(c));
        (before && after).then_some(i)
    })
}

/// Start of a trailing `{` or `;` at depth zero, or the end of the text.
fn trailing_delimiter(s: &str) -> usize {
    let trimmed = s.trim_end();
    if trimmed.ends_with(';') {
        return trimmed.len() - 1;
    }
    depth_walk(trimmed)
        .into_iter()
        .filter(|&(_, c, depth)| c == '{' && depth == 0)
        .map(|(i, _, _)| i)
        .last()
        .unwrap_or(trimmed.len())
}

/// Every char with the bracket depth *before* it is applied.
fn depth_walk(s: &str) -> Vec<(usize, char, i32)> {
    let mut out = Vec::with_capacity(s.len());
    let mut depth = 0i32;
    let mut prev = '\0';
    for (i, c) in s.char_indices() {
        let closing = matches!(c, ')' | ']' | '}') || (c == '>' && prev != '-');
        if closing {
            depth -= 1;
        }
        out.push((i, c, depth));
        if matches!(c, '(' | '[' | '<' | '{') {
            depth += 1;
        }
        prev = c;
    }
    out
}
