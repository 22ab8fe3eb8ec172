//! Diff patch node - applies a unified diff to a file through FileStore.
//!
//! Modes: `normal` (strict context match), `force` (relocate hunks whose
//! context drifted, skipping unmatchable ones), `dry_run` (report without
//! writing), `reverse` (invert additions and removals).

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::domain::{ExecutableNode, HandleLabel, NodeKind, NodeType, PatchMode};
use crate::engine::{ExecutionContext, NodeTask, ResolvedInputs};
use crate::envelope::Envelope;
use crate::types::{Error, Result};

use super::{NodeHandler, NodeOutput};

#[derive(Debug, Clone, PartialEq)]
enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone, Default)]
struct Hunk {
    old_start: usize,
    new_start: usize,
    lines: Vec<HunkLine>,
}

impl Hunk {
    fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    fn new_lines(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Add(s) => Some(s.clone()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }

    fn reversed(&self) -> Hunk {
        Hunk {
            old_start: self.new_start,
            new_start: self.old_start,
            lines: self
                .lines
                .iter()
                .map(|l| match l {
                    HunkLine::Context(s) => HunkLine::Context(s.clone()),
                    HunkLine::Remove(s) => HunkLine::Add(s.clone()),
                    HunkLine::Add(s) => HunkLine::Remove(s.clone()),
                })
                .collect(),
        }
    }
}

fn parse_diff(text: &str) -> Result<Vec<Hunk>> {
    let mut hunks = Vec::new();
    let mut current: Option<Hunk> = None;

    for line in text.lines() {
        if line.starts_with("--- ") || line.starts_with("+++ ") || line.starts_with("diff ") {
            continue;
        }
        if line.starts_with("\\ No newline") {
            continue;
        }
        if let Some(header) = line.strip_prefix("@@ ") {
            if let Some(hunk) = current.take() {
                hunks.push(hunk);
            }
            let (old_start, new_start) = parse_hunk_header(header)
                .ok_or_else(|| Error::permanent(format!("malformed hunk header: {line}")))?;
            current = Some(Hunk {
                old_start,
                new_start,
                lines: Vec::new(),
            });
            continue;
        }
        let Some(hunk) = current.as_mut() else {
            continue;
        };
        if let Some(rest) = line.strip_prefix('+') {
            hunk.lines.push(HunkLine::Add(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix('-') {
            hunk.lines.push(HunkLine::Remove(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix(' ') {
            hunk.lines.push(HunkLine::Context(rest.to_string()));
        } else if line.is_empty() {
            hunk.lines.push(HunkLine::Context(String::new()));
        }
    }
    if let Some(hunk) = current.take() {
        hunks.push(hunk);
    }
    if hunks.is_empty() {
        return Err(Error::permanent("diff contains no hunks"));
    }
    Ok(hunks)
}

/// `-a[,b] +c[,d] @@ ...` → (a, c)
fn parse_hunk_header(header: &str) -> Option<(usize, usize)> {
    let mut parts = header.split_whitespace();
    let old = parts.next()?.strip_prefix('-')?;
    let new = parts.next()?.strip_prefix('+')?;
    let old_start = old.split(',').next()?.parse().ok()?;
    let new_start = new.split(',').next()?.parse().ok()?;
    Some((old_start, new_start))
}

fn matches_at(lines: &[String], at: usize, expected: &[&str]) -> bool {
    if at + expected.len() > lines.len() {
        return false;
    }
    expected
        .iter()
        .enumerate()
        .all(|(i, e)| lines[at + i] == *e)
}

struct ApplyOutcome {
    lines: Vec<String>,
    applied: usize,
    rejected: usize,
}

fn apply_hunks(original: &[String], hunks: &[Hunk], force: bool) -> Result<ApplyOutcome> {
    let mut lines = original.to_vec();
    let mut offset: i64 = 0;
    let mut applied = 0usize;
    let mut rejected = 0usize;

    for (index, hunk) in hunks.iter().enumerate() {
        let old = hunk.old_lines();
        // Hunk positions are 1-based; a zero start means prepending.
        let base = (hunk.old_start.max(1) - 1) as i64 + offset;
        let base = base.max(0) as usize;

        let position = if matches_at(&lines, base, &old) {
            Some(base)
        } else if force {
            (0..=lines.len().saturating_sub(old.len()))
                .find(|&at| matches_at(&lines, at, &old))
        } else {
            None
        };

        let Some(at) = position else {
            if force {
                rejected += 1;
                continue;
            }
            return Err(Error::permanent(format!(
                "hunk {} does not apply at line {}",
                index + 1,
                hunk.old_start
            )));
        };

        let replacement = hunk.new_lines();
        let removed = old.len();
        lines.splice(at..at + removed, replacement.iter().cloned());
        offset += replacement.len() as i64 - removed as i64;
        applied += 1;
    }

    Ok(ApplyOutcome {
        lines,
        applied,
        rejected,
    })
}

#[derive(Debug, Default)]
pub struct DiffPatchHandler;

#[async_trait]
impl NodeHandler for DiffPatchHandler {
    fn node_type(&self) -> NodeType {
        NodeType::DiffPatch
    }

    async fn execute(
        &self,
        node: &ExecutableNode,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        _task: &NodeTask,
    ) -> Result<NodeOutput> {
        let NodeKind::DiffPatch(config) = &node.kind else {
            return Err(Error::execution("diff_patch handler on wrong node"));
        };

        let diff_text = inputs
            .get("default")
            .and_then(|e| e.as_text().map(str::to_string))
            .ok_or_else(|| Error::MissingRequiredInput("default".to_string()))?;

        let mut hunks = parse_diff(&diff_text)?;
        if config.mode == PatchMode::Reverse {
            hunks = hunks.iter().map(Hunk::reversed).collect();
        }

        let current = ctx.ports.files.read(&config.target_path).await?;
        let text = String::from_utf8(current.to_vec())
            .map_err(|e| Error::permanent(format!("target is not UTF-8: {e}")))?;
        let had_trailing_newline = text.ends_with('\n');
        let lines: Vec<String> = text.lines().map(str::to_string).collect();

        let force = config.mode == PatchMode::Force;
        let outcome = apply_hunks(&lines, &hunks, force)?;

        let dry_run = config.mode == PatchMode::DryRun;
        if !dry_run {
            let mut patched = outcome.lines.join("\n");
            if had_trailing_newline {
                patched.push('\n');
            }
            ctx.ports
                .files
                .write(&config.target_path, Bytes::from(patched))
                .await?;
        }

        let body = serde_json::json!({
            "path": config.target_path,
            "applied_hunks": outcome.applied,
            "rejected_hunks": outcome.rejected,
            "dry_run": dry_run,
        });
        Ok(NodeOutput::labeled(
            HandleLabel::Results,
            Envelope::from_json(body, node.id().clone(), ctx.execution_id.clone())
                .with_meta("mode", Value::String(format!("{:?}", config.mode))),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &str = "\
--- a/file.txt
+++ b/file.txt
@@ -1,3 +1,3 @@
 one
-two
+TWO
 three
";

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn parse_and_apply() {
        let hunks = parse_diff(DIFF).unwrap();
        assert_eq!(hunks.len(), 1);
        let out = apply_hunks(&lines("one\ntwo\nthree"), &hunks, false).unwrap();
        assert_eq!(out.lines, lines("one\nTWO\nthree"));
        assert_eq!(out.applied, 1);
    }

    #[test]
    fn reverse_round_trips() {
        let hunks = parse_diff(DIFF).unwrap();
        let reversed: Vec<Hunk> = hunks.iter().map(Hunk::reversed).collect();
        let out = apply_hunks(&lines("one\nTWO\nthree"), &reversed, false).unwrap();
        assert_eq!(out.lines, lines("one\ntwo\nthree"));
    }

    #[test]
    fn context_mismatch_fails_without_force() {
        let hunks = parse_diff(DIFF).unwrap();
        assert!(apply_hunks(&lines("completely\ndifferent"), &hunks, false).is_err());
    }

    #[test]
    fn force_relocates_drifted_hunks() {
        let hunks = parse_diff(DIFF).unwrap();
        // Content shifted down by two lines.
        let out = apply_hunks(&lines("x\ny\none\ntwo\nthree"), &hunks, true).unwrap();
        assert_eq!(out.lines, lines("x\ny\none\nTWO\nthree"));
        assert_eq!(out.applied, 1);
        assert_eq!(out.rejected, 0);
    }

    #[test]
    fn force_skips_unmatchable_hunks() {
        let hunks = parse_diff(DIFF).unwrap();
        let out = apply_hunks(&lines("nothing\nhere"), &hunks, true).unwrap();
        assert_eq!(out.applied, 0);
        assert_eq!(out.rejected, 1);
    }
}
