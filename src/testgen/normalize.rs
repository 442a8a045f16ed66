//! Turns free-form backend output into a runnable pytest module.
//!
//! Only code shaped like a test survives: top-level `def test*`
//! functions and `class Test*` classes with their decorators and bodies.
//! Everything else the backend wrote is dropped, except plain imports.
//! Imports of the module under test are turned into references to the
//! canonical binding. The result always starts with the canonical header
//! and always contains at least one test.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Local name every generated test must reach the module through.
pub const CANONICAL_NAME: &str = "test_module";

const FALLBACK_TEST: &str = "def test_module_import():\n    assert test_module is not None";

const STAR_BINDING: &str =
    "globals().update({k: v for k, v in vars(test_module).items() if not k.startswith('_')})";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedCandidate {
    pub backend: String,
    pub test_source: String,
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub candidate: NormalizedCandidate,
    pub kept_blocks: usize,
    pub used_fallback: bool,
}

fn test_fn_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:async\s+)?def\s+test\w*\s*\(").expect("valid regex"))
}

fn test_class_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^class\s+Test\w*\s*[:(]").expect("valid regex"))
}

fn import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^import\s+([\w.]+(?:\s+as\s+\w+)?(?:\s*,\s*[\w.]+(?:\s+as\s+\w+)?)*)\s*$")
            .expect("valid regex")
    })
}

fn from_import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^from\s+([\w.]+)\s+import\s+([^()\\]+)$").expect("valid regex"))
}

pub fn normalize(backend: &str, module: &str, raw: &str) -> Normalized {
    let code = dedent(&strip_fences(raw));
    let extracted = extract(&code, module);

    let used_fallback = extracted.blocks.is_empty();
    let kept_blocks = extracted.blocks.len();

    let mut out = String::new();
    out.push_str("import pytest\n\n");
    out.push_str(&format!(
        "{CANONICAL_NAME} = __import__({})\n",
        python_str_literal(module)
    ));
    for line in extracted.imports.iter().chain(&extracted.bindings) {
        out.push_str(line);
        out.push('\n');
    }

    if used_fallback {
        out.push_str("\n\n");
        out.push_str(FALLBACK_TEST);
        out.push('\n');
    } else {
        let names = rewrite_targets(module, &extracted.aliases);
        for block in &extracted.blocks {
            out.push_str("\n\n");
            out.push_str(&rewrite_refs(block, &names));
            out.push('\n');
        }
    }

    Normalized {
        candidate: NormalizedCandidate {
            backend: backend.to_string(),
            test_source: out,
        },
        kept_blocks,
        used_fallback,
    }
}

/* ============================================================
   Fences
   ============================================================ */

/// Keeps the inside of fenced blocks if there are any, otherwise the
/// whole text. An unterminated fence runs to the end of the text.
fn strip_fences(raw: &str) -> String {
    let mut fenced: Vec<&str> = Vec::new();
    let mut in_fence = false;
    let mut saw_fence = false;

    for line in raw.lines() {
        if line.trim_start().starts_with("```") {
            saw_fence = true;
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            fenced.push(line);
        }
    }

    if saw_fence {
        fenced.join("\n")
    } else {
        raw.lines().collect::<Vec<_>>().join("\n")
    }
}

/// Removes indentation shared by every non-blank line.
fn dedent(code: &str) -> String {
    let common = code
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start_matches([' ', '\t']).len())
        .min()
        .unwrap_or(0);

    if common == 0 {
        return code.to_string();
    }

    code.lines()
        .map(|l| if l.trim().is_empty() { "" } else { &l[common..] })
        .collect::<Vec<_>>()
        .join("\n")
}

/* ============================================================
   Lexing
   ============================================================ */

/// Per byte of `text`: `true` in code, `false` inside a string literal or
/// a comment. Triple-quoted strings may span lines; an unterminated
/// single-quoted string ends at the line break.
fn code_mask(text: &str) -> Vec<bool> {
    let b = text.as_bytes();
    let mut mask = vec![true; b.len()];
    let mut i = 0;

    while i < b.len() {
        match b[i] {
            b'#' => {
                while i < b.len() && b[i] != b'\n' {
                    mask[i] = false;
                    i += 1;
                }
            }
            q @ (b'\'' | b'"') => {
                let triple = b[i..].starts_with(&[q, q, q]);
                let width = if triple { 3 } else { 1 };
                let start = i;
                i += width;

                while i < b.len() {
                    if b[i] == b'\\' {
                        i += 2;
                        continue;
                    }
                    if !triple && b[i] == b'\n' {
                        break;
                    }
                    if b[i] == q && (!triple || b[i..].starts_with(&[q, q, q])) {
                        i += width;
                        break;
                    }
                    i += 1;
                }

                let end = i.min(b.len());
                mask[start..end].iter_mut().for_each(|m| *m = false);
            }
            _ => i += 1,
        }
    }

    mask
}

/* ============================================================
   Extraction
   ============================================================ */

struct Extracted {
    blocks: Vec<String>,
    /// Hoisted imports of other modules.
    imports: Vec<String>,
    /// `name = test_module.attr` lines replacing `from <module> import ...`.
    bindings: Vec<String>,
    /// Local alias to canonical expression, from `import <module> as x`.
    aliases: Vec<(String, String)>,
}

fn extract(code: &str, module: &str) -> Extracted {
    let lines: Vec<&str> = code.lines().collect();
    let mut out = Extracted {
        blocks: Vec::new(),
        imports: Vec::new(),
        bindings: Vec::new(),
        aliases: Vec::new(),
    };
    let mut decorators: Vec<&str> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if line.starts_with('@') {
            decorators.push(line);
            i += 1;
            continue;
        }

        if starts_test_block(line) {
            let mut block: Vec<&str> = std::mem::take(&mut decorators);

            // header, possibly spanning lines while brackets are open
            let mut depth = paren_delta(line);
            block.push(line);
            let header_start = block.len() - 1;
            i += 1;
            while depth > 0 && i < lines.len() {
                depth += paren_delta(lines[i]);
                block.push(lines[i]);
                i += 1;
            }
            let header = block[header_start..].join("\n");

            let body_start = block.len();
            while i < lines.len() && (lines[i].trim().is_empty() || is_indented(lines[i])) {
                block.push(lines[i]);
                i += 1;
            }
            while block.len() > body_start && block[block.len() - 1].trim().is_empty() {
                block.pop();
            }

            if is_complete(&header, &block[body_start..]) {
                out.blocks.push(block.join("\n"));
            }
            continue;
        }

        decorators.clear();

        for effect in top_level_import(line, module) {
            match effect {
                ImportEffect::Hoist(imp) => push_unique(&mut out.imports, imp),
                ImportEffect::Bind(binding) => push_unique(&mut out.bindings, binding),
                ImportEffect::Alias(local, target) => {
                    if !out.aliases.iter().any(|(l, _)| *l == local) {
                        out.aliases.push((local, target));
                    }
                }
            }
        }

        i += 1;
    }

    out
}

fn push_unique(list: &mut Vec<String>, item: String) {
    if !list.contains(&item) {
        list.push(item);
    }
}

fn starts_test_block(line: &str) -> bool {
    test_fn_re().is_match(line) || test_class_re().is_match(line)
}

fn is_indented(line: &str) -> bool {
    line.starts_with(' ') || line.starts_with('\t')
}

/// Net bracket depth change of one line, ignoring strings and comments.
fn paren_delta(line: &str) -> i32 {
    line.bytes()
        .zip(code_mask(line))
        .filter(|(_, code)| *code)
        .fold(0, |acc, (c, _)| match c {
            b'(' | b'[' | b'{' => acc + 1,
            b')' | b']' | b'}' => acc - 1,
            _ => acc,
        })
}

/// A block is usable when it has a statement after the header colon or
/// at least one indented line that is not just a comment.
fn is_complete(header: &str, body: &[&str]) -> bool {
    let has_body = body.iter().any(|l| {
        let t = l.trim();
        !t.is_empty() && !t.starts_with('#')
    });
    if has_body {
        return true;
    }

    header
        .rfind(':')
        .map(|idx| {
            let tail = header[idx + 1..].trim();
            !tail.is_empty() && !tail.starts_with('#')
        })
        .unwrap_or(false)
}

/* ============================================================
   Imports
   ============================================================ */

#[derive(Debug, PartialEq, Eq)]
enum ImportEffect {
    Hoist(String),
    Bind(String),
    Alias(String, String),
}

/// Canonical expression for a dotted path rooted at the module under
/// test (`calc.sub` becomes `test_module.sub`), or `None` for other roots.
fn canonical_path(path: &str, module: &str) -> Option<String> {
    let mut parts = path.splitn(2, '.');
    if parts.next()? != module {
        return None;
    }
    Some(match parts.next() {
        Some(rest) => format!("{CANONICAL_NAME}.{rest}"),
        None => CANONICAL_NAME.to_string(),
    })
}

/// What a top-level import line contributes to the generated module.
fn top_level_import(line: &str, module: &str) -> Vec<ImportEffect> {
    if is_indented(line) {
        return Vec::new();
    }
    let line = line.trim_end();

    if let Some(caps) = import_re().captures(line) {
        let Some(names) = caps.get(1) else {
            return Vec::new();
        };

        let mut effects = Vec::new();
        let mut others = Vec::new();
        for part in names.as_str().split(',').map(str::trim) {
            let mut words = part.split_whitespace();
            let path = words.next().unwrap_or_default();
            let alias = words.nth(1);

            match (canonical_path(path, module), alias) {
                // `import calc` needs nothing: `calc.` is rewritten anyway
                (Some(_), None) => {}
                (Some(target), Some(alias)) => {
                    effects.push(ImportEffect::Alias(alias.to_string(), target))
                }
                (None, _) if path == "pytest" && alias.is_none() => {}
                (None, _) => others.push(part),
            }
        }
        if !others.is_empty() {
            effects.push(ImportEffect::Hoist(format!("import {}", others.join(", "))));
        }
        return effects;
    }

    if let Some(caps) = from_import_re().captures(line) {
        let (Some(source), Some(names)) = (caps.get(1), caps.get(2)) else {
            return Vec::new();
        };
        let source = source.as_str();

        if source.split('.').next() == Some("__future__") {
            return Vec::new();
        }

        let Some(target) = canonical_path(source, module) else {
            return vec![ImportEffect::Hoist(line.to_string())];
        };

        let mut effects = Vec::new();
        for part in names.as_str().split(',').map(str::trim) {
            let mut words = part.split_whitespace();
            let Some(name) = words.next() else {
                continue;
            };
            if name == "*" {
                effects.push(ImportEffect::Bind(STAR_BINDING.replace(CANONICAL_NAME, &target)));
                continue;
            }
            let local = words.nth(1).unwrap_or(name);
            effects.push(ImportEffect::Bind(format!("{local} = {target}.{name}")));
        }
        return effects;
    }

    Vec::new()
}

/* ============================================================
   Rewriting
   ============================================================ */

/// Names whose attribute accesses must go through the canonical binding.
fn rewrite_targets(module: &str, aliases: &[(String, String)]) -> Vec<(String, String)> {
    let mut names = Vec::new();
    if module != CANONICAL_NAME && is_identifier(module) {
        names.push((module.to_string(), CANONICAL_NAME.to_string()));
    }
    for (local, target) in aliases {
        if local != CANONICAL_NAME && is_identifier(local) && !names.iter().any(|(n, _)| n == local) {
            names.push((local.clone(), target.clone()));
        }
    }
    names
}

/// Rewrites `name.` to `target.` in code positions only. String literals
/// (`patch('calc.x')`, `open('calc.py')`) and comments are left alone.
fn rewrite_refs(block: &str, names: &[(String, String)]) -> String {
    if names.is_empty() {
        return block.to_string();
    }

    let alternatives: Vec<String> = names.iter().map(|(n, _)| regex::escape(n)).collect();
    let pattern = format!(r"(?:^|[^\w.])({})\.", alternatives.join("|"));
    let Ok(re) = Regex::new(&pattern) else {
        return block.to_string();
    };

    let mask = code_mask(block);
    let mut out = String::with_capacity(block.len());
    let mut last = 0;

    for caps in re.captures_iter(block) {
        let Some(name) = caps.get(1) else {
            continue;
        };
        if !mask[name.start()] {
            continue;
        }
        let Some((_, target)) = names.iter().find(|(n, _)| n == name.as_str()) else {
            continue;
        };
        out.push_str(&block[last..name.start()]);
        out.push_str(target);
        last = name.end();
    }

    out.push_str(&block[last..]);
    out
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn python_str_literal(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}
