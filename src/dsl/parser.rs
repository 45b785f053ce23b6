//! Indentation-based parser for the kernel DSL (§4.2).
//!
//! Unlike the infix grammar, indentation here is resolved line-by-line
//! (Python-style) rather than through lexer-emitted `Indent`/`Dedent`
//! tokens: each logical line is stripped of comments/blank content and
//! tagged with its leading-whitespace column, then a recursive-descent
//! block parser groups lines by indent depth. Expressions within a line
//! reuse [`crate::parser::Parser`].

use crate::ast::Expr;
use crate::dsl::ast::{CompilerBackend, Dialect, ForRange, FpMode, Pragmas, Program, Stmt};
use crate::error::{CompileError, SourcePos};
use crate::parser::Parser as ExprParser;
use std::collections::BTreeMap;

struct Line {
    indent: usize,
    text: String,
    line_no: u32,
}

fn strip_comment(raw: &str) -> &str {
    let bytes = raw.as_bytes();
    let mut in_str = false;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_str = !in_str,
            b'#' if !in_str => return &raw[..i],
            _ => {}
        }
    }
    raw
}

fn split_lines(src: &str) -> (Vec<Line>, BTreeMap<String, String>) {
    let mut lines = Vec::new();
    let mut pragmas = BTreeMap::new();
    let mut past_def = false;
    for (idx, raw) in src.lines().enumerate() {
        let line_no = idx as u32 + 1;
        let trimmed_start = raw.trim_start();
        if trimmed_start.trim_start_matches('#').trim_start().starts_with("me:") && trimmed_start.starts_with('#') && !past_def {
            let kv = trimmed_start.trim_start_matches('#').trim().trim_start_matches("me:");
            if let Some((k, v)) = kv.split_once('=') {
                pragmas.insert(k.trim().to_string(), v.trim().to_string());
            }
            continue;
        }
        if trimmed_start.starts_with('#') {
            continue;
        }
        let indent = raw.len() - trimmed_start.len();
        let code = strip_comment(raw).trim_end();
        let code_trimmed = code.trim();
        if code_trimmed.is_empty() {
            continue;
        }
        if code_trimmed.starts_with("def ") {
            past_def = true;
        }
        lines.push(Line { indent, text: code_trimmed.to_string(), line_no });
    }
    (lines, pragmas)
}

fn resolve_pragmas(raw: &BTreeMap<String, String>) -> Result<Pragmas, CompileError> {
    let mut p = Pragmas::default();
    for (k, v) in raw {
        match k.as_str() {
            "fp" => {
                p.fp = match v.as_str() {
                    "strict" => FpMode::Strict,
                    "contract" => FpMode::Contract,
                    "fast" => FpMode::Fast,
                    other => return Err(CompileError::Unsupported(format!("unknown fp mode '{other}'"))),
                };
            }
            "compiler" => {
                p.compiler = match v.as_str() {
                    "cc" => CompilerBackend::Cc,
                    "tcc" => CompilerBackend::Tcc,
                    other => return Err(CompileError::Unsupported(format!("unknown compiler backend '{other}'"))),
                };
            }
            "dialect" => {
                p.dialect = match v.as_str() {
                    "vector" => Dialect::Vector,
                    "element" => Dialect::Element,
                    other => return Err(CompileError::Unsupported(format!("unknown dialect '{other}'"))),
                };
            }
            other => return Err(CompileError::Unsupported(format!("unknown 'me:' pragma key '{other}'"))),
        }
    }
    Ok(p)
}

fn parse_expr_str(text: &str, line_no: u32) -> Result<Expr, CompileError> {
    ExprParser::new(text)?.parse_full().map_err(|e| match e {
        CompileError::Parse { message, .. } => {
            CompileError::Parse { pos: SourcePos { offset: 0, line: line_no, column: 1 }, message }
        }
        other => other,
    })
}

pub fn parse(src: &str) -> Result<Program, CompileError> {
    let (lines, raw_pragmas) = split_lines(src);
    let pragmas = resolve_pragmas(&raw_pragmas)?;

    let mut i = 0usize;
    while i < lines.len() && !lines[i].text.starts_with("def ") {
        i += 1;
    }
    if i >= lines.len() {
        return Err(CompileError::Parse {
            pos: SourcePos::default(),
            message: "expected 'def kernel(...):' ".into(),
        });
    }
    let def_line = &lines[i];
    let params = parse_def_header(&def_line.text, def_line.line_no)?;
    let def_indent = def_line.indent;
    i += 1;

    let body = parse_block(&lines, &mut i, def_indent)?;
    if i < lines.len() {
        return Err(CompileError::Parse {
            pos: SourcePos { offset: 0, line: lines[i].line_no, column: 1 },
            message: "unexpected indentation after kernel body".into(),
        });
    }

    Ok(Program { pragmas, params, body, raw_pragmas })
}

fn parse_def_header(text: &str, line_no: u32) -> Result<Vec<String>, CompileError> {
    let rest = text
        .strip_prefix("def ")
        .ok_or_else(|| CompileError::Parse { pos: pos_at(line_no), message: "expected 'def'".into() })?;
    let open = rest.find('(').ok_or_else(|| CompileError::Parse { pos: pos_at(line_no), message: "expected '('".into() })?;
    let close = rest.rfind(')').ok_or_else(|| CompileError::Parse { pos: pos_at(line_no), message: "expected ')'".into() })?;
    if !rest[close + 1..].trim_end().ends_with(':') {
        return Err(CompileError::Parse { pos: pos_at(line_no), message: "expected ':' after kernel signature".into() });
    }
    let params_str = &rest[open + 1..close];
    let params = if params_str.trim().is_empty() {
        Vec::new()
    } else {
        params_str.split(',').map(|s| s.trim().to_string()).collect()
    };
    Ok(params)
}

fn pos_at(line_no: u32) -> SourcePos {
    SourcePos { offset: 0, line: line_no, column: 1 }
}

fn parse_block(lines: &[Line], i: &mut usize, parent_indent: usize) -> Result<Vec<Stmt>, CompileError> {
    if *i >= lines.len() || lines[*i].indent <= parent_indent {
        return Err(CompileError::Parse { pos: pos_at(lines.get(*i).map(|l| l.line_no).unwrap_or(0)), message: "expected an indented block".into() });
    }
    let indent = lines[*i].indent;
    let mut stmts = Vec::new();
    while *i < lines.len() && lines[*i].indent == indent {
        stmts.push(parse_stmt(lines, i, indent)?);
    }
    if *i < lines.len() && lines[*i].indent > indent {
        return Err(CompileError::Parse { pos: pos_at(lines[*i].line_no), message: "unexpected indentation".into() });
    }
    Ok(stmts)
}

fn parse_stmt(lines: &[Line], i: &mut usize, indent: usize) -> Result<Stmt, CompileError> {
    let line = &lines[*i];
    let text = line.text.clone();
    let line_no = line.line_no;

    if let Some(rest) = text.strip_prefix("if ") {
        let cond_str = rest.strip_suffix(':').ok_or_else(|| CompileError::Parse { pos: pos_at(line_no), message: "expected ':' after if condition".into() })?;
        let cond = parse_expr_str(cond_str, line_no)?;
        *i += 1;
        let then_body = parse_block(lines, i, indent)?;
        let mut elifs = Vec::new();
        while *i < lines.len() && lines[*i].indent == indent && lines[*i].text.starts_with("elif ") {
            let elif_line_no = lines[*i].line_no;
            let elif_rest = lines[*i].text.strip_prefix("elif ").unwrap();
            let elif_cond_str = elif_rest
                .strip_suffix(':')
                .ok_or_else(|| CompileError::Parse { pos: pos_at(elif_line_no), message: "expected ':' after elif condition".into() })?;
            let elif_cond = parse_expr_str(elif_cond_str, elif_line_no)?;
            *i += 1;
            let elif_body = parse_block(lines, i, indent)?;
            elifs.push((elif_cond, elif_body));
        }
        let else_body = if *i < lines.len() && lines[*i].indent == indent && lines[*i].text == "else:" {
            *i += 1;
            Some(parse_block(lines, i, indent)?)
        } else {
            None
        };
        return Ok(Stmt::If { cond, then_body, elifs, else_body });
    }

    if let Some(rest) = text.strip_prefix("for ") {
        let body_start_after_colon = rest.strip_suffix(':').ok_or_else(|| CompileError::Parse { pos: pos_at(line_no), message: "expected ':' after for header".into() })?;
        let (var, range_str) = body_start_after_colon
            .split_once(" in ")
            .ok_or_else(|| CompileError::Parse { pos: pos_at(line_no), message: "expected 'for NAME in range(...)'".into() })?;
        let var = var.trim().to_string();
        let range_str = range_str.trim();
        let range_inner = range_str
            .strip_prefix("range(")
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| CompileError::Parse { pos: pos_at(line_no), message: "expected 'range(...)'".into() })?;
        let parts: Vec<&str> = split_top_level_commas(range_inner);
        let range = match parts.len() {
            1 => ForRange { start: None, stop: parse_expr_str(parts[0], line_no)?, step: None },
            2 => ForRange {
                start: Some(parse_expr_str(parts[0], line_no)?),
                stop: parse_expr_str(parts[1], line_no)?,
                step: None,
            },
            3 => ForRange {
                start: Some(parse_expr_str(parts[0], line_no)?),
                stop: parse_expr_str(parts[1], line_no)?,
                step: Some(parse_expr_str(parts[2], line_no)?),
            },
            _ => return Err(CompileError::Parse { pos: pos_at(line_no), message: "range() takes 1 to 3 arguments".into() }),
        };
        *i += 1;
        let body = parse_block(lines, i, indent)?;
        return Ok(Stmt::For { var, range, body });
    }

    if text == "break" || text.starts_with("break if ") {
        let cond = if let Some(rest) = text.strip_prefix("break if ") { Some(parse_expr_str(rest, line_no)?) } else { None };
        *i += 1;
        return Ok(Stmt::Break { cond });
    }

    if text == "continue" || text.starts_with("continue if ") {
        let cond = if let Some(rest) = text.strip_prefix("continue if ") { Some(parse_expr_str(rest, line_no)?) } else { None };
        *i += 1;
        return Ok(Stmt::Continue { cond });
    }

    if let Some(rest) = text.strip_prefix("return ") {
        let expr = parse_expr_str(rest, line_no)?;
        *i += 1;
        return Ok(Stmt::Return(expr));
    }

    // Assignment: NAME = EXPR
    if let Some((name, value_str)) = split_assignment(&text) {
        let value = parse_expr_str(value_str, line_no)?;
        *i += 1;
        return Ok(Stmt::Assign { name: name.trim().to_string(), value });
    }

    Err(CompileError::Parse { pos: pos_at(line_no), message: format!("unrecognized statement: '{text}'") })
}

/// Split `NAME = EXPR`, avoiding `==`, `<=`, `>=`, `!=`.
fn split_assignment(text: &str) -> Option<(&str, &str)> {
    let bytes = text.as_bytes();
    for idx in 0..bytes.len() {
        if bytes[idx] == b'=' {
            let prev = if idx > 0 { bytes[idx - 1] } else { 0 };
            let next = bytes.get(idx + 1).copied().unwrap_or(0);
            if next == b'=' || matches!(prev, b'=' | b'<' | b'>' | b'!') {
                continue;
            }
            return Some((&text[..idx], &text[idx + 1..]));
        }
    }
    None
}

fn split_top_level_commas(s: &str) -> Vec<&str> {
    let mut depth = 0i32;
    let mut parts = Vec::new();
    let mut start = 0usize;
    for (idx, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(s[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    let tail = s[start..].trim();
    if !tail.is_empty() || !parts.is_empty() {
        parts.push(tail);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_kernel() {
        let src = "def kernel(a, b):\n    c = a + b\n    return c\n";
        let prog = parse(src).unwrap();
        assert_eq!(prog.params, vec!["a", "b"]);
        assert_eq!(prog.body.len(), 2);
        assert!(matches!(prog.body[0], Stmt::Assign { .. }));
        assert!(matches!(prog.body[1], Stmt::Return(_)));
    }

    #[test]
    fn parses_pragmas() {
        let src = "# me:fp=fast\n# me:dialect=vector\ndef kernel(a):\n    return a\n";
        let prog = parse(src).unwrap();
        assert_eq!(prog.pragmas.fp, FpMode::Fast);
        assert_eq!(prog.pragmas.dialect, Dialect::Vector);
    }

    #[test]
    fn unknown_pragma_rejected() {
        let src = "# me:bogus=1\ndef kernel(a):\n    return a\n";
        assert!(parse(src).is_err());
    }

    #[test]
    fn parses_for_loop_with_break_if() {
        let src = "def kernel(a):\n    n = 0\n    for i in range(0, 10, 1):\n        n = n + 1\n        break if n > 5\n    return n\n";
        let prog = parse(src).unwrap();
        assert_eq!(prog.body.len(), 3);
        if let Stmt::For { body, .. } = &prog.body[1] {
            assert_eq!(body.len(), 2);
            assert!(matches!(body[1], Stmt::Break { cond: Some(_) }));
        } else {
            panic!("expected For");
        }
    }

    #[test]
    fn parses_if_elif_else() {
        let src = "def kernel(a):\n    if a > 0:\n        r = 1\n    elif a < 0:\n        r = -1\n    else:\n        r = 0\n    return r\n";
        let prog = parse(src).unwrap();
        if let Stmt::If { elifs, else_body, .. } = &prog.body[0] {
            assert_eq!(elifs.len(), 1);
            assert!(else_body.is_some());
        } else {
            panic!("expected If");
        }
    }
}
