//! Template rendering for step inputs and assertion values.
//!
//! Strings are tokenized into an expression list, then evaluated in
//! one pass against a [`Context`]. Supported placeholders:
//!
//! - `NUM($API[n].path)` / `NUM($var)`: bare numeric literal, `0` when
//!   the reference is unresolvable or not numeric.
//! - `STR($API[n].path)` / `STR($var)`: JSON-quoted string, `""` when
//!   unresolvable.
//! - `$API[n].path`: value at `path` in the `n`-th step response.
//! - `$var`: context variable. Not matched when directly followed by
//!   `[` or `.`.
//! - `{{ expr }}`: legacy form; `expr` is a variable name, `$var`, or
//!   `API[n].path`.
//!
//! Bare references are formatted with type-aware quoting (strings are
//! quoted, numbers and booleans are bare, structures are JSON).
//! Unresolved bare and legacy references are left verbatim.

use crate::context::Context;
use crate::path;
use serde_json::{Map, Value};
use tracing::debug;

/// What a placeholder points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Var(String),
    Api { index: usize, path: String },
}

/// One lexed piece of a template string. `raw` keeps the source text
/// so unresolved references can be written back verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(String),
    Ref { raw: String, target: Reference },
    Num { raw: String, target: Reference },
    Str { raw: String, target: Reference },
    Legacy { raw: String, target: Reference },
}

/// A parsed template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub exprs: Vec<Expr>,
}

impl Template {
    /// Render to a string.
    pub fn render(&self, ctx: &Context) -> String {
        let mut out = String::new();
        for expr in &self.exprs {
            match expr {
                Expr::Literal(text) => out.push_str(text),
                Expr::Ref { raw, target } | Expr::Legacy { raw, target } => {
                    match resolve(target, ctx) {
                        Some(value) => out.push_str(&quote_value(value)),
                        None => out.push_str(raw),
                    }
                }
                Expr::Num { target, .. } => {
                    out.push_str(&numeric_literal(resolve(target, ctx)))
                }
                Expr::Str { target, .. } => {
                    out.push_str(&string_literal(resolve(target, ctx)))
                }
            }
        }
        out
    }

    /// When the template is exactly one placeholder, the native JSON
    /// value it evaluates to. `None` for mixed templates and for a
    /// lone bare reference that does not resolve.
    pub fn native_value(&self, ctx: &Context) -> Option<Value> {
        let [expr] = self.exprs.as_slice() else {
            return None;
        };
        match expr {
            Expr::Literal(_) => None,
            Expr::Ref { target, .. } | Expr::Legacy { target, .. } => {
                resolve(target, ctx).cloned()
            }
            Expr::Num { target, .. } => {
                let literal = numeric_literal(resolve(target, ctx));
                Some(
                    serde_json::from_str(&literal)
                        .unwrap_or(Value::String(literal)),
                )
            }
            Expr::Str { target, .. } => Some(Value::String(
                resolve(target, ctx).map(stringify).unwrap_or_default(),
            )),
        }
    }

    pub fn has_references(&self) -> bool {
        self.exprs
            .iter()
            .any(|expr| !matches!(expr, Expr::Literal(_)))
    }
}

/// Tokenize `input`. Never fails: anything that is not a well-formed
/// placeholder is literal text.
pub fn parse(input: &str) -> Template {
    let mut lexer = Lexer {
        src: input,
        pos: 0,
        literal_start: 0,
        exprs: Vec::new(),
    };
    lexer.run();
    Template {
        exprs: lexer.exprs,
    }
}

/// Render a string template.
pub fn render_str(input: &str, ctx: &Context) -> String {
    if !has_placeholder(input) {
        return input.to_string();
    }
    parse(input).render(ctx)
}

/// Render any JSON value. Strings are rewritten, mappings and
/// sequences are rendered element-wise, other scalars pass through.
pub fn render(value: &Value, ctx: &Context) -> Value {
    match value {
        Value::String(s) => Value::String(render_str(s, ctx)),
        Value::Object(map) => Value::Object(render_map(map, ctx)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| render(v, ctx)).collect())
        }
        other => other.clone(),
    }
}

/// Render a mapping. Templated string fields are converted back to
/// native JSON where the rendered text allows it.
pub fn render_map(map: &Map<String, Value>, ctx: &Context) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) if has_placeholder(s) => render_field(s, ctx),
                other => render(other, ctx),
            };
            (key.clone(), rendered)
        })
        .collect()
}

/// Quick pre-check before tokenizing.
pub fn has_placeholder(s: &str) -> bool {
    s.contains('$') || s.contains("{{") || s.contains("NUM(") || s.contains("STR(")
}

/// Render one mapping field.
///
/// A field that is a single placeholder yields the referenced value
/// natively. Otherwise the rendered text is kept, except that a
/// JSON-quoted result (`"..."`) is decoded back to its value.
fn render_field(input: &str, ctx: &Context) -> Value {
    let template = parse(input);
    if let Some(native) = template.native_value(ctx) {
        return native;
    }

    let rendered = template.render(ctx);
    if rendered.len() >= 2 && rendered.starts_with('"') && rendered.ends_with('"') {
        match serde_json::from_str(&rendered) {
            Ok(value) => return value,
            Err(err) => {
                debug!("Keeping quoted field as text ({err}): {rendered}");
            }
        }
    }
    Value::String(rendered)
}

fn resolve<'a>(target: &Reference, ctx: &'a Context) -> Option<&'a Value> {
    match target {
        Reference::Var(name) => ctx.resolve(name),
        Reference::Api { index, path } => {
            let response = ctx.resolve(&Context::api_key(*index))?;
            path::extract(response, path).filter(|value| !value.is_null())
        }
    }
}

/// Type-aware formatting of a resolved bare reference.
pub fn quote_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => {
            let escaped = s
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n")
                .replace('\r', "\\r");
            format!("\"{escaped}\"")
        }
        structured => structured.to_string(),
    }
}

/// Plain string form of a value: strings unquoted, anything else
/// as JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn string_literal(value: Option<&Value>) -> String {
    match value {
        Some(value) => Value::String(stringify(value)).to_string(),
        None => "\"\"".to_string(),
    }
}

fn numeric_literal(value: Option<&Value>) -> String {
    let number = match value {
        Some(Value::Bool(b)) => return if *b { "1" } else { "0" }.to_string(),
        Some(Value::Number(n)) => {
            if n.is_i64() || n.is_u64() {
                return n.to_string();
            }
            n.as_f64()
        }
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match number {
        Some(f) => format_float(f),
        None => "0".to_string(),
    }
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 {
        if f.abs() < 9.0e15 {
            format!("{}", f as i64)
        } else {
            format!("{f:.0}")
        }
    } else {
        f.to_string()
    }
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    literal_start: usize,
    exprs: Vec<Expr>,
}

impl Lexer<'_> {
    fn run(&mut self) {
        while self.pos < self.src.len() {
            let rest = &self.src[self.pos..];
            let token = if rest.starts_with("{{") {
                self.scan_legacy()
            } else if rest.starts_with("NUM(") || rest.starts_with("STR(") {
                self.scan_cast()
            } else if rest.starts_with('$') {
                self.scan_dollar()
            } else {
                None
            };

            match token {
                Some((Expr::Literal(_), end)) => {
                    self.pos = end;
                }
                Some((expr, end)) => {
                    self.flush_literal();
                    self.exprs.push(expr);
                    self.pos = end;
                    self.literal_start = end;
                }
                None => {
                    // Advance one whole character.
                    let step = rest.chars().next().map_or(1, char::len_utf8);
                    self.pos += step;
                }
            }
        }
        self.flush_literal();
    }

    fn flush_literal(&mut self) {
        if self.literal_start < self.pos {
            let text = &self.src[self.literal_start..self.pos];
            match self.exprs.last_mut() {
                Some(Expr::Literal(prev)) => prev.push_str(text),
                _ => self.exprs.push(Expr::Literal(text.to_string())),
            }
        }
        self.literal_start = self.pos;
    }

    /// `{{ expr }}` with no braces inside.
    fn scan_legacy(&self) -> Option<(Expr, usize)> {
        let start = self.pos;
        let body_start = start + 2;
        let body = &self.src[body_start..];
        let close = body.find("}}")?;
        let inner = &body[..close];
        if inner.is_empty() || inner.contains('{') || inner.contains('}') {
            return None;
        }
        let end = body_start + close + 2;
        let target = legacy_target(inner.trim());
        Some((
            Expr::Legacy {
                raw: self.src[start..end].to_string(),
                target,
            },
            end,
        ))
    }

    /// `NUM(ref)` / `STR(ref)`, where `ref` is `$var`, `$API[n].path`
    /// or `API[n].path`.
    fn scan_cast(&self) -> Option<(Expr, usize)> {
        let start = self.pos;
        let is_num = self.src[start..].starts_with("NUM(");
        let mut cursor = start + 4;

        let has_dollar = self.src[cursor..].starts_with('$');
        if has_dollar {
            cursor += 1;
        }

        let (target, after) = if self.src[cursor..].starts_with("API[") {
            scan_api_ref(self.src, cursor)?
        } else if has_dollar {
            let end = scan_identifier(self.src, cursor)?;
            (Reference::Var(self.src[cursor..end].to_string()), end)
        } else {
            return None;
        };

        if !self.src[after..].starts_with(')') {
            return None;
        }
        let end = after + 1;
        let raw = self.src[start..end].to_string();
        let expr = if is_num {
            Expr::Num { raw, target }
        } else {
            Expr::Str { raw, target }
        };
        Some((expr, end))
    }

    /// `$API[n].path` or `$var`.
    fn scan_dollar(&self) -> Option<(Expr, usize)> {
        let start = self.pos;
        let cursor = start + 1;

        if self.src[cursor..].starts_with("API[") {
            if let Some((target, end)) = scan_api_ref(self.src, cursor) {
                return Some((
                    Expr::Ref {
                        raw: self.src[start..end].to_string(),
                        target,
                    },
                    end,
                ));
            }
        }

        let end = scan_identifier(self.src, cursor)?;
        let raw = self.src[start..end].to_string();
        if matches!(self.src[end..].chars().next(), Some('[' | '.')) {
            // `$name.x` / `$name[0]` are not variable references.
            return Some((Expr::Literal(raw), end));
        }

        Some((
            Expr::Ref {
                raw,
                target: Reference::Var(self.src[cursor..end].to_string()),
            },
            end,
        ))
    }
}

/// Parse `API[n].path` starting at `start`. Returns the reference and
/// the end offset. Trailing dots are not part of the path.
fn scan_api_ref(src: &str, start: usize) -> Option<(Reference, usize)> {
    let rest = src[start..].strip_prefix("API[")?;
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let index: usize = rest[..digits].parse().ok()?;
    let after_index = &rest[digits..];
    let after_dot = after_index.strip_prefix("].")?;

    let path_len = after_dot
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'[' | b']'))
        .count();
    let path = after_dot[..path_len].trim_end_matches('.');
    if path.is_empty() {
        return None;
    }

    let path_start = start + 4 + digits + 2;
    Some((
        Reference::Api {
            index,
            path: path.to_string(),
        },
        path_start + path.len(),
    ))
}

/// End offset of an identifier (`[A-Za-z_][A-Za-z0-9_]*`) at `start`.
fn scan_identifier(src: &str, start: usize) -> Option<usize> {
    let bytes = src[start..].as_bytes();
    let first = *bytes.first()?;
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return None;
    }
    let len = bytes
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
        .count();
    Some(start + len)
}

fn legacy_target(expr: &str) -> Reference {
    let bare = expr.strip_prefix('$').unwrap_or(expr);
    if let Some((Reference::Api { index, path }, end)) = scan_api_ref(bare, 0) {
        // Legacy braces accept any path text after `API[n].`.
        let tail = &bare[end..];
        return Reference::Api {
            index,
            path: format!("{path}{tail}"),
        };
    }
    Reference::Var(bare.trim().to_string())
}
