//! Lua pattern matching that polls the interrupt controller
//!
//! The interpreter's own matcher backtracks inside C and never reaches the
//! instruction hook, so a pathological pattern could pin a run forever.
//! `string.find`, `string.match`, `string.gmatch` and `string.gsub` are
//! replaced by this port, which counts its steps and checks for termination
//! at the same cadence as the hook.

use crate::interrupt::InterruptController;
use mlua::{Error as LuaError, Function, Lua, Table, Value, Variadic};
use std::sync::Arc;

const MAX_CAPTURES: usize = 32;
const MAX_DEPTH: usize = 200;
const SPECIALS: &[u8] = b"^$*+?.([%-";

fn pattern_error(message: impl Into<String>) -> LuaError {
    LuaError::RuntimeError(message.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureLen {
    Open,
    Position,
    Closed(usize),
}

#[derive(Debug, Clone, Copy)]
struct Capture {
    start: usize,
    len: CaptureLen,
}

/// One captured value of a successful match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Captured<'a> {
    Text(&'a [u8]),
    /// `()` capture, 1-based
    Position(usize),
}

fn class_matches(c: u8, class: u8) -> bool {
    let matched = match class.to_ascii_lowercase() {
        b'a' => c.is_ascii_alphabetic(),
        b'c' => c.is_ascii_control(),
        b'd' => c.is_ascii_digit(),
        b'g' => c.is_ascii_graphic(),
        b'l' => c.is_ascii_lowercase(),
        b'p' => c.is_ascii_punctuation(),
        b's' => c == b' ' || (b'\t'..=b'\r').contains(&c),
        b'u' => c.is_ascii_uppercase(),
        b'w' => c.is_ascii_alphanumeric(),
        b'x' => c.is_ascii_hexdigit(),
        _ => return class == c,
    };
    if class.is_ascii_uppercase() {
        !matched
    } else {
        matched
    }
}

/// Backtracking matcher over one subject and one pattern.
pub(super) struct Matcher<'a> {
    src: &'a [u8],
    pat: &'a [u8],
    captures: Vec<Capture>,
    depth: usize,
    steps: u32,
    every: u32,
    interrupt: &'a InterruptController,
}

impl<'a> Matcher<'a> {
    pub(super) fn new(
        src: &'a [u8],
        pat: &'a [u8],
        interrupt: &'a InterruptController,
        every: u32,
    ) -> Self {
        Self {
            src,
            pat,
            captures: Vec::new(),
            depth: MAX_DEPTH,
            steps: 0,
            every: every.max(1),
            interrupt,
        }
    }

    fn tick(&mut self) -> mlua::Result<()> {
        self.steps += 1;
        if self.steps >= self.every {
            self.steps = 0;
            self.interrupt.check().map_err(LuaError::external)?;
        }
        Ok(())
    }

    /// Match the pattern from index `p` against the subject at `s`; returns
    /// the end of the match. Captures of a previous attempt are discarded.
    pub(super) fn match_at(&mut self, s: usize, p: usize) -> mlua::Result<Option<usize>> {
        self.captures.clear();
        self.depth = MAX_DEPTH;
        self.do_match(s, p)
    }

    pub(super) fn capture(&self, index: usize, s: usize, e: usize) -> mlua::Result<Captured<'a>> {
        let src = self.src;
        let Some(capture) = self.captures.get(index) else {
            if index == 0 {
                return Ok(Captured::Text(&src[s..e]));
            }
            return Err(pattern_error(format!("invalid capture index %{}", index + 1)));
        };
        match capture.len {
            CaptureLen::Open => Err(pattern_error("unfinished capture")),
            CaptureLen::Position => Ok(Captured::Position(capture.start + 1)),
            CaptureLen::Closed(len) => Ok(Captured::Text(&src[capture.start..capture.start + len])),
        }
    }

    /// Captures of the last match. With no explicit captures, `whole`
    /// yields the matched text itself.
    pub(super) fn captures(&self, s: usize, e: usize, whole: bool) -> mlua::Result<Vec<Captured<'a>>> {
        let count = if self.captures.is_empty() && whole {
            1
        } else {
            self.captures.len()
        };
        (0..count).map(|i| self.capture(i, s, e)).collect()
    }

    fn do_match(&mut self, s: usize, p: usize) -> mlua::Result<Option<usize>> {
        if self.depth == 0 {
            return Err(pattern_error("pattern too complex"));
        }
        self.depth -= 1;
        let matched = self.match_here(s, p);
        self.depth += 1;
        matched
    }

    fn match_here(&mut self, mut s: usize, mut p: usize) -> mlua::Result<Option<usize>> {
        let pat = self.pat;
        loop {
            self.tick()?;
            let Some(&c) = pat.get(p) else {
                return Ok(Some(s));
            };
            match c {
                b'(' => {
                    return if pat.get(p + 1) == Some(&b')') {
                        self.start_capture(s, p + 2, CaptureLen::Position)
                    } else {
                        self.start_capture(s, p + 1, CaptureLen::Open)
                    };
                }
                b')' => return self.end_capture(s, p + 1),
                b'$' if p + 1 == pat.len() => {
                    return Ok((s == self.src.len()).then_some(s));
                }
                b'%' if pat.get(p + 1) == Some(&b'b') => match self.match_balance(s, p + 2)? {
                    Some(end) => {
                        s = end;
                        p += 4;
                        continue;
                    }
                    None => return Ok(None),
                },
                b'%' if pat.get(p + 1) == Some(&b'f') => {
                    p += 2;
                    if pat.get(p) != Some(&b'[') {
                        return Err(pattern_error("missing '[' after '%f' in pattern"));
                    }
                    let ep = self.class_end(p)?;
                    let previous = if s == 0 { 0 } else { self.src[s - 1] };
                    let current = self.src.get(s).copied().unwrap_or(0);
                    if !self.match_bracket(previous, p, ep - 1)
                        && self.match_bracket(current, p, ep - 1)
                    {
                        p = ep;
                        continue;
                    }
                    return Ok(None);
                }
                b'%' if pat.get(p + 1).is_some_and(u8::is_ascii_digit) => {
                    match self.match_backref(s, pat[p + 1])? {
                        Some(end) => {
                            s = end;
                            p += 2;
                            continue;
                        }
                        None => return Ok(None),
                    }
                }
                _ => {}
            }

            let ep = self.class_end(p)?;
            let suffix = pat.get(ep).copied();
            if !self.single_match(s, p, ep) {
                if matches!(suffix, Some(b'*' | b'?' | b'-')) {
                    p = ep + 1;
                    continue;
                }
                return Ok(None);
            }
            match suffix {
                Some(b'?') => {
                    if let Some(end) = self.do_match(s + 1, ep + 1)? {
                        return Ok(Some(end));
                    }
                    p = ep + 1;
                }
                Some(b'+') => return self.max_expand(s + 1, p, ep),
                Some(b'*') => return self.max_expand(s, p, ep),
                Some(b'-') => return self.min_expand(s, p, ep),
                _ => {
                    s += 1;
                    p = ep;
                }
            }
        }
    }

    /// Index just past the single-character class starting at `p`.
    fn class_end(&self, mut p: usize) -> mlua::Result<usize> {
        let pat = self.pat;
        let c = pat[p];
        p += 1;
        match c {
            b'%' => {
                if p >= pat.len() {
                    return Err(pattern_error("malformed pattern (ends with '%')"));
                }
                Ok(p + 1)
            }
            b'[' => {
                if pat.get(p) == Some(&b'^') {
                    p += 1;
                }
                // the first character is never the closing bracket, so "[]]" works
                loop {
                    let Some(&c) = pat.get(p) else {
                        return Err(pattern_error("malformed pattern (missing ']')"));
                    };
                    p += 1;
                    if c == b'%' && p < pat.len() {
                        p += 1;
                    }
                    if pat.get(p) == Some(&b']') {
                        return Ok(p + 1);
                    }
                }
            }
            _ => Ok(p),
        }
    }

    fn single_match(&self, s: usize, p: usize, ep: usize) -> bool {
        let Some(&c) = self.src.get(s) else {
            return false;
        };
        match self.pat[p] {
            b'.' => true,
            b'%' => class_matches(c, self.pat[p + 1]),
            b'[' => self.match_bracket(c, p, ep - 1),
            literal => literal == c,
        }
    }

    /// `p` is the opening bracket of a set, `ec` its closing bracket.
    fn match_bracket(&self, c: u8, p: usize, ec: usize) -> bool {
        let pat = self.pat;
        let mut p = p + 1;
        let mut found = true;
        if pat[p] == b'^' {
            found = false;
            p += 1;
        }
        while p < ec {
            if pat[p] == b'%' {
                p += 1;
                if class_matches(c, pat[p]) {
                    return found;
                }
                p += 1;
            } else if p + 2 < ec && pat[p + 1] == b'-' {
                if pat[p] <= c && c <= pat[p + 2] {
                    return found;
                }
                p += 3;
            } else {
                if pat[p] == c {
                    return found;
                }
                p += 1;
            }
        }
        !found
    }

    fn max_expand(&mut self, s: usize, p: usize, ep: usize) -> mlua::Result<Option<usize>> {
        let mut count = 0;
        while self.single_match(s + count, p, ep) {
            count += 1;
            self.tick()?;
        }
        loop {
            if let Some(end) = self.do_match(s + count, ep + 1)? {
                return Ok(Some(end));
            }
            if count == 0 {
                return Ok(None);
            }
            count -= 1;
        }
    }

    fn min_expand(&mut self, mut s: usize, p: usize, ep: usize) -> mlua::Result<Option<usize>> {
        loop {
            if let Some(end) = self.do_match(s, ep + 1)? {
                return Ok(Some(end));
            }
            if !self.single_match(s, p, ep) {
                return Ok(None);
            }
            s += 1;
        }
    }

    fn start_capture(&mut self, s: usize, p: usize, len: CaptureLen) -> mlua::Result<Option<usize>> {
        if self.captures.len() >= MAX_CAPTURES {
            return Err(pattern_error("too many captures"));
        }
        self.captures.push(Capture { start: s, len });
        let matched = self.do_match(s, p)?;
        if matched.is_none() {
            self.captures.pop();
        }
        Ok(matched)
    }

    fn end_capture(&mut self, s: usize, p: usize) -> mlua::Result<Option<usize>> {
        let open = self
            .captures
            .iter()
            .rposition(|c| c.len == CaptureLen::Open)
            .ok_or_else(|| pattern_error("invalid pattern capture"))?;
        self.captures[open].len = CaptureLen::Closed(s - self.captures[open].start);
        let matched = self.do_match(s, p)?;
        if matched.is_none() {
            self.captures[open].len = CaptureLen::Open;
        }
        Ok(matched)
    }

    fn match_balance(&self, s: usize, p: usize) -> mlua::Result<Option<usize>> {
        let pat = self.pat;
        if p + 1 >= pat.len() {
            return Err(pattern_error("malformed pattern (missing arguments to '%b')"));
        }
        let (open, close) = (pat[p], pat[p + 1]);
        if self.src.get(s) != Some(&open) {
            return Ok(None);
        }
        let mut depth = 1usize;
        for (i, &c) in self.src.iter().enumerate().skip(s + 1) {
            if c == close {
                depth -= 1;
                if depth == 0 {
                    return Ok(Some(i + 1));
                }
            } else if c == open {
                depth += 1;
            }
        }
        Ok(None)
    }

    fn match_backref(&self, s: usize, digit: u8) -> mlua::Result<Option<usize>> {
        let capture = digit
            .checked_sub(b'1')
            .and_then(|i| self.captures.get(usize::from(i)))
            .filter(|c| c.len != CaptureLen::Open)
            .ok_or_else(|| {
                pattern_error(format!("invalid capture index %{} in pattern", digit as char))
            })?;
        // a position capture never matches as a back reference
        let CaptureLen::Closed(len) = capture.len else {
            return Ok(None);
        };
        let src = self.src;
        let captured = &src[capture.start..capture.start + len];
        Ok(src
            .get(s..s + len)
            .filter(|candidate| *candidate == captured)
            .map(|_| s + len))
    }
}

/// Zero-based offset for a 1-based, possibly negative, start argument.
/// May point past the end of the subject.
fn start_offset(init: Option<i64>, len: usize) -> usize {
    let len = len as i64;
    let pos = match init.unwrap_or(1) {
        pos if pos > 0 => pos,
        0 => 1,
        pos if pos < -len => 1,
        pos => len + pos + 1,
    };
    (pos - 1) as usize
}

fn plain_find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn split_anchor(pat: &[u8]) -> (bool, usize) {
    if pat.first() == Some(&b'^') {
        (true, 1)
    } else {
        (false, 0)
    }
}

fn fail() -> Variadic<Value> {
    Variadic::from(vec![Value::Nil])
}

fn truthy(value: &Option<Value>) -> bool {
    !matches!(value, None | Some(Value::Nil) | Some(Value::Boolean(false)))
}

fn bytes_arg(lua: &Lua, value: Value, position: usize, function: &str) -> mlua::Result<Vec<u8>> {
    let type_name = value.type_name();
    match lua.coerce_string(value)? {
        Some(text) => Ok(text.as_bytes().to_vec()),
        None => Err(LuaError::RuntimeError(format!(
            "bad argument #{} to '{}' (string expected, got {})",
            position, function, type_name
        ))),
    }
}

fn capture_value(lua: &Lua, captured: Captured<'_>) -> mlua::Result<Value> {
    Ok(match captured {
        Captured::Text(bytes) => Value::String(lua.create_string(bytes)?),
        Captured::Position(pos) => Value::Integer(pos as i64),
    })
}

fn capture_values(lua: &Lua, captures: Vec<Captured<'_>>) -> mlua::Result<Vec<Value>> {
    captures
        .into_iter()
        .map(|captured| capture_value(lua, captured))
        .collect()
}

struct Search<'a> {
    src: &'a [u8],
    pat: &'a [u8],
    init: Option<i64>,
    plain: bool,
}

/// Shared body of `find` (positions then captures) and `match` (captures).
fn search(
    lua: &Lua,
    interrupt: &InterruptController,
    every: u32,
    search: Search<'_>,
    find: bool,
) -> mlua::Result<Variadic<Value>> {
    let Search { src, pat, init, plain } = search;
    let start = start_offset(init, src.len());
    if start > src.len() {
        return Ok(fail());
    }

    if find && (plain || !pat.iter().any(|b| SPECIALS.contains(b))) {
        return Ok(match plain_find(&src[start..], pat) {
            Some(offset) => {
                let first = start + offset;
                Variadic::from(vec![
                    Value::Integer(first as i64 + 1),
                    Value::Integer((first + pat.len()) as i64),
                ])
            }
            None => fail(),
        });
    }

    let (anchored, p) = split_anchor(pat);
    let mut matcher = Matcher::new(src, pat, interrupt, every);
    let mut s = start;
    loop {
        if let Some(end) = matcher.match_at(s, p)? {
            let values = if find {
                let mut values = vec![Value::Integer(s as i64 + 1), Value::Integer(end as i64)];
                values.extend(capture_values(lua, matcher.captures(s, end, false)?)?);
                values
            } else {
                capture_values(lua, matcher.captures(s, end, true)?)?
            };
            return Ok(Variadic::from(values));
        }
        s += 1;
        if anchored || s > src.len() {
            return Ok(fail());
        }
    }
}

enum Replacement {
    Template(Vec<u8>),
    Table(Table),
    Function(Function),
}

impl Replacement {
    fn from_value(lua: &Lua, value: Value) -> mlua::Result<Self> {
        match value {
            Value::String(_) | Value::Integer(_) | Value::Number(_) => {
                Ok(Replacement::Template(bytes_arg(lua, value, 3, "gsub")?))
            }
            Value::Table(table) => Ok(Replacement::Table(table)),
            Value::Function(function) => Ok(Replacement::Function(function)),
            other => Err(LuaError::RuntimeError(format!(
                "bad argument #3 to 'gsub' (string/function/table expected, got {})",
                other.type_name()
            ))),
        }
    }

    fn apply(
        &self,
        lua: &Lua,
        matcher: &Matcher<'_>,
        s: usize,
        e: usize,
        out: &mut Vec<u8>,
    ) -> mlua::Result<()> {
        let value = match self {
            Replacement::Template(template) => return expand(template, matcher, s, e, out),
            Replacement::Table(table) => {
                table.get::<Value>(capture_value(lua, matcher.capture(0, s, e)?)?)?
            }
            Replacement::Function(function) => {
                let args = capture_values(lua, matcher.captures(s, e, true)?)?;
                function.call::<Value>(Variadic::from(args))?
            }
        };

        match value {
            // false or nil keeps the original text
            Value::Nil | Value::Boolean(false) => out.extend_from_slice(&matcher.src[s..e]),
            Value::String(_) | Value::Integer(_) | Value::Number(_) => {
                if let Some(text) = lua.coerce_string(value)? {
                    out.extend_from_slice(&text.as_bytes());
                }
            }
            other => {
                return Err(LuaError::RuntimeError(format!(
                    "invalid replacement value (a {})",
                    other.type_name()
                )))
            }
        }
        Ok(())
    }
}

/// Expand `%0`-`%9` and `%%` in a replacement string.
fn expand(template: &[u8], matcher: &Matcher<'_>, s: usize, e: usize, out: &mut Vec<u8>) -> mlua::Result<()> {
    let mut bytes = template.iter().copied();
    while let Some(b) = bytes.next() {
        if b != b'%' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'%') => out.push(b'%'),
            Some(b'0') => out.extend_from_slice(&matcher.src[s..e]),
            Some(d) if d.is_ascii_digit() => match matcher.capture(usize::from(d - b'1'), s, e)? {
                Captured::Text(text) => out.extend_from_slice(text),
                Captured::Position(pos) => out.extend_from_slice(pos.to_string().as_bytes()),
            },
            _ => {
                return Err(LuaError::RuntimeError(
                    "invalid use of '%' in replacement string".to_string(),
                ))
            }
        }
    }
    Ok(())
}

fn substitute(
    lua: &Lua,
    matcher: &mut Matcher<'_>,
    replacement: &Replacement,
    limit: Option<i64>,
) -> mlua::Result<(mlua::String, i64)> {
    let src = matcher.src;
    let (anchored, p) = split_anchor(matcher.pat);
    let limit = limit.unwrap_or(src.len() as i64 + 1);

    let mut out = Vec::with_capacity(src.len());
    let mut s = 0;
    let mut last_match = None;
    let mut count = 0i64;
    while count < limit {
        match matcher.match_at(s, p)? {
            Some(end) if Some(end) != last_match => {
                count += 1;
                replacement.apply(lua, matcher, s, end, &mut out)?;
                s = end;
                last_match = Some(end);
            }
            _ if s < src.len() => {
                out.push(src[s]);
                s += 1;
            }
            _ => break,
        }
        if anchored {
            break;
        }
    }
    out.extend_from_slice(&src[s..]);
    Ok((lua.create_string(&out)?, count))
}

/// Replace the matching functions of the `string` table.
pub(super) fn install(
    lua: &Lua,
    string: &Table,
    interrupt: &Arc<InterruptController>,
    every: u32,
) -> mlua::Result<()> {
    for (name, find) in [("find", true), ("match", false)] {
        let interrupt = Arc::clone(interrupt);
        string.raw_set(
            name,
            lua.create_function(
                move |lua, (s, p, init, plain): (Value, Value, Option<i64>, Option<Value>)| {
                    let src = bytes_arg(lua, s, 1, name)?;
                    let pat = bytes_arg(lua, p, 2, name)?;
                    let request = Search {
                        src: &src,
                        pat: &pat,
                        init,
                        plain: truthy(&plain),
                    };
                    search(lua, &interrupt, every, request, find)
                },
            )?,
        )?;
    }

    let gmatch_interrupt = Arc::clone(interrupt);
    string.raw_set(
        "gmatch",
        lua.create_function(move |lua, (s, p, init): (Value, Value, Option<i64>)| {
            let src = bytes_arg(lua, s, 1, "gmatch")?;
            let pat = bytes_arg(lua, p, 2, "gmatch")?;
            let interrupt = Arc::clone(&gmatch_interrupt);
            let mut position = start_offset(init, src.len()).min(src.len() + 1);
            let mut last_match: Option<usize> = None;

            lua.create_function_mut(move |lua, ()| {
                let mut matcher = Matcher::new(&src, &pat, &interrupt, every);
                let mut s = position;
                while s <= src.len() {
                    if let Some(end) = matcher.match_at(s, 0)? {
                        if Some(end) != last_match {
                            position = end;
                            last_match = Some(end);
                            let values = capture_values(lua, matcher.captures(s, end, true)?)?;
                            return Ok(Variadic::from(values));
                        }
                    }
                    s += 1;
                }
                position = s;
                Ok(Variadic::new())
            })
        })?,
    )?;

    let gsub_interrupt = Arc::clone(interrupt);
    string.raw_set(
        "gsub",
        lua.create_function(
            move |lua, (s, p, repl, limit): (Value, Value, Value, Option<i64>)| {
                let src = bytes_arg(lua, s, 1, "gsub")?;
                let pat = bytes_arg(lua, p, 2, "gsub")?;
                let replacement = Replacement::from_value(lua, repl)?;
                let mut matcher = Matcher::new(&src, &pat, &gsub_interrupt, every);
                substitute(lua, &mut matcher, &replacement, limit)
            },
        )?,
    )?;

    Ok(())
}
