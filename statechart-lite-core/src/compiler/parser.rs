//! Permissive document parser (C1).
//!
//! Reads a JSON-shaped machine description into a generic
//! `serde_json::Value` tree. On top of strict JSON the lexer tolerates:
//!
//! - single-quoted strings (`'green'`)
//! - unquoted identifier and integer object keys (`initial:`, `1000:`)
//! - `//` line comments
//! - trailing commas in objects and arrays
//!
//! No schema validation happens here; that is the graph builder's job.
//! Malformed input fails with [`DefinitionError::Parse`] carrying the line
//! and column of the failure.

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::{char, digit1, multispace1, one_of};
use nom::combinator::{all_consuming, cut, map, opt, recognize, value};
use nom::error::{ContextError, ErrorKind, ParseError as NomParseError, VerboseError, VerboseErrorKind};
use nom::multi::many0;
use nom::sequence::{pair, preceded, terminated, tuple};
use nom::IResult;
use serde_json::{Map, Number, Value};

use crate::error::DefinitionError;

type PResult<'a, O> = IResult<&'a str, O, VerboseError<&'a str>>;

/// Parse a machine description. The root must be an object.
pub fn parse_document(input: &str) -> Result<Value, DefinitionError> {
    match all_consuming(terminated(json_value, sp))(input) {
        Ok((_, root @ Value::Object(_))) => Ok(root),
        Ok((_, _)) => Err(DefinitionError::Parse {
            line: 1,
            column: 1,
            reason: "description root must be an object".to_string(),
        }),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(to_parse_error(input, &e)),
        Err(nom::Err::Incomplete(_)) => Err(DefinitionError::Parse {
            line: 1,
            column: 1,
            reason: "incomplete input".to_string(),
        }),
    }
}

// ─── Lexical layer ────────────────────────────────────────────

/// Whitespace and `//` line comments.
fn sp(input: &str) -> PResult<'_, ()> {
    value(
        (),
        many0(alt((
            value((), multispace1),
            value((), pair(tag("//"), take_while(|c| c != '\n'))),
        ))),
    )(input)
}

fn json_value(input: &str) -> PResult<'_, Value> {
    preceded(
        sp,
        alt((
            object,
            array,
            map(string_literal, Value::String),
            number,
            value(Value::Bool(true), tag("true")),
            value(Value::Bool(false), tag("false")),
            value(Value::Null, tag("null")),
        )),
    )(input)
}

// ─── Objects and arrays ───────────────────────────────────────

fn object(input: &str) -> PResult<'_, Value> {
    let (mut rest, _) = char('{')(input)?;
    let mut entries = Map::new();
    loop {
        let (i, _) = sp(rest)?;
        if let Ok((i, _)) = char::<_, VerboseError<&str>>('}')(i) {
            return Ok((i, Value::Object(entries)));
        }
        let (i, (key, val)) = entry(i)?;
        entries.insert(key, val);
        let (i, _) = sp(i)?;
        match char::<_, VerboseError<&str>>(',')(i) {
            Ok((i, _)) => rest = i,
            Err(_) => {
                let (i, _) = cut(expect_char('}', "'}' or ',' in object"))(i)?;
                return Ok((i, Value::Object(entries)));
            }
        }
    }
}

fn entry(input: &str) -> PResult<'_, (String, Value)> {
    let (input, key) = object_key(input)?;
    let (input, _) = sp(input)?;
    let (input, _) = cut(expect_char(':', "':' after object key"))(input)?;
    let (input, val) = cut(json_value)(input)?;
    Ok((input, (key, val)))
}

fn object_key(input: &str) -> PResult<'_, String> {
    alt((
        string_literal,
        // unquoted identifier key
        map(
            recognize(pair(
                take_while1(|c: char| c.is_ascii_alphabetic() || c == '_' || c == '$'),
                take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '$'),
            )),
            str::to_string,
        ),
        // unquoted integer key (the `after` map uses these)
        map(digit1, str::to_string),
    ))(input)
}

fn array(input: &str) -> PResult<'_, Value> {
    let (mut rest, _) = char('[')(input)?;
    let mut items = Vec::new();
    loop {
        let (i, _) = sp(rest)?;
        if let Ok((i, _)) = char::<_, VerboseError<&str>>(']')(i) {
            return Ok((i, Value::Array(items)));
        }
        let (i, val) = json_value(i)?;
        items.push(val);
        let (i, _) = sp(i)?;
        match char::<_, VerboseError<&str>>(',')(i) {
            Ok((i, _)) => rest = i,
            Err(_) => {
                let (i, _) = cut(expect_char(']', "']' or ',' in array"))(i)?;
                return Ok((i, Value::Array(items)));
            }
        }
    }
}

/// `char` with a context label so failures read well.
fn expect_char<'a>(
    c: char,
    label: &'static str,
) -> impl FnMut(&'a str) -> PResult<'a, char> {
    move |input| match char::<_, VerboseError<&str>>(c)(input) {
        Ok(ok) => Ok(ok),
        Err(nom::Err::Error(e)) => Err(nom::Err::Error(VerboseError::add_context(
            input, label, e,
        ))),
        Err(e) => Err(e),
    }
}

// ─── Strings ──────────────────────────────────────────────────

fn string_literal(input: &str) -> PResult<'_, String> {
    alt((quoted('"'), quoted('\'')))(input)
}

fn quoted<'a>(q: char) -> impl FnMut(&'a str) -> PResult<'a, String> {
    move |input| {
        let (body, _) = char(q)(input)?;
        let mut out = String::new();
        let mut rest = body;
        loop {
            let mut chars = rest.chars();
            match chars.next() {
                None => {
                    return Err(nom::Err::Failure(VerboseError::add_context(
                        rest,
                        "unterminated string",
                        VerboseError::from_error_kind(rest, ErrorKind::Char),
                    )))
                }
                Some(c) if c == q => return Ok((&rest[c.len_utf8()..], out)),
                Some('\\') => {
                    let after_backslash = &rest[1..];
                    let (advanced, unescaped) = unescape(after_backslash)?;
                    out.push(unescaped);
                    rest = advanced;
                }
                Some(c) => {
                    out.push(c);
                    rest = &rest[c.len_utf8()..];
                }
            }
        }
    }
}

/// One escape sequence, cursor positioned after the backslash.
fn unescape(input: &str) -> Result<(&str, char), nom::Err<VerboseError<&str>>> {
    let mut chars = input.chars();
    let c = chars.next().ok_or_else(|| {
        nom::Err::Failure(VerboseError::add_context(
            input,
            "unterminated escape sequence",
            VerboseError::from_error_kind(input, ErrorKind::Char),
        ))
    })?;
    let simple = |c| Ok((&input[1..], c));
    match c {
        'n' => simple('\n'),
        't' => simple('\t'),
        'r' => simple('\r'),
        'b' => simple('\u{0008}'),
        'f' => simple('\u{000C}'),
        '\\' => simple('\\'),
        '/' => simple('/'),
        '\'' => simple('\''),
        '"' => simple('"'),
        'u' => {
            let hex = input.get(1..5).ok_or_else(|| bad_escape(input))?;
            let code = u32::from_str_radix(hex, 16).map_err(|_| bad_escape(input))?;
            let ch = char::from_u32(code).ok_or_else(|| bad_escape(input))?;
            Ok((&input[5..], ch))
        }
        _ => Err(bad_escape(input)),
    }
}

fn bad_escape(input: &str) -> nom::Err<VerboseError<&str>> {
    nom::Err::Failure(VerboseError::add_context(
        input,
        "invalid escape sequence",
        VerboseError::from_error_kind(input, ErrorKind::Char),
    ))
}

// ─── Numbers ──────────────────────────────────────────────────

fn number(input: &str) -> PResult<'_, Value> {
    let (rest, text) = recognize(tuple((
        opt(char('-')),
        digit1,
        opt(preceded(char('.'), digit1)),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )))(input)?;

    let is_integral = !text.contains('.') && !text.contains('e') && !text.contains('E');
    if is_integral {
        if let Ok(n) = text.parse::<i64>() {
            return Ok((rest, Value::Number(Number::from(n))));
        }
    }
    let float: f64 = text.parse().map_err(|_| {
        nom::Err::Failure(VerboseError::from_error_kind(input, ErrorKind::Float))
    })?;
    let num = Number::from_f64(float).ok_or_else(|| {
        nom::Err::Failure(VerboseError::from_error_kind(input, ErrorKind::Float))
    })?;
    Ok((rest, Value::Number(num)))
}

// ─── Error rendering ──────────────────────────────────────────

fn to_parse_error(input: &str, err: &VerboseError<&str>) -> DefinitionError {
    // The first frame is the innermost failure; the first Context frame is
    // the most specific human-readable label.
    let slice = err.errors.first().map(|(s, _)| *s).unwrap_or(input);
    let reason = err
        .errors
        .iter()
        .find_map(|(_, kind)| match kind {
            VerboseErrorKind::Context(label) => Some((*label).to_string()),
            _ => None,
        })
        .unwrap_or_else(|| match err.errors.first().map(|(_, k)| k) {
            Some(VerboseErrorKind::Char(c)) => format!("expected '{c}'"),
            Some(VerboseErrorKind::Nom(ErrorKind::Eof)) => {
                "unexpected trailing characters".to_string()
            }
            Some(VerboseErrorKind::Nom(kind)) => format!("invalid syntax ({})", kind.description()),
            _ => "invalid syntax".to_string(),
        });
    let (line, column) = position(input, slice);
    DefinitionError::Parse {
        line,
        column,
        reason,
    }
}

/// Line/column (1-based) of the start of `remaining` within `input`.
fn position(input: &str, remaining: &str) -> (usize, usize) {
    let offset = input.len().saturating_sub(remaining.len());
    let consumed = &input[..offset.min(input.len())];
    let line = consumed.matches('\n').count() + 1;
    let column = consumed
        .rsplit('\n')
        .next()
        .map(|l| l.chars().count())
        .unwrap_or(0)
        + 1;
    (line, column)
}
