//! Handshake line format.
//!
//! All messages are single `\n`-terminated lines with double-quoted,
//! escaped strings:
//!
//! ```text
//! > lonet "<network>" dial "<src>" "<dst>"
//! < lonet "<network>" connected "<acceptedAddr>"
//! < lonet "<network>" E "<reason>"
//! ```

use crate::error::{Error, Result};

/// Wire protocol identifier.
pub(crate) const TAG: &str = "lonet";

/// Longest handshake line either side will read.
pub(crate) const MAX_LINE: usize = 1024;

/// Quote a string for the wire.
pub(crate) fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// The dial request line.
pub(crate) fn dial_line(network: &str, src: &str, dst: &str) -> String {
    format!(
        "> {} {} dial {} {}\n",
        TAG,
        quote(network),
        quote(src),
        quote(dst)
    )
}

/// A reply line; `verb` is "connected" or "E".
pub(crate) fn reply_line(network: &str, verb: &str, arg: &str) -> String {
    format!("< {} {} {} {}\n", TAG, quote(network), verb, quote(arg))
}

/// Parse a dial request into (network, src, dst).
pub(crate) fn parse_dial(line: &str) -> Result<(String, String, String)> {
    let invalid = || Error::Protocol(format!("invalid dial request: {:?}", line.trim_end()));
    let toks = tokenize(line).map_err(|_| invalid())?;
    match toks.as_slice() {
        [Tok::Word(">"), Tok::Word(tag), Tok::Str(network), Tok::Word("dial"), Tok::Str(src), Tok::Str(dst)]
            if *tag == TAG =>
        {
            Ok((network.clone(), src.clone(), dst.clone()))
        }
        _ => Err(invalid()),
    }
}

/// Parse a reply into (network, verb, arg).
pub(crate) fn parse_reply(line: &str) -> Result<(String, String, String)> {
    let invalid = || Error::Protocol(format!("invalid dial reply: {:?}", line.trim_end()));
    let toks = tokenize(line).map_err(|_| invalid())?;
    match toks.as_slice() {
        [Tok::Word("<"), Tok::Word(tag), Tok::Str(network), Tok::Word(verb), Tok::Str(arg)]
            if *tag == TAG =>
        {
            Ok((network.clone(), verb.to_string(), arg.clone()))
        }
        _ => Err(invalid()),
    }
}

enum Tok<'a> {
    Word(&'a str),
    Str(String),
}

/// Split a line into bare words and quoted strings.
fn tokenize(line: &str) -> Result<Vec<Tok<'_>>> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let mut toks = Vec::new();
    let mut rest = line;
    loop {
        rest = rest.trim_start_matches(' ');
        if rest.is_empty() {
            break;
        }
        if let Some(r) = rest.strip_prefix('"') {
            let (s, r) = unquote_rest(r)?;
            toks.push(Tok::Str(s));
            rest = r;
        } else {
            let end = rest.find(' ').unwrap_or(rest.len());
            toks.push(Tok::Word(&rest[..end]));
            rest = &rest[end..];
        }
    }
    Ok(toks)
}

/// Consume a quoted string (opening quote already stripped); returns the
/// unescaped content and the remainder after the closing quote.
fn unquote_rest(s: &str) -> Result<(String, &str)> {
    let bad = || Error::Protocol("malformed quoted string".to_string());
    let mut out = String::new();
    let mut it = s.char_indices();
    while let Some((i, c)) = it.next() {
        match c {
            '"' => return Ok((out, &s[i + 1..])),
            '\\' => {
                let (_, esc) = it.next().ok_or_else(bad)?;
                match esc {
                    '"' => out.push('"'),
                    '\\' => out.push('\\'),
                    'n' => out.push('\n'),
                    'r' => out.push('\r'),
                    't' => out.push('\t'),
                    'x' => {
                        let hex = match (it.next(), it.next()) {
                            (Some((_, a)), Some((_, b))) => format!("{a}{b}"),
                            _ => return Err(bad()),
                        };
                        let v = u8::from_str_radix(&hex, 16).map_err(|_| bad())?;
                        out.push(v as char);
                    }
                    _ => return Err(bad()),
                }
            }
            c => out.push(c),
        }
    }
    Err(bad()) // no closing quote
}
