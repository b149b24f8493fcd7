//! Search filters: a parser and evaluator for the string representation.
//!
//! The grammar is the subset internal searches and rule URIs need: and, or,
//! not, equality, presence, substrings, and the ordering comparisons.

use crate::errors::ParseError;
use crate::schema::Schema;
use crate::types::Entry;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, String),
    Present(String),
    Substrings {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        fin: Option<String>,
    },
    Ge(String, String),
    Le(String, String),
}

impl Filter {
    /// A filter matched by every entry.
    pub fn present_any() -> Filter {
        Filter::Present("objectClass".to_string())
    }

    /// Evaluates the filter against an entry.
    ///
    /// Attribute names are resolved through the registry; an entry attribute
    /// counts when its description is a subtype of the filter's. Names that
    /// do not resolve never match. Value comparison is caseIgnore.
    pub fn matches(&self, entry: &Entry, schema: &'static Schema) -> bool {
        match self {
            Filter::And(fs) => fs.iter().all(|f| f.matches(entry, schema)),
            Filter::Or(fs) => fs.iter().any(|f| f.matches(entry, schema)),
            Filter::Not(f) => !f.matches(entry, schema),
            Filter::Equality(attr, val) => {
                vals(entry, attr, schema).any(|v| v.eq_ignore_ascii_case(val))
            }
            Filter::Present(attr) => vals(entry, attr, schema).next().is_some(),
            Filter::Substrings {
                attr,
                initial,
                any,
                fin,
            } => vals(entry, attr, schema).any(|v| substrings_match(v, initial, any, fin)),
            Filter::Ge(attr, val) => {
                vals(entry, attr, schema).any(|v| v.to_ascii_lowercase() >= val.to_ascii_lowercase())
            }
            Filter::Le(attr, val) => {
                vals(entry, attr, schema).any(|v| v.to_ascii_lowercase() <= val.to_ascii_lowercase())
            }
        }
    }
}

/// The values of every entry attribute whose description is a subtype of
/// `attr`. Empty when `attr` does not resolve.
fn vals<'a>(
    entry: &'a Entry,
    attr: &str,
    schema: &'static Schema,
) -> impl Iterator<Item = &'a str> {
    let target = schema.resolve(attr).ok();
    entry
        .attrs
        .iter()
        .filter(move |a| match target {
            Some(t) => a.desc.is_subtype_of(t),
            None => false,
        })
        .flat_map(|a| a.vals.iter().map(|v| v.as_str()))
}

fn substrings_match(
    v: &str,
    initial: &Option<String>,
    any: &[String],
    fin: &Option<String>,
) -> bool {
    let v = v.to_ascii_lowercase();
    let mut pos = 0;
    if let Some(i) = initial {
        let i = i.to_ascii_lowercase();
        if !v.starts_with(&i) {
            return false;
        }
        pos = i.len();
    }
    for a in any {
        let a = a.to_ascii_lowercase();
        match v[pos..].find(&a) {
            Some(i) => pos += i + a.len(),
            None => return false,
        }
    }
    match fin {
        Some(f) => v[pos..].ends_with(&f.to_ascii_lowercase()),
        None => true,
    }
}

impl FromStr for Filter {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut p = Parser { s, pos: 0 };
        let f = if s.starts_with('(') {
            p.filter()?
        } else {
            p.item(s.len())?
        };
        if p.pos != s.len() {
            return Err(ParseError::InvalidFilter(format!(
                "trailing input at byte {}",
                p.pos
            )));
        }
        Ok(f)
    }
}

struct Parser<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, what: &str) -> ParseError {
        ParseError::InvalidFilter(format!("{} at byte {}", what, self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.s.as_bytes().get(self.pos).copied()
    }

    fn expect(&mut self, b: u8) -> Result<(), ParseError> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.err(&format!("expected '{}'", b as char)))
        }
    }

    fn filter(&mut self) -> Result<Filter, ParseError> {
        self.expect(b'(')?;
        let f = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => {
                let end = self.s[self.pos..]
                    .find(')')
                    .map(|i| self.pos + i)
                    .ok_or_else(|| self.err("unterminated item"))?;
                self.item(end)?
            }
            None => return Err(self.err("unterminated filter")),
        };
        self.expect(b')')?;
        Ok(f)
    }

    fn list(&mut self) -> Result<Vec<Filter>, ParseError> {
        let mut fs = Vec::new();
        while self.peek() == Some(b'(') {
            fs.push(self.filter()?);
        }
        if fs.is_empty() {
            return Err(self.err("empty filter list"));
        }
        Ok(fs)
    }

    /// Parses a single `attr OP value` item ending at byte `end`.
    fn item(&mut self, end: usize) -> Result<Filter, ParseError> {
        let item = &self.s[self.pos..end];
        let eq = item.find('=').ok_or_else(|| self.err("item has no '='"))?;
        let (attr, op) = match item[..eq].as_bytes().last() {
            Some(b'>') => (&item[..eq - 1], b'>'),
            Some(b'<') => (&item[..eq - 1], b'<'),
            Some(b'~') => return Err(self.err("approximate matching not supported")),
            _ => (&item[..eq], b'='),
        };
        if attr.is_empty() {
            return Err(self.err("empty attribute name"));
        }
        let attr = attr.to_string();
        let raw = &item[eq + 1..];
        self.pos = end;

        match op {
            b'>' => Ok(Filter::Ge(attr, unescape(raw)?)),
            b'<' => Ok(Filter::Le(attr, unescape(raw)?)),
            _ if raw == "*" => Ok(Filter::Present(attr)),
            _ if raw.contains('*') => {
                let parts: Vec<&str> = raw.split('*').collect();
                let initial = Some(parts[0])
                    .filter(|p| !p.is_empty())
                    .map(unescape)
                    .transpose()?;
                let fin = Some(parts[parts.len() - 1])
                    .filter(|p| !p.is_empty())
                    .map(unescape)
                    .transpose()?;
                let any = parts[1..parts.len() - 1]
                    .iter()
                    .filter(|p| !p.is_empty())
                    .map(|p| unescape(p))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Filter::Substrings {
                    attr,
                    initial,
                    any,
                    fin,
                })
            }
            _ => Ok(Filter::Equality(attr, unescape(raw)?)),
        }
    }
}

/// Decodes `\XX` hex escapes in a filter value.
fn unescape(s: &str) -> Result<String, ParseError> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            match hex {
                Some(b) => {
                    out.push(b);
                    i += 3;
                }
                None => {
                    return Err(ParseError::InvalidFilter(format!(
                        "bad escape in value '{}'",
                        s
                    )))
                }
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| ParseError::InvalidFilter(format!("bad UTF-8 in '{}'", s)))
}

/// Escapes the characters significant to the filter grammar.
fn escape(s: &str, f: &mut fmt::Formatter) -> fmt::Result {
    for b in s.bytes() {
        match b {
            b'(' | b')' | b'*' | b'\\' => write!(f, "\\{:02x}", b)?,
            _ => write!(f, "{}", b as char)?,
        }
    }
    Ok(())
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Filter::And(fs) => {
                write!(f, "(&")?;
                for x in fs {
                    x.fmt(f)?;
                }
                write!(f, ")")
            }
            Filter::Or(fs) => {
                write!(f, "(|")?;
                for x in fs {
                    x.fmt(f)?;
                }
                write!(f, ")")
            }
            Filter::Not(x) => write!(f, "(!{})", x),
            Filter::Equality(a, v) => {
                write!(f, "({}=", a)?;
                escape(v, f)?;
                write!(f, ")")
            }
            Filter::Present(a) => write!(f, "({}=*)", a),
            Filter::Substrings {
                attr,
                initial,
                any,
                fin,
            } => {
                write!(f, "({}=", attr)?;
                if let Some(i) = initial {
                    escape(i, f)?;
                }
                for a in any {
                    write!(f, "*")?;
                    escape(a, f)?;
                }
                write!(f, "*")?;
                if let Some(x) = fin {
                    escape(x, f)?;
                }
                write!(f, ")")
            }
            Filter::Ge(a, v) => {
                write!(f, "({}>=", a)?;
                escape(v, f)?;
                write!(f, ")")
            }
            Filter::Le(a, v) => {
                write!(f, "({}<=", a)?;
                escape(v, f)?;
                write!(f, ")")
            }
        }
    }
}
