// Represents a distinguished name
use crate::errors::ParseError;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// A distinguished name: an ordered sequence of relative-name components,
/// most specific first.
///
/// A `Dn` carries both a presentation form (insignificant whitespace
/// stripped, value case preserved) and a normalized form suitable for
/// byte-equality comparison. Equality and hashing use only the normalized
/// form. Attribute names are case-insensitive; values are normalized under
/// caseIgnore matching, the default for DN-valued attributes.
#[derive(Clone, Debug, Default, Eq)]
pub struct Dn {
    pretty: String,
    norm: String,
}

impl Dn {
    /// The empty DN (the root of the tree).
    pub fn empty() -> Dn {
        Dn::default()
    }

    pub fn is_empty(&self) -> bool {
        self.norm.is_empty()
    }

    /// The presentation form.
    pub fn as_str(&self) -> &str {
        &self.pretty
    }

    /// The normalized form.
    pub fn norm(&self) -> &str {
        &self.norm
    }

    /// The number of relative-name components.
    pub fn depth(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            split_unescaped(&self.norm, ',').len()
        }
    }

    /// The DN with its first (most specific) component removed. The empty
    /// DN has no parent.
    pub fn parent(&self) -> Option<Dn> {
        if self.is_empty() {
            return None;
        }
        let pretty = split_unescaped(&self.pretty, ',');
        let norm = split_unescaped(&self.norm, ',');
        Some(Dn {
            pretty: pretty[1..].join(","),
            norm: norm[1..].join(","),
        })
    }

    /// True iff `suffix` is a (whole-component) suffix of this DN. Every DN
    /// is within the empty suffix.
    pub fn ends_with(&self, suffix: &Dn) -> bool {
        if suffix.is_empty() {
            return true;
        }
        let mine = split_unescaped(&self.norm, ',');
        let theirs = split_unescaped(&suffix.norm, ',');
        if theirs.len() > mine.len() {
            return false;
        }
        mine[mine.len() - theirs.len()..] == theirs[..]
    }

    /// Rewrites a `from` suffix into `to`, leaving the DN untouched when the
    /// suffix does not match.
    pub fn replace_suffix(&self, from: &Dn, to: &Dn) -> Dn {
        if !self.ends_with(from) {
            return self.clone();
        }
        let keep = self.depth() - from.depth();
        let pretty = split_unescaped(&self.pretty, ',');
        let mut head = pretty[..keep].join(",");
        if !head.is_empty() && !to.is_empty() {
            head.push(',');
        }
        head.push_str(to.as_str());
        // Both inputs were normalized already, so this cannot fail.
        Dn::from_str(&head).unwrap_or_else(|_| self.clone())
    }
}

/// Splits on unescaped occurrences of `sep`, honoring backslash escapes.
fn split_unescaped(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

fn valid_attr_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c.is_ascii_digit() => (),
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

impl FromStr for Dn {
    type Err = ParseError;

    /// Parses a distinguished name, producing both forms.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Dn::empty());
        }

        let mut rdns = Vec::new();
        for rdn in split_unescaped(s, ',') {
            let mut avas = Vec::new();
            for ava in split_unescaped(rdn, '+') {
                let eq = match ava.find('=') {
                    Some(i) => i,
                    None => {
                        return Err(ParseError::InvalidDn(format!(
                            "component '{}' has no '='",
                            ava.trim()
                        )))
                    }
                };
                let attr = ava[..eq].trim();
                let val = ava[eq + 1..].trim();
                if !valid_attr_name(attr) {
                    return Err(ParseError::InvalidDn(format!(
                        "bad attribute name '{}'",
                        attr
                    )));
                }
                avas.push(format!("{}={}", attr, val));
            }
            rdns.push(avas.join("+"));
        }

        let pretty = rdns.join(",");
        let norm = pretty.to_ascii_lowercase();
        Ok(Dn { pretty, norm })
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.pretty)
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.norm == other.norm
    }
}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.norm.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_str() {
        assert_eq!(Dn::from_str("").unwrap().to_string(), "");
        assert_eq!(
            Dn::from_str("uid=alice, dc=Example,dc=COM").unwrap().to_string(),
            "uid=alice,dc=Example,dc=COM"
        );
        assert_eq!(
            Dn::from_str("cn = Admin + uid = 1 , dc=x").unwrap().to_string(),
            "cn=Admin+uid=1,dc=x"
        );

        assert!(Dn::from_str("no equals sign").is_err());
        assert!(Dn::from_str("=value,dc=x").is_err());
    }

    #[test]
    fn test_parse_is_idempotent() {
        // One normalization pass is a fixed point.
        let dn = Dn::from_str(" UID = jane ,  dc=example, dc=com ").unwrap();
        let again = Dn::from_str(dn.as_str()).unwrap();
        assert_eq!(dn.as_str(), again.as_str());
        assert_eq!(dn.norm(), again.norm());
    }

    #[test]
    fn test_equality_ignores_case() {
        let a = Dn::from_str("uid=Alice,dc=Example").unwrap();
        let b = Dn::from_str("UID=alice,DC=example").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.norm(), "uid=alice,dc=example");
    }

    #[test]
    fn test_escaped_separators() {
        let dn = Dn::from_str(r"cn=a\,b,dc=x").unwrap();
        assert_eq!(dn.depth(), 2);
        assert_eq!(dn.parent().unwrap().to_string(), "dc=x");
    }

    #[test]
    fn test_ends_with() {
        let dn = Dn::from_str("uid=bob,ou=people,dc=example,dc=com").unwrap();
        let suffix = Dn::from_str("DC=Example,DC=Com").unwrap();
        assert!(dn.ends_with(&suffix));
        assert!(dn.ends_with(&Dn::empty()));
        // Whole components only, not raw substrings.
        assert!(!dn.ends_with(&Dn::from_str("c=example,dc=com").unwrap()));
        assert!(!suffix.ends_with(&dn));
    }

    #[test]
    fn test_replace_suffix() {
        let dn = Dn::from_str("uid=bob,dc=old").unwrap();
        let from = Dn::from_str("dc=old").unwrap();
        let to = Dn::from_str("dc=new,dc=com").unwrap();
        assert_eq!(dn.replace_suffix(&from, &to).to_string(), "uid=bob,dc=new,dc=com");

        let other = Dn::from_str("uid=bob,dc=other").unwrap();
        assert_eq!(other.replace_suffix(&from, &to), other);
    }
}
