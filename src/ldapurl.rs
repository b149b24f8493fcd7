//! LDAP URLs: `scheme://host[:port]/dn[?attrs[?scope[?filter]]]`.
//!
//! The `url` crate does the scheme/authority split; the LDAP-specific
//! question-mark tail is parsed on top. See RFC 4516.

use crate::errors::ParseError;
use crate::types::Scope;
use std::fmt;
use std::str::FromStr;
use url::Url;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LdapUrl {
    pub scheme: String,
    pub host: Option<String>,
    pub port: Option<u16>,

    /// The base DN, percent-decoded. Empty when the URL names no base.
    pub dn: String,

    pub attrs: Vec<String>,
    pub scope: Option<Scope>,
    pub filter: Option<String>,
}

impl LdapUrl {
    /// Reduces the URL to `scheme://host[:port]/`, the form used to target a
    /// connection: the DN is supplied by the operation, and per RFC 3296 the
    /// scope and filter of a referral URL are not honored.
    pub fn authority_only(&self) -> LdapUrl {
        LdapUrl {
            scheme: self.scheme.clone(),
            host: self.host.clone(),
            port: self.port,
            dn: String::new(),
            attrs: Vec::new(),
            scope: None,
            filter: None,
        }
    }

    /// The `scheme://host[:port]/` prefix as a string, usable as a
    /// connection-cache key.
    pub fn origin(&self) -> String {
        let mut s = format!("{}://", self.scheme);
        if let Some(host) = &self.host {
            s.push_str(host);
        }
        if let Some(port) = self.port {
            s.push_str(&format!(":{}", port));
        }
        s.push('/');
        s
    }
}

impl FromStr for LdapUrl {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|_| ParseError::BadScheme)?;
        match url.scheme() {
            "ldap" | "ldaps" | "ldapi" => (),
            _ => return Err(ParseError::BadScheme),
        }

        let host = url.host_str().filter(|h| !h.is_empty()).map(str::to_string);
        let dn = percent_decode(url.path().trim_start_matches('/'))?;

        let mut attrs = Vec::new();
        let mut scope = None;
        let mut filter = None;
        if let Some(q) = url.query() {
            let mut fields = q.split('?');
            if let Some(a) = fields.next() {
                attrs = a
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            if let Some(s) = fields.next() {
                if !s.is_empty() {
                    scope = Some(s.parse::<Scope>().map_err(|_| {
                        ParseError::InvalidUrl(format!("unknown scope '{}'", s))
                    })?);
                }
            }
            if let Some(f) = fields.next() {
                if !f.is_empty() {
                    filter = Some(percent_decode(f)?);
                }
            }
            if fields.next().is_some() {
                return Err(ParseError::InvalidUrl("too many '?' fields".to_string()));
            }
        }

        Ok(LdapUrl {
            scheme: url.scheme().to_string(),
            host,
            port: url.port(),
            dn,
            attrs,
            scope,
            filter,
        })
    }
}

impl fmt::Display for LdapUrl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", self.origin(), self.dn)?;
        let tail = [
            (!self.attrs.is_empty()).then(|| self.attrs.join(",")),
            self.scope.map(|s| s.to_string()),
            self.filter.clone(),
        ];
        let last = tail.iter().rposition(Option::is_some);
        if let Some(last) = last {
            for field in &tail[..=last] {
                write!(f, "?{}", field.as_deref().unwrap_or(""))?;
            }
        }
        Ok(())
    }
}

fn percent_decode(s: &str) -> Result<String, ParseError> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
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
                    return Err(ParseError::InvalidUrl(format!(
                        "bad percent escape in '{}'",
                        s
                    )))
                }
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| ParseError::InvalidUrl(format!("bad UTF-8 in '{}'", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_full() {
        let url: LdapUrl = "ldap://peer.example:10389/dc=a,dc=b?cn,sn?sub?(uid=bob)"
            .parse()
            .unwrap();
        assert_eq!(url.scheme, "ldap");
        assert_eq!(url.host.as_deref(), Some("peer.example"));
        assert_eq!(url.port, Some(10389));
        assert_eq!(url.dn, "dc=a,dc=b");
        assert_eq!(url.attrs, vec!["cn".to_string(), "sn".to_string()]);
        assert_eq!(url.scope, Some(Scope::Sub));
        assert_eq!(url.filter.as_deref(), Some("(uid=bob)"));
    }

    #[test]
    fn test_parse_sparse() {
        let url: LdapUrl = "ldap://peer.example/dc=a".parse().unwrap();
        assert_eq!(url.dn, "dc=a");
        assert!(url.attrs.is_empty());
        assert_eq!(url.scope, None);
        assert_eq!(url.filter, None);

        // Hostless form, scope only.
        let url: LdapUrl = "ldap:///uid=bob,dc=example,dc=com??base".parse().unwrap();
        assert_eq!(url.host, None);
        assert_eq!(url.dn, "uid=bob,dc=example,dc=com");
        assert_eq!(url.scope, Some(Scope::Base));
    }

    #[test]
    fn test_bad_scheme_falls_out() {
        assert_eq!("uid=bob,dc=example".parse::<LdapUrl>(), Err(ParseError::BadScheme));
        assert_eq!("http://example.com/".parse::<LdapUrl>(), Err(ParseError::BadScheme));
    }

    #[test]
    fn test_percent_decoding() {
        let url: LdapUrl = "ldap://h/cn=Big%20Corp,dc=x".parse().unwrap();
        assert_eq!(url.dn, "cn=Big Corp,dc=x");
    }

    #[test]
    fn test_authority_only() {
        let url: LdapUrl = "ldap://peer.example:1389/dc=a?cn?sub?(uid=b)".parse().unwrap();
        let auth = url.authority_only();
        assert_eq!(auth.to_string(), "ldap://peer.example:1389/");
        assert_eq!(auth.origin(), "ldap://peer.example:1389/");
        assert_eq!(auth.dn, "");
    }

    #[test]
    fn test_display_round_trip() {
        for s in &[
            "ldap://peer.example/",
            "ldap://peer.example:10389/dc=a,dc=b?cn,sn?sub?(uid=bob)",
            "ldap:///uid=bob,dc=example,dc=com??base",
        ] {
            let url: LdapUrl = s.parse().unwrap();
            assert_eq!(&url.to_string(), s);
        }
    }
}
