//! The identity authorization engine: maps externally-authenticated
//! principal names to directory names, and decides whether one identity may
//! assume another.
//!
//! Principal mapping is driven by an ordered list of regexp rewrite rules
//! configured at startup; authorization is driven by rules stored as
//! attributes (`authzTo`, `authzFrom`) on the identities' own entries.

use crate::backend::{Backends, Flow, OpError, ReplySink};
use crate::dn::Dn;
use crate::errors::ParseError;
use crate::filter::Filter;
use crate::ldapurl::LdapUrl;
use crate::schema::Schema;
use crate::types::{Deref, Entry, Operation, ReplyKind, Response, ResultCode, Scope, SearchParams};
use log::{debug, trace, warn};
use regex::{Regex, RegexBuilder};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Attribute holding the rules for identities an entry may become.
pub const AUTHZ_SOURCE_ATTR: &str = "authzTo";

/// Attribute holding the rules for identities that may become an entry.
pub const AUTHZ_DEST_ATTR: &str = "authzFrom";

/// Placeholders allowed in one replace template.
const MAX_PLACEHOLDERS: usize = 10;

#[derive(Error, Debug)]
pub enum AuthzError {
    #[error("match pattern could not be compiled: {0}")]
    Compile(#[from] regex::Error),

    #[error("replace pattern has too many placeholders (max 10)")]
    TooManyPlaceholders,

    #[error("name could not be normalized: {0}")]
    Normalization(ParseError),

    #[error("malformed authorization URI: {0}")]
    Protocol(String),

    #[error("authorization rules do not permit the identity")]
    InappropriateAuth,
}

impl AuthzError {
    pub fn code(&self) -> ResultCode {
        match self {
            AuthzError::Compile(_) | AuthzError::TooManyPlaceholders => {
                ResultCode::OperationsError
            }
            AuthzError::Normalization(_) => ResultCode::InvalidDnSyntax,
            AuthzError::Protocol(_) => ResultCode::ProtocolError,
            AuthzError::InappropriateAuth => ResultCode::InappropriateAuthentication,
        }
    }
}

/// One compiled rewrite rule: a case-insensitive match pattern, a replace
/// template, and the precomputed byte offsets of its `$n` placeholders.
struct RewriteRule {
    pattern: Regex,
    replace: String,
    offsets: Vec<usize>,
}

impl RewriteRule {
    fn compile(pattern: &str, replace: &str) -> Result<RewriteRule, AuthzError> {
        let pattern = RegexBuilder::new(pattern).case_insensitive(true).build()?;

        // Scan the template once: `\` escapes the next character, `$`
        // followed by a digit is a back-reference.
        let bytes = replace.as_bytes();
        let mut offsets = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i += 2,
                b'$' if i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() => {
                    if offsets.len() == MAX_PLACEHOLDERS {
                        return Err(AuthzError::TooManyPlaceholders);
                    }
                    offsets.push(i);
                    i += 2;
                }
                _ => i += 1,
            }
        }

        Ok(RewriteRule {
            pattern,
            replace: replace.to_string(),
            offsets,
        })
    }

    /// Expands the template against a successful match; linear in the
    /// template length.
    fn expand(&self, caps: &regex::Captures) -> String {
        let mut out = String::with_capacity(self.replace.len());
        let mut prev = 0;
        for &at in &self.offsets {
            out.push_str(&self.replace[prev..at]);
            let n = (self.replace.as_bytes()[at + 1] - b'0') as usize;
            if let Some(m) = caps.get(n) {
                out.push_str(m.as_str());
            }
            prev = at + 2;
        }
        out.push_str(&self.replace[prev..]);
        out
    }
}

/// The ordered rewrite-rule list, immutable once built; order is
/// precedence.
#[derive(Default)]
pub struct Rules {
    rules: Vec<RewriteRule>,
}

impl Rules {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrites a principal through the first matching rule.
    pub fn rewrite(&self, principal: &str) -> Option<String> {
        for rule in &self.rules {
            if let Some(caps) = rule.pattern.captures(principal) {
                let out = rule.expand(&caps);
                trace!("rewrote '{}' to '{}'", principal, out);
                return Some(out);
            }
        }
        None
    }
}

/// Accumulates rewrite rules at configuration time.
#[derive(Default)]
pub struct RulesBuilder {
    rules: Vec<RewriteRule>,
}

impl RulesBuilder {
    pub fn new() -> RulesBuilder {
        RulesBuilder::default()
    }

    pub fn rule(mut self, pattern: &str, replace: &str) -> Result<RulesBuilder, AuthzError> {
        self.rules.push(RewriteRule::compile(pattern, replace)?);
        Ok(self)
    }

    pub fn build(self) -> Rules {
        Rules { rules: self.rules }
    }
}

/// How a rule string (or a principal expansion) is to be interpreted.
enum RuleForm {
    /// A bare DN or `dn:<dn>`.
    Plain(Dn),

    /// A directory URI. The searchbase stays raw here: with base scope it
    /// may be a regexp over candidate DNs, not a parseable DN.
    Uri {
        base: String,
        scope: Scope,
        filter: Option<Filter>,
    },
}

pub struct Authz {
    schema: &'static Schema,
    backends: Arc<Backends>,
    rules: Rules,
}

impl Authz {
    pub fn new(schema: &'static Schema, backends: Arc<Backends>, rules: Rules) -> Authz {
        Authz {
            schema,
            backends,
            rules,
        }
    }

    /// Resolves a principal (e.g. `uid=jane,cn=REALM,cn=MECH,cn=AUTH`) to
    /// the directory name it maps to, or `None`.
    ///
    /// The first matching rewrite rule turns the principal into a DN or a
    /// directory URI. A DN (or a base-scope URI) is the answer directly;
    /// any other URI drives an internal search that must produce exactly
    /// one entry.
    pub fn to_dn(&self, principal: &str) -> Option<Dn> {
        debug!("converting principal '{}' to a DN", principal);
        let expansion = self.rules.rewrite(principal)?;

        let (base, scope, filter) = match self.parse_rule(&expansion) {
            Ok(RuleForm::Plain(dn)) => {
                debug!("principal '{}' maps directly to '{}'", principal, dn);
                return Some(dn);
            }
            Ok(RuleForm::Uri {
                base,
                scope: Scope::Base,
                ..
            }) => {
                // Massive shortcut: the searchbase is the answer.
                let dn = Dn::from_str(&base).ok()?;
                debug!("principal '{}' maps directly to '{}'", principal, dn);
                return Some(dn);
            }
            Ok(RuleForm::Uri {
                base,
                scope,
                filter,
            }) => match Dn::from_str(&base) {
                Ok(dn) => (dn, scope, filter),
                Err(e) => {
                    debug!("searchbase '{}' unusable: {}", base, e);
                    return None;
                }
            },
            Err(e) => {
                debug!("rewritten principal '{}' unusable: {}", expansion, e);
                return None;
            }
        };

        debug!(
            "performing internal search (base='{}', scope={})",
            base, scope
        );
        let be = self.backends.select(&base)?;
        let base = self.backends.suffix_alias(&base);

        let mut params =
            SearchParams::new(scope, filter.unwrap_or_else(Filter::present_any));
        params.deref = Deref::Searching;
        let mut op = Operation::search(base, params);
        op.size_limit = Some(1);
        op.dn = Dn::from_str(principal).unwrap_or_default();

        let mut collect = CollectDn::default();
        if let Err(e) = be.search(&mut op, &mut collect) {
            warn!("principal-resolution search failed: {}", e);
            return None;
        }
        if collect.voided || collect.code == Some(ResultCode::SizeLimitExceeded) {
            debug!("principal '{}' is ambiguous", principal);
            return None;
        }
        collect.found
    }

    /// Answers "can `authc` become `authz`?".
    pub fn authorized(&self, authc: &Dn, authz: &Dn) -> Result<(), AuthzError> {
        // Binding as anonymous.
        if authz.is_empty() {
            return Ok(());
        }
        debug!("can '{}' become '{}'?", authc, authz);

        // Authorizing to self.
        if authc == authz {
            return Ok(());
        }

        // Source rules at the authenticated entry, then destination rules
        // at the claimed entry.
        if self.check_rules(authc, authz, AUTHZ_SOURCE_ATTR, authc)
            || self.check_rules(authz, authc, AUTHZ_DEST_ATTR, authc)
        {
            return Ok(());
        }

        Err(AuthzError::InappropriateAuth)
    }

    /// Fetches rule values from the `attr` attribute of the entry at
    /// `holder` and matches each against `candidate`.
    fn check_rules(&self, holder: &Dn, candidate: &Dn, attr: &str, authc: &Dn) -> bool {
        debug!("does '{}' match a {} rule in '{}'?", candidate, attr, holder);
        let ad = match self.schema.resolve(attr) {
            Ok(ad) => ad,
            Err(e) => {
                warn!("authorization attribute '{}' unusable: {}", attr, e);
                return false;
            }
        };

        let vals = {
            let be = match self.backends.select(holder) {
                Some(be) => be,
                None => return false,
            };
            let mut params =
                SearchParams::new(Scope::Base, Filter::Present(attr.to_string()));
            params.attrs = vec![attr.to_string()];
            let mut op = Operation::search(holder.clone(), params);
            op.dn = authc.clone();
            let mut collect = CollectEntry::default();
            if let Err(e) = be.search(&mut op, &mut collect) {
                warn!("authorization-rule fetch failed: {}", e);
                return false;
            }
            match collect.entry.and_then(|e| e.get(ad).cloned()) {
                Some(a) => a.vals,
                None => return false,
            }
        };

        vals.iter().any(|rule| self.rule_matches(rule, candidate, authc))
    }

    /// Matches one rule value against a candidate DN.
    fn rule_matches(&self, rule: &str, candidate: &Dn, authc: &Dn) -> bool {
        trace!("comparing '{}' to rule '{}'", candidate, rule);
        let form = match self.parse_rule(rule) {
            Ok(form) => form,
            Err(e) => {
                warn!("unusable authorization rule '{}': {}", rule, e);
                return false;
            }
        };
        match form {
            // Byte equality after normalization.
            RuleForm::Plain(dn) => dn == *candidate,

            // A base-scope URI: the searchbase is a regexp over the
            // candidate's normalized form.
            RuleForm::Uri {
                base,
                scope: Scope::Base,
                ..
            } => match RegexBuilder::new(&base).case_insensitive(true).build() {
                Ok(re) => re.is_match(candidate.norm()),
                Err(e) => {
                    warn!("rule searchbase '{}' not a valid regexp: {}", base, e);
                    false
                }
            },

            // Anything else drives an internal search; the rule matches if
            // the candidate turns up among the results.
            RuleForm::Uri {
                base,
                scope,
                filter,
            } => {
                let base = match Dn::from_str(&base) {
                    Ok(dn) => dn,
                    Err(e) => {
                        warn!("rule searchbase '{}' unusable: {}", base, e);
                        return false;
                    }
                };
                debug!(
                    "performing internal search (base='{}', scope={})",
                    base, scope
                );
                let be = match self.backends.select(&base) {
                    Some(be) => be,
                    None => return false,
                };
                let base = self.backends.suffix_alias(&base);
                let mut params =
                    SearchParams::new(scope, filter.unwrap_or_else(Filter::present_any));
                params.deref = Deref::Searching;
                let mut op = Operation::search(base, params);
                op.dn = authc.clone();

                let mut matcher = MatchDn {
                    want: candidate.clone(),
                    matched: false,
                };
                if let Err(e) = be.search(&mut op, &mut matcher) {
                    warn!("authorization-rule search failed: {}", e);
                    return false;
                }
                matcher.matched
            }
        }
    }

    /// Interprets a rule string (or principal expansion): `dn:` prefix or
    /// no scheme at all means a plain DN; otherwise a directory URI.
    fn parse_rule(&self, s: &str) -> Result<RuleForm, AuthzError> {
        lazy_static! {
            static ref DN_PREFIX: Regex = Regex::new(r"(?i)^dn:[ ]*").unwrap();
        }
        if let Some(m) = DN_PREFIX.find(s) {
            let dn = Dn::from_str(&s[m.end()..]).map_err(AuthzError::Normalization)?;
            return Ok(RuleForm::Plain(dn));
        }

        let url = match LdapUrl::from_str(s) {
            Ok(url) => url,
            Err(ParseError::BadScheme) => {
                let dn = Dn::from_str(s).map_err(AuthzError::Normalization)?;
                return Ok(RuleForm::Plain(dn));
            }
            Err(e) => return Err(AuthzError::Protocol(e.to_string())),
        };

        let filter = url
            .filter
            .as_deref()
            .map(Filter::from_str)
            .transpose()
            .map_err(|e| AuthzError::Protocol(e.to_string()))?;
        Ok(RuleForm::Uri {
            base: url.dn,
            // The client library's default when the URL names none.
            scope: url.scope.unwrap_or(Scope::Base),
            filter,
        })
    }
}

/// Collects at most one entry DN; a second delivery voids the result.
#[derive(Default)]
struct CollectDn {
    found: Option<Dn>,
    voided: bool,
    code: Option<ResultCode>,
}

impl ReplySink for CollectDn {
    fn reply(&mut self, _op: &mut Operation, rs: &mut Response) -> Result<Flow, OpError> {
        match &rs.entry {
            Some(entry) if rs.kind == ReplyKind::SearchEntry => {
                if self.found.is_some() {
                    // More than one entry: ambiguous.
                    self.found = None;
                    self.voided = true;
                    return Ok(Flow::Stop);
                }
                self.found = Some(entry.dn.clone());
                Ok(Flow::Continue)
            }
            _ => {
                if rs.kind == ReplyKind::Result {
                    self.code = Some(rs.code);
                }
                Ok(Flow::Continue)
            }
        }
    }
}

/// Collects at most one whole entry.
#[derive(Default)]
struct CollectEntry {
    entry: Option<Entry>,
}

impl ReplySink for CollectEntry {
    fn reply(&mut self, _op: &mut Operation, rs: &mut Response) -> Result<Flow, OpError> {
        if rs.kind == ReplyKind::SearchEntry {
            if let Some(entry) = rs.entry.take() {
                self.entry = Some(entry);
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }
}

/// Succeeds the first time the wanted DN appears among the results.
struct MatchDn {
    want: Dn,
    matched: bool,
}

impl ReplySink for MatchDn {
    fn reply(&mut self, _op: &mut Operation, rs: &mut Response) -> Result<Flow, OpError> {
        if rs.kind == ReplyKind::SearchEntry {
            if let Some(entry) = &rs.entry {
                if entry.dn == self.want {
                    self.matched = true;
                    // Short-circuit the search.
                    return Ok(Flow::Stop);
                }
            }
        }
        Ok(Flow::Continue)
    }
}
