//! Attribute descriptions: interned `<type>[;binary][;lang-<tag>]` pairs
//! resolved against the schema.
//!
//! Every distinct description is allocated once and lives for the rest of
//! the process, so handles are `Copy` and equality is identity. The bare
//! description of a type stays at the head of that type's intern list; it is
//! the one resolved most often.

use crate::schema::{AttributeType, Schema};
use crate::types::ResultCode;
use log::trace;
use std::fmt;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use thiserror::Error;

/// Option bit: value transfer in binary form was requested.
const DESC_BINARY: u8 = 0x01;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdError {
    #[error("empty attribute description")]
    Empty,

    #[error("attribute description contains inappropriate characters")]
    InappropriateCharacters,

    #[error("attribute type undefined")]
    UndefinedType,

    #[error("option \"binary\" specified multiple times")]
    DuplicateOption,

    #[error("option \"binary\" with type not supported")]
    OptionNotSupported,

    #[error("multiple language tag options specified")]
    MultipleLanguageTag,

    #[error("unrecognized option")]
    UnrecognizedOption,
}

impl AdError {
    /// Every description failure surfaces as the same protocol code; the
    /// diagnostic text carries the detail.
    pub fn code(&self) -> ResultCode {
        ResultCode::UndefinedAttributeType
    }
}

/// An interned attribute description. Allocated on first demand, never
/// freed.
pub struct AttributeDescription {
    at: &'static AttributeType,
    flags: u8,

    /// The language-tag option, lowercased (e.g. `lang-en-us`).
    lang: Option<String>,

    /// Canonical display string: `<type-name>[;binary][;lang-<tag>]`, or
    /// the uppercased literal for undefined names.
    cname: String,

    /// Next entry in the owning type's intern list. Written only under the
    /// registry mutex, with release ordering.
    next: AtomicPtr<AttributeDescription>,
}

impl AttributeDescription {
    pub fn attr_type(&self) -> &'static AttributeType {
        self.at
    }

    pub fn has_binary(&self) -> bool {
        self.flags & DESC_BINARY != 0
    }

    pub fn lang(&self) -> Option<&str> {
        self.lang.as_deref()
    }

    /// The canonical display string.
    pub fn name(&self) -> &str {
        &self.cname
    }
}

/// A handle to an interned description. Equality is identity: two handles
/// are equal iff they came from the same registry slot.
#[derive(Copy, Clone)]
pub struct Ad(&'static AttributeDescription);

impl Deref for Ad {
    type Target = AttributeDescription;

    fn deref(&self) -> &AttributeDescription {
        self.0
    }
}

impl PartialEq for Ad {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.0, other.0)
    }
}

impl Eq for Ad {}

impl std::hash::Hash for Ad {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self.0 as *const AttributeDescription as usize).hash(state);
    }
}

impl fmt::Display for Ad {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.cname)
    }
}

impl fmt::Debug for Ad {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ad({})", self.cname)
    }
}

/// The attribute-description character class: ASCII letters, digits,
/// hyphen, and the option separator.
fn ad_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b';'
}

fn keystring(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(ad_char)
}

impl Schema {
    /// Parses and interns `<type>[;option]*`.
    ///
    /// Each option is `binary` (at most once, and only when the type's
    /// syntax permits binary transfer) or `lang-<tag>` (at most once). Any
    /// name that parses to the same (type, options) returns the identical
    /// handle.
    pub fn resolve(&'static self, name: &str) -> Result<Ad, AdError> {
        if name.is_empty() {
            return Err(AdError::Empty);
        }
        if !keystring(name) {
            return Err(AdError::InappropriateCharacters);
        }

        let mut parts = name.split(';');
        let type_name = parts.next().unwrap_or("");
        let at = self.find_type(type_name).ok_or(AdError::UndefinedType)?;

        let mut flags = 0u8;
        let mut lang: Option<&str> = None;
        for opt in parts {
            if opt.eq_ignore_ascii_case("binary") {
                if flags & DESC_BINARY != 0 {
                    return Err(AdError::DuplicateOption);
                }
                if !at.binary_syntax() {
                    // Not stored in binary, disallow the option.
                    return Err(AdError::OptionNotSupported);
                }
                flags |= DESC_BINARY;
            } else if opt.len() > 5 && opt[..5].eq_ignore_ascii_case("lang-") {
                if lang.is_some() {
                    return Err(AdError::MultipleLanguageTag);
                }
                lang = Some(opt);
            } else {
                return Err(AdError::UnrecognizedOption);
            }
        }

        Ok(self.intern(at, flags, lang))
    }

    /// As [`Schema::resolve`] but with no option parsing: a name that does
    /// not resolve to any schema type is interned into the undefined pool,
    /// displayed uppercased.
    pub fn resolve_undefined(&'static self, name: &str) -> Result<Ad, AdError> {
        if name.is_empty() {
            return Err(AdError::Empty);
        }
        if !keystring(name) {
            return Err(AdError::InappropriateCharacters);
        }

        let at = self.undefined_type();
        if let Some(d) = find_undefined(at, name) {
            return Ok(d);
        }

        let _guard = self.intern_lock.lock().unwrap();
        // Check again in case another thread added it.
        if let Some(d) = find_undefined(at, name) {
            return Ok(d);
        }

        let node: &'static AttributeDescription = Box::leak(Box::new(AttributeDescription {
            at,
            flags: 0,
            lang: None,
            cname: name.to_ascii_uppercase(),
            next: AtomicPtr::new(at.head.load(Ordering::Acquire)),
        }));
        trace!("interned undefined attribute description {}", node.cname);
        at.head
            .store(node as *const _ as *mut AttributeDescription, Ordering::Release);
        Ok(Ad(node))
    }

    /// True iff `desc` is matched by any name in `attrs`; names that fail
    /// to resolve are skipped.
    pub fn in_list<S: AsRef<str>>(&'static self, desc: Ad, attrs: &[S]) -> bool {
        attrs.iter().any(|name| match self.resolve(name.as_ref()) {
            Ok(ad) => desc.is_subtype_of(ad),
            Err(_) => false,
        })
    }

    fn intern(&'static self, at: &'static AttributeType, flags: u8, lang: Option<&str>) -> Ad {
        if let Some(d) = find(at, flags, lang) {
            return d;
        }

        let _guard = self.intern_lock.lock().unwrap();
        // Check again in case another thread added it while we waited.
        if let Some(d) = find(at, flags, lang) {
            return d;
        }

        let mut cname = at.name().to_string();
        if flags & DESC_BINARY != 0 {
            cname.push_str(";binary");
        }
        let lang = lang.map(|l| l.to_ascii_lowercase());
        if let Some(l) = &lang {
            cname.push(';');
            cname.push_str(l);
        }
        let bare = flags == 0 && lang.is_none();
        let node: &'static AttributeDescription = Box::leak(Box::new(AttributeDescription {
            at,
            flags,
            lang,
            cname,
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        trace!("interned attribute description {}", node.cname);

        // The bare description stays at the head of the list; option-bearing
        // descriptions link in behind it.
        let head = at.head.load(Ordering::Acquire);
        if head.is_null() || bare {
            node.next.store(head, Ordering::Relaxed);
            at.head
                .store(node as *const _ as *mut AttributeDescription, Ordering::Release);
        } else {
            // Safety: intern-list nodes are leaked at creation and the lists
            // are append-only, so a loaded pointer is valid forever.
            let head = unsafe { &*head };
            node.next
                .store(head.next.load(Ordering::Acquire), Ordering::Relaxed);
            head.next
                .store(node as *const _ as *mut AttributeDescription, Ordering::Release);
        }
        Ad(node)
    }
}

impl Ad {
    /// True iff this description is matched by a request for `sup`: the
    /// types are schema subtypes, `sup` either has no options or the same
    /// flags, and `sup` either has no language tag or a byte-equal one.
    pub fn is_subtype_of(self, sup: Ad) -> bool {
        if !self.attr_type().is_subtype_of(sup.attr_type()) {
            return false;
        }
        if sup.flags != 0 && sup.flags != self.flags {
            return false;
        }
        match (sup.lang(), self.lang()) {
            (None, _) => true,
            (Some(s), Some(d)) => s == d,
            (Some(_), None) => false,
        }
    }
}

/// Walks a type's intern list without the lock; the list is append-only and
/// its links are published with release stores.
fn find(at: &'static AttributeType, flags: u8, lang: Option<&str>) -> Option<Ad> {
    let mut p = at.head.load(Ordering::Acquire);
    while !p.is_null() {
        // Safety: see the comment in `intern`; nodes are never freed.
        let d = unsafe { &*p };
        if d.flags == flags && lang_eq(d.lang(), lang) {
            return Some(Ad(d));
        }
        p = d.next.load(Ordering::Acquire);
    }
    None
}

fn find_undefined(at: &'static AttributeType, name: &str) -> Option<Ad> {
    let mut p = at.head.load(Ordering::Acquire);
    while !p.is_null() {
        // Safety: see the comment in `intern`; nodes are never freed.
        let d = unsafe { &*p };
        if d.cname.eq_ignore_ascii_case(name) {
            return Some(Ad(d));
        }
        p = d.next.load(Ordering::Acquire);
    }
    None
}

/// Stored tags are lowercased; candidates arrive in any case.
fn lang_eq(stored: Option<&str>, want: Option<&str>) -> bool {
    match (stored, want) {
        (None, None) => true,
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaBuilder;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;
    use std::thread;

    fn schema() -> &'static Schema {
        SchemaBuilder::new()
            .attribute("name", None, false)
            .unwrap()
            .attribute("cn", Some("name"), false)
            .unwrap()
            .attribute("userCertificate", None, true)
            .unwrap()
            .build()
    }

    #[test]
    fn test_resolve_interns_one_handle() {
        let schema = schema();
        assert_eq!(schema.resolve("cn").unwrap(), schema.resolve("CN").unwrap());
        assert_eq!(
            schema.resolve("cn;lang-EN").unwrap(),
            schema.resolve("CN;LANG-en").unwrap()
        );
        assert_ne!(
            schema.resolve("cn").unwrap(),
            schema.resolve("cn;lang-en").unwrap()
        );
    }

    #[test]
    fn test_display_is_canonical() {
        let schema = schema();
        assert_eq!(schema.resolve("CN").unwrap().to_string(), "cn");
        assert_eq!(
            schema.resolve("cn;lang-EN").unwrap().to_string(),
            "cn;lang-en"
        );
        assert_eq!(
            schema
                .resolve("userCertificate;LANG-DE;binary")
                .unwrap()
                .to_string(),
            "userCertificate;binary;lang-de"
        );
    }

    #[test]
    fn test_bare_description_heads_the_list() {
        let schema = schema();
        let at = schema.find_type("name").unwrap();

        // Option-bearing first, bare second: the bare one still ends up at
        // the head.
        let tagged = schema.resolve("name;lang-fr").unwrap();
        let bare = schema.resolve("name").unwrap();
        let head = at.head.load(Ordering::Acquire);
        assert!(ptr::eq(head, &*bare));

        // And later option-bearing descriptions link in behind it.
        let tagged2 = schema.resolve("name;lang-de").unwrap();
        let head = at.head.load(Ordering::Acquire);
        assert!(ptr::eq(head, &*bare));
        assert_ne!(tagged, tagged2);
    }

    #[test]
    fn test_option_errors() {
        let schema = schema();
        assert_eq!(schema.resolve(""), Err(AdError::Empty));
        assert_eq!(schema.resolve("cn name"), Err(AdError::InappropriateCharacters));
        assert_eq!(schema.resolve("nosuch"), Err(AdError::UndefinedType));
        assert_eq!(
            schema.resolve("userCertificate;binary;binary"),
            Err(AdError::DuplicateOption)
        );
        assert_eq!(schema.resolve("cn;binary"), Err(AdError::OptionNotSupported));
        assert_eq!(
            schema.resolve("cn;lang-en;lang-fr"),
            Err(AdError::MultipleLanguageTag)
        );
        assert_eq!(schema.resolve("cn;wat"), Err(AdError::UnrecognizedOption));
        assert_eq!(schema.resolve("cn;lang-"), Err(AdError::UnrecognizedOption));
    }

    #[test]
    fn test_binary_option() {
        let schema = schema();
        let ad = schema.resolve("userCertificate;binary").unwrap();
        assert!(ad.has_binary());
        assert_eq!(ad.to_string(), "userCertificate;binary");
    }

    #[test]
    fn test_subtype_with_options() {
        let schema = schema();
        let cn = schema.resolve("cn").unwrap();
        let cn_en = schema.resolve("cn;lang-en").unwrap();
        let name = schema.resolve("name").unwrap();
        let name_en = schema.resolve("name;lang-en").unwrap();
        let name_fr = schema.resolve("name;lang-fr").unwrap();

        assert!(cn.is_subtype_of(cn));
        assert!(cn_en.is_subtype_of(name));
        assert!(cn_en.is_subtype_of(name_en));
        // Type mismatch.
        assert!(!name_en.is_subtype_of(cn));
        // Language mismatch: the supertype's tag binds.
        assert!(!cn.is_subtype_of(name_fr));
        assert!(!cn_en.is_subtype_of(name_fr));
    }

    #[test]
    fn test_in_list() {
        let schema = schema();
        let cn_en = schema.resolve("cn;lang-en").unwrap();
        assert!(schema.in_list(cn_en, &["sn", "name"]));
        // Unresolvable names are skipped.
        assert!(schema.in_list(cn_en, &["nosuch", "cn"]));
        assert!(!schema.in_list(cn_en, &["nosuch", "userCertificate"]));
    }

    #[test]
    fn test_undefined_pool() {
        let schema = schema();
        let a = schema.resolve_undefined("noSuchAttr").unwrap();
        let b = schema.resolve_undefined("NOSUCHATTR").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "NOSUCHATTR");
        assert!(a.attr_type().is_undefined());

        assert_ne!(a, schema.resolve_undefined("otherAttr").unwrap());
        assert_eq!(schema.resolve_undefined(""), Err(AdError::Empty));
    }

    #[test]
    fn test_concurrent_resolution_agrees() {
        let schema = schema();
        let handles: Vec<_> = (0..8)
            .map(|_| thread::spawn(move || schema.resolve("cn;lang-ja").unwrap()))
            .collect();
        let first = schema.resolve("cn;lang-ja").unwrap();
        for h in handles {
            assert_eq!(h.join().unwrap(), first);
        }
    }
}
