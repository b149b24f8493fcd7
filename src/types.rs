use crate::ad::Ad;
use crate::dn::Dn;
use crate::filter::Filter;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum_macros::{Display, EnumString};

/// Directory result codes, numbered as on the wire.
///
/// Only the slice of the protocol's code space the core produces or inspects
/// is listed; anything else arriving from a remote server collapses to
/// [`ResultCode::Other`] via [`ResultCode::from_wire`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromPrimitive, Display)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    SizeLimitExceeded = 4,
    CompareFalse = 5,
    CompareTrue = 6,
    Referral = 10,
    NoSuchAttribute = 16,
    UndefinedAttributeType = 17,
    NoSuchObject = 32,
    InvalidDnSyntax = 34,
    InappropriateAuthentication = 48,
    InvalidCredentials = 49,
    InsufficientAccessRights = 50,
    Busy = 51,
    UnwillingToPerform = 53,
    EntryAlreadyExists = 68,
    Other = 80,
}

impl ResultCode {
    /// Maps a wire-numeric code onto the taxonomy above.
    pub fn from_wire(code: u32) -> ResultCode {
        num_traits::FromPrimitive::from_u32(code).unwrap_or(ResultCode::Other)
    }
}

/// Operation tags.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Tag {
    Bind,
    Add,
    Delete,
    Modify,
    ModRdn,
    Compare,
    Search,
    Extended,
}

/// Search scope, with the spellings LDAP URLs use.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString)]
pub enum Scope {
    #[strum(serialize = "base")]
    Base,
    #[strum(to_string = "one", serialize = "onelevel")]
    One,
    #[strum(to_string = "sub", serialize = "subtree")]
    Sub,
}

/// Alias-dereferencing policy for searches.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Deref {
    Never,
    Searching,
    Finding,
    Always,
}

/// A single attribute of an entry: an interned description plus its values.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub desc: Ad,
    pub vals: Vec<String>,
}

/// A directory entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub dn: Dn,
    pub attrs: Vec<Attribute>,

    /// True when the entry is resident in a local database. Entries
    /// materialized from a remote server's responses are not, and must not
    /// receive a second operational-attributes pass.
    pub local: bool,
}

impl Entry {
    /// An empty entry resident in a local database.
    pub fn new(dn: Dn) -> Entry {
        Entry {
            dn,
            attrs: Vec::new(),
            local: true,
        }
    }

    /// An empty entry materialized from a remote server.
    pub fn remote(dn: Dn) -> Entry {
        Entry {
            local: false,
            ..Entry::new(dn)
        }
    }

    pub fn get(&self, desc: Ad) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.desc == desc)
    }

    /// Adds values under `desc`, merging with an existing attribute.
    pub fn put(&mut self, desc: Ad, vals: Vec<String>) {
        match self.attrs.iter_mut().find(|a| a.desc == desc) {
            Some(a) => a.vals.extend(vals),
            None => self.attrs.push(Attribute { desc, vals }),
        }
    }
}

/// A modification operation within a modify (or add) request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ModOp {
    Add,
    Delete,
    Replace,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mod {
    pub op: ModOp,
    pub desc: Ad,
    pub vals: Vec<String>,
}

/// Parameters specific to a search request.
#[derive(Clone, Debug)]
pub struct SearchParams {
    pub scope: Scope,
    pub deref: Deref,
    pub filter: Filter,

    /// Requested attributes; empty means all user attributes.
    pub attrs: Vec<String>,
}

impl SearchParams {
    pub fn new(scope: Scope, filter: Filter) -> SearchParams {
        SearchParams {
            scope,
            deref: Deref::Never,
            filter,
            attrs: Vec::new(),
        }
    }
}

/// The tag-specific body of a request.
#[derive(Clone, Debug)]
pub enum Request {
    Bind {
        credentials: Option<Vec<u8>>,
    },
    Add {
        entry: Entry,
        mods: Vec<Mod>,
    },
    Delete,
    Modify {
        mods: Vec<Mod>,
    },
    ModRdn {
        new_rdn: String,
        delete_old: bool,
        new_superior: Option<Dn>,
    },
    Compare {
        desc: Ad,
        value: String,
    },
    Search(SearchParams),
    Extended {
        oid: String,
        data: Option<Vec<u8>>,
    },
}

impl Request {
    pub fn tag(&self) -> Tag {
        match self {
            Request::Bind { .. } => Tag::Bind,
            Request::Add { .. } => Tag::Add,
            Request::Delete => Tag::Delete,
            Request::Modify { .. } => Tag::Modify,
            Request::ModRdn { .. } => Tag::ModRdn,
            Request::Compare { .. } => Tag::Compare,
            Request::Search(_) => Tag::Search,
            Request::Extended { .. } => Tag::Extended,
        }
    }
}

/// One in-flight request, from arrival to response emission.
///
/// An operation is handled on a single worker thread, but its abandon flag
/// is shared so that chained sub-operations dispatched on its behalf can
/// observe an abandon from the connection thread.
#[derive(Debug)]
pub struct Operation {
    pub msgid: u32,

    /// The authenticated identity the operation runs as.
    pub dn: Dn,

    /// The assumed (proxy-authz) identity, when one was asserted at bind
    /// time. The remote-client backend forwards it on chained operations.
    pub authz: Option<Dn>,

    /// The target DN, presentation and normalized forms.
    pub target: Dn,

    pub request: Request,

    pub deadline: Option<Instant>,
    pub size_limit: Option<u32>,

    /// Set while an upstream is derived per-request from a referral, so the
    /// remote client does not cache the connection by URL.
    pub do_not_cache: bool,

    /// The client connection this operation arrived on, if any. A chained
    /// bind must not stay bound to it.
    pub conn: Option<u64>,

    abandoned: Arc<AtomicBool>,
}

impl Operation {
    pub fn new(target: Dn, request: Request) -> Operation {
        Operation {
            msgid: Operation::random_id(),
            dn: Dn::empty(),
            authz: None,
            target,
            request,
            deadline: None,
            size_limit: None,
            do_not_cache: false,
            conn: None,
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn search(base: Dn, params: SearchParams) -> Operation {
        Operation::new(base, Request::Search(params))
    }

    pub fn tag(&self) -> Tag {
        self.request.tag()
    }

    /// Starts the operation's time budget now.
    pub fn set_time_limit(&mut self, limit: Duration) {
        self.deadline = Some(Instant::now() + limit);
    }

    pub fn expired(&self) -> bool {
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    fn random_id() -> u32 {
        rand::thread_rng().gen()
    }
}

/// The kind of a single reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum ReplyKind {
    SearchEntry,
    SearchRef,
    Result,
    Extended,
}

/// One reply travelling down an operation's callback chain.
///
/// Heap-allocated fields (the entry, the referral list) belong to the
/// producer until a consumer claims them; a consumer `take()`s the field so
/// the producer never observes a half-owned value.
#[derive(Clone, Debug)]
pub struct Response {
    pub kind: ReplyKind,
    pub code: ResultCode,
    pub matched: Option<String>,
    pub text: Option<String>,
    pub refs: Option<Vec<String>>,
    pub entry: Option<Entry>,
    pub oid: Option<String>,
    pub data: Option<Vec<u8>>,
}

impl Response {
    pub fn result(code: ResultCode) -> Response {
        Response {
            kind: ReplyKind::Result,
            code,
            matched: None,
            text: None,
            refs: None,
            entry: None,
            oid: None,
            data: None,
        }
    }

    pub fn result_text(code: ResultCode, text: impl Into<String>) -> Response {
        Response {
            text: Some(text.into()),
            ..Response::result(code)
        }
    }

    /// A final result carrying a referral to other servers.
    pub fn referral(refs: Vec<String>) -> Response {
        Response {
            refs: Some(refs),
            ..Response::result(ResultCode::Referral)
        }
    }

    pub fn search_entry(entry: Entry) -> Response {
        Response {
            kind: ReplyKind::SearchEntry,
            entry: Some(entry),
            ..Response::result(ResultCode::Success)
        }
    }

    /// A continuation reference delivered mid-search.
    pub fn search_ref(refs: Vec<String>) -> Response {
        Response {
            kind: ReplyKind::SearchRef,
            refs: Some(refs),
            ..Response::result(ResultCode::Success)
        }
    }

    pub fn extended(code: ResultCode, oid: Option<String>, data: Option<Vec<u8>>) -> Response {
        Response {
            kind: ReplyKind::Extended,
            oid,
            data,
            ..Response::result(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_from_wire() {
        assert_eq!(ResultCode::from_wire(0), ResultCode::Success);
        assert_eq!(ResultCode::from_wire(10), ResultCode::Referral);
        assert_eq!(ResultCode::from_wire(48), ResultCode::InappropriateAuthentication);
        // Codes outside the taxonomy collapse.
        assert_eq!(ResultCode::from_wire(123), ResultCode::Other);
    }

    #[test]
    fn test_scope_spellings() {
        assert_eq!("base".parse(), Ok(Scope::Base));
        assert_eq!("one".parse(), Ok(Scope::One));
        assert_eq!("onelevel".parse(), Ok(Scope::One));
        assert_eq!("sub".parse(), Ok(Scope::Sub));
        assert_eq!("subtree".parse(), Ok(Scope::Sub));
        assert_eq!(Scope::Sub.to_string(), "sub");
    }

    #[test]
    fn test_abandon_is_shared() {
        let op = Operation::new(Dn::empty(), Request::Delete);
        assert!(!op.is_abandoned());
        op.abandon();
        assert!(op.is_abandoned());
    }
}
