//! The chaining overlay: chases referrals server-side instead of returning
//! them to the client.
//!
//! The overlay wraps the local database backend and watches its replies. A
//! final result carrying a referral, or a continuation reference delivered
//! mid-search, is not sent to the client; the operation is re-issued against
//! the referred server through the remote-client backend and the remote
//! replies are stitched into the local response stream. Everything else
//! passes through untouched.

use crate::ad::{Ad, AdError};
use crate::backend::{Backend, Flow, OpError, ReplySink};
use crate::dn::Dn;
use crate::ldapurl::LdapUrl;
use crate::remote::RemoteLdap;
use crate::schema::{Schema, ENTRY_DN};
use crate::types::{
    Attribute, Entry, Mod, ModOp, Operation, ReplyKind, Request, Response, ResultCode, Tag,
};
use log::{debug, warn};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Directive prefix consumed by the overlay; the remainder is handed to the
/// remote client's config parser.
const CONFIG_PREFIX: &str = "chain-";

pub struct ChainOverlay {
    inner: Arc<dyn Backend>,
    remote: Arc<RemoteLdap>,
    entry_dn: Ad,

    /// When a non-search response carries several referral URIs, try them
    /// in order until one works instead of taking only the first.
    try_all_uris: AtomicBool,
}

impl ChainOverlay {
    pub fn new(
        inner: Arc<dyn Backend>,
        remote: Arc<RemoteLdap>,
        schema: &'static Schema,
    ) -> Result<ChainOverlay, AdError> {
        Ok(ChainOverlay {
            inner,
            remote,
            entry_dn: schema.resolve(ENTRY_DN)?,
            try_all_uris: AtomicBool::new(false),
        })
    }

    fn run(
        &self,
        op: &mut Operation,
        sink: &mut dyn ReplySink,
        f: impl FnOnce(&dyn Backend, &mut Operation, &mut dyn ReplySink) -> Result<(), OpError>,
    ) -> Result<(), OpError> {
        let mut chained = ChainSink {
            overlay: self,
            down: sink,
        };
        f(&*self.inner, op, &mut chained)
    }

    /// Chases the referral in `rs`, sending the substitute replies to
    /// `down`. Returns the verdict for the original (referral) reply.
    fn chase(
        &self,
        op: &mut Operation,
        rs: &mut Response,
        down: &mut dyn ReplySink,
    ) -> Result<Flow, OpError> {
        let refs = match rs.refs.take() {
            Some(refs) if !refs.is_empty() => refs,
            _ => return down.reply(op, rs),
        };
        debug!("chaining {} via {} referral(s)", op.tag(), refs.len());

        // With no fixed upstream the target comes from the referral itself,
        // so the remote client must not cache the connection by URL.
        let per_request = self.remote.uri().is_none();
        let saved_cache = op.do_not_cache;
        let saved_identity = op.dn.clone();
        if per_request {
            op.do_not_cache = true;
        }

        let out = if rs.kind == ReplyKind::SearchRef {
            self.chase_search_refs(op, rs, &refs, down)
        } else {
            self.chase_referral(op, &refs, down).map(|()| Flow::Stop)
        };

        op.do_not_cache = saved_cache;
        op.dn = saved_identity;
        out
    }

    /// Chases a final-result referral: the remote response replaces it.
    fn chase_referral(
        &self,
        op: &mut Operation,
        refs: &[String],
        down: &mut dyn ReplySink,
    ) -> Result<(), OpError> {
        let per_request = self.remote.uri().is_none();
        let take = if self.try_all_uris.load(Ordering::Relaxed) {
            refs.len()
        } else {
            1
        };

        let mut last: Option<OpError> = None;
        for uri in &refs[..take] {
            let target = if per_request {
                // Keep proto://host[:port]/ only; the operation supplies
                // the DN.
                match LdapUrl::from_str(uri) {
                    Ok(url) => Some(url.authority_only()),
                    Err(e) => {
                        warn!("unchaseable referral '{}': {}", uri, e);
                        last = Some(OpError::new(
                            ResultCode::ProtocolError,
                            format!("bad referral URL '{}'", uri),
                        ));
                        continue;
                    }
                }
            } else {
                None
            };
            match self.dispatch_one(op, target.as_ref(), down) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("chained {} to '{}' failed: {}", op.tag(), uri, e);
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| OpError::new(ResultCode::Other, "no chaseable referral")))
    }

    /// One remote dispatch, with the per-tag request rewrites.
    fn dispatch_one(
        &self,
        op: &mut Operation,
        target: Option<&LdapUrl>,
        down: &mut dyn ReplySink,
    ) -> Result<(), OpError> {
        match op.tag() {
            Tag::Bind => {
                // A chained bind must not bind the client's connection, and
                // targets the remote server's root.
                let saved_target = std::mem::take(&mut op.target);
                let saved_conn = op.conn.take();
                let rc = self.remote.dispatch(target, op, down);
                op.target = saved_target;
                op.conn = saved_conn;
                rc
            }
            Tag::Add => {
                let synthesized = match &mut op.request {
                    Request::Add { entry, mods } if entry.attrs.is_empty() => {
                        entry.attrs = mods_to_attrs(mods)?;
                        true
                    }
                    _ => false,
                };
                let rc = self.remote.dispatch(target, op, down);
                if synthesized {
                    if let Request::Add { entry, .. } = &mut op.request {
                        entry.attrs.clear();
                    }
                }
                rc
            }
            Tag::Extended => {
                // The remote client returns the extended response without
                // sending it; emit it through the normal reply path.
                let mut capture = CaptureSink::default();
                self.remote.dispatch(target, op, &mut capture)?;
                if let Some(mut rs) = capture.response {
                    down.reply(op, &mut rs)?;
                }
                Ok(())
            }
            _ => self.remote.dispatch(target, op, down),
        }
    }

    /// Chases every URI of a continuation reference. Entries stream to the
    /// client as they arrive; URIs whose remote search did not succeed are
    /// re-emitted as a smaller continuation reference.
    fn chase_search_refs(
        &self,
        op: &mut Operation,
        rs: &mut Response,
        refs: &[String],
        down: &mut dyn ReplySink,
    ) -> Result<Flow, OpError> {
        let fixed = self.remote.uri().is_some();
        let saved_target = op.target.clone();
        let mut failed: Vec<String> = Vec::new();
        let mut rc: Result<(), OpError> = Ok(());

        for uri in refs {
            let url = match LdapUrl::from_str(uri) {
                Ok(url) => url,
                Err(e) => {
                    rc = Err(OpError::new(
                        ResultCode::ProtocolError,
                        format!("bad referral URL '{}': {}", uri, e),
                    ));
                    break;
                }
            };
            // The URI supplies the search base; its scope and filter are
            // deliberately not taken (RFC 3296).
            op.target = match Dn::from_str(&url.dn) {
                Ok(dn) => dn,
                Err(e) => {
                    rc = Err(OpError::new(
                        ResultCode::ProtocolError,
                        format!("bad referral base '{}': {}", url.dn, e),
                    ));
                    break;
                }
            };
            let target = if fixed { None } else { Some(url.authority_only()) };

            let mut strip = StripSink {
                entry_dn: self.entry_dn,
                down: &mut *down,
                code: None,
            };
            match self.remote.dispatch(target.as_ref(), op, &mut strip) {
                Err(e) => {
                    rc = Err(e);
                    break;
                }
                Ok(()) => {
                    if strip.code != Some(ResultCode::Success) {
                        // The search failed there; at least return the
                        // referral.
                        failed.push(uri.clone());
                    }
                }
            }
        }

        op.target = saved_target;
        rc?;

        if failed.is_empty() {
            // Everything chased; the reference is consumed and the inner
            // search carries on.
            return Ok(Flow::Continue);
        }
        rs.refs = Some(failed);
        down.reply(op, rs)
    }

    fn set_try_all_uris(&self, on: bool) {
        self.try_all_uris.store(on, Ordering::Relaxed);
    }
}

impl Backend for ChainOverlay {
    fn kind(&self) -> &'static str {
        "chain"
    }

    fn suffixes(&self) -> &[Dn] {
        self.inner.suffixes()
    }

    fn bind(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        self.run(op, sink, |be, op, sink| be.bind(op, sink))
    }

    fn add(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        self.run(op, sink, |be, op, sink| be.add(op, sink))
    }

    fn delete(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        self.run(op, sink, |be, op, sink| be.delete(op, sink))
    }

    fn modify(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        self.run(op, sink, |be, op, sink| be.modify(op, sink))
    }

    fn modrdn(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        self.run(op, sink, |be, op, sink| be.modrdn(op, sink))
    }

    fn compare(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        self.run(op, sink, |be, op, sink| be.compare(op, sink))
    }

    fn search(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        self.run(op, sink, |be, op, sink| be.search(op, sink))
    }

    fn extended(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        self.run(op, sink, |be, op, sink| be.extended(op, sink))
    }

    /// Entries materialized from a remote server already carry their
    /// operational attributes; they must not get a second pass here.
    fn operational(&self, op: &Operation, entry: &Entry) -> Flow {
        if !entry.local {
            return Flow::Stop;
        }
        self.inner.operational(op, entry)
    }

    fn db_config(&self, file: &str, line: u32, args: &[String]) -> Result<(), OpError> {
        match args.first().map(String::as_str) {
            Some("chain-try-all-uris") if args.len() == 2 => match args[1].as_str() {
                "on" => Ok(self.set_try_all_uris(true)),
                "off" => Ok(self.set_try_all_uris(false)),
                v => Err(OpError::new(
                    ResultCode::Other,
                    format!("{}:{}: expected on|off, got '{}'", file, line, v),
                )),
            },
            Some(directive) => {
                // Strip our prefix and hand the directive to the remote
                // client's parser.
                let mut forwarded = args.to_vec();
                if let Some(stripped) = strip_prefix_ci(directive, CONFIG_PREFIX) {
                    forwarded[0] = stripped.to_string();
                }
                self.remote.db_config(file, line, &forwarded)
            }
            None => Ok(()),
        }
    }

    fn db_destroy(&self) {
        self.remote.db_destroy();
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Builds an add-entry body from the operation's modification list. The
/// operational attributes are not injected here; the remote server provides
/// its own.
fn mods_to_attrs(mods: &[Mod]) -> Result<Vec<Attribute>, OpError> {
    let mut attrs: Vec<Attribute> = Vec::with_capacity(mods.len());
    for m in mods {
        if m.op != ModOp::Add {
            return Err(OpError::new(
                ResultCode::ProtocolError,
                format!("{} modification in an add request", m.op),
            ));
        }
        match attrs.iter_mut().find(|a| a.desc == m.desc) {
            Some(a) => a.vals.extend(m.vals.iter().cloned()),
            None => attrs.push(Attribute {
                desc: m.desc,
                vals: m.vals.clone(),
            }),
        }
    }
    Ok(attrs)
}

/// The overlay's response interceptor, installed in front of the caller's
/// sink for the duration of an operation.
struct ChainSink<'a> {
    overlay: &'a ChainOverlay,
    down: &'a mut dyn ReplySink,
}

impl<'a> ReplySink for ChainSink<'a> {
    fn reply(&mut self, op: &mut Operation, rs: &mut Response) -> Result<Flow, OpError> {
        if rs.code != ResultCode::Referral && rs.kind != ReplyKind::SearchRef {
            return self.down.reply(op, rs);
        }
        self.overlay.chase(op, rs, &mut *self.down)
    }
}

/// Forwards remote search entries (with `entryDN` stripped) and captures the
/// remote final result instead of forwarding it.
struct StripSink<'a> {
    entry_dn: Ad,
    down: &'a mut dyn ReplySink,
    code: Option<ResultCode>,
}

impl<'a> ReplySink for StripSink<'a> {
    fn reply(&mut self, op: &mut Operation, rs: &mut Response) -> Result<Flow, OpError> {
        match rs.kind {
            ReplyKind::SearchEntry => {
                if let Some(entry) = rs.entry.as_mut() {
                    // The frontend regenerates entryDN; there SHOULD be one
                    // only.
                    if let Some(i) = entry.attrs.iter().position(|a| a.desc == self.entry_dn) {
                        entry.attrs.remove(i);
                    }
                }
                self.down.reply(op, rs)
            }
            ReplyKind::Result => {
                self.code = Some(rs.code);
                Ok(Flow::Stop)
            }
            _ => Ok(Flow::Stop),
        }
    }
}

/// Captures a single reply; used for extended responses the remote client
/// hands back without sending.
#[derive(Default)]
struct CaptureSink {
    response: Option<Response>,
}

impl ReplySink for CaptureSink {
    fn reply(&mut self, _op: &mut Operation, rs: &mut Response) -> Result<Flow, OpError> {
        self.response = Some(rs.clone());
        Ok(Flow::Stop)
    }
}
