//! The backend dispatch interface and the callback chain.
//!
//! A backend is a record of operation entry points keyed by tag, plus
//! lifecycle hooks. Backends stream every reply (entries, continuation
//! references, final results) into the operation's [`ReplySink`] chain;
//! [`Flow::Continue`] propagates a reply onward, [`Flow::Stop`] consumes it,
//! and an [`OpError`] aborts the operation.

use crate::dn::Dn;
use crate::types::{Entry, Operation, Response, ResultCode};
use std::sync::Arc;
use thiserror::Error;

/// Callback-chain verdict for a single reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// An infrastructure failure while executing an operation. Protocol-level
/// outcomes travel inside [`Response`]s instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {text}")]
pub struct OpError {
    pub code: ResultCode,
    pub text: String,
}

impl OpError {
    pub fn new(code: ResultCode, text: impl Into<String>) -> OpError {
        OpError {
            code,
            text: text.into(),
        }
    }
}

/// One link of an operation's callback chain.
pub trait ReplySink: Send {
    fn reply(&mut self, op: &mut Operation, rs: &mut Response) -> Result<Flow, OpError>;
}

/// A sink that records every reply it sees; useful as the end of a chain.
#[derive(Default)]
pub struct CollectSink {
    pub replies: Vec<Response>,
}

impl ReplySink for CollectSink {
    fn reply(&mut self, _op: &mut Operation, rs: &mut Response) -> Result<Flow, OpError> {
        self.replies.push(rs.clone());
        Ok(Flow::Continue)
    }
}

fn unsupported(op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
    let mut rs = Response::result_text(
        ResultCode::UnwillingToPerform,
        format!("{} operation not supported", op.tag()),
    );
    sink.reply(op, &mut rs)?;
    Ok(())
}

/// The record of operation entry points a backend exposes.
///
/// Default implementations answer `UnwillingToPerform`; a backend overrides
/// the operations it supports.
pub trait Backend: Send + Sync {
    /// The backend's registered type name (e.g. `mem`, `ldap`, `chain`).
    fn kind(&self) -> &'static str;

    /// The naming contexts this backend serves.
    fn suffixes(&self) -> &[Dn] {
        &[]
    }

    fn bind(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        unsupported(op, sink)
    }

    fn add(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        unsupported(op, sink)
    }

    fn delete(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        unsupported(op, sink)
    }

    fn modify(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        unsupported(op, sink)
    }

    fn modrdn(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        unsupported(op, sink)
    }

    fn compare(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        unsupported(op, sink)
    }

    fn search(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        unsupported(op, sink)
    }

    fn extended(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        unsupported(op, sink)
    }

    /// Pre-filter for the operational-attributes pass over an entry about to
    /// be returned: `Continue` to let it run, `Stop` to skip it.
    fn operational(&self, _op: &Operation, _entry: &Entry) -> Flow {
        Flow::Continue
    }

    /// Handles one configuration directive.
    fn db_config(&self, _file: &str, _line: u32, _args: &[String]) -> Result<(), OpError> {
        Ok(())
    }

    fn db_destroy(&self) {}
}

/// The set of configured backends, selectable by naming context.
#[derive(Default)]
pub struct Backends {
    backends: Vec<Arc<dyn Backend>>,
    aliases: Vec<(Dn, Dn)>,
}

impl Backends {
    pub fn new() -> Backends {
        Backends::default()
    }

    pub fn register(&mut self, be: Arc<dyn Backend>) {
        self.backends.push(be);
    }

    /// Configures a suffix alias: bases under `from` are rewritten under
    /// `to` before backend dispatch.
    pub fn alias(&mut self, from: Dn, to: Dn) {
        self.aliases.push((from, to));
    }

    /// Selects the backend responsible for `ndn`: the one with the longest
    /// matching suffix.
    pub fn select(&self, ndn: &Dn) -> Option<Arc<dyn Backend>> {
        let mut best: Option<(usize, &Arc<dyn Backend>)> = None;
        for be in &self.backends {
            for suffix in be.suffixes() {
                if ndn.ends_with(suffix) {
                    let depth = suffix.depth();
                    if best.map_or(true, |(d, _)| depth > d) {
                        best = Some((depth, be));
                    }
                }
            }
        }
        best.map(|(_, be)| Arc::clone(be))
    }

    /// Applies the first matching suffix alias, if any.
    pub fn suffix_alias(&self, dn: &Dn) -> Dn {
        for (from, to) in &self.aliases {
            if dn.ends_with(from) {
                return dn.replace_suffix(from, to);
            }
        }
        dn.clone()
    }
}
