//! The remote-client backend: executes operations against a peer server
//! through an externally-supplied wire session.
//!
//! The wire codec lives outside this crate; it plugs in through
//! [`Connector`] and [`Exchanger`]. This backend adds the pieces the core
//! needs on top: a fixed or per-call upstream, configuration parsing, and a
//! URL-keyed connection cache that honors an operation's do-not-cache flag.

use crate::backend::{Backend, OpError, ReplySink};
use crate::ldapurl::LdapUrl;
use crate::op_error;
use crate::types::Operation;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Opens wire sessions. Implemented by the codec layer outside this crate.
pub trait Connector: Send + Sync {
    /// Connects to the server named by the authority part of `url`.
    fn connect(&self, url: &LdapUrl) -> Result<Box<dyn Exchanger>, OpError>;
}

/// One wire session with a remote server.
///
/// `exchange` runs a whole operation: it encodes the request, and streams
/// every reply back through the sink in arrival order. The implementation is
/// responsible for asserting the operation's assumed identity (proxy-authz)
/// upstream and for observing its abandon flag. An extended operation's
/// response is streamed like any other reply; the caller decides whether to
/// forward it.
pub trait Exchanger: Send {
    fn exchange(&mut self, op: &mut Operation, sink: &mut dyn ReplySink)
        -> Result<(), OpError>;
}

/// The remote-client backend, registered under type `ldap`.
pub struct RemoteLdap {
    connector: Arc<dyn Connector>,
    uri: RwLock<Option<LdapUrl>>,
    cache: Mutex<HashMap<String, Box<dyn Exchanger>>>,
}

impl RemoteLdap {
    pub fn new(connector: Arc<dyn Connector>) -> RemoteLdap {
        RemoteLdap {
            connector,
            uri: RwLock::new(None),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The fixed upstream, when one is configured.
    pub fn uri(&self) -> Option<LdapUrl> {
        self.uri.read().unwrap().clone()
    }

    pub fn set_uri(&self, url: LdapUrl) {
        *self.uri.write().unwrap() = Some(url);
    }

    /// Runs `op` against `target`, falling back to the configured upstream.
    ///
    /// The session is checked out of the cache for the duration of the call
    /// (the lock is never held across the exchange) and returned afterwards,
    /// unless the operation forbids caching.
    pub(crate) fn dispatch(
        &self,
        target: Option<&LdapUrl>,
        op: &mut Operation,
        sink: &mut dyn ReplySink,
    ) -> Result<(), OpError> {
        let url = match target {
            Some(url) => url.clone(),
            None => match self.uri() {
                Some(url) => url,
                None => op_error!(UnwillingToPerform, "no upstream server configured"),
            },
        };
        let key = url.origin();
        debug!("dispatching {} to {}", op.tag(), key);

        let cached = if op.do_not_cache {
            None
        } else {
            self.cache.lock().unwrap().remove(&key)
        };
        let mut session = match cached {
            Some(session) => session,
            None => self.connector.connect(&url)?,
        };

        let rc = session.exchange(op, sink);
        if rc.is_ok() && !op.do_not_cache {
            self.cache.lock().unwrap().insert(key, session);
        }
        rc
    }

    #[cfg(test)]
    fn cached_sessions(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

impl Backend for RemoteLdap {
    fn kind(&self) -> &'static str {
        "ldap"
    }

    fn bind(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        self.dispatch(None, op, sink)
    }

    fn add(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        self.dispatch(None, op, sink)
    }

    fn delete(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        self.dispatch(None, op, sink)
    }

    fn modify(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        self.dispatch(None, op, sink)
    }

    fn modrdn(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        self.dispatch(None, op, sink)
    }

    fn compare(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        self.dispatch(None, op, sink)
    }

    fn search(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        self.dispatch(None, op, sink)
    }

    fn extended(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        self.dispatch(None, op, sink)
    }

    fn db_config(&self, file: &str, line: u32, args: &[String]) -> Result<(), OpError> {
        match args.first().map(String::as_str) {
            Some("uri") if args.len() == 2 => {
                let url: LdapUrl = args[1]
                    .parse()
                    .map_err(|e| OpError::new(crate::types::ResultCode::Other, format!(
                        "{}:{}: bad uri: {}",
                        file, line, e
                    )))?;
                self.set_uri(url);
                Ok(())
            }
            Some(directive) => {
                op_error!(Other, "{}:{}: unknown directive '{}'", file, line, directive)
            }
            None => Ok(()),
        }
    }

    fn db_destroy(&self) {
        self.cache.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CollectSink, Flow};
    use crate::types::{Request, Response, ResultCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every operation with success and counts connections.
    struct CountingConnector {
        connects: Arc<AtomicUsize>,
    }

    struct YesSession;

    impl Exchanger for YesSession {
        fn exchange(
            &mut self,
            op: &mut Operation,
            sink: &mut dyn ReplySink,
        ) -> Result<(), OpError> {
            sink.reply(op, &mut Response::result(ResultCode::Success))?;
            Ok(())
        }
    }

    impl Connector for CountingConnector {
        fn connect(&self, _url: &LdapUrl) -> Result<Box<dyn Exchanger>, OpError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(YesSession))
        }
    }

    fn remote() -> (RemoteLdap, Arc<AtomicUsize>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let remote = RemoteLdap::new(Arc::new(CountingConnector {
            connects: Arc::clone(&connects),
        }));
        (remote, connects)
    }

    fn delete_op() -> Operation {
        Operation::new("dc=x".parse().unwrap(), Request::Delete)
    }

    #[test]
    fn test_dispatch_needs_an_upstream() {
        let (remote, _) = remote();
        let mut sink = CollectSink::default();
        let err = remote.delete(&mut delete_op(), &mut sink).unwrap_err();
        assert_eq!(err.code, ResultCode::UnwillingToPerform);
    }

    #[test]
    fn test_fixed_upstream_reuses_the_session() {
        let (remote, connects) = remote();
        remote
            .db_config("test.conf", 1, &["uri".into(), "ldap://peer.example/".into()])
            .unwrap();

        let mut sink = CollectSink::default();
        remote.delete(&mut delete_op(), &mut sink).unwrap();
        remote.delete(&mut delete_op(), &mut sink).unwrap();

        // The second dispatch reused the cached session.
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(remote.cached_sessions(), 1);
        assert_eq!(sink.replies.len(), 2);
    }

    #[test]
    fn test_do_not_cache_skips_the_cache() {
        let (remote, connects) = remote();
        remote.set_uri("ldap://peer.example/".parse().unwrap());

        for _ in 0..2 {
            let mut op = delete_op();
            op.do_not_cache = true;
            let mut sink = CollectSink::default();
            remote.dispatch(None, &mut op, &mut sink).unwrap();
        }
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(remote.cached_sessions(), 0);
    }

    #[test]
    fn test_unknown_directive_is_rejected() {
        let (remote, _) = remote();
        let err = remote
            .db_config("test.conf", 7, &["nonsense".into()])
            .unwrap_err();
        assert_eq!(err.code, ResultCode::Other);
        assert!(err.text.contains("test.conf:7"));
    }

    #[test]
    fn test_sink_flow_is_preserved() {
        struct Stopper;
        impl ReplySink for Stopper {
            fn reply(&mut self, _: &mut Operation, _: &mut Response) -> Result<Flow, OpError> {
                Ok(Flow::Stop)
            }
        }
        let (remote, _) = remote();
        remote.set_uri("ldap://peer.example/".parse().unwrap());
        remote.dispatch(None, &mut delete_op(), &mut Stopper).unwrap();
    }
}
