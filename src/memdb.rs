//! A small in-memory backend over a sorted map of normalized DNs.
//!
//! It is the local database in tests and the substrate for the identity
//! engine's internal searches; it deliberately implements only the
//! operations those need.

use crate::backend::{Backend, Flow, OpError, ReplySink};
use crate::dn::Dn;
use crate::op_error;
use crate::schema::Schema;
use crate::types::{Entry, ModOp, Operation, Request, Response, ResultCode, Scope};
use std::collections::BTreeMap;
use std::sync::RwLock;

pub struct MemBackend {
    suffix: Vec<Dn>,
    schema: &'static Schema,
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl MemBackend {
    pub fn new(suffix: Dn, schema: &'static Schema) -> MemBackend {
        MemBackend {
            suffix: vec![suffix],
            schema,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Loads an entry directly, bypassing the add operation.
    pub fn insert(&self, entry: Entry) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(entry.dn.norm().to_string(), entry);
    }

    fn in_scope(&self, entry: &Entry, base: &Dn, scope: Scope) -> bool {
        match scope {
            Scope::Base => entry.dn == *base,
            Scope::One => entry.dn.parent().map_or(false, |p| p == *base),
            Scope::Sub => entry.dn.ends_with(base),
        }
    }

    /// Projects an entry down to the requested attributes; an empty request
    /// list means all of them.
    fn project(&self, entry: &Entry, attrs: &[String]) -> Entry {
        if attrs.is_empty() {
            return entry.clone();
        }
        let mut out = entry.clone();
        out.attrs.retain(|a| self.schema.in_list(a.desc, attrs));
        out
    }
}

impl Backend for MemBackend {
    fn kind(&self) -> &'static str {
        "mem"
    }

    fn suffixes(&self) -> &[Dn] {
        &self.suffix
    }

    fn bind(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        let known = {
            let entries = self.entries.read().unwrap();
            entries.contains_key(op.target.norm())
        };
        let code = if known {
            ResultCode::Success
        } else {
            ResultCode::InvalidCredentials
        };
        sink.reply(op, &mut Response::result(code))?;
        Ok(())
    }

    fn add(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        let entry = match &op.request {
            Request::Add { entry, .. } => entry.clone(),
            _ => op_error!(OperationsError, "add dispatched with a non-add request"),
        };
        let mut rs = {
            let mut entries = self.entries.write().unwrap();
            if entries.contains_key(entry.dn.norm()) {
                Response::result(ResultCode::EntryAlreadyExists)
            } else {
                entries.insert(entry.dn.norm().to_string(), entry);
                Response::result(ResultCode::Success)
            }
        };
        sink.reply(op, &mut rs)?;
        Ok(())
    }

    fn delete(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        let mut rs = {
            let mut entries = self.entries.write().unwrap();
            match entries.remove(op.target.norm()) {
                Some(_) => Response::result(ResultCode::Success),
                None => Response::result(ResultCode::NoSuchObject),
            }
        };
        sink.reply(op, &mut rs)?;
        Ok(())
    }

    fn modify(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        let mods = match &op.request {
            Request::Modify { mods } => mods.clone(),
            _ => op_error!(OperationsError, "modify dispatched with a non-modify request"),
        };
        let mut rs = {
            let mut entries = self.entries.write().unwrap();
            match entries.get_mut(op.target.norm()) {
                None => Response::result(ResultCode::NoSuchObject),
                Some(entry) => {
                    let mut code = ResultCode::Success;
                    for m in mods {
                        match m.op {
                            ModOp::Add => entry.put(m.desc, m.vals),
                            ModOp::Replace => {
                                entry.attrs.retain(|a| a.desc != m.desc);
                                if !m.vals.is_empty() {
                                    entry.put(m.desc, m.vals);
                                }
                            }
                            ModOp::Delete => {
                                let had = entry.get(m.desc).is_some();
                                if !had {
                                    code = ResultCode::NoSuchAttribute;
                                    break;
                                }
                                if m.vals.is_empty() {
                                    entry.attrs.retain(|a| a.desc != m.desc);
                                } else if let Some(a) =
                                    entry.attrs.iter_mut().find(|a| a.desc == m.desc)
                                {
                                    a.vals.retain(|v| {
                                        !m.vals.iter().any(|d| d.eq_ignore_ascii_case(v))
                                    });
                                }
                            }
                        }
                    }
                    Response::result(code)
                }
            }
        };
        sink.reply(op, &mut rs)?;
        Ok(())
    }

    fn compare(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        let (desc, value) = match &op.request {
            Request::Compare { desc, value } => (*desc, value.clone()),
            _ => op_error!(OperationsError, "compare dispatched with a non-compare request"),
        };
        let mut rs = {
            let entries = self.entries.read().unwrap();
            match entries.get(op.target.norm()) {
                None => Response::result(ResultCode::NoSuchObject),
                Some(entry) => {
                    let found = entry
                        .attrs
                        .iter()
                        .filter(|a| a.desc.is_subtype_of(desc))
                        .flat_map(|a| a.vals.iter())
                        .any(|v| v.eq_ignore_ascii_case(&value));
                    if found {
                        Response::result(ResultCode::CompareTrue)
                    } else {
                        Response::result(ResultCode::CompareFalse)
                    }
                }
            }
        };
        sink.reply(op, &mut rs)?;
        Ok(())
    }

    fn search(&self, op: &mut Operation, sink: &mut dyn ReplySink) -> Result<(), OpError> {
        let params = match &op.request {
            Request::Search(p) => p.clone(),
            _ => op_error!(OperationsError, "search dispatched with a non-search request"),
        };

        // Collect matches under the read lock, stream them after releasing
        // it; the sink may block.
        let base = op.target.clone();
        let matched: Vec<Entry> = {
            let entries = self.entries.read().unwrap();
            entries
                .values()
                .filter(|e| self.in_scope(e, &base, params.scope))
                .filter(|e| params.filter.matches(e, self.schema))
                .map(|e| self.project(e, &params.attrs))
                .collect()
        };

        let mut sent: u32 = 0;
        for entry in matched {
            if op.is_abandoned() {
                // Abandoned operations get no final result.
                return Ok(());
            }
            if op.expired() {
                sink.reply(op, &mut Response::result(ResultCode::TimeLimitExceeded))?;
                return Ok(());
            }
            if let Some(limit) = op.size_limit {
                if sent >= limit {
                    sink.reply(op, &mut Response::result(ResultCode::SizeLimitExceeded))?;
                    return Ok(());
                }
            }
            let flow = sink.reply(op, &mut Response::search_entry(entry))?;
            sent += 1;
            if flow == Flow::Stop {
                return Ok(());
            }
        }

        sink.reply(op, &mut Response::result(ResultCode::Success))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CollectSink;
    use crate::schema::SchemaBuilder;
    use crate::types::{ReplyKind, SearchParams};
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    fn schema() -> &'static Schema {
        SchemaBuilder::new()
            .attribute("objectClass", None, false)
            .unwrap()
            .attribute("name", None, false)
            .unwrap()
            .attribute("cn", Some("name"), false)
            .unwrap()
            .attribute("uid", None, false)
            .unwrap()
            .build()
    }

    fn dn(s: &str) -> Dn {
        Dn::from_str(s).unwrap()
    }

    fn db(schema: &'static Schema) -> MemBackend {
        let db = MemBackend::new(dn("dc=example,dc=com"), schema);
        for (name, cn) in &[("alice", "Alice A"), ("bob", "Bob B")] {
            let mut e = Entry::new(dn(&format!("uid={},ou=people,dc=example,dc=com", name)));
            e.put(schema.resolve("objectClass").unwrap(), vec!["person".into()]);
            e.put(schema.resolve("uid").unwrap(), vec![name.to_string()]);
            e.put(schema.resolve("cn").unwrap(), vec![cn.to_string()]);
            db.insert(e);
        }
        let mut ou = Entry::new(dn("ou=people,dc=example,dc=com"));
        ou.put(
            schema.resolve("objectClass").unwrap(),
            vec!["organizationalUnit".into()],
        );
        db.insert(ou);
        db
    }

    fn search(
        db: &MemBackend,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: &[&str],
    ) -> CollectSink {
        let mut params = SearchParams::new(scope, filter.parse().unwrap());
        params.attrs = attrs.iter().map(|s| s.to_string()).collect();
        let mut op = Operation::search(dn(base), params);
        let mut sink = CollectSink::default();
        db.search(&mut op, &mut sink).unwrap();
        sink
    }

    #[test]
    fn test_search_scopes() {
        let schema = schema();
        let db = db(schema);

        let sink = search(&db, "dc=example,dc=com", Scope::Sub, "(objectClass=*)", &[]);
        assert_eq!(sink.replies.len(), 4); // three entries + final result

        let sink = search(
            &db,
            "ou=people,dc=example,dc=com",
            Scope::One,
            "(objectClass=*)",
            &[],
        );
        assert_eq!(sink.replies.len(), 3);

        let sink = search(
            &db,
            "uid=bob,ou=people,dc=example,dc=com",
            Scope::Base,
            "(uid=bob)",
            &[],
        );
        assert_eq!(sink.replies.len(), 2);
        assert_eq!(sink.replies[0].kind, ReplyKind::SearchEntry);
        assert_eq!(sink.replies[1].code, ResultCode::Success);
    }

    #[test]
    fn test_search_projection_follows_subtyping() {
        let schema = schema();
        let db = db(schema);

        // Requesting "name" keeps cn (a subtype) but drops uid.
        let sink = search(
            &db,
            "uid=bob,ou=people,dc=example,dc=com",
            Scope::Base,
            "(objectClass=*)",
            &["name"],
        );
        let entry = sink.replies[0].entry.as_ref().unwrap();
        assert_eq!(entry.attrs.len(), 1);
        assert_eq!(entry.attrs[0].desc, schema.resolve("cn").unwrap());
    }

    #[test]
    fn test_search_size_limit() {
        let schema = schema();
        let db = db(schema);

        let mut op = Operation::search(
            dn("dc=example,dc=com"),
            SearchParams::new(Scope::Sub, "(objectClass=*)".parse().unwrap()),
        );
        op.size_limit = Some(1);
        let mut sink = CollectSink::default();
        db.search(&mut op, &mut sink).unwrap();
        assert_eq!(sink.replies.len(), 2);
        assert_eq!(sink.replies[1].code, ResultCode::SizeLimitExceeded);
    }

    #[test]
    fn test_abandoned_search_goes_quiet() {
        let schema = schema();
        let db = db(schema);

        let mut op = Operation::search(
            dn("dc=example,dc=com"),
            SearchParams::new(Scope::Sub, "(objectClass=*)".parse().unwrap()),
        );
        op.abandon();
        let mut sink = CollectSink::default();
        db.search(&mut op, &mut sink).unwrap();
        assert!(sink.replies.is_empty());
    }

    #[test]
    fn test_bind_compare_delete() {
        let schema = schema();
        let db = db(schema);
        let bob = "uid=bob,ou=people,dc=example,dc=com";

        let mut sink = CollectSink::default();
        let mut op = Operation::new(dn(bob), Request::Bind { credentials: None });
        db.bind(&mut op, &mut sink).unwrap();
        assert_eq!(sink.replies[0].code, ResultCode::Success);

        let mut sink = CollectSink::default();
        let mut op = Operation::new(
            dn(bob),
            Request::Compare {
                desc: schema.resolve("cn").unwrap(),
                value: "bob b".into(),
            },
        );
        db.compare(&mut op, &mut sink).unwrap();
        assert_eq!(sink.replies[0].code, ResultCode::CompareTrue);

        let mut sink = CollectSink::default();
        let mut op = Operation::new(dn(bob), Request::Delete);
        db.delete(&mut op, &mut sink).unwrap();
        assert_eq!(sink.replies[0].code, ResultCode::Success);

        let mut sink = CollectSink::default();
        let mut op = Operation::new(dn(bob), Request::Bind { credentials: None });
        db.bind(&mut op, &mut sink).unwrap();
        assert_eq!(sink.replies[0].code, ResultCode::InvalidCredentials);
    }
}
