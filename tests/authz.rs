//! End-to-end identity-mapping and authorization scenarios over an
//! in-memory backend.

use rustldap::authz::{Authz, AuthzError, RulesBuilder, AUTHZ_DEST_ATTR, AUTHZ_SOURCE_ATTR};
use rustldap::memdb::MemBackend;
use rustldap::schema::{Schema, SchemaBuilder};
use rustldap::types::Entry;
use rustldap::{Backends, Dn};
use std::str::FromStr;
use std::sync::Arc;

fn schema() -> &'static Schema {
    SchemaBuilder::new()
        .attribute("objectClass", None, false)
        .unwrap()
        .attribute("uid", None, false)
        .unwrap()
        .attribute("cn", None, false)
        .unwrap()
        .attribute(AUTHZ_SOURCE_ATTR, None, false)
        .unwrap()
        .attribute(AUTHZ_DEST_ATTR, None, false)
        .unwrap()
        .build()
}

fn dn(s: &str) -> Dn {
    Dn::from_str(s).unwrap()
}

fn person(schema: &'static Schema, dn_s: &str, uid: &str) -> Entry {
    let mut e = Entry::new(dn(dn_s));
    e.put(schema.resolve("objectClass").unwrap(), vec!["person".into()]);
    e.put(schema.resolve("uid").unwrap(), vec![uid.into()]);
    e
}

/// A directory with admin, bob, deputy and two lookalike twins under dc=x.
fn directory(schema: &'static Schema) -> (Arc<Backends>, Arc<MemBackend>) {
    let db = Arc::new(MemBackend::new(dn("dc=x"), schema));
    db.insert(person(schema, "uid=admin,dc=x", "admin"));
    db.insert(person(schema, "uid=bob,dc=x", "bob"));
    db.insert(person(schema, "uid=deputy,dc=x", "deputy"));
    db.insert(person(schema, "uid=twin1,dc=x", "twin"));
    db.insert(person(schema, "uid=twin2,dc=x", "twin"));

    let mut backends = Backends::new();
    backends.register(db.clone() as Arc<dyn rustldap::Backend>);
    (Arc::new(backends), db)
}

#[test]
fn principal_with_base_scope_uri_resolves_without_a_search() {
    let schema = schema();
    let rules = RulesBuilder::new()
        .rule(
            "^uid=([^,]+),cn=EXAMPLE,cn=AUTH$",
            "ldap:///uid=$1,dc=example,dc=com??base",
        )
        .unwrap()
        .build();

    // No backends registered at all: a search would return nothing, so a
    // successful resolution proves the shortcut.
    let authz = Authz::new(schema, Arc::new(Backends::new()), rules);
    assert_eq!(
        authz.to_dn("uid=bob,cn=EXAMPLE,cn=AUTH"),
        Some(dn("uid=bob,dc=example,dc=com"))
    );
}

#[test]
fn principal_resolution_via_internal_search() {
    let schema = schema();
    let (backends, _db) = directory(schema);
    let rules = RulesBuilder::new()
        .rule("^uid=([^,]+),cn=x,cn=auth$", "ldap:///dc=x??sub?(uid=$1)")
        .unwrap()
        .build();
    let authz = Authz::new(schema, backends, rules);

    assert_eq!(
        authz.to_dn("uid=bob,cn=x,cn=auth"),
        Some(dn("uid=bob,dc=x"))
    );

    // Two entries share uid=twin: ambiguous, so no identity.
    assert_eq!(authz.to_dn("uid=twin,cn=x,cn=auth"), None);

    // No entry at all.
    assert_eq!(authz.to_dn("uid=ghost,cn=x,cn=auth"), None);
}

#[test]
fn principal_with_no_matching_rule_stays_unmapped() {
    let schema = schema();
    let (backends, _db) = directory(schema);
    let authz = Authz::new(schema, backends, RulesBuilder::new().build());
    assert_eq!(authz.to_dn("uid=bob,cn=x,cn=auth"), None);
}

#[test]
fn principal_mapping_to_plain_dn() {
    let schema = schema();
    let rules = RulesBuilder::new()
        .rule("^uid=([^,]+),cn=x,cn=auth$", "uid=$1,dc=x")
        .unwrap()
        .build();
    let authz = Authz::new(schema, Arc::new(Backends::new()), rules);
    assert_eq!(authz.to_dn("uid=Bob,cn=x,cn=auth"), Some(dn("uid=bob,dc=x")));
}

#[test]
fn anonymous_and_self_authorization_succeed() {
    let schema = schema();
    let (backends, _db) = directory(schema);
    let authz = Authz::new(schema, backends, RulesBuilder::new().build());

    assert!(authz.authorized(&dn("uid=admin,dc=x"), &Dn::empty()).is_ok());
    assert!(authz
        .authorized(&dn("uid=admin,dc=x"), &dn("UID=Admin,DC=X"))
        .is_ok());
}

#[test]
fn source_rules_grant_through_an_internal_search() {
    let schema = schema();
    let (backends, db) = directory(schema);

    // admin may become anyone matching (uid=bob) under dc=x.
    let mut admin = person(schema, "uid=admin,dc=x", "admin");
    admin.put(
        schema.resolve(AUTHZ_SOURCE_ATTR).unwrap(),
        vec!["ldap:///dc=x??sub?(uid=bob)".into()],
    );
    db.insert(admin);

    let authz = Authz::new(schema, backends, RulesBuilder::new().build());

    assert!(authz
        .authorized(&dn("uid=admin,dc=x"), &dn("uid=bob,dc=x"))
        .is_ok());

    // mallory is not among the rule's results.
    assert!(matches!(
        authz.authorized(&dn("uid=admin,dc=x"), &dn("uid=mallory,dc=x")),
        Err(AuthzError::InappropriateAuth)
    ));
}

#[test]
fn destination_rules_grant_with_a_plain_dn() {
    let schema = schema();
    let (backends, db) = directory(schema);

    // bob accepts deputy acting as him.
    let mut bob = person(schema, "uid=bob,dc=x", "bob");
    bob.put(
        schema.resolve(AUTHZ_DEST_ATTR).unwrap(),
        vec!["dn:uid=deputy,dc=x".into()],
    );
    db.insert(bob);

    let authz = Authz::new(schema, backends, RulesBuilder::new().build());

    assert!(authz
        .authorized(&dn("uid=deputy,dc=x"), &dn("uid=bob,dc=x"))
        .is_ok());
    assert!(authz
        .authorized(&dn("uid=admin,dc=x"), &dn("uid=bob,dc=x"))
        .is_err());
}

#[test]
fn base_scope_uri_rules_match_as_regexps() {
    let schema = schema();
    let (backends, db) = directory(schema);

    // admin may become any single-word uid directly under dc=x.
    let mut admin = person(schema, "uid=admin,dc=x", "admin");
    admin.put(
        schema.resolve(AUTHZ_SOURCE_ATTR).unwrap(),
        vec!["ldap:///^uid=[a-z]+,dc=x$??base".into()],
    );
    db.insert(admin);

    let authz = Authz::new(schema, backends, RulesBuilder::new().build());

    assert!(authz
        .authorized(&dn("uid=admin,dc=x"), &dn("uid=bob,dc=x"))
        .is_ok());
    assert!(authz
        .authorized(&dn("uid=admin,dc=x"), &dn("uid=bob,ou=nested,dc=x"))
        .is_err());
}

#[test]
fn missing_rule_attribute_denies() {
    let schema = schema();
    let (backends, _db) = directory(schema);
    let authz = Authz::new(schema, backends, RulesBuilder::new().build());

    assert!(matches!(
        authz.authorized(&dn("uid=deputy,dc=x"), &dn("uid=bob,dc=x")),
        Err(AuthzError::InappropriateAuth)
    ));
}
