//! rustldap is the request-processing core of an LDAP directory server:
//! the pieces between the wire codec and the entry stores.
//!
//! # Features
//! * Attribute descriptions (`cn;lang-en`, `userCertificate;binary`)
//!   parsed, validated against a schema, and interned process-wide.
//! * A chaining overlay that chases referrals server-side, re-issuing
//!   operations against the referred server and stitching the remote
//!   replies back into the local response stream.
//! * Principal-to-DN mapping driven by regexp rewrite rules, and
//!   rule-based authorization between identities (`authzTo` / `authzFrom`).
//! * A backend dispatch interface with a callback chain, plus a small
//!   in-memory backend for internal searches and tests.
//!
//! # Usage
//!
//! ```rust
//! use rustldap::SchemaBuilder;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Build the schema once; it lives for the rest of the process.
//!     let schema = SchemaBuilder::new()
//!         .attribute("name", None, false)?
//!         .attribute("cn", Some("name"), false)?
//!         .build();
//!
//!     // Equal descriptions resolve to the identical handle.
//!     let cn = schema.resolve("CN")?;
//!     assert_eq!(cn, schema.resolve("cn")?);
//!     assert_eq!(cn.to_string(), "cn");
//!
//!     // Options become part of the identity and the canonical name.
//!     let tagged = schema.resolve("cn;lang-EN")?;
//!     assert_eq!(tagged.to_string(), "cn;lang-en");
//!     assert!(tagged.is_subtype_of(schema.resolve("name")?));
//!
//!     Ok(())
//! }
//! ```
//!
//! What is deliberately *not* here: the BER/DER codec, on-disk entry
//! stores, the connection accept loop, and the configuration-file
//! tokenizer. They plug in through the interfaces in [`backend`] and
//! [`remote`].
//!
//! ## Reference
//!
//! * [rfc4511]: LDAP: The Protocol
//! * [rfc4512]: LDAP: Directory Information Models
//! * [rfc4516]: LDAP: Uniform Resource Locator
//! * [rfc3296]: Named Subordinate References in LDAP Directories
//!
//! [rfc4511]: https://datatracker.ietf.org/doc/html/rfc4511
//! [rfc4512]: https://datatracker.ietf.org/doc/html/rfc4512
//! [rfc4516]: https://datatracker.ietf.org/doc/html/rfc4516
//! [rfc3296]: https://datatracker.ietf.org/doc/html/rfc3296

pub mod ad;
pub mod authz;
pub mod backend;
pub mod chain;
mod dn;
mod errors;
pub mod filter;
mod ldapurl;
pub mod memdb;
pub mod remote;
pub mod schema;
pub mod types;

#[macro_use]
extern crate num_derive;

#[macro_use]
extern crate lazy_static;

// Pull up the types that should be on the front page of the docs.
#[doc(inline)]
pub use crate::types::*;

#[doc(inline)]
pub use crate::ad::{Ad, AdError};

#[doc(inline)]
pub use crate::authz::{Authz, AuthzError, Rules, RulesBuilder};

#[doc(inline)]
pub use crate::backend::{Backend, Backends, CollectSink, Flow, OpError, ReplySink};

#[doc(inline)]
pub use crate::chain::ChainOverlay;

#[doc(inline)]
pub use crate::memdb::MemBackend;

#[doc(inline)]
pub use crate::remote::{Connector, Exchanger, RemoteLdap};

#[doc(inline)]
pub use crate::schema::{Schema, SchemaBuilder};

pub use crate::dn::Dn;
pub use crate::errors::ParseError;
pub use crate::filter::Filter;
pub use crate::ldapurl::LdapUrl;
