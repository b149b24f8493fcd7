//! The attribute-type schema.
//!
//! Types are registered once through [`SchemaBuilder`] and live for the rest
//! of the process; `build` leaks the finished [`Schema`] to `'static` so
//! description handles stay `Copy` and never dangle. Interned attribute
//! descriptions hang off each type; see the registry module for how the
//! per-type lists are maintained.

use crate::ad::AttributeDescription;
use std::collections::HashMap;
use std::fmt;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::Mutex;
use thiserror::Error;

/// The operational attribute regenerated by the frontend on every entry; it
/// is always present in the schema.
pub const ENTRY_DN: &str = "entryDN";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("attribute type '{0}' is already defined")]
    DuplicateType(String),

    #[error("attribute type '{0}' is not defined")]
    UnknownType(String),

    #[error("superior type '{0}' is not defined")]
    UnknownSuperior(String),
}

/// A schema-resident attribute type. Created during schema load, never
/// freed.
pub struct AttributeType {
    name: String,
    sup: Option<&'static AttributeType>,
    binary_syntax: bool,
    undefined: bool,

    /// Head of this type's intern list. Written only under the registry
    /// mutex, with release ordering.
    pub(crate) head: AtomicPtr<AttributeDescription>,
}

impl AttributeType {
    /// The canonical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the type's syntax permits binary transfer.
    pub fn binary_syntax(&self) -> bool {
        self.binary_syntax
    }

    /// Whether this is the distinguished type backing the undefined pool.
    pub fn is_undefined(&self) -> bool {
        self.undefined
    }

    /// True iff `self` is a (non-strict) subtype of `sup`.
    pub fn is_subtype_of(&'static self, sup: &'static AttributeType) -> bool {
        let mut at = self;
        loop {
            if ptr::eq(at, sup) {
                return true;
            }
            match at.sup {
                Some(parent) => at = parent,
                None => return false,
            }
        }
    }
}

impl fmt::Debug for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AttributeType")
            .field("name", &self.name)
            .finish()
    }
}

/// The process-wide schema: type lookup plus the intern registry's lock.
pub struct Schema {
    by_name: HashMap<String, &'static AttributeType>,
    undefined: &'static AttributeType,

    /// A single mutex for all intern-list insertions. Insertions are rare
    /// after steady state, so one lock suffices; readers traverse the
    /// append-only lists without it.
    pub(crate) intern_lock: Mutex<()>,
}

impl Schema {
    /// Looks up an attribute type by name or alias, case-insensitively.
    pub fn find_type(&self, name: &str) -> Option<&'static AttributeType> {
        self.by_name.get(&name.to_ascii_lowercase()).copied()
    }

    /// The distinguished type backing the undefined-description pool.
    pub fn undefined_type(&self) -> &'static AttributeType {
        self.undefined
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Schema")
            .field("types", &self.by_name.len())
            .finish()
    }
}

/// Builds a [`Schema`]. A superior type must be registered before its
/// subtypes reference it.
pub struct SchemaBuilder {
    by_name: HashMap<String, &'static AttributeType>,
}

impl SchemaBuilder {
    pub fn new() -> SchemaBuilder {
        let mut b = SchemaBuilder {
            by_name: HashMap::new(),
        };
        // Always present; see ENTRY_DN.
        b.register(ENTRY_DN, None, false).expect("fresh builder");
        b
    }

    /// Registers an attribute type.
    pub fn attribute(
        mut self,
        name: &str,
        sup: Option<&str>,
        binary_syntax: bool,
    ) -> Result<SchemaBuilder, SchemaError> {
        self.register(name, sup, binary_syntax)?;
        Ok(self)
    }

    /// Registers an additional lookup name for an existing type.
    pub fn alias(mut self, name: &str, alias: &str) -> Result<SchemaBuilder, SchemaError> {
        let at = self
            .by_name
            .get(&name.to_ascii_lowercase())
            .copied()
            .ok_or_else(|| SchemaError::UnknownType(name.to_string()))?;
        let key = alias.to_ascii_lowercase();
        if self.by_name.contains_key(&key) {
            return Err(SchemaError::DuplicateType(alias.to_string()));
        }
        self.by_name.insert(key, at);
        Ok(self)
    }

    fn register(
        &mut self,
        name: &str,
        sup: Option<&str>,
        binary_syntax: bool,
    ) -> Result<&'static AttributeType, SchemaError> {
        let key = name.to_ascii_lowercase();
        if self.by_name.contains_key(&key) {
            return Err(SchemaError::DuplicateType(name.to_string()));
        }
        let sup = match sup {
            Some(s) => Some(
                self.by_name
                    .get(&s.to_ascii_lowercase())
                    .copied()
                    .ok_or_else(|| SchemaError::UnknownSuperior(s.to_string()))?,
            ),
            None => None,
        };
        let at: &'static AttributeType = Box::leak(Box::new(AttributeType {
            name: name.to_string(),
            sup,
            binary_syntax,
            undefined: false,
            head: AtomicPtr::new(ptr::null_mut()),
        }));
        self.by_name.insert(key, at);
        Ok(at)
    }

    /// Finishes the schema and leaks it for the life of the process.
    pub fn build(self) -> &'static Schema {
        // The undefined type backs its own pool and is not found by name.
        let undefined: &'static AttributeType = Box::leak(Box::new(AttributeType {
            name: "undefined".to_string(),
            sup: None,
            binary_syntax: false,
            undefined: true,
            head: AtomicPtr::new(ptr::null_mut()),
        }));
        Box::leak(Box::new(Schema {
            by_name: self.by_name,
            undefined,
            intern_lock: Mutex::new(()),
        }))
    }
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        SchemaBuilder::new()
    }
}
