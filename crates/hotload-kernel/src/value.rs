//! Schema-tagged values
//!
//! Every field, static and method parameter a plugin object exposes is
//! described by a [`TypeTag`] and carried as a [`Value`]. Two independently
//! compiled versions of a type agree on these tags, not on memory layout,
//! which is what makes field-by-field state migration possible.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{FieldError, InvokeError};
use crate::object::PluginObject;

/// Declared type of a field, static, parameter or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum TypeTag {
    /// No value (`()`)
    Unit,
    Bool,
    I32,
    I64,
    U32,
    U64,
    /// Native machine word (`usize`)
    Word,
    F64,
    Str,
    /// String list, the argument shape of commands
    StrList,
    /// Menu item handed to menu actions
    MenuItem,
    /// Arbitrary plain data
    Json,
}

impl TypeTag {
    /// Whether a value declared as `self` can be stored into a slot declared as `target`.
    ///
    /// Identical tags are always assignable; integers widen losslessly.
    pub fn is_assignable_to(self, target: TypeTag) -> bool {
        use TypeTag::*;
        self == target
            || matches!(
                (self, target),
                (I32, I64) | (U32, U64) | (U32, I64) | (U32, Word)
            )
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeTag::Unit => "()",
            TypeTag::Bool => "bool",
            TypeTag::I32 => "i32",
            TypeTag::I64 => "i64",
            TypeTag::U32 => "u32",
            TypeTag::U64 => "u64",
            TypeTag::Word => "usize",
            TypeTag::F64 => "f64",
            TypeTag::Str => "string",
            TypeTag::StrList => "string[]",
            TypeTag::MenuItem => "menu-item",
            TypeTag::Json => "json",
        };
        f.write_str(name)
    }
}

/// Menu entry passed to a menu action when it is triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    /// Owning plugin
    pub plugin: String,
    /// Full registration path, e.g. `Main/counter/Reset`
    pub path: String,
}

/// A dynamically typed value crossing the host/plugin boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Value {
    Unit,
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    Word(usize),
    F64(f64),
    Str(String),
    StrList(Vec<String>),
    MenuItem(MenuItem),
    Json(serde_json::Value),
}

impl Value {
    /// Tag describing this value
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Unit => TypeTag::Unit,
            Value::Bool(_) => TypeTag::Bool,
            Value::I32(_) => TypeTag::I32,
            Value::I64(_) => TypeTag::I64,
            Value::U32(_) => TypeTag::U32,
            Value::U64(_) => TypeTag::U64,
            Value::Word(_) => TypeTag::Word,
            Value::F64(_) => TypeTag::F64,
            Value::Str(_) => TypeTag::Str,
            Value::StrList(_) => TypeTag::StrList,
            Value::MenuItem(_) => TypeTag::MenuItem,
            Value::Json(_) => TypeTag::Json,
        }
    }

    /// Convert into the representation of `target`, widening integers.
    ///
    /// Returns `None` when the tags are not assignable.
    pub fn coerce(self, target: TypeTag) -> Option<Value> {
        if self.tag() == target {
            return Some(self);
        }
        match (self, target) {
            (Value::I32(v), TypeTag::I64) => Some(Value::I64(v.into())),
            (Value::U32(v), TypeTag::U64) => Some(Value::U64(v.into())),
            (Value::U32(v), TypeTag::I64) => Some(Value::I64(v.into())),
            (Value::U32(v), TypeTag::Word) => usize::try_from(v).ok().map(Value::Word),
            _ => None,
        }
    }
}

macro_rules! impl_value_conversions {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }

            impl TryFrom<Value> for $ty {
                type Error = TypeTag;

                fn try_from(value: Value) -> Result<Self, Self::Error> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(other.tag()),
                    }
                }
            }
        )*
    };
}

impl_value_conversions! {
    bool => Bool,
    i32 => I32,
    i64 => I64,
    u32 => U32,
    u64 => U64,
    usize => Word,
    f64 => F64,
    String => Str,
    Vec<String> => StrList,
    MenuItem => MenuItem,
    serde_json::Value => Json,
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Unit
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

/// Extract argument `index` from an invocation argument list.
pub fn arg<T>(args: &[Value], index: usize, expected: TypeTag) -> Result<T, InvokeError>
where
    T: TryFrom<Value, Error = TypeTag>,
{
    let value = args.get(index).cloned().ok_or(InvokeError::Arity {
        expected: index + 1,
        actual: args.len(),
    })?;
    T::try_from(value).map_err(|actual| InvokeError::ArgumentType {
        index,
        expected,
        actual,
    })
}

/// Check that `value` fits a field declared as `declared`, converting if needed.
pub fn expect_field(field: &str, declared: TypeTag, value: Value) -> Result<Value, FieldError> {
    let actual = value.tag();
    value.coerce(declared).ok_or(FieldError::TypeMismatch {
        field: field.to_string(),
        expected: declared,
        actual,
    })
}

/// One captured field: its declared tag and current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedValue {
    pub tag: TypeTag,
    pub value: Value,
}

/// Outcome of importing a [`StateBag`] into an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Fields copied into the target
    pub applied: Vec<String>,
    /// Target fields the bag has no entry for; they keep their current value
    pub missing: Vec<String>,
    /// Fields present on both sides whose tags are not assignable
    pub incompatible: Vec<String>,
    /// Fields the target refused
    pub rejected: Vec<String>,
}

/// Schema-tagged export of an object's fields, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateBag {
    /// Type the bag was captured from
    pub type_name: String,
    /// Field values by name
    pub fields: BTreeMap<String, TaggedValue>,
}

impl StateBag {
    /// Create an empty bag for `type_name`
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            fields: BTreeMap::new(),
        }
    }

    /// Capture every readable declared field of `object`.
    pub fn capture(object: &dyn PluginObject) -> Self {
        let mut bag = Self::new(object.type_name());
        for decl in object.fields() {
            if let Some(value) = object.get_field(decl.name) {
                bag.insert(decl.name, decl.tag, value);
            }
        }
        bag
    }

    /// Add a field
    pub fn insert(&mut self, name: &str, tag: TypeTag, value: Value) {
        self.fields
            .insert(name.to_string(), TaggedValue { tag, value });
    }

    /// Builder form of [`StateBag::insert`]
    pub fn with_field(mut self, name: &str, tag: TypeTag, value: Value) -> Self {
        self.insert(name, tag, value);
        self
    }

    /// Look up a field
    pub fn get(&self, name: &str) -> Option<&TaggedValue> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Import into `object`, matching entries to the object's declared fields
    /// by name and tag. Unmatched fields are left untouched.
    pub fn apply_to(&self, object: &dyn PluginObject) -> ApplyReport {
        let mut report = ApplyReport::default();
        for decl in object.fields() {
            let Some(entry) = self.fields.get(decl.name) else {
                report.missing.push(decl.name.to_string());
                continue;
            };
            if !entry.tag.is_assignable_to(decl.tag) {
                report.incompatible.push(decl.name.to_string());
                continue;
            }
            let Some(value) = entry.value.clone().coerce(decl.tag) else {
                report.incompatible.push(decl.name.to_string());
                continue;
            };
            match object.set_field(decl.name, value) {
                Ok(()) => report.applied.push(decl.name.to_string()),
                Err(_) => report.rejected.push(decl.name.to_string()),
            }
        }
        report
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
