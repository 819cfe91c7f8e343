//! Module descriptors and the dynamic-library ABI
//!
//! A compiled plugin module describes the types it defines with a
//! [`ModuleDescriptor`]. Exactly one type carries an entry constructor; that
//! type becomes the plugin's root instance. Types may also expose their
//! static state so it can be carried across a reload.

use std::fmt;

use crate::error::FieldError;
use crate::object::{FieldDecl, ObjectRef};
use crate::value::Value;

/// ABI version a host and a module must agree on.
pub const API_VERSION: u32 = 1;

/// Symbol returning the module's [`API_VERSION`].
pub const API_VERSION_SYMBOL: &[u8] = b"_hotload_api_version";

/// Symbol returning a boxed [`ModuleDescriptor`].
pub const MODULE_SYMBOL: &[u8] = b"_hotload_module";

/// Constructor of a module's entry type.
pub type Constructor = fn() -> ObjectRef;

/// Accessors for a type's static fields.
#[derive(Clone, Copy)]
pub struct StaticState {
    pub fields: fn() -> Vec<FieldDecl>,
    pub get: fn(&str) -> Option<Value>,
    pub set: fn(&str, Value) -> Result<(), FieldError>,
}

impl fmt::Debug for StaticState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticState")
            .field("fields", &(self.fields)())
            .finish()
    }
}

/// A type defined by a module.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    /// Name matching [`PluginObject::type_name`](crate::PluginObject::type_name)
    pub name: &'static str,
    /// Set on the module's single entry type
    pub entry: Option<Constructor>,
    /// Static state, if the type has any
    pub statics: Option<StaticState>,
}

impl TypeDescriptor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entry: None,
            statics: None,
        }
    }

    /// Mark this type as the module entry, constructed with `ctor`
    pub fn entry(mut self, ctor: Constructor) -> Self {
        self.entry = Some(ctor);
        self
    }

    pub fn with_statics(mut self, statics: StaticState) -> Self {
        self.statics = Some(statics);
        self
    }

    pub fn is_entry(&self) -> bool {
        self.entry.is_some()
    }
}

/// Description of everything a module defines.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: String,
    pub types: Vec<TypeDescriptor>,
}

impl ModuleDescriptor {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            types: Vec::new(),
        }
    }

    pub fn with_type(mut self, descriptor: TypeDescriptor) -> Self {
        self.types.push(descriptor);
        self
    }

    /// Look up a type by name
    pub fn find_type(&self, name: &str) -> Option<&TypeDescriptor> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Whether this module defines `name`
    pub fn declares(&self, name: &str) -> bool {
        self.find_type(name).is_some()
    }

    /// All types carrying an entry constructor
    pub fn entry_types(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.types.iter().filter(|t| t.is_entry())
    }
}

/// Export a module descriptor from a `cdylib`.
///
/// ```rust,ignore
/// hotload_kernel::export_module!(
///     ModuleDescriptor::new("counter", env!("CARGO_PKG_VERSION"))
///         .with_type(TypeDescriptor::new("Counter").entry(Counter::create))
/// );
/// ```
#[macro_export]
macro_rules! export_module {
    ($descriptor:expr) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn _hotload_api_version() -> u32 {
            $crate::module::API_VERSION
        }

        #[unsafe(no_mangle)]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn _hotload_module() -> *mut $crate::module::ModuleDescriptor {
            let descriptor: $crate::module::ModuleDescriptor = $descriptor;
            Box::into_raw(Box::new(descriptor))
        }
    };
}
