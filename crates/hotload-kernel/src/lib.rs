//! 热加载内核
//!
//! Shared vocabulary between a hotload host and the plugin modules it loads:
//! - Schema-tagged values and state bags
//! - The plugin object schema (fields, children, tagged methods)
//! - Entry and hotload capabilities
//! - Module descriptors and the `export_module!` ABI

pub mod error;
pub mod module;
pub mod object;
pub mod value;

#[cfg(feature = "config")]
pub mod config;

pub use error::{FieldError, InvokeError, PluginError, PluginResult};
pub use module::{API_VERSION, Constructor, ModuleDescriptor, StaticState, TypeDescriptor};
pub use object::{
    ChildRef, FieldDecl, Hotload, Invoker, MemberShape, MenuParent, MethodDecl, ObjectRef,
    PluginEntry, PluginObject, Signature, Tag, object_id,
};
pub use value::{ApplyReport, MenuItem, StateBag, TaggedValue, TypeTag, Value, arg, expect_field};
