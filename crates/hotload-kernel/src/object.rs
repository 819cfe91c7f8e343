//! Plugin object schema
//!
//! A plugin's live state is a graph of [`PluginObject`]s. Each object
//! describes itself explicitly: its scalar fields, its object-typed members
//! and its tagged methods. The host walks this description to discover
//! capabilities and to transplant state between module versions.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{FieldError, InvokeError, PluginResult};
use crate::value::{TypeTag, Value};

/// Shared handle to a node of a live object graph.
pub type ObjectRef = Arc<dyn PluginObject>;

/// Identity of a graph node, stable for as long as the node is alive.
pub fn object_id(object: &ObjectRef) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

/// A scalar field declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDecl {
    pub name: &'static str,
    pub tag: TypeTag,
}

impl FieldDecl {
    pub const fn new(name: &'static str, tag: TypeTag) -> Self {
        Self { name, tag }
    }
}

/// Shape of an object-typed member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberShape {
    /// Plain reference to another object; walked by scans and transplants
    Object,
    /// Collection of objects; never walked
    Array,
    /// Indexed accessor; never walked
    Indexed,
}

/// An object-typed member of a plugin object.
#[derive(Clone)]
pub struct ChildRef {
    pub name: &'static str,
    pub shape: MemberShape,
    pub object: Option<ObjectRef>,
}

impl ChildRef {
    /// A plain object member, possibly unset.
    pub fn object(name: &'static str, object: Option<ObjectRef>) -> Self {
        Self {
            name,
            shape: MemberShape::Object,
            object,
        }
    }

    /// An array member. Declared for completeness; never traversed.
    pub fn array(name: &'static str) -> Self {
        Self {
            name,
            shape: MemberShape::Array,
            object: None,
        }
    }

    /// An indexed member. Declared for completeness; never traversed.
    pub fn indexed(name: &'static str) -> Self {
        Self {
            name,
            shape: MemberShape::Indexed,
            object: None,
        }
    }

    /// The referenced object when this member is walkable.
    pub fn walkable(&self) -> Option<&ObjectRef> {
        match self.shape {
            MemberShape::Object => self.object.as_ref(),
            MemberShape::Array | MemberShape::Indexed => None,
        }
    }
}

impl fmt::Debug for ChildRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildRef")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("type", &self.object.as_ref().map(|o| o.type_name()))
            .finish()
    }
}

/// Parent menu a menu capability is attached under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum MenuParent {
    Main,
    Disassembly,
    Dump,
    Stack,
    Graph,
    MemoryMap,
    Symbols,
}

impl fmt::Display for MenuParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MenuParent::Main => "Main",
            MenuParent::Disassembly => "Disassembly",
            MenuParent::Dump => "Dump",
            MenuParent::Stack => "Stack",
            MenuParent::Graph => "Graph",
            MenuParent::MemoryMap => "MemoryMap",
            MenuParent::Symbols => "Symbols",
        };
        f.write_str(name)
    }
}

/// Capability tag attached to a method.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Tag {
    /// Debugger command; `debug_only` commands need an active debuggee.
    Command { name: String, debug_only: bool },
    /// Expression function over machine words.
    Expression { name: String },
    /// Menu action at `path` below `parent`.
    Menu { path: String, parent: MenuParent },
}

impl Tag {
    pub fn command(name: &str) -> Self {
        Tag::Command {
            name: name.to_string(),
            debug_only: false,
        }
    }

    pub fn debug_command(name: &str) -> Self {
        Tag::Command {
            name: name.to_string(),
            debug_only: true,
        }
    }

    pub fn expression(name: &str) -> Self {
        Tag::Expression {
            name: name.to_string(),
        }
    }

    pub fn menu(path: &str, parent: MenuParent) -> Self {
        Tag::Menu {
            path: path.to_string(),
            parent,
        }
    }
}

/// Declared parameter and return types of a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<TypeTag>,
    pub ret: TypeTag,
}

impl Signature {
    pub fn new(params: impl Into<Vec<TypeTag>>, ret: TypeTag) -> Self {
        Self {
            params: params.into(),
            ret,
        }
    }

    /// A signature without parameters
    pub fn nullary(ret: TypeTag) -> Self {
        Self {
            params: Vec::new(),
            ret,
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// Dynamic entry point of a bound method.
pub type Invoker = Arc<dyn Fn(&[Value]) -> Result<Value, InvokeError> + Send + Sync>;

/// A method of a live object, bound to that object.
#[derive(Clone)]
pub struct MethodDecl {
    pub name: &'static str,
    pub signature: Signature,
    pub tags: Vec<Tag>,
    pub invoke: Invoker,
}

impl MethodDecl {
    pub fn new<F>(name: &'static str, signature: Signature, invoke: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, InvokeError> + Send + Sync + 'static,
    {
        Self {
            name,
            signature,
            tags: Vec::new(),
            invoke: Arc::new(invoke),
        }
    }

    /// Attach a capability tag
    pub fn tagged(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }
}

impl fmt::Debug for MethodDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDecl")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("tags", &self.tags)
            .finish()
    }
}

/// 插件对象 trait
/// Plugin object trait
///
/// Objects use interior mutability: the host only ever holds shared
/// references, and both field writes and bound callbacks go through `&self`.
pub trait PluginObject: Send + Sync + 'static {
    /// 类型名称，用于新旧版本配对
    /// Type name used to pair old and new versions of this type
    fn type_name(&self) -> &'static str;

    /// 标量字段声明
    /// Declared scalar fields
    fn fields(&self) -> Vec<FieldDecl> {
        Vec::new()
    }

    /// Read a declared field
    fn get_field(&self, name: &str) -> Option<Value> {
        None
    }

    /// Write a declared field
    fn set_field(&self, name: &str, value: Value) -> Result<(), FieldError> {
        Err(FieldError::Unknown(name.to_string()))
    }

    /// 对象类型成员
    /// Object-typed members
    fn children(&self) -> Vec<ChildRef> {
        Vec::new()
    }

    /// Point an object-typed member at `object`
    fn set_child(&self, name: &str, object: Option<ObjectRef>) -> Result<(), FieldError> {
        Err(FieldError::ReadOnly(name.to_string()))
    }

    /// 方法表，绑定到当前实例
    /// Method table, bound to this instance
    fn methods(self: Arc<Self>) -> Vec<MethodDecl> {
        Vec::new()
    }

    /// Entry capability, implemented by the module's root type only
    fn as_entry(&self) -> Option<&dyn PluginEntry> {
        None
    }

    /// Hotload participation
    fn as_hotload(&self) -> Option<&dyn Hotload> {
        None
    }
}

/// 插件入口 trait
/// Plugin entry trait
pub trait PluginEntry: Send + Sync {
    /// 首次加载时调用一次
    /// Called once, on first load only
    fn startup(&self) -> PluginResult<()> {
        Ok(())
    }

    /// 非热加载卸载时调用
    /// Called on a non-reloading unload
    fn shutdown(&self) -> PluginResult<()> {
        Ok(())
    }
}

/// 热加载参与者 trait
/// Hotload participant trait
///
/// Notified after state has been transplanted into a freshly loaded graph so
/// that handles and caches that cannot be copied by value can be rebuilt.
pub trait Hotload: Send + Sync {
    fn on_hotload(&self) -> PluginResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leaf;

    impl PluginObject for Leaf {
        fn type_name(&self) -> &'static str {
            "Leaf"
        }
    }

    #[test]
    fn test_object_identity() {
        let a: ObjectRef = Arc::new(Leaf);
        let b = a.clone();
        let c: ObjectRef = Arc::new(Leaf);

        assert_eq!(object_id(&a), object_id(&b));
        assert_ne!(object_id(&a), object_id(&c));
    }

    #[test]
    fn test_only_plain_members_are_walkable() {
        let leaf: ObjectRef = Arc::new(Leaf);

        assert!(ChildRef::object("leaf", Some(leaf)).walkable().is_some());
        assert!(ChildRef::object("unset", None).walkable().is_none());
        assert!(ChildRef::array("items").walkable().is_none());
        assert!(ChildRef::indexed("by_index").walkable().is_none());
    }

    #[test]
    fn test_members_are_read_only_by_default() {
        let leaf = Leaf;
        let other: ObjectRef = Arc::new(Leaf);

        assert!(matches!(
            leaf.set_child("next", Some(other)),
            Err(FieldError::ReadOnly(name)) if name == "next"
        ));
    }

    #[test]
    fn test_signature_display() {
        let sig = Signature::new([TypeTag::Word, TypeTag::Word], TypeTag::Word);
        assert_eq!(sig.to_string(), "(usize, usize) -> usize");
        assert_eq!(Tag::menu("Reset", MenuParent::Dump), Tag::Menu {
            path: "Reset".to_string(),
            parent: MenuParent::Dump,
        });
    }
}
