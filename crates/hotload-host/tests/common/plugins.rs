//! Plugin modules built in-process for integration tests.
//!
//! Each `*_module` function stands in for one compiled build of a plugin.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use hotload_host::Commands;
use hotload_host::kernel::{
    ChildRef, FieldDecl, FieldError, Hotload, MenuParent, MethodDecl, ModuleDescriptor,
    ObjectRef, PluginEntry, PluginError, PluginObject, PluginResult, Signature, Tag,
    TypeDescriptor, TypeTag, Value, arg, expect_field,
};

const COUNT: FieldDecl = FieldDecl::new("count", TypeTag::I64);
const N: FieldDecl = FieldDecl::new("n", TypeTag::I64);

fn read_i64(field: &str, value: Value) -> Result<i64, FieldError> {
    match expect_field(field, TypeTag::I64, value)? {
        Value::I64(v) => Ok(v),
        other => Err(FieldError::TypeMismatch {
            field: field.to_string(),
            expected: TypeTag::I64,
            actual: other.tag(),
        }),
    }
}

fn ping_method(count: Arc<AtomicI64>) -> MethodDecl {
    MethodDecl::new("ping", Signature::nullary(TypeTag::Bool), move |_| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Bool(true))
    })
    .tagged(Tag::command("ping"))
}

fn reset_method(count: Arc<AtomicI64>) -> MethodDecl {
    MethodDecl::new(
        "reset",
        Signature::new([TypeTag::MenuItem], TypeTag::Unit),
        move |_| {
            count.store(0, Ordering::SeqCst);
            Ok(Value::Unit)
        },
    )
    .tagged(Tag::menu("Reset", MenuParent::Main))
}

// ---------------------------------------------------------------------------
// ping: v1 has a counter, v2 adds `n`
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct PingV1 {
    count: Arc<AtomicI64>,
}

impl PluginObject for PingV1 {
    fn type_name(&self) -> &'static str {
        "Ping"
    }

    fn fields(&self) -> Vec<FieldDecl> {
        vec![COUNT]
    }

    fn get_field(&self, name: &str) -> Option<Value> {
        match name {
            "count" => Some(Value::I64(self.count.load(Ordering::SeqCst))),
            _ => None,
        }
    }

    fn set_field(&self, name: &str, value: Value) -> Result<(), FieldError> {
        match name {
            "count" => {
                self.count.store(read_i64(name, value)?, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(FieldError::Unknown(name.to_string())),
        }
    }

    fn methods(self: Arc<Self>) -> Vec<MethodDecl> {
        vec![ping_method(self.count.clone()), reset_method(self.count.clone())]
    }

    fn as_entry(&self) -> Option<&dyn PluginEntry> {
        Some(self)
    }
}

impl PluginEntry for PingV1 {}

#[derive(Default)]
pub struct PingV2 {
    count: Arc<AtomicI64>,
    n: AtomicI64,
}

impl PluginObject for PingV2 {
    fn type_name(&self) -> &'static str {
        "Ping"
    }

    fn fields(&self) -> Vec<FieldDecl> {
        vec![COUNT, N]
    }

    fn get_field(&self, name: &str) -> Option<Value> {
        match name {
            "count" => Some(Value::I64(self.count.load(Ordering::SeqCst))),
            "n" => Some(Value::I64(self.n.load(Ordering::SeqCst))),
            _ => None,
        }
    }

    fn set_field(&self, name: &str, value: Value) -> Result<(), FieldError> {
        let v = read_i64(name, value)?;
        match name {
            "count" => self.count.store(v, Ordering::SeqCst),
            "n" => self.n.store(v, Ordering::SeqCst),
            _ => return Err(FieldError::Unknown(name.to_string())),
        }
        Ok(())
    }

    fn methods(self: Arc<Self>) -> Vec<MethodDecl> {
        vec![ping_method(self.count.clone()), reset_method(self.count.clone())]
    }

    fn as_entry(&self) -> Option<&dyn PluginEntry> {
        Some(self)
    }
}

impl PluginEntry for PingV2 {}

/// v3 drops `count` entirely
#[derive(Default)]
pub struct PingV3 {
    n: AtomicI64,
}

impl PluginObject for PingV3 {
    fn type_name(&self) -> &'static str {
        "Ping"
    }

    fn fields(&self) -> Vec<FieldDecl> {
        vec![N]
    }

    fn get_field(&self, name: &str) -> Option<Value> {
        (name == "n").then(|| Value::I64(self.n.load(Ordering::SeqCst)))
    }

    fn set_field(&self, name: &str, value: Value) -> Result<(), FieldError> {
        if name != "n" {
            return Err(FieldError::Unknown(name.to_string()));
        }
        self.n.store(read_i64(name, value)?, Ordering::SeqCst);
        Ok(())
    }

    fn methods(self: Arc<Self>) -> Vec<MethodDecl> {
        vec![
            MethodDecl::new("ping", Signature::nullary(TypeTag::Unit), |_| Ok(Value::Unit))
                .tagged(Tag::command("ping")),
        ]
    }

    fn as_entry(&self) -> Option<&dyn PluginEntry> {
        Some(self)
    }
}

impl PluginEntry for PingV3 {}

fn create_ping_v1() -> ObjectRef {
    Arc::new(PingV1::default())
}

fn create_ping_v2() -> ObjectRef {
    Arc::new(PingV2::default())
}

fn create_ping_v3() -> ObjectRef {
    Arc::new(PingV3::default())
}

pub fn ping_v1_module() -> ModuleDescriptor {
    ModuleDescriptor::new("ping", "1.0.0")
        .with_type(TypeDescriptor::new("Ping").entry(create_ping_v1))
}

pub fn ping_v2_module() -> ModuleDescriptor {
    ModuleDescriptor::new("ping", "2.0.0")
        .with_type(TypeDescriptor::new("Ping").entry(create_ping_v2))
}

pub fn ping_v3_module() -> ModuleDescriptor {
    ModuleDescriptor::new("ping", "3.0.0")
        .with_type(TypeDescriptor::new("Ping").entry(create_ping_v3))
}

/// Declares `Ping` but marks nothing as the entry
pub fn no_entry_module() -> ModuleDescriptor {
    ModuleDescriptor::new("ping", "0.0.1").with_type(TypeDescriptor::new("Ping"))
}

/// Two entry types
pub fn two_entries_module() -> ModuleDescriptor {
    ModuleDescriptor::new("ping", "0.0.2")
        .with_type(TypeDescriptor::new("Ping").entry(create_ping_v1))
        .with_type(TypeDescriptor::new("Pong").entry(create_ping_v2))
}

// ---------------------------------------------------------------------------
// ring: A -> B -> A
// ---------------------------------------------------------------------------

pub struct RingA {
    b: Arc<RingB>,
}

pub struct RingB {
    a: Mutex<Weak<RingA>>,
}

fn flag_command(name: &'static str) -> MethodDecl {
    MethodDecl::new(name, Signature::nullary(TypeTag::Bool), |_| Ok(Value::Bool(true)))
        .tagged(Tag::command(name))
}

impl PluginObject for RingA {
    fn type_name(&self) -> &'static str {
        "RingA"
    }

    fn children(&self) -> Vec<ChildRef> {
        let b: ObjectRef = self.b.clone();
        vec![ChildRef::object("b", Some(b))]
    }

    fn methods(self: Arc<Self>) -> Vec<MethodDecl> {
        vec![flag_command("ring_a")]
    }

    fn as_entry(&self) -> Option<&dyn PluginEntry> {
        Some(self)
    }
}

impl PluginEntry for RingA {}

impl PluginObject for RingB {
    fn type_name(&self) -> &'static str {
        "RingB"
    }

    fn children(&self) -> Vec<ChildRef> {
        let a = self.a.lock().upgrade().map(|a| -> ObjectRef { a });
        vec![ChildRef::object("a", a)]
    }

    fn methods(self: Arc<Self>) -> Vec<MethodDecl> {
        vec![flag_command("ring_b")]
    }
}

fn create_ring() -> ObjectRef {
    let b = Arc::new(RingB {
        a: Mutex::new(Weak::new()),
    });
    let a = Arc::new(RingA { b: b.clone() });
    *b.a.lock() = Arc::downgrade(&a);
    a
}

pub fn ring_module() -> ModuleDescriptor {
    ModuleDescriptor::new("ring", "1.0.0")
        .with_type(TypeDescriptor::new("RingA").entry(create_ring))
        .with_type(TypeDescriptor::new("RingB"))
}

// ---------------------------------------------------------------------------
// calc: expression functions with configurable parameter lists
// ---------------------------------------------------------------------------

pub struct Calc {
    params: Vec<TypeTag>,
}

impl PluginObject for Calc {
    fn type_name(&self) -> &'static str {
        "Calc"
    }

    fn methods(self: Arc<Self>) -> Vec<MethodDecl> {
        let add = MethodDecl::new(
            "add",
            Signature::new(self.params.clone(), TypeTag::Word),
            |args| {
                let mut sum = 0usize;
                for index in 0..args.len() {
                    let v: usize = arg(args, index, TypeTag::Word)?;
                    sum = sum.wrapping_add(v);
                }
                Ok(Value::Word(sum))
            },
        )
        .tagged(Tag::expression("add"));
        vec![add, flag_command("calc")]
    }

    fn as_entry(&self) -> Option<&dyn PluginEntry> {
        Some(self)
    }
}

impl PluginEntry for Calc {}

fn create_calc() -> ObjectRef {
    Arc::new(Calc {
        params: vec![TypeTag::Word, TypeTag::Word],
    })
}

fn create_calc_wide() -> ObjectRef {
    Arc::new(Calc {
        params: vec![TypeTag::Word; 4],
    })
}

fn create_calc_str() -> ObjectRef {
    Arc::new(Calc {
        params: vec![TypeTag::Word, TypeTag::Str],
    })
}

pub fn calc_module() -> ModuleDescriptor {
    ModuleDescriptor::new("calc", "1.0.0").with_type(TypeDescriptor::new("Calc").entry(create_calc))
}

/// `add` takes four words
pub fn calc_wide_module() -> ModuleDescriptor {
    ModuleDescriptor::new("calc", "1.1.0")
        .with_type(TypeDescriptor::new("Calc").entry(create_calc_wide))
}

/// `add` takes a string
pub fn calc_str_module() -> ModuleDescriptor {
    ModuleDescriptor::new("calc", "1.2.0")
        .with_type(TypeDescriptor::new("Calc").entry(create_calc_str))
}

// ---------------------------------------------------------------------------
// hooks: counts lifecycle hooks
// ---------------------------------------------------------------------------

pub static HOOK_STARTS: AtomicUsize = AtomicUsize::new(0);
pub static HOOK_STOPS: AtomicUsize = AtomicUsize::new(0);

pub struct Hooks;

impl PluginObject for Hooks {
    fn type_name(&self) -> &'static str {
        "Hooks"
    }

    fn as_entry(&self) -> Option<&dyn PluginEntry> {
        Some(self)
    }
}

impl PluginEntry for Hooks {
    fn startup(&self) -> PluginResult<()> {
        HOOK_STARTS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) -> PluginResult<()> {
        HOOK_STOPS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn create_hooks() -> ObjectRef {
    Arc::new(Hooks)
}

pub fn hooks_module() -> ModuleDescriptor {
    ModuleDescriptor::new("hooks", "1.0.0")
        .with_type(TypeDescriptor::new("Hooks").entry(create_hooks))
}

/// Startup hook fails, or panics
pub struct Grumpy {
    panic: bool,
}

impl PluginObject for Grumpy {
    fn type_name(&self) -> &'static str {
        "Grumpy"
    }

    fn methods(self: Arc<Self>) -> Vec<MethodDecl> {
        vec![flag_command("grumble")]
    }

    fn as_entry(&self) -> Option<&dyn PluginEntry> {
        Some(self)
    }
}

impl PluginEntry for Grumpy {
    fn startup(&self) -> PluginResult<()> {
        if self.panic {
            panic!("startup exploded");
        }
        Err(PluginError::Other("not today".to_string()))
    }
}

fn create_grumpy() -> ObjectRef {
    Arc::new(Grumpy { panic: false })
}

fn create_panicky() -> ObjectRef {
    Arc::new(Grumpy { panic: true })
}

pub fn grumpy_module() -> ModuleDescriptor {
    ModuleDescriptor::new("grumpy", "1.0.0")
        .with_type(TypeDescriptor::new("Grumpy").entry(create_grumpy))
}

pub fn panicky_module() -> ModuleDescriptor {
    ModuleDescriptor::new("grumpy", "1.0.1")
        .with_type(TypeDescriptor::new("Grumpy").entry(create_panicky))
}

// ---------------------------------------------------------------------------
// beacon: counts hotload notifications in a transplanted field
// ---------------------------------------------------------------------------

const HOTLOADS: FieldDecl = FieldDecl::new("hotloads", TypeTag::I64);

#[derive(Default)]
pub struct Beacon {
    hotloads: AtomicI64,
}

impl PluginObject for Beacon {
    fn type_name(&self) -> &'static str {
        "Beacon"
    }

    fn fields(&self) -> Vec<FieldDecl> {
        vec![HOTLOADS]
    }

    fn get_field(&self, name: &str) -> Option<Value> {
        (name == "hotloads").then(|| Value::I64(self.hotloads.load(Ordering::SeqCst)))
    }

    fn set_field(&self, name: &str, value: Value) -> Result<(), FieldError> {
        if name != "hotloads" {
            return Err(FieldError::Unknown(name.to_string()));
        }
        self.hotloads.store(read_i64(name, value)?, Ordering::SeqCst);
        Ok(())
    }

    fn as_entry(&self) -> Option<&dyn PluginEntry> {
        Some(self)
    }

    fn as_hotload(&self) -> Option<&dyn Hotload> {
        Some(self)
    }
}

impl PluginEntry for Beacon {}

impl Hotload for Beacon {
    fn on_hotload(&self) -> PluginResult<()> {
        self.hotloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn create_beacon() -> ObjectRef {
    Arc::new(Beacon::default())
}

pub fn beacon_module() -> ModuleDescriptor {
    ModuleDescriptor::new("beacon", "1.0.0")
        .with_type(TypeDescriptor::new("Beacon").entry(create_beacon))
}

// ---------------------------------------------------------------------------
// farewell: records whether its command is still reachable during shutdown
// ---------------------------------------------------------------------------

thread_local! {
    static WATCHED: RefCell<Option<Arc<Commands>>> = const { RefCell::new(None) };
    static SEEN_AT_SHUTDOWN: Cell<Option<bool>> = const { Cell::new(None) };
}

/// Let farewell shutdowns on this thread look into `commands`
pub fn watch_commands(commands: Arc<Commands>) {
    WATCHED.with(|w| *w.borrow_mut() = Some(commands));
}

/// Whether `farewell` was still registered when the last shutdown ran
pub fn command_seen_at_shutdown() -> Option<bool> {
    SEEN_AT_SHUTDOWN.with(Cell::get)
}

pub struct Farewell;

impl PluginObject for Farewell {
    fn type_name(&self) -> &'static str {
        "Farewell"
    }

    fn methods(self: Arc<Self>) -> Vec<MethodDecl> {
        vec![flag_command("farewell")]
    }

    fn as_entry(&self) -> Option<&dyn PluginEntry> {
        Some(self)
    }
}

impl PluginEntry for Farewell {
    fn shutdown(&self) -> PluginResult<()> {
        let seen = WATCHED.with(|w| w.borrow().as_ref().map(|c| c.contains("farewell")));
        SEEN_AT_SHUTDOWN.with(|s| s.set(seen));
        Ok(())
    }
}

fn create_farewell() -> ObjectRef {
    Arc::new(Farewell)
}

pub fn farewell_module() -> ModuleDescriptor {
    ModuleDescriptor::new("farewell", "1.0.0")
        .with_type(TypeDescriptor::new("Farewell").entry(create_farewell))
}
