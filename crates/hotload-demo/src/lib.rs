//! 计数器插件
//!
//! A counter plugin module. Built as a `cdylib` it can be dropped into a
//! `hotload run` plugin directory; rebuilding it while the host runs swaps the
//! code in place and keeps `count`, `label` and the stats child.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use hotload_kernel::module::StaticState;
use hotload_kernel::{
    ChildRef, FieldDecl, FieldError, Hotload, MenuParent, MethodDecl, ModuleDescriptor, ObjectRef,
    PluginEntry, PluginObject, PluginResult, Signature, Tag, TypeDescriptor, TypeTag, Value, arg,
    expect_field,
};
use parking_lot::Mutex;
use tracing::{debug, info};

/// Total of every increment since the module was first loaded
static TOTAL: AtomicI64 = AtomicI64::new(0);

const COUNT: FieldDecl = FieldDecl::new("count", TypeTag::I64);
const LABEL: FieldDecl = FieldDecl::new("label", TypeTag::Str);
const HITS: FieldDecl = FieldDecl::new("hits", TypeTag::U64);
const TOTAL_FIELD: FieldDecl = FieldDecl::new("total", TypeTag::I64);

fn mismatch(field: &str, expected: TypeTag, actual: &Value) -> FieldError {
    FieldError::TypeMismatch {
        field: field.to_string(),
        expected,
        actual: actual.tag(),
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Usage statistics, kept as a child of the counter.
#[derive(Default)]
pub struct Stats {
    hits: AtomicU64,
}

impl PluginObject for Stats {
    fn type_name(&self) -> &'static str {
        "Stats"
    }

    fn fields(&self) -> Vec<FieldDecl> {
        vec![HITS]
    }

    fn get_field(&self, name: &str) -> Option<Value> {
        (name == "hits").then(|| Value::U64(self.hits.load(Ordering::Relaxed)))
    }

    fn set_field(&self, name: &str, value: Value) -> Result<(), FieldError> {
        if name != "hits" {
            return Err(FieldError::Unknown(name.to_string()));
        }
        match expect_field(name, TypeTag::U64, value)? {
            Value::U64(v) => {
                self.hits.store(v, Ordering::Relaxed);
                Ok(())
            }
            other => Err(mismatch(name, TypeTag::U64, &other)),
        }
    }

    fn methods(self: Arc<Self>) -> Vec<MethodDecl> {
        vec![
            MethodDecl::new("hits", Signature::nullary(TypeTag::Word), move |_| {
                Ok(Value::Word(self.hits.load(Ordering::Relaxed) as usize))
            })
            .tagged(Tag::expression("counter_hits")),
        ]
    }
}

// ============================================================================
// Counter
// ============================================================================

/// The module's entry type.
pub struct Counter {
    count: AtomicI64,
    label: Mutex<String>,
    stats: Arc<Stats>,
}

impl Counter {
    fn create() -> ObjectRef {
        Arc::new(Counter {
            count: AtomicI64::new(0),
            label: Mutex::new("hits".to_string()),
            stats: Arc::new(Stats::default()),
        })
    }

    fn bump(&self, by: i64) -> i64 {
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        TOTAL.fetch_add(by, Ordering::Relaxed);
        self.count.fetch_add(by, Ordering::Relaxed) + by
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }
}

impl PluginObject for Counter {
    fn type_name(&self) -> &'static str {
        "Counter"
    }

    fn fields(&self) -> Vec<FieldDecl> {
        vec![COUNT, LABEL]
    }

    fn get_field(&self, name: &str) -> Option<Value> {
        match name {
            "count" => Some(Value::I64(self.count.load(Ordering::Relaxed))),
            "label" => Some(Value::Str(self.label.lock().clone())),
            _ => None,
        }
    }

    fn set_field(&self, name: &str, value: Value) -> Result<(), FieldError> {
        match (name, value) {
            ("count", value) => match expect_field(name, TypeTag::I64, value)? {
                Value::I64(v) => self.count.store(v, Ordering::Relaxed),
                other => return Err(mismatch(name, TypeTag::I64, &other)),
            },
            ("label", Value::Str(v)) => *self.label.lock() = v,
            ("label", other) => return Err(mismatch(name, TypeTag::Str, &other)),
            _ => return Err(FieldError::Unknown(name.to_string())),
        }
        Ok(())
    }

    fn children(&self) -> Vec<ChildRef> {
        let stats: ObjectRef = self.stats.clone();
        vec![ChildRef::object("stats", Some(stats))]
    }

    fn methods(self: Arc<Self>) -> Vec<MethodDecl> {
        let count = {
            let this = self.clone();
            MethodDecl::new(
                "count",
                Signature::new([TypeTag::StrList], TypeTag::Bool),
                move |args| {
                    let args: Vec<String> = arg(args, 0, TypeTag::StrList)?;
                    let by = match args.first() {
                        Some(raw) => match raw.parse::<i64>() {
                            Ok(by) => by,
                            Err(_) => return Ok(Value::Bool(false)),
                        },
                        None => 1,
                    };
                    let now = this.bump(by);
                    info!(count = now, "counted");
                    Ok(Value::Bool(true))
                },
            )
            .tagged(Tag::command("count"))
        };

        let show = {
            let this = self.clone();
            MethodDecl::new("show", Signature::nullary(TypeTag::Unit), move |_| {
                info!(
                    label = %this.label.lock(),
                    count = this.count.load(Ordering::Relaxed),
                    total = TOTAL.load(Ordering::Relaxed),
                    "counter"
                );
                Ok(Value::Unit)
            })
            .tagged(Tag::command("count_show"))
        };

        let clear = {
            let this = self.clone();
            MethodDecl::new("clear", Signature::nullary(TypeTag::Bool), move |_| {
                this.reset();
                Ok(Value::Bool(true))
            })
            .tagged(Tag::debug_command("count_clear"))
        };

        let get = {
            let this = self.clone();
            MethodDecl::new("get", Signature::nullary(TypeTag::Word), move |_| {
                Ok(Value::Word(this.count.load(Ordering::Relaxed).max(0) as usize))
            })
            .tagged(Tag::expression("counter_get"))
        };

        let add = {
            let this = self.clone();
            MethodDecl::new(
                "add",
                Signature::new([TypeTag::Word, TypeTag::Word], TypeTag::Word),
                move |args| {
                    let a: usize = arg(args, 0, TypeTag::Word)?;
                    let b: usize = arg(args, 1, TypeTag::Word)?;
                    let count = this.count.load(Ordering::Relaxed).max(0) as usize;
                    Ok(Value::Word(a.wrapping_add(b).wrapping_add(count)))
                },
            )
            .tagged(Tag::expression("counter_add"))
        };

        let reset = MethodDecl::new(
            "reset",
            Signature::new([TypeTag::MenuItem], TypeTag::Unit),
            move |_| {
                self.reset();
                Ok(Value::Unit)
            },
        )
        .tagged(Tag::menu("Reset", MenuParent::Main))
        .tagged(Tag::menu("Counter/Reset", MenuParent::Dump));

        vec![count, show, clear, get, add, reset]
    }

    fn as_entry(&self) -> Option<&dyn PluginEntry> {
        Some(self)
    }

    fn as_hotload(&self) -> Option<&dyn Hotload> {
        Some(self)
    }
}

impl PluginEntry for Counter {
    fn startup(&self) -> PluginResult<()> {
        info!(version = env!("CARGO_PKG_VERSION"), "counter started");
        Ok(())
    }

    fn shutdown(&self) -> PluginResult<()> {
        info!(count = self.count.load(Ordering::Relaxed), "counter stopped");
        Ok(())
    }
}

impl Hotload for Counter {
    fn on_hotload(&self) -> PluginResult<()> {
        debug!(count = self.count.load(Ordering::Relaxed), "counter reloaded");
        Ok(())
    }
}

// ============================================================================
// Statics
// ============================================================================

fn static_fields() -> Vec<FieldDecl> {
    vec![TOTAL_FIELD]
}

fn get_static(name: &str) -> Option<Value> {
    (name == "total").then(|| Value::I64(TOTAL.load(Ordering::Relaxed)))
}

fn set_static(name: &str, value: Value) -> Result<(), FieldError> {
    if name != "total" {
        return Err(FieldError::Unknown(name.to_string()));
    }
    match expect_field(name, TypeTag::I64, value)? {
        Value::I64(v) => {
            TOTAL.store(v, Ordering::Relaxed);
            Ok(())
        }
        other => Err(mismatch(name, TypeTag::I64, &other)),
    }
}

/// Everything this module defines
pub fn module() -> ModuleDescriptor {
    ModuleDescriptor::new("counter", env!("CARGO_PKG_VERSION"))
        .with_type(
            TypeDescriptor::new("Counter")
                .entry(Counter::create)
                .with_statics(StaticState {
                    fields: static_fields,
                    get: get_static,
                    set: set_static,
                }),
        )
        .with_type(TypeDescriptor::new("Stats"))
}

hotload_kernel::export_module!(module());
