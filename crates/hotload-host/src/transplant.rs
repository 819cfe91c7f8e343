//! State transplant engine
//!
//! Carries a plugin's state from the object graph of a retiring module into
//! the freshly constructed graph of its replacement. The two versions of a
//! type share no layout, so objects are paired by type name and fields are
//! copied by name when their declared tags are assignable. Anything that
//! does not match keeps the new version's default.

use std::collections::{HashMap, HashSet};
use std::fmt;

use hotload_kernel::{
    FieldDecl, MemberShape, ObjectRef, StaticState, TypeTag, Value, object_id,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::LoadError;
use crate::guard;
use crate::loader::ModuleHandle;

/// Why a field or object was not carried over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The new version added it; it keeps its default
    MissingInOld,
    /// The new version dropped it
    NotInNew,
    /// Declared with tags that are not assignable
    TypeChanged { old: TypeTag, new: TypeTag },
    /// The old object did not produce a value
    Unreadable,
    /// The new object refused the value
    Rejected(String),
    /// Same-named members hold objects of different types
    ClassMismatch { old: String, new: String },
    /// The new graph has no object at this member
    NoTarget,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingInOld => f.write_str("not present in old version"),
            SkipReason::NotInNew => f.write_str("not present in new version"),
            SkipReason::TypeChanged { old, new } => write!(f, "type changed from {old} to {new}"),
            SkipReason::Unreadable => f.write_str("old value unreadable"),
            SkipReason::Rejected(reason) => write!(f, "rejected: {reason}"),
            SkipReason::ClassMismatch { old, new } => {
                write!(f, "class changed from {old} to {new}")
            }
            SkipReason::NoTarget => f.write_str("no object in new graph"),
        }
    }
}

/// A skipped field, static or member, addressed as `Type.field` or `Type::static`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skip {
    pub path: String,
    pub reason: SkipReason,
}

/// Detailed outcome of a transplant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransplantReport {
    pub statics_copied: usize,
    pub fields_copied: usize,
    /// Object members pointed at a carried-over object
    pub references_copied: usize,
    /// Old/new object pairs whose fields were merged
    pub objects_paired: usize,
    /// Hotload participants notified
    pub notified: usize,
    pub notify_failures: usize,
    pub skipped: Vec<Skip>,
}

impl TransplantReport {
    fn skip(&mut self, path: String, reason: SkipReason) {
        debug!(path = %path, reason = %reason, "transplant skip");
        self.skipped.push(Skip { path, reason });
    }

    /// Skips recorded for `path`
    pub fn skipped_for(&self, path: &str) -> Option<&SkipReason> {
        self.skipped
            .iter()
            .find(|s| s.path == path)
            .map(|s| &s.reason)
    }

    pub fn summary(&self) -> TransplantSummary {
        TransplantSummary {
            statics_copied: self.statics_copied,
            fields_copied: self.fields_copied,
            references_copied: self.references_copied,
            objects_paired: self.objects_paired,
            notified: self.notified,
            skipped: self.skipped.len(),
        }
    }
}

/// Counters of a transplant, as carried by host events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransplantSummary {
    pub statics_copied: usize,
    pub fields_copied: usize,
    pub references_copied: usize,
    pub objects_paired: usize,
    pub notified: usize,
    pub skipped: usize,
}

/// Scope of one instance construction and, on reload, one transplant.
///
/// Holds the outgoing module (if any) and the old/new pairing. It must be
/// dropped before the outgoing module is retired.
pub struct TransplantContext {
    old_module: Option<ModuleHandle>,
    new_module: ModuleHandle,
    /// old object id -> new object
    paired: HashMap<usize, ObjectRef>,
    visited: HashSet<usize>,
}

impl TransplantContext {
    pub fn new(old_module: Option<ModuleHandle>, new_module: ModuleHandle) -> Self {
        Self {
            old_module,
            new_module,
            paired: HashMap::new(),
            visited: HashSet::new(),
        }
    }

    pub fn new_module(&self) -> &ModuleHandle {
        &self.new_module
    }

    pub fn old_module(&self) -> Option<&ModuleHandle> {
        self.old_module.as_ref()
    }

    /// Construct the new module's entry type.
    pub fn create(&self) -> Result<ObjectRef, LoadError> {
        let entry = self.new_module.entry_type()?;
        let Some(ctor) = entry.entry else {
            return Err(LoadError::NoEntryType(self.new_module.name().to_string()));
        };

        guard::catch(ctor).map_err(|message| LoadError::ConstructorPanicked {
            type_name: entry.name.to_string(),
            message,
        })
    }

    /// Whether `type_name` is defined by either module version
    fn owns(&self, type_name: &str) -> bool {
        self.new_module.declares(type_name)
            || self
                .old_module
                .as_ref()
                .is_some_and(|m| m.declares(type_name))
    }

    /// New object paired with the old object `old`
    pub fn paired(&self, old: &ObjectRef) -> Option<&ObjectRef> {
        self.paired.get(&object_id(old))
    }
}

impl fmt::Debug for TransplantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransplantContext")
            .field("old_module", &self.old_module.as_ref().map(|m| m.id()))
            .field("new_module", &self.new_module.id())
            .field("paired", &self.paired.len())
            .finish()
    }
}

/// Copy every field declared on both sides, in declaration order of `new`.
fn copy_fields(
    owner: &str,
    sep: &str,
    old: &[FieldDecl],
    read: impl Fn(&str) -> Option<Value>,
    new: &[FieldDecl],
    write: impl Fn(&str, Value) -> Result<(), hotload_kernel::FieldError>,
    report: &mut TransplantReport,
) -> usize {
    let old_tags: HashMap<&str, TypeTag> = old.iter().map(|d| (d.name, d.tag)).collect();
    let new_names: HashSet<&str> = new.iter().map(|d| d.name).collect();
    let mut copied = 0;

    for decl in new {
        let path = format!("{owner}{sep}{}", decl.name);
        let Some(&old_tag) = old_tags.get(decl.name) else {
            report.skip(path, SkipReason::MissingInOld);
            continue;
        };
        if !old_tag.is_assignable_to(decl.tag) {
            report.skip(path, SkipReason::TypeChanged {
                old: old_tag,
                new: decl.tag,
            });
            continue;
        }
        let Some(value) = guard::catch(|| read(decl.name)).ok().flatten() else {
            report.skip(path, SkipReason::Unreadable);
            continue;
        };
        let Some(value) = value.coerce(decl.tag) else {
            report.skip(path, SkipReason::TypeChanged {
                old: old_tag,
                new: decl.tag,
            });
            continue;
        };
        match guard::catch(|| write(decl.name, value)) {
            Ok(Ok(())) => copied += 1,
            Ok(Err(e)) => report.skip(path, SkipReason::Rejected(e.to_string())),
            Err(panic) => report.skip(path, SkipReason::Rejected(panic)),
        }
    }

    for decl in old.iter().filter(|d| !new_names.contains(d.name)) {
        report.skip(format!("{owner}{sep}{}", decl.name), SkipReason::NotInNew);
    }

    copied
}

/// Copy static state between same-named types of the old and new module.
pub fn adapt_statics(ctx: &TransplantContext, report: &mut TransplantReport) {
    let Some(old_module) = &ctx.old_module else {
        return;
    };

    for old_type in &old_module.descriptor().types {
        let Some(old_statics) = old_type.statics else {
            continue;
        };
        let Some(new_statics) = ctx
            .new_module
            .descriptor()
            .find_type(old_type.name)
            .and_then(|t| t.statics)
        else {
            continue;
        };

        let StaticState {
            fields: old_fields,
            get,
            ..
        } = old_statics;
        let StaticState {
            fields: new_fields,
            set,
            ..
        } = new_statics;

        let (Ok(old_decls), Ok(new_decls)) = (guard::catch(old_fields), guard::catch(new_fields))
        else {
            warn!(type_name = old_type.name, "static field table panicked");
            continue;
        };

        let copied = copy_fields(old_type.name, "::", &old_decls, get, &new_decls, set, report);
        report.statics_copied += copied;
    }
}

/// An empty member of the new graph waiting for its old object to be paired.
struct Vacancy {
    owner: ObjectRef,
    member: &'static str,
    old: ObjectRef,
    path: String,
}

fn point_member(
    owner: &ObjectRef,
    member: &str,
    object: ObjectRef,
    path: String,
    report: &mut TransplantReport,
) {
    match guard::catch(|| owner.set_child(member, Some(object))) {
        Ok(Ok(())) => report.references_copied += 1,
        Ok(Err(e)) => report.skip(path, SkipReason::Rejected(e.to_string())),
        Err(panic) => report.skip(path, SkipReason::Rejected(panic)),
    }
}

/// Merge the old instance graph into the new one, pairing objects by type.
///
/// Members holding host objects are pointed at the same host object in the
/// new graph. Members holding plugin objects are paired with the new graph's
/// object of the same type and merged recursively; an empty new member takes
/// whichever new object its old target was paired with.
pub fn adapt_instance(
    ctx: &mut TransplantContext,
    old_root: &ObjectRef,
    new_root: &ObjectRef,
    report: &mut TransplantReport,
) {
    let mut stack = vec![(old_root.clone(), new_root.clone())];
    let mut vacancies = Vec::new();

    while let Some((old, new)) = stack.pop() {
        if !ctx.visited.insert(object_id(&new)) {
            continue;
        }
        let old_type = old.type_name();
        let new_type = new.type_name();

        if !ctx.new_module.declares(new_type) {
            continue;
        }
        if old_type != new_type {
            report.skip(new_type.to_string(), SkipReason::ClassMismatch {
                old: old_type.to_string(),
                new: new_type.to_string(),
            });
            continue;
        }

        ctx.paired.insert(object_id(&old), new.clone());
        report.objects_paired += 1;

        let copied = copy_fields(
            new_type,
            ".",
            &old.fields(),
            |name| old.get_field(name),
            &new.fields(),
            |name, value| new.set_field(name, value),
            report,
        );
        report.fields_copied += copied;

        let mut old_children: HashMap<&str, ObjectRef> = old
            .children()
            .into_iter()
            .filter_map(|c| c.walkable().cloned().map(|o| (c.name, o)))
            .collect();

        let mut pairs = Vec::new();
        for child in new.children() {
            let Some(old_child) = old_children.remove(child.name) else {
                continue;
            };
            let path = format!("{new_type}.{}", child.name);

            if !ctx.owns(old_child.type_name()) {
                let same = child
                    .walkable()
                    .is_some_and(|current| object_id(current) == object_id(&old_child));
                if !same {
                    point_member(&new, child.name, old_child, path, report);
                }
                continue;
            }

            match child.walkable() {
                Some(new_child) if new_child.type_name() == old_child.type_name() => {
                    pairs.push((old_child, new_child.clone()));
                }
                Some(new_child) => report.skip(path, SkipReason::ClassMismatch {
                    old: old_child.type_name().to_string(),
                    new: new_child.type_name().to_string(),
                }),
                None if child.shape == MemberShape::Object => vacancies.push(Vacancy {
                    owner: new.clone(),
                    member: child.name,
                    old: old_child,
                    path,
                }),
                None => report.skip(path, SkipReason::NoTarget),
            }
        }
        for name in old_children.into_keys() {
            report.skip(format!("{new_type}.{name}"), SkipReason::NotInNew);
        }
        stack.extend(pairs.into_iter().rev());
    }

    for vacancy in vacancies {
        let Vacancy {
            owner,
            member,
            old,
            path,
        } = vacancy;
        match ctx.paired.get(&object_id(&old)).cloned() {
            Some(target) => point_member(&owner, member, target, path, report),
            None => report.skip(path, SkipReason::NoTarget),
        }
    }
}

/// Objects of the new graph in discovery order, restricted to the module's types.
fn discover(ctx: &TransplantContext, root: &ObjectRef) -> Vec<ObjectRef> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![root.clone()];

    while let Some(node) = stack.pop() {
        if !seen.insert(object_id(&node)) || !ctx.new_module.declares(node.type_name()) {
            continue;
        }
        let children: Vec<ObjectRef> = node
            .children()
            .iter()
            .filter_map(|c| c.walkable().cloned())
            .collect();
        stack.extend(children.into_iter().rev());
        order.push(node);
    }
    order
}

/// Tell every hotload participant of the new graph that its state arrived.
pub fn notify_hotload(
    ctx: &TransplantContext,
    new_root: &ObjectRef,
    report: &mut TransplantReport,
) {
    for node in discover(ctx, new_root) {
        let Some(participant) = node.as_hotload() else {
            continue;
        };
        report.notified += 1;
        if let Err(e) = guard::guard_hook("on_hotload", || participant.on_hotload()) {
            report.notify_failures += 1;
            warn!(type_name = node.type_name(), error = %e, "hotload notification failed");
        }
    }
}

/// Carry statics and instance state from `old_instance` into `new_instance`.
pub fn transplant(
    ctx: &mut TransplantContext,
    old_instance: &ObjectRef,
    new_instance: &ObjectRef,
) -> TransplantReport {
    let mut report = TransplantReport::default();

    adapt_statics(ctx, &mut report);
    adapt_instance(ctx, old_instance, new_instance, &mut report);
    notify_hotload(ctx, new_instance, &mut report);

    debug!(
        statics = report.statics_copied,
        fields = report.fields_copied,
        objects = report.objects_paired,
        notified = report.notified,
        skipped = report.skipped.len(),
        "transplant complete"
    );
    report
}
