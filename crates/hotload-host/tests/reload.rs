//! Hot reload tests: transplant, capability rescans and signature validation.

mod common;

use std::path::Path;

use hotload_host::kernel::{StateBag, Value};
use hotload_host::{HostEvent, PluginState, RegistryError};
use tokio_util::sync::CancellationToken;

use common::Fixture;
use common::plugins;

fn field(state: &StateBag, name: &str) -> Option<Value> {
    state.get(name).map(|tagged| tagged.value.clone())
}

#[tokio::test]
async fn test_ping_survives_reload_to_v2() {
    let fx = Fixture::new();
    fx.add("ping", "plugins/libping-1.so", plugins::ping_v1_module);
    fx.backend.register("plugins/libping-2.so", plugins::ping_v2_module);
    let cancel = CancellationToken::new();
    let mut events = fx.host.subscribe();

    assert!(fx.host.load("ping", &cancel).await);
    assert_eq!(fx.commands.owner_of("ping").as_deref(), Some("ping"));
    assert_eq!(fx.commands.execute("ping", &[], false).unwrap(), true);

    assert!(
        fx.host
            .reload("ping", Path::new("plugins/libping-2.so"), &cancel)
            .await
    );

    // One entry, bound to the new instance
    assert_eq!(fx.commands.names_for("ping"), vec!["ping".to_string()]);
    assert_eq!(fx.commands.len(), 1);
    assert_eq!(fx.commands.execute("ping", &[], false).unwrap(), true);

    let state = fx.host.snapshot("ping").await.unwrap();
    assert_eq!(field(&state, "count"), Some(Value::I64(2)));
    assert_eq!(field(&state, "n"), Some(Value::I64(0)));

    let info = fx.host.info("ping").await.unwrap();
    assert_eq!(info.state, PluginState::Loaded);
    assert_eq!(info.module_version.as_deref(), Some("2.0.0"));
    assert_eq!(info.reload_count, 1);

    assert!(matches!(events.try_recv(), Ok(HostEvent::Loaded { .. })));
    match events.try_recv() {
        Ok(HostEvent::Reloaded { version, transplant, .. }) => {
            assert_eq!(version, "2.0.0");
            assert_eq!(transplant.fields_copied, 1);
            assert_eq!(transplant.skipped, 1);
        }
        other => panic!("expected a reload event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_dropped_field_keeps_default() {
    let fx = Fixture::new();
    fx.add("ping", "libping-2.so", plugins::ping_v2_module);
    fx.backend.register("libping-3.so", plugins::ping_v3_module);
    let cancel = CancellationToken::new();

    assert!(fx.host.load("ping", &cancel).await);
    for _ in 0..7 {
        fx.commands.execute("ping", &[], false).unwrap();
    }

    assert!(fx.host.reload("ping", Path::new("libping-3.so"), &cancel).await);

    let state = fx.host.snapshot("ping").await.unwrap();
    assert_eq!(field(&state, "count"), None);
    assert_eq!(field(&state, "n"), Some(Value::I64(0)));
    assert!(fx.commands.execute("ping", &[], false).unwrap());
}

#[tokio::test]
async fn test_rebuilt_module_at_same_path() {
    let fx = Fixture::new();
    fx.add("ping", "libping.so", plugins::ping_v1_module);
    let cancel = CancellationToken::new();

    assert!(fx.host.load("ping", &cancel).await);
    fx.commands.execute("ping", &[], false).unwrap();

    fx.backend.register("libping.so", plugins::ping_v2_module);
    assert!(fx.host.load("ping", &cancel).await);

    let state = fx.host.snapshot("ping").await.unwrap();
    assert_eq!(field(&state, "count"), Some(Value::I64(1)));
    assert_eq!(
        fx.host.info("ping").await.unwrap().module_version.as_deref(),
        Some("2.0.0")
    );
}

#[tokio::test]
async fn test_menu_action_runs_against_live_instance() {
    let fx = Fixture::new();
    fx.add("ping", "libping-1.so", plugins::ping_v1_module);
    fx.backend.register("libping-2.so", plugins::ping_v2_module);
    let cancel = CancellationToken::new();

    assert!(fx.host.load("ping", &cancel).await);
    assert!(fx.host.reload("ping", Path::new("libping-2.so"), &cancel).await);
    fx.commands.execute("ping", &[], false).unwrap();

    assert!(fx.menus.trigger("Main/ping/Reset").unwrap());
    assert!(!fx.menus.trigger("Main/ping").unwrap());

    let state = fx.host.snapshot("ping").await.unwrap();
    assert_eq!(field(&state, "count"), Some(Value::I64(0)));
}

#[tokio::test]
async fn test_cyclic_graph_registers_each_member_once() {
    let fx = Fixture::new();
    fx.add("ring", "libring.so", plugins::ring_module);

    assert!(fx.host.load("ring", &CancellationToken::new()).await);

    let mut names = fx.commands.names_for("ring");
    names.sort();
    assert_eq!(names, vec!["ring_a".to_string(), "ring_b".to_string()]);
    assert_eq!(fx.commands.len(), 2);
    assert_eq!(fx.menus.paths_for("ring"), vec!["Main/ring".to_string()]);
}

#[tokio::test]
async fn test_expression_registration() {
    let fx = Fixture::new();
    fx.add("calc", "libcalc.so", plugins::calc_module);

    assert!(fx.host.load("calc", &CancellationToken::new()).await);
    assert_eq!(fx.expressions.arity("add"), Some(2));
    assert_eq!(fx.expressions.evaluate("add", &[2, 3]).unwrap(), 5);
    assert!(matches!(
        fx.expressions.evaluate("add", &[1]),
        Err(RegistryError::Arity { expected: 2, actual: 1, .. })
    ));
}

#[tokio::test]
async fn test_invalid_expression_signatures_fail_the_load() {
    let fx = Fixture::new();
    fx.add("calc", "libcalc.so", plugins::calc_module);
    fx.backend.register("libcalc-wide.so", plugins::calc_wide_module);
    fx.backend.register("libcalc-str.so", plugins::calc_str_module);
    let cancel = CancellationToken::new();

    assert!(fx.host.load("calc", &cancel).await);

    for path in ["libcalc-wide.so", "libcalc-str.so"] {
        assert!(!fx.host.reload("calc", Path::new(path), &cancel).await);

        let info = fx.host.info("calc").await.unwrap();
        assert_eq!(info.state, PluginState::Unloaded);
        assert!(info.last_error.unwrap().contains("add"));
        assert!(fx.expressions.is_empty());
        assert_eq!(fx.registered("calc"), 0);
    }

    // The last good module path is kept
    assert!(fx.host.load("calc", &cancel).await);
    assert_eq!(fx.expressions.evaluate("add", &[4, 4]).unwrap(), 8);
}

#[tokio::test]
async fn test_failed_reload_needs_fresh_load() {
    let fx = Fixture::new();
    fx.add("ping", "libping.so", plugins::ping_v1_module);
    let cancel = CancellationToken::new();
    let mut events = fx.host.subscribe();

    assert!(fx.host.load("ping", &cancel).await);
    fx.commands.execute("ping", &[], false).unwrap();

    assert!(!fx.host.reload("ping", Path::new("libmissing.so"), &cancel).await);
    assert_eq!(fx.host.state("ping").await, Some(PluginState::Unloaded));
    assert!(fx.host.current_module("ping").is_none());
    assert!(fx.commands.is_empty());

    // State is not rolled back: the plugin starts over
    assert!(fx.host.load("ping", &cancel).await);
    let state = fx.host.snapshot("ping").await.unwrap();
    assert_eq!(field(&state, "count"), Some(Value::I64(0)));

    let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert!(matches!(kinds[1], HostEvent::LoadFailed { .. }));
    assert!(matches!(kinds[2], HostEvent::Loaded { .. }));
}

#[tokio::test]
async fn test_reloads_of_one_plugin_are_serialized() {
    let fx = Fixture::new();
    fx.add("ping", "libping-1.so", plugins::ping_v1_module);
    fx.backend.register("libping-2.so", plugins::ping_v2_module);
    let cancel = CancellationToken::new();

    assert!(fx.host.load("ping", &cancel).await);
    fx.commands.execute("ping", &[], false).unwrap();

    let (a, b) = tokio::join!(
        fx.host.reload("ping", Path::new("libping-2.so"), &cancel),
        fx.host.reload("ping", Path::new("libping-1.so"), &cancel),
    );
    assert!(a && b);

    assert_eq!(fx.commands.len(), 1);
    assert_eq!(fx.host.info("ping").await.unwrap().reload_count, 2);
    let state = fx.host.snapshot("ping").await.unwrap();
    assert_eq!(field(&state, "count"), Some(Value::I64(1)));
}
