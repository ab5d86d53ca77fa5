//! Namespace population, finalization and capability attachment

use crate::common::{capture_sandbox, eval, lua_engines, setup_test_logging};
use assert_matches::assert_matches;
use consoles_sandbox::{
    CapabilityRegistry, FunctionPool, HostFunction, NamedFunction, SandboxBuilder, SandboxError,
    ScriptValue,
};
use std::collections::BTreeSet;

fn constant(value: i64) -> HostFunction {
    HostFunction::new(move |_| Ok(ScriptValue::Integer(value)))
}

fn names(sandbox: &consoles_sandbox::Sandbox) -> BTreeSet<String> {
    sandbox.global_names().unwrap().into_iter().collect()
}

#[test]
fn test_base_namespace() {
    setup_test_logging();
    let engines = lua_engines();
    let (sandbox, _) = capture_sandbox(&engines, FunctionPool::new());
    let names = names(&sandbox);

    for present in [
        "print", "pcall", "xpcall", "require", "package", "bit32", "table", "string", "math",
        "io", "__impl",
    ] {
        assert!(names.contains(present), "missing {}", present);
    }
    for absent in ["load", "loadfile", "dofile", "coroutine", "os", "debug"] {
        assert!(!names.contains(absent), "unexpected {}", absent);
    }
    assert_eq!(sandbox.global("__impl").unwrap(), ScriptValue::from("lua54"));
}

#[test]
fn test_pool_adds_exactly_its_names() {
    let engines = lua_engines();
    let (base, _) = capture_sandbox(&engines, FunctionPool::new());

    let mut pool = FunctionPool::new();
    pool.bind("alpha", constant(1)).unwrap();
    pool.bind("beta", constant(2)).unwrap();
    let (extended, _) = capture_sandbox(&engines, pool);

    let added: BTreeSet<String> = names(&extended).difference(&names(&base)).cloned().collect();
    let expected: BTreeSet<String> = ["alpha", "beta"].iter().map(|s| s.to_string()).collect();
    assert_eq!(added, expected);
    assert!(names(&base).is_subset(&names(&extended)));
}

#[test]
fn test_duplicate_pool_binding() {
    let mut pool = FunctionPool::new();
    pool.bind("beep", constant(1)).unwrap();
    let err = pool.bind("beep", constant(2)).unwrap_err();
    assert_matches!(err, SandboxError::DuplicateBinding { ref name } if name == "beep");
}

#[test]
fn test_pool_colliding_with_base_global() {
    let engines = lua_engines();
    let mut pool = FunctionPool::new();
    pool.bind("require", constant(1)).unwrap();
    let err = SandboxBuilder::new(pool).build(&engines).unwrap_err();
    assert_matches!(err, SandboxError::Configuration(_));
    assert_eq!(engines.live_instances(), 0);
}

#[test]
fn test_injected_globals_cannot_be_reassigned() {
    let engines = lua_engines();
    let mut pool = FunctionPool::new();
    pool.bind("beep", constant(1)).unwrap();
    let (mut sandbox, _) = capture_sandbox(&engines, pool);

    for source in [
        "print = nil",
        "beep = function() end",
        "_G.math = {}",
        "rawset(_G, 'pcall', print)",
        "setmetatable(_G, nil)",
    ] {
        let err = eval(&mut sandbox, source).unwrap_err();
        assert_matches!(err, SandboxError::ScriptRuntime(_), "{}", source);
    }

    // the bindings survived every attempt
    assert_eq!(eval(&mut sandbox, "return beep()").unwrap(), vec![ScriptValue::Integer(1)]);
}

#[test]
fn test_reachable_structures_stay_mutable() {
    let engines = lua_engines();
    let (mut sandbox, _) = capture_sandbox(&engines, FunctionPool::new());

    let results = eval(
        &mut sandbox,
        "math.tau = 2 * math.pi
         function string.shout(s) return s:upper() .. '!' end
         counter = 1
         counter = counter + 1
         return ('hi'):shout(), counter",
    )
    .unwrap();
    assert_eq!(results, vec![ScriptValue::from("HI!"), ScriptValue::Integer(2)]);
    assert!(sandbox.global_names().unwrap().contains(&"counter".to_string()));
}

#[test]
fn test_host_load_works_while_script_loaders_are_absent() {
    let engines = lua_engines();
    let (mut sandbox, _) = capture_sandbox(&engines, FunctionPool::new());

    let results = eval(
        &mut sandbox,
        "return load, loadfile, dofile, package.loadlib, package.path",
    )
    .unwrap();
    assert_eq!(
        results,
        vec![
            ScriptValue::Nil,
            ScriptValue::Nil,
            ScriptValue::Nil,
            ScriptValue::Nil,
            ScriptValue::from(""),
        ]
    );

    let err = eval(&mut sandbox, "return require('os')").unwrap_err();
    assert_matches!(err, SandboxError::ScriptRuntime(_));
}

#[test]
fn test_required_library_is_the_attached_table() {
    let engines = lua_engines();
    let registry = CapabilityRegistry::new();
    registry
        .publish(
            "gfx",
            vec![
                NamedFunction::new("width", constant(320)),
                NamedFunction::new("height", constant(200)),
            ],
        )
        .unwrap();
    registry
        .publish("sfx", vec![NamedFunction::new("channels", constant(4))])
        .unwrap();

    let mut sandbox = SandboxBuilder::new(FunctionPool::new())
        .capabilities(registry.clone())
        .library("gfx")
        .build(&engines)
        .unwrap();

    let results = eval(
        &mut sandbox,
        "local g = require('gfx') return g == gfx, g.width() * g.height()",
    )
    .unwrap();
    assert_eq!(
        results,
        vec![ScriptValue::Boolean(true), ScriptValue::Integer(64000)]
    );

    // attaching after finalization is a host operation
    sandbox.attach(&registry, "sfx").unwrap();
    let results = eval(&mut sandbox, "return require('sfx') == sfx, sfx.channels()").unwrap();
    assert_eq!(results, vec![ScriptValue::Boolean(true), ScriptValue::Integer(4)]);

    // and the attached name is as locked as the rest
    assert_matches!(
        eval(&mut sandbox, "sfx = nil"),
        Err(SandboxError::ScriptRuntime(_))
    );
    assert_matches!(
        sandbox.attach(&registry, "sfx"),
        Err(SandboxError::Configuration(_))
    );
}

#[test]
fn test_attach_replaces_script_global() {
    let engines = lua_engines();
    let registry = CapabilityRegistry::new();
    registry
        .publish("sfx", vec![NamedFunction::new("channels", constant(4))])
        .unwrap();
    let (mut sandbox, _) = capture_sandbox(&engines, FunctionPool::new());

    eval(&mut sandbox, "sfx = 'mine'").unwrap();
    sandbox.attach(&registry, "sfx").unwrap();

    let results = eval(
        &mut sandbox,
        "return type(sfx), require('sfx') == sfx, sfx.channels()",
    )
    .unwrap();
    assert_eq!(
        results,
        vec![
            ScriptValue::from("table"),
            ScriptValue::Boolean(true),
            ScriptValue::Integer(4)
        ]
    );

    assert_matches!(
        eval(&mut sandbox, "sfx = 42"),
        Err(SandboxError::ScriptRuntime(_))
    );
    assert_matches!(
        eval(&mut sandbox, "rawset(_G, 'sfx', 42)"),
        Err(SandboxError::ScriptRuntime(_))
    );
    let listed = sandbox.global_names().unwrap();
    assert_eq!(listed.iter().filter(|name| *name == "sfx").count(), 1);
}

#[test]
fn test_unpublished_library() {
    let engines = lua_engines();
    let registry = CapabilityRegistry::new();

    let err = SandboxBuilder::new(FunctionPool::new())
        .capabilities(registry.clone())
        .library("modem")
        .build(&engines)
        .unwrap_err();
    assert_matches!(err, SandboxError::NotFound(_));
    assert_eq!(engines.live_instances(), 0);

    let (mut sandbox, _) = capture_sandbox(&engines, FunctionPool::new());
    assert_matches!(
        sandbox.attach(&registry, "modem"),
        Err(SandboxError::NotFound(_))
    );
}

#[test]
fn test_republishing_a_library() {
    let registry = CapabilityRegistry::new();
    registry
        .publish("gfx", vec![NamedFunction::new("width", constant(1))])
        .unwrap();
    let err = registry
        .publish("gfx", vec![NamedFunction::new("height", constant(2))])
        .unwrap_err();
    assert_matches!(err, SandboxError::Configuration(_));
}

#[test]
fn test_instances_are_isolated() {
    let engines = lua_engines();
    let (mut first, _) = capture_sandbox(&engines, FunctionPool::new());
    let (mut second, _) = capture_sandbox(&engines, FunctionPool::new());

    eval(&mut first, "shared = 'first'; math.extra = 1").unwrap();
    let results = eval(&mut second, "return shared, math.extra").unwrap();
    assert_eq!(results, vec![ScriptValue::Nil, ScriptValue::Nil]);
}
