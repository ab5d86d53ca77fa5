//! Sandbox lifecycle, error classification and program loading

use crate::common::{capture_sandbox, eval, lua_engines, setup_test_logging};
use assert_matches::assert_matches;
use consoles_sandbox::{
    ErrorKind, FunctionPool, HostArgs, HostError, HostObject, LuaEngine, Program,
    ProgramLoader, SandboxBuilder, SandboxError, SandboxLimits, SandboxState, ScriptValue,
};
use std::fs;

fn failing_pool() -> FunctionPool {
    FunctionPool::new()
        .with("fail", |_| Err(HostError::new("disk on fire")))
        .unwrap()
        .with("double", |args| Ok(ScriptValue::Integer(args.int_arg(1)? * 2)))
        .unwrap()
}

#[test]
fn test_uncaught_host_error() {
    setup_test_logging();
    let engines = lua_engines();
    let (mut sandbox, _) = capture_sandbox(&engines, failing_pool());

    let err = eval(&mut sandbox, "fail()").unwrap_err();
    assert_matches!(err, SandboxError::Host(ref m) if m == "disk on fire");
    assert_eq!(err.kind(), ErrorKind::Host);

    let err = eval(&mut sandbox, "double('x')").unwrap_err();
    assert_matches!(err, SandboxError::Host(ref m) if m.contains("bad argument #1"));
}

#[test]
fn test_script_catches_host_error() {
    let engines = lua_engines();
    let (mut sandbox, _) = capture_sandbox(&engines, failing_pool());

    let results = eval(
        &mut sandbox,
        "local ok, err = pcall(fail) return ok, tostring(err), double(21)",
    )
    .unwrap();
    assert_eq!(results[0], ScriptValue::Boolean(false));
    assert!(results[1].as_str().unwrap().contains("disk on fire"));
    assert_eq!(results[2], ScriptValue::Integer(42));
}

#[test]
fn test_tables_are_not_passed_to_host_functions() {
    let engines = lua_engines();
    let (mut sandbox, _) = capture_sandbox(&engines, failing_pool());
    let err = eval(&mut sandbox, "double({})").unwrap_err();
    assert_matches!(err, SandboxError::ScriptRuntime(ref m) if m.contains("table"));
}

#[test]
fn test_host_objects_round_trip() {
    let engines = lua_engines();
    let screen = HostObject::new(String::from("screen-0"));
    let handle = screen.clone();
    let pool = FunctionPool::new()
        .with("screen", move |_| Ok(ScriptValue::Host(handle.clone())))
        .unwrap()
        .with("describe", |args| {
            let object = args
                .arg(1)
                .as_host()
                .and_then(|h| h.downcast_ref::<String>())
                .ok_or_else(|| HostError::bad_argument(1, "screen", args.arg(1)))?;
            Ok(ScriptValue::from(object.as_str()))
        })
        .unwrap();
    let (mut sandbox, _) = capture_sandbox(&engines, pool);

    let results = eval(&mut sandbox, "local s = screen() return describe(s), type(s), s").unwrap();
    assert_eq!(results[0], ScriptValue::from("screen-0"));
    assert_eq!(results[1], ScriptValue::from("userdata"));
    assert!(results[2].as_host().unwrap().ptr_eq(&screen));
}

#[test]
fn test_syntax_error_at_load() {
    let engines = lua_engines();
    let (mut sandbox, _) = capture_sandbox(&engines, FunctionPool::new());

    let err = sandbox
        .load(&Program::new("broken", "x = = 1"))
        .unwrap_err();
    assert_matches!(err, SandboxError::ScriptRuntime(ref m) if m.starts_with("syntax error") && m.contains("broken:1"));
    assert_eq!(err.to_failure().kind, ErrorKind::ScriptRuntime);
}

#[test]
fn test_runtime_error_is_structured() {
    let engines = lua_engines();
    let (mut sandbox, _) = capture_sandbox(&engines, FunctionPool::new());

    let err = sandbox
        .run(&Program::new("crash", "local t = nil\nreturn t.field"), vec![])
        .unwrap_err();
    let failure = err.to_failure();
    assert_eq!(failure.kind, ErrorKind::ScriptRuntime);
    assert!(failure.message.contains("crash:2"));

    let json = serde_json::to_value(&failure).unwrap();
    assert_eq!(json["kind"], "script_runtime");
}

#[test]
fn test_heap_limit() {
    let engines = lua_engines();
    let mut sandbox = SandboxBuilder::new(FunctionPool::new())
        .heap_limit(2 * 1024 * 1024)
        .build(&engines)
        .unwrap();

    let err = eval(
        &mut sandbox,
        "local t = {} for i = 1, 1e8 do t[i] = string.rep('x', 64) .. i end",
    )
    .unwrap_err();
    assert_matches!(err, SandboxError::ScriptRuntime(ref m) if m.starts_with("out of memory"));

    // the instance survives and can run again
    assert_eq!(eval(&mut sandbox, "return 1 + 1").unwrap(), vec![ScriptValue::Integer(2)]);
}

#[test]
fn test_remove_restrictions() {
    let engines = lua_engines();
    let (mut sandbox, _) = capture_sandbox(&engines, FunctionPool::new());
    let before = sandbox.global_names().unwrap();
    assert_eq!(sandbox.state(), SandboxState::Ready);

    sandbox.remove_restrictions().unwrap();
    sandbox.remove_restrictions().unwrap();
    assert_eq!(sandbox.state(), SandboxState::Unrestricted);

    let after = sandbox.global_names().unwrap();
    let added: Vec<&String> = after.iter().filter(|n| !before.contains(n)).collect();
    assert_eq!(added, vec!["coroutine", "os"]);

    let results = eval(
        &mut sandbox,
        "local co = coroutine.wrap(function(a) local b = coroutine.yield(a + 1) return b * 2 end)
         return co(1), co(5), os.exit, os.execute, type(os.time())",
    )
    .unwrap();
    assert_eq!(
        results,
        vec![
            ScriptValue::Integer(2),
            ScriptValue::Integer(10),
            ScriptValue::Nil,
            ScriptValue::Nil,
            ScriptValue::from("number"),
        ]
    );

    // the new names are locked like the rest
    assert_matches!(eval(&mut sandbox, "os = nil"), Err(SandboxError::ScriptRuntime(_)));
}

#[test]
fn test_repeated_runs_do_not_accumulate_chunks() {
    let engines = lua_engines();
    let mut sandbox = SandboxBuilder::new(FunctionPool::new())
        .limits(SandboxLimits::strict())
        .build(&engines)
        .unwrap();

    let program = Program::inline(&format!("local pad = '{}' return #pad", "x".repeat(1024)));
    for _ in 0..10_000 {
        let results = sandbox.run(&program, vec![]).unwrap();
        assert_eq!(results, vec![ScriptValue::Integer(1024)]);
    }
    assert_eq!(sandbox.loaded_chunks().unwrap(), 0);

    // an explicit load stays until it is unloaded
    let chunk = sandbox.load(&program).unwrap();
    assert_eq!(sandbox.loaded_chunks().unwrap(), 1);
    sandbox.unload(chunk).unwrap();
    assert_matches!(
        sandbox.call(chunk, vec![]),
        Err(SandboxError::InvalidState(_))
    );
}

#[test]
fn test_close_is_terminal() {
    let engines = lua_engines();
    let (mut sandbox, _) = capture_sandbox(&engines, FunctionPool::new());
    assert_eq!(engines.live_instances(), 1);

    sandbox.close().unwrap();
    assert_eq!(sandbox.state(), SandboxState::Closed);
    assert_eq!(engines.live_instances(), 0);
    assert_matches!(eval(&mut sandbox, "return 1"), Err(SandboxError::InvalidState(_)));
    assert_matches!(sandbox.global_names(), Err(SandboxError::InvalidState(_)));
    assert_matches!(sandbox.close(), Err(SandboxError::InvalidState(_)));
}

#[test]
fn test_engine_replacement_waits_for_live_instances() {
    let engines = lua_engines();
    let (sandbox, _) = capture_sandbox(&engines, FunctionPool::new());

    assert_matches!(
        engines.install(LuaEngine::new()),
        Err(SandboxError::Configuration(_))
    );
    drop(sandbox);
    engines.install(LuaEngine::new()).unwrap();
    assert_eq!(engines.active().unwrap().name(), "lua54");
}

#[test]
fn test_program_loader_end_to_end() {
    let engines = lua_engines();
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("games")).unwrap();
    fs::write(
        dir.path().join("games").join("greet.lua"),
        "local name, times = ...\nfor _ = 1, tonumber(times) do print('hi ' .. name) end\nreturn times",
    )
    .unwrap();

    let loader = ProgramLoader::new(dir.path());
    let program = loader.load("games/greet").unwrap();
    assert_eq!(program.name(), "games/greet");

    let (mut sandbox, output) = capture_sandbox(&engines, FunctionPool::new());
    let (_, args) = ProgramLoader::split_command("games/greet ada 2");
    let args = args.into_iter().map(ScriptValue::from).collect();
    let results = sandbox.run(&program, args).unwrap();

    assert_eq!(output.text(), "hi ada\nhi ada\n");
    assert_eq!(results, vec![ScriptValue::from("2")]);

    assert_matches!(loader.load("games/missing"), Err(SandboxError::NotFound(_)));
    assert_matches!(loader.load("../outside"), Err(SandboxError::NotFound(_)));
    assert_matches!(loader.load("games"), Err(SandboxError::NotFound(_)));
}

#[test]
fn test_function_pool_closure_sees_varargs() {
    let engines = lua_engines();
    let pool = FunctionPool::new()
        .with("count", |args| Ok(ScriptValue::Integer(args.len() as i64)))
        .unwrap();
    let (mut sandbox, _) = capture_sandbox(&engines, pool);
    let chunk = sandbox.load(&Program::inline("return count(...)")).unwrap();
    let results = sandbox
        .call(chunk, vec![1.5.into(), "x".into(), true.into()])
        .unwrap();
    assert_eq!(results, vec![ScriptValue::Integer(3)]);
}
