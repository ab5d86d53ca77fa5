//! Cooperative termination through the interrupt controller

use crate::common::{eval, fires_after, lua_engines, setup_test_logging};
use assert_matches::assert_matches;
use consoles_sandbox::{
    deadline, FunctionPool, Program, SandboxBuilder, SandboxError, ScriptValue, TerminationFlag,
};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_predicate_polled_until_it_fires() {
    setup_test_logging();
    for false_polls in [0u64, 1, 1000] {
        let engines = lua_engines();
        let (predicate, polls) = fires_after(false_polls);
        let mut sandbox = SandboxBuilder::new(FunctionPool::new())
            .terminate_when(predicate)
            .build(&engines)
            .unwrap();

        let err = eval(&mut sandbox, "while true do end").unwrap_err();
        assert_matches!(err, SandboxError::Terminated);
        assert!(err.is_termination());
        assert_eq!(polls.load(Ordering::SeqCst), false_polls + 1, "N = {}", false_polls);
        assert!(sandbox.is_tripped());
    }
}

#[test]
fn test_pcall_cannot_swallow_termination() {
    let engines = lua_engines();
    let flag = TerminationFlag::new();
    let mut sandbox = SandboxBuilder::new(FunctionPool::new())
        .terminate_on(&flag)
        .build(&engines)
        .unwrap();

    flag.trip();
    let err = eval(
        &mut sandbox,
        "local ok = pcall(function() while true do end end)
         escaped = true
         while true do end",
    )
    .unwrap_err();
    assert_matches!(err, SandboxError::Terminated);
    assert_eq!(sandbox.global("escaped").unwrap(), ScriptValue::Nil);
}

#[test]
fn test_xpcall_handler_never_sees_termination() {
    let engines = lua_engines();
    let flag = TerminationFlag::new();
    let mut sandbox = SandboxBuilder::new(FunctionPool::new())
        .terminate_on(&flag)
        .build(&engines)
        .unwrap();

    flag.trip();
    let err = eval(
        &mut sandbox,
        "xpcall(function() while true do end end, function(e) handled = true return e end)
         escaped = true",
    )
    .unwrap_err();
    assert_matches!(err, SandboxError::Terminated);
    assert_eq!(sandbox.global("handled").unwrap(), ScriptValue::Nil);
    assert_eq!(sandbox.global("escaped").unwrap(), ScriptValue::Nil);
}

#[test]
fn test_pcall_still_catches_script_errors() {
    let engines = lua_engines();
    let mut sandbox = SandboxBuilder::new(FunctionPool::new()).build(&engines).unwrap();

    let results = eval(
        &mut sandbox,
        "local ok, err = pcall(error, 'boom', 0)
         local ok2, err2 = xpcall(error, function(e) return 'handled ' .. e end, 'bang', 0)
         return ok, err, ok2, err2",
    )
    .unwrap();
    assert_eq!(
        results,
        vec![
            ScriptValue::Boolean(false),
            ScriptValue::from("boom"),
            ScriptValue::Boolean(false),
            ScriptValue::from("handled bang"),
        ]
    );
}

#[test]
fn test_flag_tripped_from_another_thread() {
    let engines = lua_engines();
    let flag = TerminationFlag::new();
    let mut sandbox = SandboxBuilder::new(FunctionPool::new())
        .terminate_on(&flag)
        .build(&engines)
        .unwrap();

    let remote = flag.clone();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        remote.trip();
    });

    let started = Instant::now();
    let err = eval(&mut sandbox, "local n = 0 while true do n = n + 1 end").unwrap_err();
    stopper.join().unwrap();
    assert_matches!(err, SandboxError::Terminated);
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_deadline_predicate() {
    let engines = lua_engines();
    let mut sandbox = SandboxBuilder::new(FunctionPool::new())
        .terminate_when(deadline(Instant::now() + Duration::from_millis(30)))
        .build(&engines)
        .unwrap();

    let err = eval(&mut sandbox, "while true do end").unwrap_err();
    assert_matches!(err, SandboxError::Terminated);
}

#[test]
fn test_runaway_pattern_match_is_terminated() {
    setup_test_logging();
    let started = Instant::now();
    for call in [
        "string.find(string.rep('a', 22), string.rep('a*', 22) .. 'b')",
        "string.match(string.rep('a', 22), string.rep('a-', 22) .. 'b')",
        "for _ in string.gmatch(string.rep('a', 22), string.rep('a*', 22) .. 'b') do end",
        "string.gsub(string.rep('a', 22), string.rep('a*', 22) .. 'b', '')",
        // pcall around the match does not catch it either
        "return pcall(string.find, string.rep('a', 22), string.rep('a*', 22) .. 'b')",
    ] {
        let engines = lua_engines();
        let mut sandbox = SandboxBuilder::new(FunctionPool::new())
            .terminate_when(deadline(Instant::now() + Duration::from_millis(50)))
            .build(&engines)
            .unwrap();

        let err = eval(&mut sandbox, call).unwrap_err();
        assert_matches!(err, SandboxError::Terminated, "{}", call);
    }
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[test]
fn test_reset_allows_another_run() {
    let engines = lua_engines();
    let flag = TerminationFlag::new();
    let mut pool = FunctionPool::new();
    pool.bind(
        "beep",
        consoles_sandbox::HostFunction::new(|_| Ok(ScriptValue::from("beep"))),
    )
    .unwrap();
    let mut sandbox = SandboxBuilder::new(pool)
        .terminate_on(&flag)
        .build(&engines)
        .unwrap();
    let names_before = sandbox.global_names().unwrap();

    flag.trip();
    assert_matches!(
        eval(&mut sandbox, "while true do end"),
        Err(SandboxError::Terminated)
    );

    // still tripped: the next run is refused outright
    flag.clear();
    assert_matches!(eval(&mut sandbox, "return 1"), Err(SandboxError::Terminated));

    sandbox.reset_interrupt().unwrap();
    assert!(!sandbox.is_tripped());
    assert_eq!(
        eval(&mut sandbox, "return beep()").unwrap(),
        vec![ScriptValue::from("beep")]
    );
    assert_eq!(sandbox.global_names().unwrap(), names_before);
}

#[test]
fn test_loaded_chunk_rerun_after_reset() {
    let engines = lua_engines();
    let flag = TerminationFlag::new();
    let mut sandbox = SandboxBuilder::new(FunctionPool::new())
        .terminate_on(&flag)
        .build(&engines)
        .unwrap();

    let chunk = sandbox
        .load(&Program::new("counter", "runs = (runs or 0) + 1 return runs"))
        .unwrap();
    assert_eq!(sandbox.call(chunk, vec![]).unwrap(), vec![ScriptValue::Integer(1)]);

    flag.trip();
    assert_matches!(
        eval(&mut sandbox, "while true do end"),
        Err(SandboxError::Terminated)
    );
    flag.clear();
    sandbox.reset_interrupt().unwrap();

    assert_eq!(sandbox.call(chunk, vec![]).unwrap(), vec![ScriptValue::Integer(2)]);
}

#[test]
fn test_coroutine_resume_cannot_swallow_termination() {
    let engines = lua_engines();
    let flag = TerminationFlag::new();
    let mut sandbox = SandboxBuilder::new(FunctionPool::new())
        .terminate_on(&flag)
        .build(&engines)
        .unwrap();
    sandbox.remove_restrictions().unwrap();

    flag.trip();
    let err = eval(
        &mut sandbox,
        "local co = coroutine.create(function() while true do end end)
         local ok = coroutine.resume(co)
         escaped = true",
    )
    .unwrap_err();
    assert_matches!(err, SandboxError::Terminated);
    assert_eq!(sandbox.global("escaped").unwrap(), ScriptValue::Nil);
}
