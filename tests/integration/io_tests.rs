//! Standard stream wiring

use crate::common::{capture_sandbox, eval, lua_engines};
use assert_matches::assert_matches;
use consoles_sandbox::{
    build, CaptureBuffer, FunctionPool, InputSource, OutputSink, SandboxBuilder, SandboxError,
    ScriptValue,
};
use std::sync::Arc;

#[test]
fn test_print_and_write_reach_the_sink() {
    let engines = lua_engines();
    let (mut sandbox, output) = capture_sandbox(&engines, FunctionPool::new());

    eval(
        &mut sandbox,
        "print('a', 1, nil, true)
         io.write('x', 2, ' ', 2.5, '\\n')
         warn('not visible')",
    )
    .unwrap();
    assert_eq!(output.text(), "a\t1\tnil\ttrue\nx2 2.5\n");
}

#[test]
fn test_write_rejects_non_strings() {
    let engines = lua_engines();
    let (mut sandbox, output) = capture_sandbox(&engines, FunctionPool::new());

    let err = eval(&mut sandbox, "io.write({})").unwrap_err();
    assert_matches!(err, SandboxError::ScriptRuntime(ref m) if m.contains("bad argument #1 to 'write'"));
    assert!(output.contents().is_empty());
}

#[test]
fn test_invalid_utf8_is_transcoded() {
    let engines = lua_engines();
    let (mut sandbox, output) = capture_sandbox(&engines, FunctionPool::new());

    eval(&mut sandbox, "io.write('ok \\xff')").unwrap();
    assert_eq!(output.text(), "ok \u{FFFD}");
}

#[test]
fn test_sequence_split_across_writes() {
    let engines = lua_engines();
    let (mut sandbox, output) = capture_sandbox(&engines, FunctionPool::new());

    eval(
        &mut sandbox,
        "io.write(string.char(0xC3)) io.write(string.char(0xA9))
         local euro = '\u{20AC}'
         for i = 1, #euro do io.write(euro:sub(i, i)) end",
    )
    .unwrap();
    assert_eq!(output.contents(), "\u{e9}\u{20ac}".as_bytes());
    assert_eq!(output.text(), "\u{e9}\u{20ac}");
}

#[test]
fn test_absent_output_discards() {
    let engines = lua_engines();
    let mut sandbox = SandboxBuilder::new(FunctionPool::new())
        .build(&engines)
        .unwrap();
    let results = eval(&mut sandbox, "print('dropped') io.write('dropped') return 'done'").unwrap();
    assert_eq!(results, vec![ScriptValue::from("done")]);
}

#[test]
fn test_reading_input() {
    let engines = lua_engines();
    let mut sandbox = SandboxBuilder::new(FunctionPool::new())
        .input_source(InputSource::from_bytes("first\r\nsecond\nabcdefg rest"))
        .build(&engines)
        .unwrap();

    let results = eval(
        &mut sandbox,
        "return io.read(), io.read('L'), io.read(3), io.read('*a'), io.read(), io.read('a')",
    )
    .unwrap();
    assert_eq!(
        results,
        vec![
            ScriptValue::from("first"),
            ScriptValue::from("second\n"),
            ScriptValue::from("abc"),
            ScriptValue::from("defg rest"),
            ScriptValue::Nil,
            ScriptValue::from(""),
        ]
    );
}

#[test]
fn test_absent_input_is_end_of_file() {
    let engines = lua_engines();
    let (mut sandbox, _) = capture_sandbox(&engines, FunctionPool::new());
    let results = eval(&mut sandbox, "return io.read(), io.read('a')").unwrap();
    assert_eq!(results, vec![ScriptValue::Nil, ScriptValue::from("")]);

    let err = eval(&mut sandbox, "return io.read('x')").unwrap_err();
    assert_matches!(err, SandboxError::ScriptRuntime(_));
}

#[test]
fn test_positional_build() {
    let engines = lua_engines();
    let output = CaptureBuffer::new();
    let mut pool = FunctionPool::new();
    pool.bind(
        "greeting",
        consoles_sandbox::HostFunction::new(|_| Ok(ScriptValue::from("hello"))),
    )
    .unwrap();

    let mut sandbox = build(
        &engines,
        pool,
        Arc::new(|| false),
        Some(InputSource::from_bytes("world\n")),
        Some(OutputSink::stream(output.clone())),
        0,
    )
    .unwrap();

    eval(&mut sandbox, "print(greeting() .. ', ' .. io.read())").unwrap();
    assert_eq!(output.text(), "hello, world\n");
}
