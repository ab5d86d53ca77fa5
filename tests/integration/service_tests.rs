//! Async execution service driven from a config file

use crate::common::setup_test_logging;
use consoles_sandbox::{
    engines_for, CapabilityRegistry, ErrorKind, ExecutionRequest, ExecutionStatus, FunctionPool,
    SandboxConfig, SandboxService, ScriptValue,
};
use std::time::Duration;

fn config() -> SandboxConfig {
    SandboxConfig::from_toml(
        r#"
        engine = "lua"

        [limits]
        max_memory_bytes = 8388608
        instructions_per_check = 100

        [service]
        default_timeout = "200ms"
        stdout_capacity = 4
        "#,
    )
    .unwrap()
}

#[tokio::test]
async fn test_service_from_config() {
    setup_test_logging();
    let config = config();
    let pool = FunctionPool::new()
        .with("twice", |args| {
            Ok(ScriptValue::from(
                args.iter()
                    .map(|a| format!("{0}{0}", a))
                    .collect::<Vec<_>>()
                    .join(","),
            ))
        })
        .unwrap();
    let service = SandboxService::from_config(engines_for(&config), CapabilityRegistry::new(), &config)
        .with_pool(pool);

    // more output than the channel holds at once
    let request = ExecutionRequest::new("loud", "for i = 1, 20 do print(twice(i)) end return 'ok'");
    let (stdout, result) = service.execute(request).await.unwrap().collect().await;
    let result = result.unwrap();
    assert!(result.success());
    assert_eq!(result.values, vec!["ok".to_string()]);
    let text = String::from_utf8(stdout).unwrap();
    assert_eq!(text.lines().count(), 20);
    assert_eq!(text.lines().last(), Some("2020"));

    // the configured default timeout applies when the request has none
    let (_, result) = service
        .execute(ExecutionRequest::new("spin", "while true do end"))
        .await
        .unwrap()
        .collect()
        .await;
    let result = result.unwrap();
    assert_eq!(result.status, ExecutionStatus::Terminated);
    assert!(result.timed_out);
}

#[tokio::test]
async fn test_unrestricted_request() {
    let config = config();
    let service = SandboxService::from_config(engines_for(&config), CapabilityRegistry::new(), &config);

    let (_, restricted) = service
        .execute(ExecutionRequest::new("inspect", "return type(coroutine)"))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(restricted.unwrap().values, vec!["nil".to_string()]);

    let (_, unrestricted) = service
        .execute(ExecutionRequest::new("inspect", "return type(coroutine)").unrestricted())
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(unrestricted.unwrap().values, vec!["table".to_string()]);
}

#[tokio::test]
async fn test_request_from_json() {
    let config = config();
    let service = SandboxService::from_config(engines_for(&config), CapabilityRegistry::new(), &config);

    let request: ExecutionRequest = serde_json::from_value(serde_json::json!({
        "name": "sum",
        "source": "local a, b = ... return tonumber(a) + tonumber(b)",
        "args": ["2", "40"],
        "stdin": null,
        "timeout": "1s",
    }))
    .unwrap();
    assert_eq!(request.timeout, Some(Duration::from_secs(1)));

    let (_, result) = service.execute(request).await.unwrap().collect().await;
    assert_eq!(result.unwrap().values, vec!["42".to_string()]);

    let (_, result) = service
        .execute(ExecutionRequest::new("bad", "return +"))
        .await
        .unwrap()
        .collect()
        .await;
    let failure = result.unwrap().failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::ScriptRuntime);
}
