use std::env;
use std::sync::{Mutex, OnceLock};

use procura_cli::commands::{config, doctor, migrate, processes, seed, steps};
use serde_json::Value;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("PROCURA_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_on_invalid_override() {
    with_env(
        &[("PROCURA_DATABASE_URL", "sqlite::memory:"), ("PROCURA_SERVER_API_TOKEN", "short")],
        || {
            let result = migrate::run();
            assert_eq!(result.exit_code, 2, "expected config validation failure code");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["status"], "error");
            assert_eq!(payload["error_class"], "config_validation");
        },
    );
}

#[test]
fn seed_reports_material_request_chain() {
    with_env(&[("PROCURA_DATABASE_URL", "sqlite::memory:")], || {
        let result = seed::run();
        assert_eq!(result.exit_code, 0, "expected seed success: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "seed");
        assert_eq!(payload["status"], "ok");
        assert_eq!(
            payload["message"],
            "process `Material Request` (id 1) has 3 steps; 5 directory users"
        );
    });
}

#[test]
fn seed_is_idempotent_against_the_same_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("procura.db").display());

    with_env(&[("PROCURA_DATABASE_URL", url.as_str())], || {
        let first = seed::run();
        assert_eq!(first.exit_code, 0, "expected first seed success: {}", first.output);
        let second = seed::run();
        assert_eq!(second.exit_code, 0, "expected second seed success: {}", second.output);

        let first_payload = parse_payload(&first.output);
        let second_payload = parse_payload(&second.output);
        assert_eq!(first_payload["message"], second_payload["message"]);

        let listing = processes::run(false);
        let payload = parse_payload(&listing.output);
        assert_eq!(payload["data"].as_array().map(Vec::len), Some(1));
        assert_eq!(payload["data"][0]["title"], "Material Request");

        let chain = steps::run(1);
        let payload = parse_payload(&chain.output);
        let orders: Vec<i64> = payload["data"]
            .as_array()
            .expect("steps array")
            .iter()
            .filter_map(|step| step["order"].as_i64())
            .collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert_eq!(payload["data"][1]["approver"]["kind"], "designation");
    });
}

#[test]
fn steps_for_unknown_process_is_not_found() {
    with_env(&[("PROCURA_DATABASE_URL", "sqlite::memory:")], || {
        let result = steps::run(404);
        assert_eq!(result.exit_code, 6);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "not_found");
    });
}

#[test]
fn doctor_reports_missing_schema_on_fresh_database() {
    with_env(&[("PROCURA_DATABASE_URL", "sqlite::memory:")], || {
        let report: Value =
            serde_json::from_str(&doctor::run(true)).expect("doctor output should be JSON");
        assert_eq!(report["overall_status"], "fail");

        let schema = report["checks"]
            .as_array()
            .expect("checks")
            .iter()
            .find(|check| check["name"] == "workflow_schema")
            .cloned()
            .expect("schema check");
        assert_eq!(schema["status"], "fail");
    });
}

#[test]
fn config_lists_every_setting_with_source_and_redacted_token() {
    with_env(
        &[
            ("PROCURA_DATABASE_URL", "sqlite::memory:"),
            ("PROCURA_SERVER_API_TOKEN", "0123456789abcdef"),
            ("PROCURA_LOG_LEVEL", "warn"),
        ],
        || {
            let output = config::run();
            assert!(!output.contains("0123456789abcdef"), "token leaked: {output}");
            assert!(output.contains(
                "- server.api_token = 0123*** (source: env (PROCURA_SERVER_API_TOKEN))"
            ));
            assert!(output.contains("- logging.level = warn (source: env (PROCURA_LOG_LEVEL))"));
            assert!(output.contains("- server.port = 8080 (source: default)"));
            assert_eq!(output.lines().filter(|line| line.starts_with("- ")).count(), 11);
        },
    );
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "PROCURA_DATABASE_URL",
        "PROCURA_DATABASE_MAX_CONNECTIONS",
        "PROCURA_DATABASE_TIMEOUT_SECS",
        "PROCURA_SERVER_BIND_ADDRESS",
        "PROCURA_SERVER_PORT",
        "PROCURA_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "PROCURA_SERVER_API_TOKEN",
        "PROCURA_WORKFLOW_MAX_STEPS_PER_PROCESS",
        "PROCURA_WORKFLOW_DEFAULT_PAGE_SIZE",
        "PROCURA_LOGGING_LEVEL",
        "PROCURA_LOGGING_FORMAT",
        "PROCURA_LOG_LEVEL",
        "PROCURA_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
