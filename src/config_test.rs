use std::time::Duration;

use anyhow::Result;

use crate::config::Config;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("HTTP_PORT".into(), "9000".into()),
        ("NAMESPACE".into(), "cassandra".into()),
        ("POD_NAME".into(), "cass-operator-0".into()),
        ("REQUEUE_SECONDS".into(), "2".into()),
        ("RESYNC_SECONDS".into(), "60".into()),
        ("BACKOFF_MAX_SECONDS".into(), "30".into()),
        ("API_TIMEOUT_SECONDS".into(), "3".into()),
        ("MGMT_TIMEOUT_SECONDS".into(), "4".into()),
        ("MGMT_API_PORT".into(), "8443".into()),
        ("START_RETRY_BUDGET".into(), "7".into()),
    ])?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.http_port == 9000, "unexpected value parsed for HTTP_PORT, got {}, expected {}", config.http_port, 9000);
    assert!(config.namespace == "cassandra", "unexpected value parsed for NAMESPACE, got {}, expected {}", config.namespace, "cassandra");
    assert!(
        config.pod_name == "cass-operator-0",
        "unexpected value parsed for POD_NAME, got {}, expected {}",
        config.pod_name,
        "cass-operator-0"
    );
    assert!(config.requeue_seconds == 2, "unexpected value parsed for REQUEUE_SECONDS, got {}, expected {}", config.requeue_seconds, 2);
    assert!(config.resync_seconds == 60, "unexpected value parsed for RESYNC_SECONDS, got {}, expected {}", config.resync_seconds, 60);
    assert!(
        config.backoff_max_seconds == 30,
        "unexpected value parsed for BACKOFF_MAX_SECONDS, got {}, expected {}",
        config.backoff_max_seconds,
        30
    );
    assert!(
        config.api_timeout() == Duration::from_secs(3),
        "unexpected value parsed for API_TIMEOUT_SECONDS, got {:?}, expected {:?}",
        config.api_timeout(),
        Duration::from_secs(3)
    );
    assert!(
        config.mgmt_timeout() == Duration::from_secs(4),
        "unexpected value parsed for MGMT_TIMEOUT_SECONDS, got {:?}, expected {:?}",
        config.mgmt_timeout(),
        Duration::from_secs(4)
    );
    assert!(config.mgmt_api_port == 8443, "unexpected value parsed for MGMT_API_PORT, got {}, expected {}", config.mgmt_api_port, 8443);
    assert!(
        config.start_retry_budget == 7,
        "unexpected value parsed for START_RETRY_BUDGET, got {}, expected {}",
        config.start_retry_budget,
        7
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("NAMESPACE".into(), "default".into()),
        ("POD_NAME".into(), "cass-operator-0".into()),
    ])?;

    assert!(config.http_port == 8000, "unexpected default for HTTP_PORT, got {}, expected {}", config.http_port, 8000);
    assert!(config.requeue_delay() == Duration::from_secs(5), "unexpected default for REQUEUE_SECONDS, got {:?}", config.requeue_delay());
    assert!(config.resync_delay() == Duration::from_secs(300), "unexpected default for RESYNC_SECONDS, got {:?}", config.resync_delay());
    assert!(config.mgmt_api_port == 8080, "unexpected default for MGMT_API_PORT, got {}, expected {}", config.mgmt_api_port, 8080);
    assert!(
        config.start_retry_budget == 20,
        "unexpected default for START_RETRY_BUDGET, got {}, expected {}",
        config.start_retry_budget,
        20
    );

    Ok(())
}

#[test]
fn config_requires_namespace() -> Result<()> {
    let res: Result<Config, _> = envy::from_iter(vec![("RUST_LOG".into(), "error".into()), ("POD_NAME".into(), "cass-operator-0".into())]);
    assert!(res.is_err(), "expected missing NAMESPACE to be rejected, got {:?}", res);
    Ok(())
}
