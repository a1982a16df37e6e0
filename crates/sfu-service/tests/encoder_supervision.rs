//! Integration tests for encoder supervision.
//!
//! Uses the scripted encoder launcher and paused tokio time so restart
//! backoff runs instantly.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::time::Duration;

use sfu_service::actors::{PipelineState, SourceInfo};
use sfu_service::ingest::RestartPolicy;
use sfu_test_utils::{TestSfu, TestSource};

fn backoff(max_attempts: u32) -> RestartPolicy {
    RestartPolicy::Backoff {
        initial: Duration::from_secs(1),
        max: Duration::from_secs(30),
        max_attempts,
    }
}

/// Poll the registry until `predicate` holds for `name`.
async fn wait_for_source(
    sfu: &TestSfu,
    name: &str,
    predicate: impl Fn(&SourceInfo) -> bool,
) -> SourceInfo {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let info = sfu.registry.get_source(name.to_string()).await.unwrap();
            if predicate(&info) {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("source never reached expected state")
}

#[tokio::test(start_paused = true)]
async fn test_encoder_command_targets_allocated_ports() {
    let sfu = TestSfu::start();
    let source = TestSource::new("cam1");
    assert!(sfu.create_source(&source).await);

    let info = sfu.registry.get_source("cam1".to_string()).await.unwrap();
    let commands = sfu.launcher.commands();
    assert_eq!(commands.len(), 1);

    let args = &commands[0].args;
    let input = args.iter().position(|a| a == "-i").expect("input flag");
    assert_eq!(args[input + 1], source.origin_url);

    let sink = args.last().unwrap();
    assert!(sink.contains(&format!("ssrc={}", info.ssrc)));
    assert!(sink.contains("payload_type=102"));
    assert!(sink.contains(&format!(":{}?", info.rtp_port.unwrap())));
    assert!(sink.contains(&format!("rtcpport={}", info.rtcp_port.unwrap())));

    sfu.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_crash_without_restart_policy_is_terminal() {
    let sfu = TestSfu::start();
    assert!(sfu.create_source(&TestSource::new("cam1")).await);
    sfu.launcher.wait_for_launches(1).await;

    assert!(sfu.launcher.exit(0, Some(1)));
    let info = wait_for_source(&sfu, "cam1", |i| {
        matches!(i.state, PipelineState::Crashed { .. })
    })
    .await;
    assert_eq!(info.restarts, 0);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(sfu.launcher.launch_count(), 1);

    // A failed pipeline still blocks recreation of the same name.
    assert!(!sfu.create_source(&TestSource::new("cam1")).await);
    assert_eq!(sfu.launcher.launch_count(), 1);

    sfu.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_clean_exit_is_recorded_as_exited() {
    let sfu = TestSfu::start();
    assert!(sfu.create_source(&TestSource::new("cam1")).await);
    sfu.launcher.wait_for_launches(1).await;

    assert!(sfu.launcher.exit(0, Some(0)));
    wait_for_source(&sfu, "cam1", |i| i.state == PipelineState::Exited).await;

    sfu.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_backoff_restarts_crashed_encoder() {
    let sfu = TestSfu::builder().restart_policy(backoff(3)).build();
    assert!(sfu.create_source(&TestSource::new("cam1")).await);
    sfu.launcher.wait_for_launches(1).await;

    assert!(sfu.launcher.exit(0, None));
    sfu.launcher.wait_for_launches(2).await;

    let info = wait_for_source(&sfu, "cam1", |i| {
        matches!(i.state, PipelineState::Running { .. })
    })
    .await;
    assert_eq!(info.restarts, 1);

    // The restarted encoder targets the same endpoint.
    let commands = sfu.launcher.commands();
    assert_eq!(commands[0], commands[1]);

    sfu.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_backoff_gives_up_after_max_attempts() {
    let sfu = TestSfu::builder().restart_policy(backoff(2)).build();
    assert!(sfu.create_source(&TestSource::new("cam1")).await);

    for index in 0..3 {
        sfu.launcher.wait_for_launches(index + 1).await;
        assert!(sfu.launcher.exit(index, Some(1)));
    }

    let info = wait_for_source(&sfu, "cam1", |i| {
        matches!(i.state, PipelineState::Crashed { .. })
    })
    .await;
    assert_eq!(info.restarts, 2);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(sfu.launcher.launch_count(), 3);

    sfu.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_spawn_failure_marks_pipeline_crashed() {
    let sfu = TestSfu::start();
    sfu.launcher.set_fail_spawn(true);

    // The stream is allocated even though the encoder never starts.
    assert!(sfu.create_source(&TestSource::new("cam1")).await);

    let info = wait_for_source(&sfu, "cam1", |i| {
        matches!(i.state, PipelineState::Crashed { .. })
    })
    .await;
    assert!(info.producer_id.is_some());
    let PipelineState::Crashed { reason } = info.state else {
        unreachable!()
    };
    assert!(reason.contains("spawn failed"));

    sfu.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stderr_output_does_not_disturb_supervision() {
    let sfu = TestSfu::start();
    sfu.launcher.set_stderr_lines(vec![
        "Input #0, flv, from 'rtmp://host/live/cam1':".to_string(),
        "frame=  120 fps= 30 q=-1.0 size=N/A time=00:00:04.00".to_string(),
    ]);
    assert!(sfu.create_source(&TestSource::new("cam1")).await);
    sfu.launcher.wait_for_launches(1).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    let info = sfu.registry.get_source("cam1".to_string()).await.unwrap();
    assert!(matches!(info.state, PipelineState::Running { .. }));

    sfu.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_kills_running_encoders() {
    let sfu = TestSfu::builder().restart_policy(backoff(5)).build();
    assert!(sfu.create_source(&TestSource::new("cam1")).await);
    assert!(sfu.create_source(&TestSource::new("cam2")).await);
    sfu.launcher.wait_for_launches(2).await;

    let launcher = std::sync::Arc::clone(&sfu.launcher);
    let engine = std::sync::Arc::clone(&sfu.engine);
    sfu.shutdown().await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while !(launcher.was_killed(0) && launcher.was_killed(1)) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("encoders were not killed");

    assert_eq!(engine.inner().transport_count(), 0);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(launcher.launch_count(), 2);
}
