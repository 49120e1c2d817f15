use super::*;
use crate::env::ProcessSpec;

#[tokio::test]
async fn test_group_is_single_use() {
    let group = ConcurrencyGroup::new("once");
    group.activate().unwrap();
    assert!(group.activate().is_err());
    group.exit().await.unwrap();
    assert_eq!(group.state(), GroupState::Exited);
    assert!(group.activate().is_err());
}

#[tokio::test]
async fn test_spawn_requires_active_state() {
    let group = ConcurrencyGroup::new("inactive");
    let result = group.spawn("early", async { Ok(()) });
    assert!(result.is_err());
}

#[tokio::test]
async fn test_clean_exit_collects_successful_strands() {
    let group = ConcurrencyGroup::new("clean");
    group.activate().unwrap();
    for i in 0..3 {
        group
            .spawn(format!("worker-{i}"), async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(())
            })
            .unwrap();
    }
    group.exit().await.unwrap();
}

#[tokio::test]
async fn test_failing_strand_surfaces_in_exit_error() {
    let group = ConcurrencyGroup::new("failing");
    group.activate().unwrap();
    group
        .spawn("bad", async {
            Err(AtelierError::Validation("strand went wrong".to_string()))
        })
        .unwrap();
    let err = group.exit().await.unwrap_err();
    match err {
        AtelierError::ConcurrencyGroup { count, messages, .. } => {
            assert_eq!(count, 1);
            assert!(messages[0].contains("strand went wrong"));
        }
        other => panic!("expected ConcurrencyGroup error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_identical_failures_are_deduplicated() {
    let group = ConcurrencyGroup::new("dup");
    group.activate().unwrap();
    for i in 0..2 {
        group
            .spawn(format!("bad-{i}"), async {
                Err(AtelierError::Validation("same failure".to_string()))
            })
            .unwrap();
    }
    let err = group.exit().await.unwrap_err();
    match err {
        AtelierError::ConcurrencyGroup { count, .. } => assert_eq!(count, 1),
        other => panic!("expected ConcurrencyGroup error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_slow_strand_times_out() {
    let group = ConcurrencyGroup::with_timeouts(
        "slow",
        Duration::from_millis(100),
        Duration::from_millis(100),
    );
    group.activate().unwrap();
    group
        .spawn("sleeper", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .unwrap();
    let err = group.exit().await.unwrap_err();
    match err {
        AtelierError::ConcurrencyGroup { messages, .. } => {
            assert!(messages[0].contains("did not finish in time"));
        }
        other => panic!("expected ConcurrencyGroup error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unfinished_process_is_killed_and_reported() {
    let group = ConcurrencyGroup::with_timeouts(
        "procs",
        Duration::from_millis(200),
        Duration::from_millis(200),
    );
    group.activate().unwrap();
    let process =
        Arc::new(crate::env::RunningProcess::spawn_local(ProcessSpec::new(["sleep", "60"]).unchecked()).unwrap());
    group.register_process(process.clone()).unwrap();

    let err = group.exit().await.unwrap_err();
    match err {
        AtelierError::ConcurrencyGroup { messages, .. } => {
            assert!(messages[0].contains("did not terminate in time"));
        }
        other => panic!("expected ConcurrencyGroup error, got {other:?}"),
    }
    assert!(process.is_finished());
}

#[tokio::test]
async fn test_child_failure_blocks_new_strands_in_child_tree() {
    let parent = ConcurrencyGroup::new("parent");
    parent.activate().unwrap();
    let child = parent.make_child("child").unwrap();
    child.activate().unwrap();
    child
        .spawn("bad", async {
            Err(AtelierError::Validation("child failed".to_string()))
        })
        .unwrap();
    assert!(child.exit().await.is_err());

    let sibling = parent.make_child("sibling").unwrap();
    sibling.activate().unwrap();
    // The sibling sees no ancestor failure (the parent has not exited), but
    // a grandchild of the failed child would. Exercise the direct path:
    let grandchild = {
        // Rebuild through the failed child to check ancestor propagation.
        let result = child.make_child("grandchild");
        result
    };
    assert!(grandchild.is_err());
    sibling.exit().await.unwrap();

    // The child's failure stays contained: every child reached a terminal
    // state, so the parent itself exits cleanly.
    parent.exit().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_signal_propagates_to_children() {
    let parent = ConcurrencyGroup::new("root");
    parent.activate().unwrap();
    let child = parent.make_child("leaf").unwrap();
    child.activate().unwrap();

    let mut signal = child.stop_signal();
    parent.signal_shutdown();
    assert!(*signal.borrow_and_update() || child.is_shutdown_signaled());

    child.exit().await.unwrap();
    parent.exit().await.unwrap();
}

#[tokio::test]
async fn test_strand_can_watch_stop_signal() {
    let group = ConcurrencyGroup::new("stoppable");
    group.activate().unwrap();
    let mut stop = group.stop_signal();
    group
        .spawn("waiter", async move {
            loop {
                if *stop.borrow() {
                    return Ok(());
                }
                if stop.changed().await.is_err() {
                    return Ok(());
                }
            }
        })
        .unwrap();
    group.signal_shutdown();
    group.exit().await.unwrap();
}
