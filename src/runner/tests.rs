use super::*;
use crate::env::ImageConfig;
use crate::ids::{OrganizationReference, ProjectId, TaskId, UserReference};
use crate::models::TaskOutcome;
use crate::scheduler::Runner as _;
use crate::store::Store;

/// A fake agent: a shell script that emits the JSONL protocol lines the
/// runner parses from a real agent's stdout.
fn fake_agent_script(lines: &[serde_json::Value]) -> Vec<String> {
    let payload = lines
        .iter()
        .map(|line| line.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    vec![
        "sh".to_string(),
        "-c".to_string(),
        // The prompt argument appended by the runner is ignored via "$0".
        format!("cat <<'AGENT_EOF'\n{payload}\nAGENT_EOF"),
    ]
}

fn agent_task(project_id: ProjectId, command: Vec<String>) -> Task {
    Task {
        object_id: TaskId::new(),
        organization_reference: OrganizationReference("org-1".to_string()),
        user_reference: UserReference("user-1".to_string()),
        project_id,
        parent_task_id: None,
        input_data: TaskInputs::AgentTaskInputs {
            agent_config: AgentConfig {
                name: "fake-agent".to_string(),
                command,
                system_prompt: None,
            },
            image_config: ImageConfig::LocalImageConfig {
                code_directory: PathBuf::from("/tmp"),
            },
            environment_config: None,
            available_secrets: None,
            git_hash: "0000000000000000000000000000000000000000".to_string(),
            initial_branch: "main".to_string(),
            is_git_state_clean: false,
        },
        max_seconds: None,
        current_state: None,
        outcome: TaskOutcome::Running,
        error: None,
        is_archived: false,
        is_deleted: false,
        is_deleting: false,
        created_at: chrono::Utc::now(),
    }
}

struct Fixture {
    _temp: tempfile::TempDir,
    bus: TaskMessageBus,
    runner: Arc<AgentRunner>,
    task_id: TaskId,
    environment: Arc<LocalEnvironment>,
}

async fn fixture(agent_lines: &[serde_json::Value]) -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let store = Store::open_in_memory().unwrap();
    let bus = TaskMessageBus::new(store);
    let project_id = ProjectId::new();
    let environment = Arc::new(
        LocalEnvironment::new(
            "env-runner-test",
            project_id.clone(),
            temp.path().join("root"),
            temp.path().join("images"),
        )
        .unwrap(),
    );
    let task = agent_task(project_id, fake_agent_script(agent_lines));
    let task_id = task.object_id.clone();
    let runner = AgentRunner::new(
        task,
        bus.clone(),
        environment.clone(),
        None,
        HashMap::new(),
    )
    .unwrap();
    Fixture {
        _temp: temp,
        bus,
        runner,
        task_id,
        environment,
    }
}

async fn send_chat(fixture: &Fixture, text: &str) {
    let mut txn = fixture.bus.store().transaction(None).await.unwrap();
    fixture
        .bus
        .create_message(
            Message::ChatInputUser {
                message_id: MessageId::new(),
                text: text.to_string(),
            },
            &fixture.task_id,
            &mut txn,
        )
        .unwrap();
    txn.commit().unwrap();
}

async fn send_stop(fixture: &Fixture) {
    let mut txn = fixture.bus.store().transaction(None).await.unwrap();
    fixture
        .bus
        .create_message(
            Message::StopAgentUser {
                message_id: MessageId::new(),
            },
            &fixture.task_id,
            &mut txn,
        )
        .unwrap();
    txn.commit().unwrap();
}

async fn collected_messages(fixture: &Fixture) -> Vec<Message> {
    let txn = fixture.bus.store().transaction(None).await.unwrap();
    txn.get_messages_for_task(&fixture.task_id)
        .unwrap()
        .into_iter()
        .map(|saved| saved.message)
        .collect()
}

async fn wait_for_state(runner: &AgentRunner, state: RunnerState) {
    for _ in 0..200 {
        if runner.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("runner never reached {state:?} (currently {:?})", runner.state());
}

#[tokio::test]
async fn test_runner_reaches_ready_then_exits_on_stop() {
    let fixture = fixture(&[]).await;
    fixture.runner.start();
    wait_for_state(&fixture.runner, RunnerState::Ready).await;
    assert!(fixture.runner.is_alive());

    send_stop(&fixture).await;
    wait_for_state(&fixture.runner, RunnerState::Exited).await;
    fixture.runner.join().await;
    assert!(!fixture.runner.is_alive());
    assert!(fixture.runner.take_error().is_none());
}

#[tokio::test]
async fn test_chat_input_drives_one_request_cycle() {
    let lines = vec![
        serde_json::json!({"type": "system", "subtype": "init", "session_id": "session-fake"}),
        serde_json::json!({"type": "assistant", "message": {"content": [
            {"type": "text", "text": "working on it"}
        ]}}),
        serde_json::json!({"type": "result", "subtype": "success", "is_error": false}),
    ];
    let fixture = fixture(&lines).await;
    fixture.runner.start();
    wait_for_state(&fixture.runner, RunnerState::Ready).await;

    send_chat(&fixture, "please do the thing").await;

    // The request resolves and the runner returns to Ready.
    for _ in 0..200 {
        let messages = collected_messages(&fixture).await;
        if messages
            .iter()
            .any(|m| matches!(m, Message::RequestSuccessAgent { .. }))
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let messages = collected_messages(&fixture).await;
    assert!(messages
        .iter()
        .any(|m| matches!(m, Message::RequestStartedAgent { .. })));
    assert!(messages.iter().any(|m| matches!(
        m,
        Message::ResponseBlockAgent { content, .. }
            if content.iter().any(|b| matches!(b, ContentBlock::Text { text } if text == "working on it"))
    )));
    assert!(messages
        .iter()
        .any(|m| matches!(m, Message::RequestSuccessAgent { .. })));
    wait_for_state(&fixture.runner, RunnerState::Ready).await;

    send_stop(&fixture).await;
    fixture.runner.join().await;
}

#[tokio::test]
async fn test_tool_use_and_result_blocks_flow_through() {
    let lines = vec![
        serde_json::json!({"type": "assistant", "message": {"content": [
            {"type": "tool_use", "id": "tool-1", "name": "Bash", "input": {"command": "ls"}}
        ]}}),
        serde_json::json!({"type": "user", "message": {"content": [
            {"type": "tool_result", "tool_use_id": "tool-1", "content": "README.md"}
        ]}}),
        serde_json::json!({"type": "result", "is_error": false}),
    ];
    let fixture = fixture(&lines).await;
    fixture.runner.start();
    wait_for_state(&fixture.runner, RunnerState::Ready).await;
    send_chat(&fixture, "list files").await;

    for _ in 0..200 {
        let messages = collected_messages(&fixture).await;
        if messages
            .iter()
            .any(|m| matches!(m, Message::RequestSuccessAgent { .. }))
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let messages = collected_messages(&fixture).await;
    let has_tool_use = messages.iter().any(|m| matches!(
        m,
        Message::ResponseBlockAgent { content, .. }
            if content.iter().any(|b| matches!(b, ContentBlock::ToolUse { id, .. } if id == "tool-1"))
    ));
    let has_tool_result = messages.iter().any(|m| matches!(
        m,
        Message::ResponseBlockAgent { content, .. }
            if content.iter().any(|b| matches!(
                b,
                ContentBlock::ToolResult { tool_use_id, content: ToolContent::Generic { text }, .. }
                    if tool_use_id == "tool-1" && text == "README.md"
            ))
    ));
    assert!(has_tool_use);
    assert!(has_tool_result);

    send_stop(&fixture).await;
    fixture.runner.join().await;
}

#[tokio::test]
async fn test_failing_agent_reports_request_failure() {
    let fixture = {
        let temp = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let bus = TaskMessageBus::new(store);
        let project_id = ProjectId::new();
        let environment = Arc::new(
            LocalEnvironment::new(
                "env-runner-fail",
                project_id.clone(),
                temp.path().join("root"),
                temp.path().join("images"),
            )
            .unwrap(),
        );
        let task = agent_task(
            project_id,
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo boom >&2; exit 9".to_string(),
            ],
        );
        let task_id = task.object_id.clone();
        let runner = AgentRunner::new(
            task,
            bus.clone(),
            environment.clone(),
            None,
            HashMap::new(),
        )
        .unwrap();
        Fixture {
            _temp: temp,
            bus,
            runner,
            task_id,
            environment,
        }
    };
    fixture.runner.start();
    wait_for_state(&fixture.runner, RunnerState::Ready).await;
    send_chat(&fixture, "explode please").await;

    for _ in 0..200 {
        let messages = collected_messages(&fixture).await;
        if messages
            .iter()
            .any(|m| matches!(m, Message::RequestFailureAgent { .. }))
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let messages = collected_messages(&fixture).await;
    let failure = messages.iter().find_map(|m| match m {
        Message::RequestFailureAgent { error, .. } => Some(error.clone()),
        _ => None,
    });
    let failure = failure.expect("expected a request failure message");
    assert!(failure.message.contains("code 9"));

    send_stop(&fixture).await;
    fixture.runner.join().await;
}

#[tokio::test]
async fn test_non_agent_task_is_rejected() {
    let store = Store::open_in_memory().unwrap();
    let bus = TaskMessageBus::new(store);
    let temp = tempfile::tempdir().unwrap();
    let project_id = ProjectId::new();
    let environment = Arc::new(
        LocalEnvironment::new(
            "env-runner-reject",
            project_id.clone(),
            temp.path().join("root"),
            temp.path().join("images"),
        )
        .unwrap(),
    );
    let mut task = agent_task(project_id, vec!["true".to_string()]);
    task.input_data = TaskInputs::MustBeShutDownTaskInputs {};
    let result = AgentRunner::new(task, bus, environment, None, HashMap::new());
    assert!(result.is_err());
}

#[tokio::test]
async fn test_housekeeping_runner_honors_stop() {
    let temp = tempfile::tempdir().unwrap();
    let store = Store::open_in_memory().unwrap();
    let bus = TaskMessageBus::new(store);
    let mut task = agent_task(ProjectId::new(), vec!["true".to_string()]);
    task.input_data = TaskInputs::MustBeShutDownTaskInputs {};

    let paths = crate::config::PathsConfig {
        data_dir: temp.path().to_path_buf(),
    };
    let runner = HousekeepingRunner::new(task, bus, paths);
    runner.start();
    assert!(runner.is_alive());
    runner.stop();
    runner.join().await;
    assert!(!runner.is_alive());
}

#[tokio::test]
async fn test_checks_are_defined_and_run_after_request() {
    let lines = vec![serde_json::json!({"type": "result", "is_error": false})];
    let fixture = fixture(&lines).await;
    fixture
        .environment
        .write_file("/code/checks.toml", b"ok = \"true\"\nbad = \"false\"\n")
        .await
        .unwrap();

    fixture.runner.start();
    wait_for_state(&fixture.runner, RunnerState::Ready).await;

    // The check set is announced during startup.
    let messages = collected_messages(&fixture).await;
    let defined = messages.iter().find_map(|m| match m {
        Message::ChecksDefinedRunner { checks, .. } => Some(checks.clone()),
        _ => None,
    });
    let defined = defined.expect("expected a checks-defined message");
    let names: Vec<&str> = defined.iter().map(|c| c.name.as_str()).collect();
    assert!(names.contains(&"ok"));
    assert!(names.contains(&"bad"));

    send_chat(&fixture, "do the thing").await;

    // Both user checks launch and finish after the request completes.
    for _ in 0..200 {
        let messages = collected_messages(&fixture).await;
        let finished = messages
            .iter()
            .filter(|m| matches!(m, Message::CheckFinishedRunner { .. }))
            .count();
        if finished >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let messages = collected_messages(&fixture).await;
    let launched: Vec<&str> = messages
        .iter()
        .filter_map(|m| match m {
            Message::CheckLaunchedRunner { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert!(launched.contains(&"ok"));
    assert!(launched.contains(&"bad"));

    let exit_code_by_name: HashMap<&str, i32> = messages
        .iter()
        .filter_map(|m| match m {
            Message::CheckFinishedRunner { name, exit_code, .. } => {
                Some((name.as_str(), *exit_code))
            }
            _ => None,
        })
        .collect();
    assert_eq!(exit_code_by_name.get("ok"), Some(&0));
    assert_eq!(exit_code_by_name.get("bad"), Some(&1));

    // The failing check surfaced a suggestion.
    assert!(messages.iter().any(|m| matches!(
        m,
        Message::NewSuggestionRunner { suggestions, .. }
            if suggestions.iter().any(|s| s.title.contains("bad"))
    )));

    send_stop(&fixture).await;
    fixture.runner.join().await;
}

#[tokio::test]
async fn test_broken_check_entry_is_defined_but_never_launched() {
    let lines = vec![serde_json::json!({"type": "result", "is_error": false})];
    let fixture = fixture(&lines).await;
    fixture
        .environment
        .write_file(
            "/code/checks.toml",
            b"[broken]\ncommand = \"true\"\ntrigger = \"ON_FULL_MOON\"\n",
        )
        .await
        .unwrap();

    fixture.runner.start();
    wait_for_state(&fixture.runner, RunnerState::Ready).await;
    send_chat(&fixture, "go").await;

    for _ in 0..100 {
        let messages = collected_messages(&fixture).await;
        if messages
            .iter()
            .any(|m| matches!(m, Message::RequestSuccessAgent { .. }))
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let messages = collected_messages(&fixture).await;
    let defined = messages.iter().find_map(|m| match m {
        Message::ChecksDefinedRunner { checks, .. } => Some(checks.clone()),
        _ => None,
    });
    let defined = defined.expect("expected a checks-defined message");
    let broken = defined.iter().find(|c| c.name == "broken").unwrap();
    assert!(broken.config_error.is_some());
    // Misconfigured checks are announced but never run.
    assert!(!messages.iter().any(|m| matches!(
        m,
        Message::CheckLaunchedRunner { name, .. } if name == "broken"
    )));

    send_stop(&fixture).await;
    fixture.runner.join().await;
}
