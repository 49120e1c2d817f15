use super::*;
use crate::env::LocalEnvironment;
use crate::ids::ProjectId;
use regex::Regex;

const FILE_CONTENTS: &str = "def foo() -> None:\n    pass";
const NEW_FILE_CONTENTS: &str = "def foo() -> None:\n    print('this is new!')";

fn text(value: &str) -> FileContent {
    FileContent::Text(value.to_string())
}

/// Normalize git diff output by replacing index hashes with zeros, since
/// the blob hashes depend on git's hashing configuration.
fn normalize_diff(diff: &str) -> String {
    let re = Regex::new(r"index [0-9a-f]+\.\.[0-9a-f]+").unwrap();
    re.replace_all(diff, "index 0000000..0000000").into_owned()
}

#[test]
fn test_no_change_returns_empty_string() {
    let result = create_unified_diff("test.txt", Some(&text("hello world")), &text("hello world"));
    assert_eq!(result.unwrap(), Some(String::new()));

    let binary = FileContent::Binary(b"hello world".to_vec());
    let result = create_unified_diff("test.bin", Some(&binary), &binary);
    assert_eq!(result.unwrap(), Some(String::new()));
}

#[test]
fn test_regular_text_diff() {
    let result = create_unified_diff(
        "test.txt",
        Some(&text("Line 1\nLine 2\nLine 3\n")),
        &text("Line 1\nLine 2 modified\nLine 3\nLine 4\n"),
    )
    .unwrap()
    .unwrap();

    let expected = "diff --git a/test.txt b/test.txt\n\
                    index 0000000..0000000 100644\n\
                    --- a/test.txt\n\
                    +++ b/test.txt\n\
                    @@ -1,3 +1,4 @@\n \
                    Line 1\n\
                    -Line 2\n\
                    +Line 2 modified\n \
                    Line 3\n\
                    +Line 4\n";
    assert_eq!(normalize_diff(&result), expected);
}

#[test]
fn test_file_creation() {
    let result = create_unified_diff("new_file.txt", None, &text("Hello, world!\nThis is new.\n"))
        .unwrap()
        .unwrap();

    let expected = "diff --git a/new_file.txt b/new_file.txt\n\
                    new file mode 100644\n\
                    index 0000000..0000000\n\
                    --- /dev/null\n\
                    +++ b/new_file.txt\n\
                    @@ -0,0 +1,2 @@\n\
                    +Hello, world!\n\
                    +This is new.\n";
    assert_eq!(normalize_diff(&result), expected);
}

#[test]
fn test_no_newline_at_end_of_file() {
    let result = create_unified_diff(
        "no_newline.txt",
        Some(&text("Line without newline")),
        &text("Line without newline\n"),
    )
    .unwrap()
    .unwrap();

    let expected = "diff --git a/no_newline.txt b/no_newline.txt\n\
                    index 0000000..0000000 100644\n\
                    --- a/no_newline.txt\n\
                    +++ b/no_newline.txt\n\
                    @@ -1 +1 @@\n\
                    -Line without newline\n\
                    \\ No newline at end of file\n\
                    +Line without newline\n";
    assert_eq!(normalize_diff(&result), expected);
}

#[test]
fn test_no_temp_paths_leak_into_output() {
    let result = create_unified_diff(
        "src/components/Button.tsx",
        Some(&text("export const Button = () => <button>Click</button>\n")),
        &text("export const Button = () => <button>Click me!</button>\n"),
    )
    .unwrap()
    .unwrap();

    assert!(result.contains("diff --git a/src/components/Button.tsx b/src/components/Button.tsx"));
    assert_eq!(result.matches("--- a/src/components/Button.tsx").count(), 1);
    assert_eq!(result.matches("+++ b/src/components/Button.tsx").count(), 1);
    let tmp = std::env::temp_dir();
    assert!(!result.contains(&tmp.to_string_lossy().into_owned()));
}

#[test]
fn test_binary_file_modification() {
    let old = FileContent::Binary(b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR\x00\x00\x00\x01".to_vec());
    let new = FileContent::Binary(b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR\x00\x00\x00\x02".to_vec());

    let result = create_unified_diff("image.png", Some(&old), &new).unwrap().unwrap();

    // Output depends on the installed git: either the short marker or a
    // full binary patch.
    assert!(
        result.contains("Binary files a/image.png and b/image.png differ")
            || result.contains("GIT binary patch"),
        "unexpected binary diff output: {result}"
    );
}

#[test]
fn test_empty_file_to_content() {
    let result = create_unified_diff("empty.txt", Some(&text("")), &text("Now has content\n"))
        .unwrap()
        .unwrap();
    assert!(normalize_diff(&result).contains("@@ -0,0 +1 @@\n+Now has content\n"));
}

#[test]
fn test_unicode_content() {
    let result = create_unified_diff(
        "unicode.txt",
        Some(&text("Hello \u{4e16}\u{754c}\n")),
        &text("Hello \u{4e16}\u{754c}! \u{1f389}\n"),
    )
    .unwrap()
    .unwrap();
    assert!(result.contains("-Hello \u{4e16}\u{754c}"));
    assert!(result.contains("+Hello \u{4e16}\u{754c}! \u{1f389}"));
}

// Tracker tests against a real repo inside a local environment.

struct Fixture {
    _temp: tempfile::TempDir,
    environment: Arc<LocalEnvironment>,
    commit_hash: String,
}

async fn run_git(environment: &LocalEnvironment, args: &[&str]) -> String {
    let mut command = vec!["git".to_string()];
    command.extend(args.iter().map(|s| s.to_string()));
    let spec = ProcessSpec::new(command)
        .with_cwd(environment.get_workspace_path().to_string_lossy().into_owned());
    let process = environment.run_process_to_completion(spec).await.unwrap();
    process.read_stdout()
}

async fn setup_repo() -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let environment = LocalEnvironment::new(
        "env-diff-test",
        ProjectId::new(),
        temp.path().join("root"),
        temp.path().join("images"),
    )
    .unwrap();

    environment
        .write_file("/code/main.py", FILE_CONTENTS.as_bytes())
        .await
        .unwrap();
    run_git(&environment, &["init"]).await;
    run_git(&environment, &["config", "user.email", "test@example.com"]).await;
    run_git(&environment, &["config", "user.name", "test"]).await;
    run_git(&environment, &["add", "."]).await;
    run_git(&environment, &["commit", "-am", "initial commit"]).await;
    let commit_hash = run_git(&environment, &["rev-parse", "HEAD"]).await.trim().to_string();

    Fixture {
        _temp: temp,
        environment: Arc::new(environment),
        commit_hash,
    }
}

#[tokio::test]
async fn test_compute_diff_after_edit_to_existing_file() {
    let fixture = setup_repo().await;
    let mut tracker = DiffTracker::new(
        fixture.environment.clone(),
        Some(fixture.commit_hash.clone()),
    );

    fixture
        .environment
        .write_file("/code/main.py", NEW_FILE_CONTENTS.as_bytes())
        .await
        .unwrap();

    let input = serde_json::json!({ "file_path": "/code/main.py" });
    let diff = tracker.compute_diff_for_tool("Edit", &input).await.unwrap();

    assert!(diff.contains("--- a/code/main.py"));
    assert!(diff.contains("+++ b/code/main.py"));
    assert!(diff.contains("-    pass"));
    assert!(diff.contains("+    print('this is new!')"));
}

#[tokio::test]
async fn test_compute_diff_for_new_file_uses_dev_null() {
    let fixture = setup_repo().await;
    let mut tracker = DiffTracker::new(
        fixture.environment.clone(),
        Some(fixture.commit_hash.clone()),
    );

    fixture
        .environment
        .write_file("/code/blah.py", NEW_FILE_CONTENTS.as_bytes())
        .await
        .unwrap();

    let input = serde_json::json!({ "file_path": "/code/blah.py" });
    let diff = tracker.compute_diff_for_tool("Write", &input).await.unwrap();

    assert!(diff.contains("--- /dev/null"));
    assert!(diff.contains("+++ b/code/blah.py"));
}

#[tokio::test]
async fn test_absent_file_produces_no_diff() {
    let fixture = setup_repo().await;
    let mut tracker = DiffTracker::new(
        fixture.environment.clone(),
        Some(fixture.commit_hash.clone()),
    );
    let input = serde_json::json!({ "file_path": "/code/does_not_exist.py" });
    assert!(tracker.compute_diff_for_tool("Edit", &input).await.is_none());
}

#[tokio::test]
async fn test_non_edit_tools_are_ignored() {
    let fixture = setup_repo().await;
    let mut tracker = DiffTracker::new(fixture.environment.clone(), None);
    let input = serde_json::json!({ "file_path": "/code/main.py" });
    assert!(tracker.compute_diff_for_tool("Bash", &input).await.is_none());
}

#[tokio::test]
async fn test_second_edit_diffs_against_first() {
    let fixture = setup_repo().await;
    let mut tracker = DiffTracker::new(
        fixture.environment.clone(),
        Some(fixture.commit_hash.clone()),
    );
    let input = serde_json::json!({ "file_path": "/code/main.py" });

    fixture
        .environment
        .write_file("/code/main.py", b"version two")
        .await
        .unwrap();
    tracker.compute_diff_for_tool("Edit", &input).await.unwrap();

    fixture
        .environment
        .write_file("/code/main.py", b"version three")
        .await
        .unwrap();
    let diff = tracker.compute_diff_for_tool("Edit", &input).await.unwrap();
    assert!(diff.contains("-version two"));
    assert!(diff.contains("+version three"));
}
