use std::path::Path;
use std::sync::Arc;

use tailcontrol::*;
use tokio::sync::mpsc;

/// A stand-in `tailscale` that swallows stdin and prints `stderr_line`.
fn fake_binary(dir: &Path, stderr_line: &str, code: i32) -> String {
    let script = dir.join("tailscale.sh");
    std::fs::write(
        &script,
        format!("cat > /dev/null\necho '{stderr_line}' >&2\nexit {code}\n"),
    )
    .unwrap();
    format!("sh {}", script.display())
}

async fn send(binary: &str, file: &Path) -> (TransferOutcome, Vec<TransferEvent>) {
    let shell = RootShell::new("sh", "-c");
    let exec: Arc<dyn CommandExecutor> = Arc::new(shell.clone());
    let (tx, mut rx) = mpsc::channel(64);
    let outcome = send_file(&shell, exec, binary, file, "laptop", tx).await.unwrap();

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (outcome, events)
}

#[tokio::test]
async fn successful_send_reports_progress() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("photo.jpg");
    std::fs::write(&file, vec![7u8; 64 * 1024]).unwrap();
    let binary = fake_binary(dir.path(), "sending 50%", 0);

    let (outcome, events) = send(&binary, &file).await;
    assert!(outcome.success());
    assert_eq!(outcome.message(), "transfer complete");
    assert!(events.contains(&TransferEvent::Progress(50)));
    assert!(events.contains(&TransferEvent::Log("sending 50%".into())));
    assert_eq!(events.last(), Some(&TransferEvent::Progress(100)));
}

#[tokio::test]
async fn failed_send_carries_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("notes.txt");
    std::fs::write(&file, "hello").unwrap();
    let binary = fake_binary(dir.path(), "unknown target laptop", 1);

    let (outcome, events) = send(&binary, &file).await;
    assert_eq!(outcome.code, Some(1));
    assert_eq!(outcome.message(), "failed: unknown target laptop");
    assert!(!events.contains(&TransferEvent::Progress(100)));
}

#[tokio::test]
async fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let shell = RootShell::new("sh", "-c");
    let exec: Arc<dyn CommandExecutor> = Arc::new(shell.clone());
    let (tx, _rx) = mpsc::channel(1);

    let err = send_file(&shell, exec, "tailscale", &dir.path().join("gone"), "laptop", tx)
        .await
        .unwrap_err();
    assert!(matches!(err, TailcontrolError::Io(_)));
}
