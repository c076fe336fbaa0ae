//! Operator console: stdin lines fed to the coordination loop.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Spawn the stdin reader. The channel closes when stdin does.
pub fn spawn_stdin() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
        tracing::debug!("console closed");
    });
    rx
}
