//! Small runtime helpers shared by the process supervisor and the runner.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

/// A `(prefix, sender)` pair: lines are only forwarded to `sender` when
/// `prefix` is `None` or the line starts with it.
type PrefixFilteredChannel = (Option<String>, mpsc::UnboundedSender<String>);

/// Handle for registering additional listeners on a line stream already
/// being broadcast. Dropping the underlying stream closes every listener.
#[derive(Clone)]
pub struct LineBroadcast(Weak<Mutex<Vec<PrefixFilteredChannel>>>);

impl LineBroadcast {
    /// Subscribes to lines matching `prefix` (or all lines, if `None`).
    pub fn receive(&self, prefix: Option<String>) -> mpsc::UnboundedReceiver<String> {
        let (sender, receiver) = mpsc::unbounded_channel::<String>();
        if let Some(internal) = self.0.upgrade() {
            internal.lock().unwrap().push((prefix, sender));
        }
        receiver
    }
}

/// Fans a line stream out to every registered [`LineBroadcast`] subscriber,
/// falling back to `fallback` for lines no subscriber's prefix matches.
/// Used to split a tool's stdout into warning/error/step-marker/plain
/// consumers without each one re-scanning the whole stream.
pub fn broadcast_lines<T>(mut lines: T, fallback: impl Fn(String) + Send + 'static) -> LineBroadcast
where
    T: Stream<Item = std::io::Result<String>> + Send + Unpin + 'static,
{
    let senders: Arc<Mutex<Vec<PrefixFilteredChannel>>> = Arc::new(Mutex::new(Vec::new()));
    let weak = Arc::downgrade(&senders);

    tokio::spawn(async move {
        while let Some(Ok(line)) = lines.next().await {
            let mut senders = senders.lock().unwrap();
            senders.retain(|(_, tx)| !tx.is_closed());
            let mut delivered = false;
            for (prefix, tx) in senders.iter() {
                if prefix.as_deref().is_none_or(|p| line.starts_with(p)) {
                    delivered |= tx.send(line.clone()).is_ok();
                }
            }
            if !delivered {
                fallback(line.clone());
            }
        }
    });

    LineBroadcast(weak)
}

/// Switches the process working directory to `dir` for the lifetime of the
/// guard, restoring the previous directory on drop (success, error, or
/// cancellation all go through the same unwind path).
///
/// The runner is single-threaded along one dependency chain (concurrent
/// flow runs happen in separate OS processes under DSE), so a process-wide
/// cwd is safe to mutate here.
pub struct WorkingDirectoryGuard {
    previous: PathBuf,
}

impl WorkingDirectoryGuard {
    pub fn enter(dir: &Path) -> std::io::Result<Self> {
        let previous = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        Ok(WorkingDirectoryGuard { previous })
    }
}

impl Drop for WorkingDirectoryGuard {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[tokio::test]
    async fn broadcast_listeners_close_when_source_does() {
        let (tx, rx) = mpsc::unbounded_channel();
        let broadcast = broadcast_lines(UnboundedReceiverStream::new(rx), |_| {});

        let mut rx2 = broadcast.receive(None);
        tx.send(Ok("hello".to_string())).unwrap();
        assert_eq!(rx2.recv().await, Some("hello".to_string()));

        let wait_again = tokio::spawn(async move { rx2.recv().await });
        drop(tx);
        assert_eq!(wait_again.await.unwrap(), None);
    }

    #[tokio::test]
    async fn prefix_filter_only_delivers_matching_lines() {
        let (tx, rx) = mpsc::unbounded_channel();
        let broadcast = broadcast_lines(UnboundedReceiverStream::new(rx), |_| {});
        let mut warnings = broadcast.receive(Some("warning:".to_string()));

        tx.send(Ok("warning: clock skew".to_string())).unwrap();
        tx.send(Ok("note: unrelated".to_string())).unwrap();
        drop(tx);

        assert_eq!(warnings.recv().await, Some("warning: clock skew".to_string()));
        assert_eq!(warnings.recv().await, None);
    }

    #[test]
    fn working_directory_guard_restores_on_drop() {
        let original = std::env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        {
            let _guard = WorkingDirectoryGuard::enter(tmp.path()).unwrap();
            assert_eq!(std::env::current_dir().unwrap(), tmp.path().canonicalize().unwrap());
        }
        assert_eq!(std::env::current_dir().unwrap(), original);
    }
}
