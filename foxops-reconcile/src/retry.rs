//! The two retry loops the orchestrator runs: push divergence and blocked automerge.
//!
//! Everything else fails fast.

use std::future::Future;
use std::time::Duration;

use foxops_engine::{EngineError, GitRepository};

/// Push `branch` to `origin`, rebasing onto the remote and trying again when
/// the push is rejected as non-fast-forward. Attempts are immediate.
pub async fn push_with_retry(
    repo: &GitRepository,
    branch: &str,
    attempts: u32,
) -> Result<(), EngineError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match repo.push("origin", branch).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_push_rejected() && attempt < attempts => {
                tracing::warn!(%branch, attempt, attempts, "push rejected, rebasing onto remote");
                repo.pull_rebase("origin", branch).await?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Call `check` every `interval` until it reports `true` or `timeout` elapses.
///
/// Returns `Ok(false)` on timeout. Errors from `check` end the loop.
pub async fn poll_until<F, Fut, E>(interval: Duration, timeout: Duration, mut check: F) -> Result<bool, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await? {
            return Ok(true);
        }
        if tokio::time::Instant::now() + interval > deadline {
            return Ok(false);
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn poll_stops_when_check_succeeds() {
        let calls = AtomicU32::new(0);
        let done = poll_until::<_, _, ()>(Duration::from_secs(5), Duration::from_secs(600), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(n == 3) }
        })
        .await
        .unwrap();
        assert!(done);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_gives_up_at_deadline() {
        let calls = AtomicU32::new(0);
        let done = poll_until::<_, _, ()>(Duration::from_secs(5), Duration::from_secs(20), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(false) }
        })
        .await
        .unwrap();
        assert!(!done);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_propagates_check_errors() {
        let err = poll_until(Duration::from_secs(1), Duration::from_secs(10), || async {
            Err::<bool, _>("boom")
        })
        .await
        .unwrap_err();
        assert_eq!(err, "boom");
    }

    #[tokio::test]
    async fn diverged_push_is_rebased_and_retried() {
        let t = Duration::from_secs(30);
        let tmp = tempfile::TempDir::new().unwrap();
        let remote = tmp.path().join("remote.git");
        GitRepository::init(&remote, true, t).await.unwrap();
        let url = remote.to_string_lossy().into_owned();

        let seed = GitRepository::init(&tmp.path().join("seed"), false, t).await.unwrap();
        std::fs::write(seed.dir().join("a.txt"), "a").unwrap();
        seed.add_all().await.unwrap();
        seed.commit("a").await.unwrap();
        seed.push(&url, "main").await.unwrap();

        let ours = GitRepository::clone_from(&url, &tmp.path().join("ours"), None, false, t)
            .await
            .unwrap();

        std::fs::write(seed.dir().join("b.txt"), "b").unwrap();
        seed.add_all().await.unwrap();
        seed.commit("b").await.unwrap();
        seed.push(&url, "main").await.unwrap();

        std::fs::write(ours.dir().join("c.txt"), "c").unwrap();
        ours.add_all().await.unwrap();
        ours.commit("c").await.unwrap();

        push_with_retry(&ours, "main", 1).await.unwrap_err();
        push_with_retry(&ours, "main", 2).await.unwrap();
        assert!(ours.dir().join("b.txt").exists());
    }
}
