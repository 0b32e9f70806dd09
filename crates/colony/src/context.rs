//! Task-local ambient context.
//!
//! Two pieces of ambient state flow through task-local storage rather than
//! globals: the identity of the process whose dispatch loop is currently
//! executing, and the session id bound by [`session_scope`]. Both are
//! scoped; there is no process-wide mutable singleton.

use crate::pid::ProcessId;
use std::future::Future;

tokio::task_local! {
    /// The process whose dispatch loop is executing on this task.
    static CURRENT_PID: ProcessId;

    /// The session id bound by `session_scope`.
    static CURRENT_SESSION: String;
}

/// The id of the process currently executing, if the caller is inside a
/// dispatch loop (including user inbox handlers).
///
/// Spawns performed from inside a handler attach the new process as a child
/// of this id; top-level spawns return `None` here and attach under
/// `/root/user`.
pub fn current_pid() -> Option<ProcessId> {
    CURRENT_PID.try_with(|pid| pid.clone()).ok()
}

/// Runs `fut` with `pid` as the ambient current process.
pub(crate) async fn pid_scope<F: Future>(pid: ProcessId, fut: F) -> F::Output {
    CURRENT_PID.scope(pid, fut).await
}

/// Runs `fut` with `id` bound as the ambient session.
///
/// Session accessors like `ProcessSystem::session_get_data` resolve the
/// session id from this binding.
///
/// # Examples
///
/// ```ignore
/// colony::session_scope("user-42", async {
///     system.session_start_ambient(Duration::from_secs(60)).await;
///     system.session_set_data("cart", &vec![1, 2, 3]).await?;
/// }).await;
/// ```
pub async fn session_scope<F: Future>(id: impl Into<String>, fut: F) -> F::Output {
    CURRENT_SESSION.scope(id.into(), fut).await
}

/// The ambient session id, if the caller is inside a [`session_scope`].
pub(crate) fn current_session() -> Option<String> {
    CURRENT_SESSION.try_with(|id| id.clone()).ok()
}
