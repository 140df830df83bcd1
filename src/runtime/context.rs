//! Execution context scoped to a single run attempt.

use std::future::Future;

use crate::domain::RunUser;

tokio::task_local! {
    static RUN_USER: Option<RunUser>;
}

/// Runs `fut` with `user` installed as the caller identity.
pub async fn with_run_user<F>(user: Option<RunUser>, fut: F) -> F::Output
where
    F: Future,
{
    RUN_USER.scope(user, fut).await
}

/// Identity of the caller that submitted the current run, if any.
///
/// Returns `None` outside a run scope.
pub fn current_user() -> Option<RunUser> {
    RUN_USER.try_with(Clone::clone).ok().flatten()
}
