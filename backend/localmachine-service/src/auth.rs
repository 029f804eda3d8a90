//! Acting-user context for replayed side effects.
//!
//! Business services attribute changes (status history, audit rows) to the
//! current user. During replay that user is the original author, installed
//! for the duration of one future with [`run_as`]. The context is task-local:
//! concurrent replays never observe each other's identity, and the previous
//! identity is back in place however the future ends (return, error, panic
//! or drop).

use std::future::Future;
use uuid::Uuid;

tokio::task_local! {
    static ACTING_USER: Option<ActingUser>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActingUser {
    pub user_id: Uuid,
    pub username: Option<String>,
}

impl ActingUser {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            username: None,
        }
    }
}

/// Identity installed by the innermost enclosing [`run_as`], if any
pub fn current_user() -> Option<ActingUser> {
    ACTING_USER.try_with(|user| user.clone()).ok().flatten()
}

/// Run `fut` with `user` as the acting identity
pub async fn run_as<F>(user: ActingUser, fut: F) -> F::Output
where
    F: Future,
{
    ACTING_USER.scope(Some(user), fut).await
}
