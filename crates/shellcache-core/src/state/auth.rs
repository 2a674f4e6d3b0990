//! Authentication state and session refresh scheduling.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dispatcher::{Dispatcher, Reducer};
use crate::clock::SharedClock;
use crate::reporting::{ErrorReport, ReportSource, SharedReporter};

/// Refresh this long before the session expires.
const REFRESH_LEAD_MINUTES: i64 = 5;

/// Never schedule a refresh sooner than this.
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(60);

/// Permission that implies every other one.
const ADMIN_PERMISSION: &str = "admin";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginPayload {
    pub user: Map<String, Value>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub session_expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthState {
    pub user: Option<Map<String, Value>>,
    pub is_authenticated: bool,
    pub is_loading: bool,
    pub permissions: Vec<String>,
    pub session_expiry: Option<DateTime<Utc>>,
}

impl Default for AuthState {
    /// Loading until the stored session has been checked.
    fn default() -> Self {
        Self {
            user: None,
            is_authenticated: false,
            is_loading: true,
            permissions: Vec::new(),
            session_expiry: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthAction {
    SetLoading(bool),
    LoginSuccess(LoginPayload),
    Logout,
    /// Merged into the current user's fields
    UpdateUser(Map<String, Value>),
    RefreshSession { session_expiry: Option<DateTime<Utc>> },
}

impl Reducer for AuthState {
    type Action = AuthAction;

    fn reduce(&mut self, action: AuthAction) {
        match action {
            AuthAction::SetLoading(loading) => self.is_loading = loading,
            AuthAction::LoginSuccess(payload) => {
                self.user = Some(payload.user);
                self.is_authenticated = true;
                self.permissions = payload.permissions;
                self.session_expiry = payload.session_expiry;
                self.is_loading = false;
            }
            AuthAction::Logout => {
                *self = AuthState {
                    is_loading: false,
                    ..AuthState::default()
                };
            }
            AuthAction::UpdateUser(fields) => {
                self.user.get_or_insert_with(Map::new).extend(fields);
            }
            AuthAction::RefreshSession { session_expiry } => self.session_expiry = session_expiry,
        }
    }
}

impl AuthState {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions
            .iter()
            .any(|p| p == permission || p == ADMIN_PERMISSION)
    }
}

/// Time to wait before refreshing a session that expires at `expiry`:
/// five minutes early, but never less than a minute from now.
pub fn refresh_delay(expiry: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let lead = chrono::Duration::minutes(REFRESH_LEAD_MINUTES);
    (expiry - now - lead).to_std().unwrap_or(MIN_REFRESH_DELAY).max(MIN_REFRESH_DELAY)
}

/// Keep the session alive: whenever the state is authenticated with an
/// expiry, wait `refresh_delay` and call `refresh` for a new expiry. A
/// failed refresh is reported and logs the user out.
pub fn spawn_session_refresh<F, Fut, E>(
    dispatcher: Dispatcher<AuthState>,
    clock: SharedClock,
    reporter: SharedReporter,
    refresh: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<DateTime<Utc>, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        let mut states = dispatcher.subscribe();
        loop {
            let expiry = {
                let state = states.borrow_and_update();
                state.session_expiry.filter(|_| state.is_authenticated)
            };

            let Some(expiry) = expiry else {
                if states.changed().await.is_err() {
                    return;
                }
                continue;
            };

            let delay = refresh_delay(expiry, clock.now());
            debug!(delay_secs = delay.as_secs(), "Session refresh scheduled");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let action = match refresh().await {
                        Ok(session_expiry) => {
                            info!(expires = %session_expiry, "Session refreshed");
                            AuthAction::RefreshSession { session_expiry: Some(session_expiry) }
                        }
                        Err(e) => {
                            warn!(error = %e, "Session refresh failed, logging out");
                            reporter.report(
                                ErrorReport::new(ReportSource::BackgroundTask, e.to_string())
                                    .with_context("session refresh"),
                            );
                            AuthAction::Logout
                        }
                    };
                    if dispatcher.dispatch(action).await.is_err() {
                        return;
                    }
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    })
}
