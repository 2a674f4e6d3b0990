//! Application state machines.
//!
//! Each piece of shared UI state (auth, notifications, theme) is a plain
//! state type with an action enum and a `Reducer` impl. A `Dispatcher` owns
//! the state in its own task and publishes every change.

pub mod auth;
pub mod dispatcher;
pub mod notifications;
pub mod theme;

pub use auth::{refresh_delay, spawn_session_refresh, AuthAction, AuthState, LoginPayload};
pub use dispatcher::{Dispatcher, Reducer, StateError};
pub use notifications::{notify, Level, Notification, NotificationAction, NotificationState, SystemAlert};
pub use theme::{PreferencesUpdate, Theme, ThemeAction, ThemePreferences, ThemeState};
