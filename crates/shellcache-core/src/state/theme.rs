//! Colour theme selection and preferences, persisted in the local store.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::dispatcher::{Dispatcher, Reducer};
use crate::storage::LocalStore;

pub const THEME_KEY: &str = "currentTheme";
pub const PREFERENCES_KEY: &str = "themePreferences";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Light,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "light" => Some(Theme::Light),
            "dark" => Some(Theme::Dark),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemePreferences {
    pub auto_detect_system_theme: bool,
    pub animations: bool,
    pub high_contrast: bool,
}

impl Default for ThemePreferences {
    fn default() -> Self {
        Self {
            auto_detect_system_theme: true,
            animations: true,
            high_contrast: false,
        }
    }
}

/// Partial preference update; absent fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesUpdate {
    pub auto_detect_system_theme: Option<bool>,
    pub animations: Option<bool>,
    pub high_contrast: Option<bool>,
}

impl ThemePreferences {
    fn apply(&mut self, update: PreferencesUpdate) {
        if let Some(v) = update.auto_detect_system_theme {
            self.auto_detect_system_theme = v;
        }
        if let Some(v) = update.animations {
            self.animations = v;
        }
        if let Some(v) = update.high_contrast {
            self.high_contrast = v;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThemeState {
    pub current: Theme,
    pub preferences: ThemePreferences,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThemeAction {
    SetTheme(Theme),
    Toggle,
    UpdatePreferences(PreferencesUpdate),
    /// The system colour scheme; followed only with auto-detect on
    DetectSystemTheme(Theme),
}

impl Reducer for ThemeState {
    type Action = ThemeAction;

    fn reduce(&mut self, action: ThemeAction) {
        match action {
            ThemeAction::SetTheme(theme) => self.current = theme,
            ThemeAction::Toggle => self.current = self.current.toggled(),
            ThemeAction::UpdatePreferences(update) => self.preferences.apply(update),
            ThemeAction::DetectSystemTheme(theme) => {
                if self.preferences.auto_detect_system_theme {
                    self.current = theme;
                }
            }
        }
    }
}

/// Restore saved state. Without a saved theme the system theme is used,
/// unless auto-detect was switched off.
pub fn load(store: &LocalStore, system: Theme) -> ThemeState {
    let mut state = ThemeState::default();
    if let Some(update) = store.get_item::<PreferencesUpdate>(PREFERENCES_KEY) {
        state.reduce(ThemeAction::UpdatePreferences(update));
    }

    let saved = store.get_item::<String>(THEME_KEY).and_then(|s| Theme::parse(&s));
    match saved {
        Some(theme) => state.reduce(ThemeAction::SetTheme(theme)),
        None => state.reduce(ThemeAction::DetectSystemTheme(system)),
    }
    state
}

pub fn persist(store: &LocalStore, state: &ThemeState) {
    if let Err(e) = store.set_item(THEME_KEY, state.current.name()) {
        warn!(error = %e, "Failed to save theme");
    }
    if let Err(e) = store.set_item(PREFERENCES_KEY, &state.preferences) {
        warn!(error = %e, "Failed to save theme preferences");
    }
}

/// Theme dispatcher that writes every change back to `store`.
pub fn spawn(store: LocalStore, system: Theme) -> Dispatcher<ThemeState> {
    let initial = load(&store, system);
    Dispatcher::spawn_with_effect(initial, move |state: &ThemeState| persist(&store, state))
}
