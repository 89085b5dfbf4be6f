//! Persistent boot marker and the startup decision it drives

use strum::Display;

/// How long the bootloader listens for a request before starting the application
pub const LISTEN_WINDOW_MS: u32 = 10_000;

/// Word kept in retained RAM across resets
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display)]
pub enum BootMarker {
    /// Stay in the bootloader
    Bootloader,
    /// Jump straight to the application
    Application,
    #[default]
    Absent,
}

impl BootMarker {
    const BOOTLOADER_WORD: u32 = 0xEE33_BB22;
    const APPLICATION_WORD: u32 = 0xAABB_CCEE;

    pub fn from_word(word: u32) -> Self {
        match word {
            Self::BOOTLOADER_WORD => BootMarker::Bootloader,
            Self::APPLICATION_WORD => BootMarker::Application,
            _ => BootMarker::Absent,
        }
    }

    pub fn to_word(self) -> u32 {
        match self {
            BootMarker::Bootloader => Self::BOOTLOADER_WORD,
            BootMarker::Application => Self::APPLICATION_WORD,
            BootMarker::Absent => 0,
        }
    }
}

/// Storage for the boot marker
pub trait BootMarkerStore {
    fn read_boot_marker(&self) -> BootMarker;

    fn write_boot_marker(&mut self, marker: BootMarker);
}

/// A marker word held in memory
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MarkerWord(pub u32);

impl BootMarkerStore for MarkerWord {
    fn read_boot_marker(&self) -> BootMarker {
        BootMarker::from_word(self.0)
    }

    fn write_boot_marker(&mut self, marker: BootMarker) {
        self.0 = marker.to_word();
    }
}

/// What the bootloader does after a reset
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum StartupAction {
    JumpToApplication,
    EnterBootloader,
    /// Listen for [LISTEN_WINDOW_MS] before deciding
    ListenWindow,
    /// Reset with the application marker set
    RebootToApplication,
}

impl StartupAction {
    /// Marker to persist before carrying out the action
    pub fn marker(self) -> Option<BootMarker> {
        match self {
            StartupAction::JumpToApplication | StartupAction::EnterBootloader => {
                Some(BootMarker::Absent)
            }
            StartupAction::RebootToApplication => Some(BootMarker::Application),
            StartupAction::ListenWindow => None,
        }
    }
}

/// Decide what to do right after reset.
pub fn startup_action(marker: BootMarker, application_erased: bool) -> StartupAction {
    if application_erased {
        return StartupAction::EnterBootloader;
    }

    match marker {
        BootMarker::Application => StartupAction::JumpToApplication,
        BootMarker::Bootloader => StartupAction::EnterBootloader,
        BootMarker::Absent => StartupAction::ListenWindow,
    }
}

/// Decide what to do once the listen window has passed.
pub fn after_listen_window(marker: BootMarker) -> StartupAction {
    match marker {
        BootMarker::Bootloader => StartupAction::EnterBootloader,
        _ => StartupAction::RebootToApplication,
    }
}

/// Read the marker, decide and persist the follow-up marker.
pub fn resolve_startup<M: BootMarkerStore>(store: &mut M, application_erased: bool) -> StartupAction {
    let action = startup_action(store.read_boot_marker(), application_erased);
    if let Some(marker) = action.marker() {
        store.write_boot_marker(marker);
    }
    action
}

/// Close the listen window and persist the follow-up marker.
pub fn resolve_listen_window<M: BootMarkerStore>(store: &mut M) -> StartupAction {
    let action = after_listen_window(store.read_boot_marker());
    if let Some(marker) = action.marker() {
        store.write_boot_marker(marker);
    }
    action
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn marker_words() {
        assert_eq!(BootMarker::from_word(0xEE33_BB22), BootMarker::Bootloader);
        assert_eq!(BootMarker::from_word(0xAABB_CCEE), BootMarker::Application);
        assert_eq!(BootMarker::from_word(0), BootMarker::Absent);
        assert_eq!(BootMarker::from_word(0xDEAD_BEEF), BootMarker::Absent);
    }

    #[test]
    fn startup_table() {
        use BootMarker::*;
        use StartupAction::*;

        for marker in [Bootloader, Application, Absent] {
            assert_eq!(startup_action(marker, true), EnterBootloader);
        }

        assert_eq!(startup_action(Application, false), JumpToApplication);
        assert_eq!(startup_action(Bootloader, false), EnterBootloader);
        assert_eq!(startup_action(Absent, false), ListenWindow);

        assert_eq!(after_listen_window(Bootloader), EnterBootloader);
        assert_eq!(after_listen_window(Absent), RebootToApplication);
    }

    #[test]
    fn listen_window_persists_markers() {
        let mut store = MarkerWord(BootMarker::Bootloader.to_word());
        assert_eq!(resolve_listen_window(&mut store), StartupAction::EnterBootloader);
        assert_eq!(store.read_boot_marker(), BootMarker::Absent);

        assert_eq!(
            resolve_listen_window(&mut store),
            StartupAction::RebootToApplication
        );
        assert_eq!(store.read_boot_marker(), BootMarker::Application);

        // after the reboot the application marker is consumed
        assert_eq!(
            resolve_startup(&mut store, false),
            StartupAction::JumpToApplication
        );
        assert_eq!(store, MarkerWord(0));
    }
}
