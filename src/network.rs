//! Network policy evaluation.
//!
//! Maps the current link and the user's preferences to a coarse
//! [`NetworkState`] and decides whether a given [`Action`] may run.

use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use crate::config::Preferences;
use crate::error::ActionParseError;
use crate::telemetry::ErrorReporter;

/// Physical or virtual link type of the active connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Ethernet,
    Wifi,
    Wimax,
    Vpn,
    Mobile,
    MobileDun,
    MobileHipri,
    MobileMms,
    Other,
}

impl ConnectionType {
    /// Cellular links are metered and subject to the Wi-Fi-only preference
    pub fn is_cellular(self) -> bool {
        matches!(
            self,
            ConnectionType::Mobile
                | ConnectionType::MobileDun
                | ConnectionType::MobileHipri
                | ConnectionType::MobileMms
        )
    }
}

/// Snapshot of the device's connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connectivity {
    /// Type of the active network, `None` when there is no active network
    pub connection: Option<ConnectionType>,
    pub is_connected: bool,
}

impl Connectivity {
    pub fn connected(connection: ConnectionType) -> Self {
        Self {
            connection: Some(connection),
            is_connected: true,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connection: None,
            is_connected: false,
        }
    }
}

/// Source of the current connectivity
pub trait ConnectivityProvider: Send + Sync {
    fn current_connectivity(&self) -> Connectivity;
}

/// Connectivity that only changes when told to
#[derive(Debug)]
pub struct StaticConnectivity {
    current: RwLock<Connectivity>,
}

impl StaticConnectivity {
    pub fn new(connectivity: Connectivity) -> Self {
        Self {
            current: RwLock::new(connectivity),
        }
    }

    pub fn set(&self, connectivity: Connectivity) {
        match self.current.write() {
            Ok(mut guard) => *guard = connectivity,
            Err(poisoned) => *poisoned.into_inner() = connectivity,
        }
    }
}

impl ConnectivityProvider for StaticConnectivity {
    fn current_connectivity(&self) -> Connectivity {
        match self.current.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Coarse classification of the network, recomputed on every check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Ok,
    Restricted,
    Disconnected,
}

impl NetworkState {
    /// Any state with a usable link
    pub fn is_usable(self) -> bool {
        matches!(self, NetworkState::Ok | NetworkState::Restricted)
    }
}

/// Intended network action gated by [`can_perform`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    RefreshSubscription,
    StreamEpisode,
    DownloadManually,
    DownloadAutomatically,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::RefreshSubscription => "refresh_subscription",
            Action::StreamEpisode => "stream_episode",
            Action::DownloadManually => "download_manually",
            Action::DownloadAutomatically => "download_automatically",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ActionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "refresh_subscription" => Ok(Action::RefreshSubscription),
            "stream_episode" => Ok(Action::StreamEpisode),
            "download_manually" => Ok(Action::DownloadManually),
            "download_automatically" => Ok(Action::DownloadAutomatically),
            other => Err(ActionParseError(other.to_string())),
        }
    }
}

/// Per-subscription override of the global auto-download preference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionPolicy {
    pub auto_download: Option<bool>,
}

impl SubscriptionPolicy {
    /// Resolve the effective auto-download flag against the global default
    pub fn download_new(&self, global_default: bool) -> bool {
        self.auto_download.unwrap_or(global_default)
    }
}

/// Classify the current link
pub fn evaluate(connectivity: Connectivity, preferences: &Preferences) -> NetworkState {
    if !connectivity.is_connected {
        return NetworkState::Disconnected;
    }

    match connectivity.connection {
        None => NetworkState::Disconnected,
        Some(kind) if kind.is_cellular() => {
            if preferences.wifi_only {
                NetworkState::Restricted
            } else {
                NetworkState::Ok
            }
        }
        Some(_) => NetworkState::Ok,
    }
}

/// Decide whether `action` may run in `state`
pub fn can_perform(
    action: Action,
    state: NetworkState,
    preferences: &Preferences,
    subscription: Option<&SubscriptionPolicy>,
) -> bool {
    if state == NetworkState::Disconnected {
        return false;
    }

    match action {
        Action::DownloadAutomatically => {
            let automatic = subscription
                .map(|s| s.download_new(preferences.auto_download))
                .unwrap_or(preferences.auto_download);

            if !automatic {
                return false;
            }

            if preferences.wifi_only {
                state == NetworkState::Ok
            } else {
                state.is_usable()
            }
        }
        Action::DownloadManually | Action::RefreshSubscription | Action::StreamEpisode => {
            state.is_usable()
        }
    }
}

/// Like [`can_perform`] for an action given by name.
///
/// Unknown names are denied and reported.
pub fn can_perform_named(
    action: &str,
    state: NetworkState,
    preferences: &Preferences,
    subscription: Option<&SubscriptionPolicy>,
    telemetry: &dyn ErrorReporter,
) -> bool {
    match action.parse::<Action>() {
        Ok(action) => can_perform(action, state, preferences, subscription),
        Err(e) => {
            telemetry.report("network_policy", &format!("can_perform defaults to false: {e}"));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const ALL_ACTIONS: [Action; 4] = [
        Action::RefreshSubscription,
        Action::StreamEpisode,
        Action::DownloadManually,
        Action::DownloadAutomatically,
    ];

    #[derive(Default)]
    struct RecordingReporter {
        reports: Mutex<Vec<String>>,
    }

    impl ErrorReporter for RecordingReporter {
        fn report(&self, _tag: &str, message: &str) {
            self.reports.lock().unwrap().push(message.to_string());
        }
    }

    fn prefs(wifi_only: bool, auto_download: bool) -> Preferences {
        Preferences {
            wifi_only,
            auto_download,
            megabytes_to_keep: 1000,
        }
    }

    #[test]
    fn unmetered_links_are_ok() {
        for kind in [
            ConnectionType::Ethernet,
            ConnectionType::Wifi,
            ConnectionType::Wimax,
            ConnectionType::Vpn,
        ] {
            assert_eq!(
                evaluate(Connectivity::connected(kind), &prefs(true, true)),
                NetworkState::Ok
            );
        }
    }

    #[test]
    fn cellular_depends_on_wifi_only() {
        let mobile = Connectivity::connected(ConnectionType::MobileHipri);
        assert_eq!(evaluate(mobile, &prefs(true, true)), NetworkState::Restricted);
        assert_eq!(evaluate(mobile, &prefs(false, true)), NetworkState::Ok);
    }

    #[test]
    fn no_connection_is_disconnected() {
        assert_eq!(
            evaluate(Connectivity::disconnected(), &prefs(false, true)),
            NetworkState::Disconnected
        );

        let not_connected = Connectivity {
            connection: Some(ConnectionType::Wifi),
            is_connected: false,
        };
        assert_eq!(
            evaluate(not_connected, &prefs(false, true)),
            NetworkState::Disconnected
        );
    }

    #[test]
    fn disconnected_denies_every_action() {
        for action in ALL_ACTIONS {
            for p in [prefs(true, true), prefs(false, false)] {
                assert!(!can_perform(action, NetworkState::Disconnected, &p, None));
            }
        }
    }

    #[test]
    fn refresh_denied_when_disconnected_regardless_of_preferences() {
        let subscription = SubscriptionPolicy {
            auto_download: Some(true),
        };
        assert!(!can_perform(
            Action::RefreshSubscription,
            NetworkState::Disconnected,
            &prefs(false, true),
            Some(&subscription)
        ));
    }

    #[test]
    fn manual_actions_allowed_on_restricted_links() {
        for action in [
            Action::DownloadManually,
            Action::RefreshSubscription,
            Action::StreamEpisode,
        ] {
            assert!(can_perform(
                action,
                NetworkState::Restricted,
                &prefs(true, true),
                None
            ));
        }
    }

    #[test]
    fn automatic_download_respects_wifi_only() {
        assert!(!can_perform(
            Action::DownloadAutomatically,
            NetworkState::Restricted,
            &prefs(true, true),
            None
        ));
        assert!(can_perform(
            Action::DownloadAutomatically,
            NetworkState::Ok,
            &prefs(true, true),
            None
        ));
        assert!(can_perform(
            Action::DownloadAutomatically,
            NetworkState::Restricted,
            &prefs(false, true),
            None
        ));
    }

    #[test]
    fn subscription_override_wins_over_global_preference() {
        let off = SubscriptionPolicy {
            auto_download: Some(false),
        };
        let on = SubscriptionPolicy {
            auto_download: Some(true),
        };

        assert!(!can_perform(
            Action::DownloadAutomatically,
            NetworkState::Ok,
            &prefs(true, true),
            Some(&off)
        ));
        assert!(can_perform(
            Action::DownloadAutomatically,
            NetworkState::Ok,
            &prefs(true, false),
            Some(&on)
        ));
    }

    #[test]
    fn unknown_action_is_denied_and_reported() {
        let reporter = RecordingReporter::default();

        let allowed = can_perform_named(
            "teleport_episode",
            NetworkState::Ok,
            &prefs(false, true),
            None,
            &reporter,
        );

        assert!(!allowed);
        let reports = reporter.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].contains("teleport_episode"));
    }

    #[test]
    fn action_names_parse_back() {
        for action in ALL_ACTIONS {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
    }
}
