//! Network policy definitions for sandbox containers.

use serde::{Deserialize, Serialize};

/// Network access policy for sandbox containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    /// Default engine networking
    #[default]
    Online,
    /// No external network access
    Offline,
}

impl NetworkPolicy {
    /// Maps the `is_online` flag of an environment onto a policy.
    pub fn from_online(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }

    /// Engine `--network` mode, or `None` to keep the default.
    pub fn network_mode(self) -> Option<&'static str> {
        match self {
            Self::Online => None,
            Self::Offline => Some("none"),
        }
    }
}

impl std::fmt::Display for NetworkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_policy_display() {
        assert_eq!(format!("{}", NetworkPolicy::Online), "online");
        assert_eq!(format!("{}", NetworkPolicy::Offline), "offline");
    }

    #[test]
    fn test_network_mode() {
        assert_eq!(NetworkPolicy::Online.network_mode(), None);
        assert_eq!(NetworkPolicy::Offline.network_mode(), Some("none"));
        assert_eq!(NetworkPolicy::from_online(false), NetworkPolicy::Offline);
    }
}
