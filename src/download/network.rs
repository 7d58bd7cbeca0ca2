/// Reports the current network conditions.
pub trait NetworkMonitor: Send + Sync {
    /// `true` when on an unmetered connection (Wi-Fi, Ethernet).
    fn is_unmetered(&self) -> bool;
}

/// Fixed answer, set from the command line or by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticNetwork {
    unmetered: bool,
}

impl StaticNetwork {
    pub fn unmetered() -> Self {
        Self { unmetered: true }
    }

    pub fn metered() -> Self {
        Self { unmetered: false }
    }
}

impl NetworkMonitor for StaticNetwork {
    fn is_unmetered(&self) -> bool {
        self.unmetered
    }
}

/// When downloads may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadPolicy {
    Unrestricted,
    #[default]
    UnmeteredOnly,
}

impl DownloadPolicy {
    pub fn from_needs_wifi(needs_wifi: bool) -> Self {
        if needs_wifi {
            Self::UnmeteredOnly
        } else {
            Self::Unrestricted
        }
    }

    pub fn permits(&self, network: &dyn NetworkMonitor) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::UnmeteredOnly => network.is_unmetered(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_gating() {
        let wifi = StaticNetwork::unmetered();
        let cellular = StaticNetwork::metered();

        assert!(DownloadPolicy::Unrestricted.permits(&wifi));
        assert!(DownloadPolicy::Unrestricted.permits(&cellular));
        assert!(DownloadPolicy::UnmeteredOnly.permits(&wifi));
        assert!(!DownloadPolicy::UnmeteredOnly.permits(&cellular));
    }

    #[test]
    fn test_policy_from_config_flag() {
        assert_eq!(DownloadPolicy::from_needs_wifi(true), DownloadPolicy::UnmeteredOnly);
        assert_eq!(DownloadPolicy::from_needs_wifi(false), DownloadPolicy::Unrestricted);
    }
}
