use once_cell::sync::Lazy;
use regex::Regex;
use strum::{Display, EnumString};

/// Upstream implementation tag derived from the advertised node version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ClientType {
    #[default]
    Unspecified,
    Unknown,
    Lighthouse,
    Lodestar,
    Nimbus,
    Prysm,
    Teku,
    Grandine,
}

static CLIENT_TYPE_PATTERNS: Lazy<Vec<(ClientType, Regex)>> = Lazy::new(|| {
    [
        (ClientType::Lighthouse, "(?i)^Lighthouse/"),
        (ClientType::Lodestar, "(?i)^Lodestar/"),
        (ClientType::Nimbus, "(?i)^Nimbus/"),
        (ClientType::Prysm, "(?i)^Prysm/"),
        (ClientType::Teku, "(?i)^teku/"),
        (ClientType::Grandine, "(?i)^Grandine/"),
    ]
    .into_iter()
    .map(|(client_type, pattern)| {
        let regex = Regex::new(pattern).expect("client type patterns are valid regexes");
        (client_type, regex)
    })
    .collect()
});

impl ClientType {
    #[must_use]
    pub fn from_version(version: &str) -> Self {
        CLIENT_TYPE_PATTERNS
            .iter()
            .find(|(_, pattern)| pattern.is_match(version))
            .map(|(client_type, _)| *client_type)
            .unwrap_or(Self::Unknown)
    }

    /// Whether this upstream satisfies a requested client type.
    #[must_use]
    pub fn matches(self, requested: Self) -> bool {
        requested == Self::Unspecified || self == requested
    }

    /// Client types that get their own ingress route.
    #[must_use]
    pub const fn routable() -> [Self; 6] {
        [
            Self::Lighthouse,
            Self::Lodestar,
            Self::Nimbus,
            Self::Prysm,
            Self::Teku,
            Self::Grandine,
        ]
    }
}
