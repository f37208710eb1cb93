use std::{fmt, str::FromStr};

/// Which compute device a model replica is placed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForceCpu => write!(f, "cpu"),
            Self::Ordinal(ordinal) => write!(f, "{ordinal}"),
        }
    }
}

impl FromStr for DeviceMap {
    type Err = String;

    /// Accepts `cpu` or a device ordinal such as `0`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("cpu") {
            return Ok(Self::ForceCpu);
        }
        s.parse()
            .map(Self::Ordinal)
            .map_err(|_| format!("expected `cpu` or a device ordinal, got `{s}`"))
    }
}
