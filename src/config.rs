use std::str::FromStr;

use crate::error::ConfigError;

/// Environment variable selecting the allocator configuration.
pub const MALLOC_ENV: &str = "EMBER_MALLOC";
/// Environment variable enabling development mode (debug allocators).
pub const DEVMODE_ENV: &str = "EMBER_DEVMODE";

/// Named allocator configurations accepted by [`Allocators::setup`](crate::allocator::Allocators::setup).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorName {
    /// Keep whatever is installed.
    NotSet,
    Default,
    Debug,
    Malloc,
    MallocDebug,
    PyMalloc,
    PyMallocDebug,
}

impl AllocatorName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotSet => "",
            Self::Default => "default",
            Self::Debug => "debug",
            Self::Malloc => "malloc",
            Self::MallocDebug => "malloc_debug",
            Self::PyMalloc => "pymalloc",
            Self::PyMallocDebug => "pymalloc_debug",
        }
    }

    pub fn is_debug(self) -> bool {
        matches!(self, Self::Debug | Self::MallocDebug | Self::PyMallocDebug)
    }
}

impl FromStr for AllocatorName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" => Self::NotSet,
            "default" => Self::Default,
            "debug" => Self::Debug,
            "malloc" => Self::Malloc,
            "malloc_debug" => Self::MallocDebug,
            "pymalloc" => Self::PyMalloc,
            "pymalloc_debug" => Self::PyMallocDebug,
            other => return Err(ConfigError::UnknownAllocator(other.to_owned())),
        })
    }
}

/// Settings consumed before the runtime core comes up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreConfig {
    pub allocator: AllocatorName,
    /// Development mode turns on the debug allocators unless an allocator is named.
    pub dev_mode: bool,
    /// Log phase transitions at `info` instead of `debug`.
    pub verbose: bool,
}

impl Default for PreConfig {
    fn default() -> Self {
        Self {
            allocator: AllocatorName::NotSet,
            dev_mode: false,
            verbose: false,
        }
    }
}

impl PreConfig {
    pub fn with_allocator(mut self, allocator: AllocatorName) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Defaults overridden by [`MALLOC_ENV`] and [`DEVMODE_ENV`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_vars(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(name) = lookup(MALLOC_ENV) {
            config.allocator = name.parse()?;
        }
        if let Some(dev) = lookup(DEVMODE_ENV) {
            config.dev_mode = !dev.is_empty() && dev != "0";
        }
        Ok(config)
    }

    /// Allocator configuration to install, after applying dev mode.
    pub fn effective_allocator(&self) -> AllocatorName {
        if self.allocator == AllocatorName::NotSet && self.dev_mode {
            AllocatorName::Debug
        } else {
            self.allocator
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_names_round_trip() {
        for name in [
            AllocatorName::Default,
            AllocatorName::Debug,
            AllocatorName::Malloc,
            AllocatorName::MallocDebug,
            AllocatorName::PyMalloc,
            AllocatorName::PyMallocDebug,
        ] {
            assert_eq!(name.as_str().parse::<AllocatorName>().unwrap(), name);
        }
        assert_eq!(
            "tcmalloc".parse::<AllocatorName>(),
            Err(ConfigError::UnknownAllocator("tcmalloc".into()))
        );
    }

    #[test]
    fn env_overrides() {
        let config = PreConfig::from_vars(|key| match key {
            MALLOC_ENV => Some("malloc_debug".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.allocator, AllocatorName::MallocDebug);
        assert!(!config.dev_mode);

        let config = PreConfig::from_vars(|key| match key {
            DEVMODE_ENV => Some("1".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.effective_allocator(), AllocatorName::Debug);

        let config = PreConfig::default()
            .with_dev_mode(true)
            .with_allocator(AllocatorName::Malloc);
        assert_eq!(config.effective_allocator(), AllocatorName::Malloc);
    }
}
