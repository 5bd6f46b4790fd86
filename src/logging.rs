use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(LogLevel::Warn.as_str(), "warn");
        let level: LogLevel = serde_plain_level("trace");
        assert_eq!(level, LogLevel::Trace);
    }

    fn serde_plain_level(name: &str) -> LogLevel {
        #[derive(Deserialize)]
        struct Wrapper {
            level: LogLevel,
        }
        toml::from_str::<Wrapper>(&format!("level = {name:?}"))
            .unwrap()
            .level
    }
}
