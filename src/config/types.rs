// -----------------------------------------------------------------------------
// ----- LogLevel --------------------------------------------------------------

/// Verbosity of the gateway's own spans. Dependencies stay at `warn` unless
/// the level is below it.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    /// `EnvFilter` directive: this crate at the chosen level, others capped.
    pub fn directive(self) -> String {
        let others = self.min(LogLevel::Warn);
        format!("{},pairgate={}", others.as_str(), self.as_str())
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
