//! Hysteretic CAN bus health status.
//!
//! Aggregate bus statistics map onto a three-level status. A transition
//! document is produced if and only if the newly computed level differs from
//! the stored one, so re-submitting the same conditions never re-emits.

/// System health status levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

impl StatusLevel {
    /// Wire/display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusLevel::Info => "INFO",
            StatusLevel::Warning => "WARNING",
            StatusLevel::Error => "ERROR",
        }
    }

    /// Dashboard icon.
    pub fn icon(&self) -> &'static str {
        match self {
            StatusLevel::Info => "🟢",
            StatusLevel::Warning => "🟡",
            StatusLevel::Error => "🔴",
        }
    }

    /// Lenient parse; unknown values default to `Info`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "ERROR" => StatusLevel::Error,
            "WARNING" => StatusLevel::Warning,
            _ => StatusLevel::Info,
        }
    }
}

/// Stored health level plus the message that produced it.
#[derive(Debug, Clone)]
pub struct HealthState {
    level: StatusLevel,
    message: String,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            level: StatusLevel::Info,
            message: "CAN bus monitoring active".to_string(),
        }
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> StatusLevel {
        self.level
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Classify aggregate bus statistics into a level and message.
    pub fn classify(bus_load: f64, error_rate: f64, drop_rate: f64) -> (StatusLevel, String) {
        if bus_load >= 80.0 || error_rate > 1.0 {
            (
                StatusLevel::Error,
                format!("CAN Critical: Load {:.1}%, Errors {:.1}/s", bus_load, error_rate),
            )
        } else if bus_load >= 50.0 || error_rate > 0.1 || drop_rate > 0.1 {
            (StatusLevel::Warning, format!("CAN Warning: Load {:.1}%", bus_load))
        } else {
            (StatusLevel::Info, "CAN Nominal".to_string())
        }
    }

    /// Evaluate new statistics against the stored level.
    ///
    /// Returns the markdown status document to emit when the level changed,
    /// `None` otherwise. The stored level/message are updated only on change.
    pub fn update(&mut self, bus_load: f64, error_rate: f64, drop_rate: f64) -> Option<String> {
        let (level, message) = Self::classify(bus_load, error_rate, drop_rate);
        if level == self.level {
            return None;
        }

        self.level = level;
        self.message = message;

        Some(format!(
            "# CAN Bus Status: {}\n\
             ### {} {}\n\
             * **Load:** {:.1}%\n\
             * **Errors/s:** {:.2}\n\
             * **Drops/s:** {:.2}\n",
            level.as_str(),
            level.icon(),
            self.message,
            bus_load,
            error_rate,
            drop_rate,
        ))
    }
}
