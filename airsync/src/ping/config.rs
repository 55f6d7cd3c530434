//! # Ping config

/// The heartbeat interval bounds.
///
/// Devices suggest an interval; the server clamps it into these
/// bounds. The clamped value is written back to the device record as
/// its new default but is never a promise: each ping renegotiates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct PingConfig {
    pub min_interval_secs: u32,
    pub max_interval_secs: u32,
    pub default_interval_secs: u32,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 60,
            max_interval_secs: 3600,
            default_interval_secs: 300,
        }
    }
}

impl PingConfig {
    /// Clamp a client-suggested interval, falling back to the default
    /// when the client did not suggest one.
    pub fn clamp(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(secs) => secs.clamp(self.min_interval_secs, self.max_interval_secs),
            None => self.default_interval_secs,
        }
    }
}
