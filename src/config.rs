use crate::error::{ProlinkError, Result};

pub const MIN_ANNOUNCE_INTERVAL_MS: u64 = 200;
pub const MAX_ANNOUNCE_INTERVAL_MS: u64 = 2000;
pub const MIN_STATUS_INTERVAL_MS: u64 = 20;
pub const MAX_STATUS_INTERVAL_MS: u64 = 2000;
pub const MAX_DEVICE_NAME_LEN: usize = 20;

/// Configuration for a [`crate::Participant`], set up before `start()`.
///
/// Mirrors spec.md's "Participant config" row: a device number of 0
/// triggers self-assignment at start.
#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    pub(crate) device_number: u8,
    pub(crate) use_standard_player_number: bool,
    pub(crate) announce_interval_ms: u64,
    pub(crate) status_interval_ms: u64,
    pub(crate) tempo_epsilon: f64,
    pub(crate) device_name: String,
    pub(crate) interface_name: Option<String>,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        ParticipantConfig {
            device_number: 0,
            use_standard_player_number: true,
            announce_interval_ms: 1500,
            status_interval_ms: 200,
            tempo_epsilon: 0.0001,
            device_name: "prolink-core".to_string(),
            interface_name: None,
        }
    }
}

impl ParticipantConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_number(&self) -> u8 {
        self.device_number
    }

    /// Set the requested device number. 0 means "self-assign at start".
    pub fn set_device_number(&mut self, n: u8) -> Result<()> {
        if n > 127 {
            return Err(ProlinkError::InvalidConfig(format!(
                "device number {} out of range 0..=127",
                n
            )));
        }
        self.device_number = n;
        Ok(())
    }

    pub fn use_standard_player_number(&self) -> bool {
        self.use_standard_player_number
    }

    pub fn set_use_standard_player_number(&mut self, v: bool) {
        self.use_standard_player_number = v;
    }

    pub fn announce_interval_ms(&self) -> u64 {
        self.announce_interval_ms
    }

    pub fn set_announce_interval_ms(&mut self, ms: u64) -> Result<()> {
        if !(MIN_ANNOUNCE_INTERVAL_MS..=MAX_ANNOUNCE_INTERVAL_MS).contains(&ms) {
            return Err(ProlinkError::InvalidConfig(format!(
                "announce interval {} out of range {}..={}",
                ms, MIN_ANNOUNCE_INTERVAL_MS, MAX_ANNOUNCE_INTERVAL_MS
            )));
        }
        self.announce_interval_ms = ms;
        Ok(())
    }

    pub fn status_interval_ms(&self) -> u64 {
        self.status_interval_ms
    }

    pub fn set_status_interval_ms(&mut self, ms: u64) -> Result<()> {
        if !(MIN_STATUS_INTERVAL_MS..=MAX_STATUS_INTERVAL_MS).contains(&ms) {
            return Err(ProlinkError::InvalidConfig(format!(
                "status interval {} out of range {}..={}",
                ms, MIN_STATUS_INTERVAL_MS, MAX_STATUS_INTERVAL_MS
            )));
        }
        self.status_interval_ms = ms;
        Ok(())
    }

    pub fn tempo_epsilon(&self) -> f64 {
        self.tempo_epsilon
    }

    pub fn set_tempo_epsilon(&mut self, epsilon: f64) -> Result<()> {
        if !(epsilon > 0.0) {
            return Err(ProlinkError::InvalidConfig(
                "tempo epsilon must be greater than 0".to_string(),
            ));
        }
        self.tempo_epsilon = epsilon;
        Ok(())
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn set_device_name(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if name.len() > MAX_DEVICE_NAME_LEN {
            return Err(ProlinkError::InvalidConfig(format!(
                "device name {:?} exceeds {} bytes",
                name, MAX_DEVICE_NAME_LEN
            )));
        }
        self.device_name = name;
        Ok(())
    }

    pub fn interface_name(&self) -> Option<&str> {
        self.interface_name.as_deref()
    }

    pub fn set_interface_name(&mut self, name: Option<String>) {
        self.interface_name = name;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = ParticipantConfig::new();
        assert_eq!(cfg.device_number(), 0);
        assert!(cfg.use_standard_player_number());
    }

    #[test]
    fn rejects_out_of_range_announce_interval() {
        let mut cfg = ParticipantConfig::new();
        assert!(cfg.set_announce_interval_ms(100).is_err());
        assert!(cfg.set_announce_interval_ms(3000).is_err());
        assert!(cfg.set_announce_interval_ms(500).is_ok());
    }

    #[test]
    fn rejects_out_of_range_status_interval() {
        let mut cfg = ParticipantConfig::new();
        assert!(cfg.set_status_interval_ms(1).is_err());
        assert!(cfg.set_status_interval_ms(5000).is_err());
        assert!(cfg.set_status_interval_ms(50).is_ok());
    }

    #[test]
    fn rejects_zero_tempo_epsilon() {
        let mut cfg = ParticipantConfig::new();
        assert!(cfg.set_tempo_epsilon(0.0).is_err());
        assert!(cfg.set_tempo_epsilon(-1.0).is_err());
        assert!(cfg.set_tempo_epsilon(0.01).is_ok());
    }

    #[test]
    fn rejects_overlong_device_name() {
        let mut cfg = ParticipantConfig::new();
        assert!(cfg.set_device_name("x".repeat(21)).is_err());
        assert!(cfg.set_device_name("x".repeat(20)).is_ok());
    }
}
