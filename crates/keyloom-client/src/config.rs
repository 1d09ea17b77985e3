//! Machine configuration.

use crate::error::ClientError;

/// Tuning for a [`crate::Machine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// Engine jobs that may wait in the queue before callers are held back
    pub queue_capacity: usize,
    /// Name of the OS thread that owns the engine
    pub worker_thread_name: String,
    /// Key derivation rounds used by
    /// [`Machine::export_room_keys_default`](crate::Machine::export_room_keys_default)
    pub default_export_rounds: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            worker_thread_name: "keyloom-engine".to_string(),
            default_export_rounds: 3,
        }
    }
}

impl MachineConfig {
    /// Check the configuration before a machine is started.
    ///
    /// # Errors
    ///
    /// `Config` if the queue capacity is zero, the thread name is empty, or the
    /// default export rounds are zero.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.queue_capacity == 0 {
            return Err(ClientError::Config("queue_capacity must be at least 1".to_string()));
        }
        if self.worker_thread_name.trim().is_empty() {
            return Err(ClientError::Config("worker_thread_name must not be empty".to_string()));
        }
        if self.default_export_rounds == 0 {
            return Err(ClientError::Config("default_export_rounds must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(MachineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_capacity() {
        let config = MachineConfig { queue_capacity: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn rejects_blank_thread_name() {
        let config = MachineConfig { worker_thread_name: "  ".to_string(), ..Default::default() };
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn rejects_zero_rounds() {
        let config = MachineConfig { default_export_rounds: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }
}
