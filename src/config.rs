use crate::error::{Error, Result};

/// Configuration for a [`crate::GlobalLock`] instance (§6).
///
/// Loading this from a file, environment, or DI container is the
/// embedding application's job — out of scope for this crate.
#[derive(Debug, Clone)]
pub struct Config {
    /// Credential for the storage backend. Opaque to this crate; forwarded
    /// to whatever [`crate::journal::JournalStore`]/[`crate::blob_gate::BlobLeaseBackend`]
    /// implementation the caller constructs.
    pub storage_connection_string: String,
    /// Journal table name.
    pub table_name: String,
    /// Blob container name.
    pub container_name: String,
    /// Default journal TTL, in seconds.
    pub lease_default_expiration_seconds: u64,
    /// Ticker period, in seconds.
    pub lease_acquirement_interval_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage_connection_string: String::new(),
            table_name: "locks".to_string(),
            container_name: "locks".to_string(),
            lease_default_expiration_seconds: 86_400,
            lease_acquirement_interval_seconds: 5,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.storage_connection_string.trim().is_empty() {
            return Err(Error::invalid_argument("storage_connection_string must be non-empty"));
        }
        if self.table_name.trim().is_empty() {
            return Err(Error::invalid_argument("table_name must be non-empty"));
        }
        if self.container_name.trim().is_empty() {
            return Err(Error::invalid_argument("container_name must be non-empty"));
        }
        if self.lease_default_expiration_seconds == 0 {
            return Err(Error::out_of_range(
                "lease_default_expiration_seconds must be > 0",
            ));
        }
        if self.lease_acquirement_interval_seconds == 0 {
            return Err(Error::out_of_range(
                "lease_acquirement_interval_seconds must be > 0",
            ));
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lease_default_expiration_seconds)
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lease_acquirement_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_given_a_connection_string() {
        let cfg = Config {
            storage_connection_string: "UseDevelopmentStorage=true".into(),
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_connection_string_is_rejected() {
        let cfg = Config::default();
        assert!(matches!(cfg.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let cfg = Config {
            storage_connection_string: "x".into(),
            lease_default_expiration_seconds: 0,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::OutOfRange(_))));
    }
}
