use std::time::Duration;

use crate::error::Error;
use crate::regs;

/// Key-value storage partition profile pushed to the device at bring-up.
///
/// The device divides its key-value memory into a linear region and two
/// hash regions (single-size and double-size entries). The hash regions
/// are sized from the device-reported total using the part weights here.
#[derive(Clone)]
pub struct Profile {
    /// Bytes reserved for the linear region.
    pub kvd_linear_size: u32,
    /// Weight of the single-size hash region.
    pub kvd_hash_single_parts: u32,
    /// Weight of the double-size hash region.
    pub kvd_hash_double_parts: u32,
    /// Allocation granularity; the double region is rounded down to this.
    pub kvd_granularity: u32,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            kvd_linear_size: 98304,
            kvd_hash_single_parts: 59,
            kvd_hash_double_parts: 41,
            kvd_granularity: 128,
        }
    }
}

/// Configuration for the transport.
#[derive(Clone)]
pub struct Config {
    /// Number of send queues.
    pub num_sdqs: usize,
    /// Number of receive queues.
    pub num_rdqs: usize,
    /// Number of completion queues. Must cover one per descriptor queue.
    pub num_cqs: usize,
    /// Elements per send queue. Power of two.
    pub sdq_count: usize,
    /// Elements per receive queue. Power of two.
    pub rdq_count: usize,
    /// Elements per completion queue. Power of two.
    pub cq_count: usize,
    /// Elements per event queue. Power of two.
    pub eq_count: usize,
    /// Size of each posted receive buffer in bytes.
    pub rx_buffer_size: usize,
    /// How long a command may run before the channel gives up on it.
    pub cmd_timeout: Duration,
    /// Key-value partition profile.
    pub profile: Profile,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_sdqs: 2,
            num_rdqs: 2,
            num_cqs: 4,
            sdq_count: 512,
            rdq_count: 512,
            cq_count: 1024,
            eq_count: 512,
            rx_buffer_size: 2048,
            cmd_timeout: Duration::from_secs(5),
            profile: Profile::default(),
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out
    /// of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.num_sdqs == 0 || self.num_rdqs == 0 {
            return Err(Error::Config(
                "num_sdqs and num_rdqs must be > 0".into(),
            ));
        }
        if self.num_sdqs > 32 || self.num_rdqs > 32 {
            return Err(Error::Config(
                "descriptor queue numbers must fit the 5-bit completion field".into(),
            ));
        }
        if self.num_cqs < self.num_sdqs + self.num_rdqs {
            return Err(Error::Config(
                "num_cqs must cover one completion queue per descriptor queue".into(),
            ));
        }
        if self.num_cqs > regs::DOORBELLS_PER_KIND {
            return Err(Error::Config(format!(
                "num_cqs must be <= {} to fit the per-kind doorbell range",
                regs::DOORBELLS_PER_KIND
            )));
        }
        for (name, count, elem) in [
            ("sdq_count", self.sdq_count, regs::WQE_SIZE),
            ("rdq_count", self.rdq_count, regs::WQE_SIZE),
            ("cq_count", self.cq_count, regs::CQE_SIZE),
            ("eq_count", self.eq_count, regs::EQE_SIZE),
        ] {
            if count == 0 || !count.is_power_of_two() {
                return Err(Error::Config(format!(
                    "{name} must be > 0 and a power of two"
                )));
            }
            if count * elem > regs::AQ_PAGES * regs::PAGE_SIZE {
                return Err(Error::Config(format!(
                    "{name} exceeds the {}-page queue backing limit",
                    regs::AQ_PAGES
                )));
            }
        }
        if self.rx_buffer_size == 0 || self.rx_buffer_size > 0x3FFF {
            return Err(Error::Config(
                "rx_buffer_size must be > 0 and fit a 14-bit byte count".into(),
            ));
        }
        if self.cmd_timeout.is_zero() {
            return Err(Error::Config("cmd_timeout must be non-zero".into()));
        }
        if self.profile.kvd_hash_single_parts == 0 || self.profile.kvd_hash_double_parts == 0 {
            return Err(Error::Config(
                "kvd hash part weights must be > 0".into(),
            ));
        }
        if self.profile.kvd_granularity == 0 {
            return Err(Error::Config("kvd_granularity must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of send and receive queues.
    pub fn descriptor_queues(mut self, sdqs: usize, rdqs: usize) -> Self {
        self.config.num_sdqs = sdqs;
        self.config.num_rdqs = rdqs;
        self
    }

    /// Set the number of completion queues.
    pub fn completion_queues(mut self, n: usize) -> Self {
        self.config.num_cqs = n;
        self
    }

    /// Set per-queue element counts. Each must be a power of two.
    pub fn queue_sizes(mut self, sdq: usize, rdq: usize, cq: usize, eq: usize) -> Self {
        self.config.sdq_count = sdq;
        self.config.rdq_count = rdq;
        self.config.cq_count = cq;
        self.config.eq_count = eq;
        self
    }

    /// Set the posted receive buffer size in bytes.
    pub fn rx_buffer_size(mut self, n: usize) -> Self {
        self.config.rx_buffer_size = n;
        self
    }

    /// Set the command execution timeout.
    pub fn cmd_timeout(mut self, timeout: Duration) -> Self {
        self.config.cmd_timeout = timeout;
        self
    }

    /// Set the key-value partition profile.
    pub fn profile(mut self, profile: Profile) -> Self {
        self.config.profile = profile;
        self
    }

    /// Get mutable access to the underlying config for fields not covered
    /// by builder methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_counts() {
        let mut config = Config::default();
        config.cq_count = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_completion_queues_beyond_the_doorbell_range() {
        let mut config = Config::default();
        config.num_sdqs = 32;
        config.num_rdqs = 32;
        config.num_cqs = 65;
        assert!(config.validate().is_err());
        config.num_cqs = 64;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_too_few_completion_queues() {
        let mut config = Config::default();
        config.num_cqs = config.num_sdqs + config.num_rdqs - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversized_queue_backing() {
        let mut config = Config::default();
        // 4096 CQEs * 16 bytes = 16 pages, over the 8-page limit.
        config.cq_count = 4096;
        assert!(config.validate().is_err());
    }

    #[test]
    fn builder_round_trip() {
        let config = ConfigBuilder::new()
            .descriptor_queues(1, 1)
            .completion_queues(2)
            .queue_sizes(64, 64, 128, 64)
            .rx_buffer_size(1536)
            .build()
            .unwrap();
        assert_eq!(config.num_cqs, 2);
        assert_eq!(config.rdq_count, 64);
    }
}
