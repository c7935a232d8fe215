//! Environment-driven configuration.
//!
//! All options are read from `RAILNET_*` environment variables by
//! [`Config::from_env`]; the `with_*` builders exist for tests and embedders
//! that bypass the environment.

use std::env;

use crate::error::{Error, Result};

/// Transport protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// The multi-rail RDMA-write protocol implemented by this crate.
    Rdma,
    /// The single-rail send/recv protocol, provided by a separate transport.
    SendRecv,
}

/// Plugin configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Selected transport protocol. Default: RDMA.
    pub protocol: Protocol,
    /// Maximum eager payload in bytes. Must be ≤ `round_robin_threshold`.
    /// Default: 8192.
    pub eager_max_size: usize,
    /// Message-size cutoff between round-robin single-rail scheduling and
    /// striping. Default: 256 KiB.
    pub round_robin_threshold: usize,
    /// Aggregate minimum of posted bounce buffers per endpoint (divided
    /// across rails). Default: 64.
    pub min_posted_bounce_buffers: usize,
    /// Aggregate maximum of posted bounce buffers per endpoint (divided
    /// across rails). Default: 128.
    pub max_posted_bounce_buffers: usize,
    /// CQ drain batch size. Default: 4.
    pub cq_read_count: usize,
    /// Memory-registration key size in bytes; bounds the key id pool.
    /// Default: 2.
    pub mr_key_size: usize,
    /// Connection duplication factor for the sendrecv transport. Must be 0
    /// when GPUDirect RDMA is supported. Default: 0.
    pub nic_dup_conns: usize,
    /// Network latency reported to the caller, in microseconds. Default: 0.
    pub net_latency: f32,
    /// Disable the flush read after GPU-memory receives. Default: false.
    pub gdr_flush_disable: bool,
    /// Prefer the GPU-vendor flush API over the flush read. Default: false.
    pub cuda_flush_enable: bool,
    /// Ask the (external) topology collaborator to emit a topology file.
    /// Default: false.
    pub topo_file_write_enable: bool,
    /// Template path for the emitted topology file; must end in `XXXXXX`.
    pub topo_file_template: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol: Protocol::Rdma,
            eager_max_size: 8192,
            round_robin_threshold: 256 * 1024,
            min_posted_bounce_buffers: 64,
            max_posted_bounce_buffers: 128,
            cq_read_count: 4,
            mr_key_size: 2,
            nic_dup_conns: 0,
            net_latency: 0.0,
            gdr_flush_disable: false,
            cuda_flush_enable: false,
            topo_file_write_enable: false,
            topo_file_template: None,
        }
    }
}

impl Config {
    /// Read the configuration from `RAILNET_*` environment variables,
    /// falling back to defaults for unset options.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = env_str("RAILNET_PROTOCOL") {
            config.protocol = match value.to_ascii_uppercase().as_str() {
                "RDMA" => Protocol::Rdma,
                "SENDRECV" => Protocol::SendRecv,
                _ => {
                    return Err(Error::InvalidConfig(format!(
                        "unknown protocol {:?}",
                        value
                    )))
                }
            };
        }

        config.eager_max_size = env_usize("RAILNET_EAGER_MAX_SIZE", config.eager_max_size)?;
        config.round_robin_threshold =
            env_usize("RAILNET_ROUND_ROBIN_THRESHOLD", config.round_robin_threshold)?;
        config.min_posted_bounce_buffers = env_usize(
            "RAILNET_MIN_POSTED_BOUNCE_BUFFERS",
            config.min_posted_bounce_buffers,
        )?;
        config.max_posted_bounce_buffers = env_usize(
            "RAILNET_MAX_POSTED_BOUNCE_BUFFERS",
            config.max_posted_bounce_buffers,
        )?;
        config.cq_read_count = env_usize("RAILNET_CQ_READ_COUNT", config.cq_read_count)?;
        config.mr_key_size = env_usize("RAILNET_MR_KEY_SIZE", config.mr_key_size)?;
        config.nic_dup_conns = env_usize("RAILNET_NIC_DUP_CONNS", config.nic_dup_conns)?;
        if let Some(value) = env_str("RAILNET_NET_LATENCY") {
            config.net_latency = value
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("bad RAILNET_NET_LATENCY {:?}", value)))?;
        }
        config.gdr_flush_disable =
            env_bool("RAILNET_GDR_FLUSH_DISABLE", config.gdr_flush_disable)?;
        config.cuda_flush_enable =
            env_bool("RAILNET_CUDA_FLUSH_ENABLE", config.cuda_flush_enable)?;
        config.topo_file_write_enable = env_bool(
            "RAILNET_TOPO_FILE_WRITE_ENABLE",
            config.topo_file_write_enable,
        )?;
        config.topo_file_template = env_str("RAILNET_TOPO_FILE_TEMPLATE");

        config.validate()?;
        Ok(config)
    }

    /// Check cross-option invariants.
    pub fn validate(&self) -> Result<()> {
        if self.eager_max_size > self.round_robin_threshold {
            return Err(Error::InvalidConfig(format!(
                "eager_max_size ({}) must not exceed round_robin_threshold ({})",
                self.eager_max_size, self.round_robin_threshold
            )));
        }
        if self.min_posted_bounce_buffers > self.max_posted_bounce_buffers {
            return Err(Error::InvalidConfig(format!(
                "min_posted_bounce_buffers ({}) must not exceed max_posted_bounce_buffers ({})",
                self.min_posted_bounce_buffers, self.max_posted_bounce_buffers
            )));
        }
        if self.cq_read_count == 0 {
            return Err(Error::InvalidConfig(
                "cq_read_count must be positive".into(),
            ));
        }
        if self.mr_key_size == 0 || self.mr_key_size > 8 {
            return Err(Error::InvalidConfig(format!(
                "mr_key_size ({}) must be between 1 and 8 bytes",
                self.mr_key_size
            )));
        }
        if let Some(template) = &self.topo_file_template {
            if !template.ends_with("XXXXXX") {
                return Err(Error::InvalidConfig(
                    "topo_file_template must end with XXXXXX".into(),
                ));
            }
        }
        Ok(())
    }

    /// Set the eager payload cutoff.
    pub fn with_eager_max_size(mut self, size: usize) -> Self {
        self.eager_max_size = size;
        self
    }

    /// Set the striping threshold.
    pub fn with_round_robin_threshold(mut self, threshold: usize) -> Self {
        self.round_robin_threshold = threshold;
        self
    }

    /// Set the aggregate bounce-buffer bounds.
    pub fn with_posted_bounce_buffers(mut self, min: usize, max: usize) -> Self {
        self.min_posted_bounce_buffers = min;
        self.max_posted_bounce_buffers = max;
        self
    }

    /// Set the CQ drain batch size.
    pub fn with_cq_read_count(mut self, count: usize) -> Self {
        self.cq_read_count = count;
        self
    }

    /// Disable the post-receive flush read.
    pub fn with_gdr_flush_disable(mut self, disable: bool) -> Self {
        self.gdr_flush_disable = disable;
        self
    }
}

fn env_str(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    match env_str(name) {
        Some(value) => value
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("bad {} {:?}", name, value))),
        None => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env_str(name) {
        Some(value) => match value.as_str() {
            "1" | "true" | "TRUE" | "yes" => Ok(true),
            "0" | "false" | "FALSE" | "no" => Ok(false),
            _ => Err(Error::InvalidConfig(format!("bad {} {:?}", name, value))),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_eager_bound() {
        let config = Config::default()
            .with_round_robin_threshold(4096)
            .with_eager_max_size(8192);
        assert!(config.validate().is_err());

        let config = Config::default()
            .with_round_robin_threshold(8192)
            .with_eager_max_size(8192);
        config.validate().unwrap();
    }

    #[test]
    fn test_bounce_bounds() {
        let config = Config::default().with_posted_bounce_buffers(128, 64);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_topo_template_suffix() {
        let mut config = Config::default();
        config.topo_file_template = Some("/tmp/topo-XXXXXX".into());
        config.validate().unwrap();
        config.topo_file_template = Some("/tmp/topo".into());
        assert!(config.validate().is_err());
    }
}
