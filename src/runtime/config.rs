//! Configuration for the QPU runtime
//!
//! [`RuntimeConfig`] selects the device nodes, the kernel image directory,
//! the firmware memory flags and the execution timeouts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::busmem::DEFAULT_DEVMEM_PATH;
use crate::backend::mailbox::DEFAULT_MAILBOX_PATH;
use crate::backend::{CachePolicy, MemFlags};
use crate::error::{io_context, ForgeResult, QpuForgeError};

/// Timeouts passed to the firmware with each launch, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    /// Launches spread over two or more units
    pub parallel_ms: u32,
    /// Single-unit fallback launches, which process the whole problem serially
    pub single_unit_ms: u32,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        TimeoutPolicy {
            parallel_ms: 5_000,
            single_unit_ms: 100_000,
        }
    }
}

impl TimeoutPolicy {
    pub fn for_units(&self, units: usize) -> u32 {
        if units <= 1 {
            self.single_unit_ms
        } else {
            self.parallel_ms
        }
    }
}

/// Configuration for a [`super::Runtime`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Firmware mailbox character device
    pub mailbox_path: PathBuf,

    /// Physical memory device used to map GPU memory
    pub devmem_path: PathBuf,

    /// Directory holding `<kernel>.qhex` images; build-time images when unset
    pub kernel_dir: Option<PathBuf>,

    /// Flags for firmware memory allocations
    pub mem_flags: MemFlags,

    /// Cache policy of allocations that do not ask for one
    pub cache_policy: CachePolicy,

    /// Execution timeouts
    pub timeouts: TimeoutPolicy,

    /// Alignment of the launch control block in bytes
    pub control_alignment: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            mailbox_path: PathBuf::from(DEFAULT_MAILBOX_PATH),
            devmem_path: PathBuf::from(DEFAULT_DEVMEM_PATH),
            kernel_dir: None,
            mem_flags: MemFlags::DIRECT | MemFlags::ZERO,
            cache_policy: CachePolicy::Cached,
            timeouts: TimeoutPolicy::default(),
            control_alignment: 4096,
        }
    }
}

impl RuntimeConfig {
    /// Create a new runtime config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the mailbox device path
    pub fn with_mailbox_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mailbox_path = path.into();
        self
    }

    /// Set the physical memory device path
    pub fn with_devmem_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.devmem_path = path.into();
        self
    }

    /// Set the kernel image directory
    pub fn with_kernel_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.kernel_dir = Some(dir.into());
        self
    }

    /// Set firmware allocation flags
    pub fn with_mem_flags(mut self, flags: MemFlags) -> Self {
        self.mem_flags = flags;
        self
    }

    /// Set the default cache policy
    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Set execution timeouts
    pub fn with_timeouts(mut self, timeouts: TimeoutPolicy) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Defaults overridden by `QPUFORGE_*` environment variables
    ///
    /// Recognized variables: `QPUFORGE_MAILBOX`, `QPUFORGE_DEVMEM`,
    /// `QPUFORGE_KERNEL_DIR`, `QPUFORGE_TIMEOUT_MS`,
    /// `QPUFORGE_SINGLE_UNIT_TIMEOUT_MS`, `QPUFORGE_CACHE_POLICY`
    /// (`cached` or `uncached`).
    pub fn from_env() -> ForgeResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> ForgeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(path) = lookup("QPUFORGE_MAILBOX") {
            config.mailbox_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("QPUFORGE_DEVMEM") {
            config.devmem_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("QPUFORGE_KERNEL_DIR") {
            config.kernel_dir = Some(PathBuf::from(dir));
        }
        if let Some(ms) = lookup("QPUFORGE_TIMEOUT_MS") {
            config.timeouts.parallel_ms = parse_ms("QPUFORGE_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("QPUFORGE_SINGLE_UNIT_TIMEOUT_MS") {
            config.timeouts.single_unit_ms = parse_ms("QPUFORGE_SINGLE_UNIT_TIMEOUT_MS", &ms)?;
        }
        if let Some(policy) = lookup("QPUFORGE_CACHE_POLICY") {
            config.cache_policy = match policy.to_lowercase().as_str() {
                "cached" => CachePolicy::Cached,
                "uncached" => CachePolicy::Uncached,
                _ => {
                    return Err(crate::param_error!(
                        "RuntimeConfig::from_env",
                        "QPUFORGE_CACHE_POLICY",
                        policy,
                        "expected 'cached' or 'uncached'"
                    ))
                }
            };
        }
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file; absent fields keep their defaults
    pub fn from_json_file(path: &Path) -> ForgeResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| io_context(e, &format!("reading {}", path.display())))?;
        let config: RuntimeConfig = serde_json::from_str(&text).map_err(|e| {
            QpuForgeError::InvalidParameter {
                routine: "RuntimeConfig::from_json_file",
                param: "path",
                value: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ForgeResult<()> {
        if !self.control_alignment.is_power_of_two() || self.control_alignment < 16 {
            return Err(crate::param_error!(
                "RuntimeConfig",
                "control_alignment",
                self.control_alignment,
                "must be a power of two of at least 16"
            ));
        }
        if self.timeouts.parallel_ms == 0 || self.timeouts.single_unit_ms == 0 {
            return Err(crate::param_error!(
                "RuntimeConfig",
                "timeouts",
                format!("{:?}", self.timeouts),
                "timeouts must be non-zero"
            ));
        }
        Ok(())
    }
}

fn parse_ms(key: &'static str, value: &str) -> ForgeResult<u32> {
    value.trim().parse::<u32>().map_err(|e| {
        crate::param_error!("RuntimeConfig::from_env", key, value, "{}", e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.mailbox_path, PathBuf::from("/dev/vcio"));
        assert_eq!(config.devmem_path, PathBuf::from("/dev/mem"));
        assert_eq!(config.kernel_dir, None);
        assert_eq!(config.mem_flags, MemFlags::DIRECT | MemFlags::ZERO);
        assert_eq!(config.timeouts.parallel_ms, 5_000);
        assert_eq!(config.timeouts.single_unit_ms, 100_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_runtime_config_builder() {
        let config = RuntimeConfig::new()
            .with_mailbox_path("/tmp/vcio")
            .with_devmem_path("/tmp/mem")
            .with_kernel_dir("/opt/qpu")
            .with_mem_flags(MemFlags::L1_NONALLOCATING)
            .with_cache_policy(CachePolicy::Uncached)
            .with_timeouts(TimeoutPolicy {
                parallel_ms: 10,
                single_unit_ms: 20,
            });

        assert_eq!(config.mailbox_path, PathBuf::from("/tmp/vcio"));
        assert_eq!(config.devmem_path, PathBuf::from("/tmp/mem"));
        assert_eq!(config.kernel_dir, Some(PathBuf::from("/opt/qpu")));
        assert_eq!(config.mem_flags.bits(), 0xC);
        assert_eq!(config.cache_policy, CachePolicy::Uncached);
        assert_eq!(config.timeouts.for_units(1), 20);
        assert_eq!(config.timeouts.for_units(12), 10);
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("QPUFORGE_KERNEL_DIR", "/srv/kernels"),
            ("QPUFORGE_TIMEOUT_MS", "250"),
            ("QPUFORGE_CACHE_POLICY", "Uncached"),
        ]
        .into_iter()
        .collect();
        let config =
            RuntimeConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.kernel_dir, Some(PathBuf::from("/srv/kernels")));
        assert_eq!(config.timeouts.parallel_ms, 250);
        assert_eq!(config.timeouts.single_unit_ms, 100_000);
        assert_eq!(config.cache_policy, CachePolicy::Uncached);
    }

    #[test]
    fn test_from_lookup_rejects_bad_timeout() {
        let err = RuntimeConfig::from_lookup(|key| {
            (key == "QPUFORGE_TIMEOUT_MS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("QPUFORGE_TIMEOUT_MS"));
    }

    #[test]
    fn test_from_json_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qpuforge.json");
        std::fs::write(
            &path,
            r#"{ "kernel_dir": "/k", "mem_flags": 12, "timeouts": { "parallel_ms": 42 } }"#,
        )
        .unwrap();

        let config = RuntimeConfig::from_json_file(&path).unwrap();
        assert_eq!(config.kernel_dir, Some(PathBuf::from("/k")));
        assert_eq!(config.mem_flags, MemFlags::L1_NONALLOCATING);
        assert_eq!(config.timeouts.parallel_ms, 42);
        assert_eq!(config.timeouts.single_unit_ms, 100_000);
        assert_eq!(config.mailbox_path, PathBuf::from("/dev/vcio"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = RuntimeConfig::new().with_timeouts(TimeoutPolicy {
            parallel_ms: 0,
            single_unit_ms: 1,
        });
        assert!(config.validate().unwrap_err().is_contract_error());
    }
}
