use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::params::{ParamValue, Params};

/// Default quantum: 100 ms of simulated time.
pub const DEFAULT_QUANTUM_NS: u64 = 100_000_000;

/// Which direct-memory fast path the executor uses, if any.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmiMode {
    #[default]
    Off,
    /// Host-resident memory shared through a `DmiBacking`.
    Host,
    /// Device-resident memory reached through a peek/poke register backend.
    Device,
}

impl DmiMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DmiMode::Off => "off",
            DmiMode::Host => "host",
            DmiMode::Device => "device",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DmiConfig {
    pub mode: DmiMode,
    pub base_address: u64,
    /// Window length in bytes. Only consulted by callers that create the backing store.
    pub size: u64,
}

impl Default for DmiConfig {
    fn default() -> Self {
        Self {
            mode: DmiMode::Off,
            base_address: 0,
            size: 0x0100_0000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub quantum_ns: u64,
    pub dmi: DmiConfig,
    /// Halt after this many completed quanta instead of re-arming the quantum timer.
    pub max_quanta: Option<u64>,
    /// CPU model module to load.
    pub library: Option<PathBuf>,
    pub gdb_port: Option<u16>,
    pub extra_arguments: Vec<String>,
    pub kernel: Option<String>,
    pub dtb: Option<String>,
    pub rootfs: Option<String>,
    pub kernel_cmd: Option<String>,
    pub params: BTreeMap<String, ParamValue>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            quantum_ns: DEFAULT_QUANTUM_NS,
            dmi: DmiConfig::default(),
            max_quanta: None,
            library: None,
            gdb_port: None,
            extra_arguments: Vec::new(),
            kernel: None,
            dtb: None,
            rootfs: None,
            kernel_cmd: None,
            params: BTreeMap::new(),
        }
    }
}

impl BridgeConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| BridgeError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.quantum_ns == 0 {
            return Err(BridgeError::Config("quantum_ns must be non-zero".into()));
        }
        if self.max_quanta == Some(0) {
            return Err(BridgeError::Config("max_quanta must be at least 1".into()));
        }
        if self.dmi.mode != DmiMode::Off {
            if self.dmi.size == 0 {
                return Err(BridgeError::Config("dmi.size must be non-zero".into()));
            }
            if self.dmi.base_address.checked_add(self.dmi.size).is_none() {
                return Err(BridgeError::Config(format!(
                    "dmi window 0x{:x}+0x{:x} wraps the address space",
                    self.dmi.base_address, self.dmi.size
                )));
            }
        }
        if self.dmi.mode == DmiMode::Device && self.dmi.base_address % 4 != 0 {
            return Err(BridgeError::Config(format!(
                "device dmi base 0x{:x} must be 4-byte aligned",
                self.dmi.base_address
            )));
        }
        Ok(())
    }

    /// Builds the parameter table a CPU model sees: every config field under its own name,
    /// followed by the free-form `params` entries (which may override them).
    pub fn to_params(&self) -> Params {
        let params = Params::new();
        params.set("quantum", self.quantum_ns);
        params.set("dmi", self.dmi.mode.as_str());
        params.set("dmi_base_address", self.dmi.base_address);
        params.set("dmi_size", self.dmi.size);
        if let Some(max) = self.max_quanta {
            params.set("max_quanta", max);
        }
        if let Some(library) = &self.library {
            params.set("library", library.display().to_string());
        }
        if let Some(port) = self.gdb_port {
            params.set("gdb_port", u64::from(port));
        }
        if !self.extra_arguments.is_empty() {
            params.set("extra_arguments", self.extra_arguments.join(" "));
        }
        let strings = [
            ("kernel", &self.kernel),
            ("dtb", &self.dtb),
            ("rootfs", &self.rootfs),
            ("kernel_cmd", &self.kernel_cmd),
        ];
        for (name, value) in strings {
            if let Some(value) = value {
                params.set(name, value.as_str());
            }
        }
        for (name, value) in &self.params {
            params.set(name.clone(), value.clone());
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = BridgeConfig::from_json_str("{}").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.quantum_ns, 100_000_000);
        assert_eq!(config.dmi.mode, DmiMode::Off);
    }

    #[test]
    fn full_config_parses_and_exports_params() {
        let config = BridgeConfig::from_json_str(
            r#"{
                "quantum_ns": 1000,
                "dmi": { "mode": "host", "base_address": 2147483648, "size": 4096 },
                "max_quanta": 3,
                "gdb_port": 1234,
                "kernel": "vmlinux",
                "kernel_cmd": "console=ttyS0",
                "extra_arguments": ["-smp", "1"],
                "params": { "cpu.cores": 2, "quantum": 5 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.dmi.mode, DmiMode::Host);

        let params = config.to_params();
        assert_eq!(params.get_uint("dmi_base_address"), Some(0x8000_0000));
        assert_eq!(params.get_uint("gdb_port"), Some(1234));
        assert_eq!(params.get_string("dmi").as_deref(), Some("host"));
        assert_eq!(params.get_string("extra_arguments").as_deref(), Some("-smp 1"));
        assert_eq!(params.get_uint("cpu.cores"), Some(2));
        // Free-form entries win over derived ones.
        assert_eq!(params.get_uint("quantum"), Some(5));
        assert_eq!(params.get_string("rootfs"), None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        for text in [
            r#"{"quantum_ns": 0}"#,
            r#"{"max_quanta": 0}"#,
            r#"{"dmi": {"mode": "device", "base_address": 2}}"#,
            r#"{"dmi": {"mode": "host", "size": 0}}"#,
            r#"{"dmi": {"mode": "host", "base_address": 18446744073709551615, "size": 2}}"#,
        ] {
            assert!(
                matches!(BridgeConfig::from_json_str(text), Err(BridgeError::Config(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn unknown_fields_and_modes_fail_to_parse() {
        assert!(matches!(
            BridgeConfig::from_json_str(r#"{"quantum": 5}"#),
            Err(BridgeError::ConfigParse(_))
        ));
        assert!(matches!(
            BridgeConfig::from_json_str(r#"{"dmi": {"mode": "fast"}}"#),
            Err(BridgeError::ConfigParse(_))
        ));
    }

    #[test]
    fn from_path_reports_the_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        match BridgeConfig::from_path(&path) {
            Err(BridgeError::ConfigRead { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
