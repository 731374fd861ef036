use crate::error::{Result, SshError};
use recovery_core::dut::Dut;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Lab inventory kept in a YAML file.
///
/// ```yaml
/// duts:
///   - name: dut-1
///     board: octopus
///     servo_host: { name: labstation-1, servod_port: 9901 }
/// units:
///   rack-3: [dut-1, dut-2]
/// ```
///
/// A unit not listed under `units` resolves to the device of the same name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInventory {
    #[serde(default)]
    pub duts: Vec<Dut>,
    #[serde(default)]
    pub units: BTreeMap<String, Vec<String>>,
}

impl FileInventory {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let inventory: FileInventory = serde_yaml::from_str(yaml)?;
        inventory.check()?;
        Ok(inventory)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
            .map_err(|e| SshError::Inventory(format!("{}: {e}", path.display())))
    }

    fn check(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for dut in &self.duts {
            if !seen.insert(dut.name.as_str()) {
                return Err(SshError::Inventory(format!("duplicate device '{}'", dut.name)));
            }
        }
        for (unit, members) in &self.units {
            if let Some(missing) = members.iter().find(|m| !seen.contains(m.as_str())) {
                return Err(SshError::Inventory(format!(
                    "unit '{unit}' lists unknown device '{missing}'"
                )));
            }
        }
        Ok(())
    }

    pub fn list_resources(&self, unit: &str) -> Result<Vec<String>> {
        if let Some(members) = self.units.get(unit) {
            return Ok(members.clone());
        }
        if self.duts.iter().any(|d| d.name == unit) {
            return Ok(vec![unit.to_string()]);
        }
        Err(SshError::Inventory(format!("unit '{unit}' not found")))
    }

    pub fn dut(&self, name: &str) -> Result<&Dut> {
        self.duts
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| SshError::Inventory(format!("device '{name}' not found")))
    }
}
