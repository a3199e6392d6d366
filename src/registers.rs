//! GoodWe register map: the boundary between raw bus words and physical
//! units. All scaling and sign extension happens here so the layers above
//! only ever see watts, volts, amps and percent.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegisterMapError {
    #[error("unknown register '{0}'")]
    UnknownRegister(String),
    #[error("register '{0}' is read-only")]
    ReadOnly(String),
    #[error("value {value} out of range for register '{name}'")]
    OutOfRange { name: String, value: f64 },
}

/// Register access class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    R,
    Rw,
}

impl Default for Access {
    fn default() -> Self {
        Access::R
    }
}

/// Descriptor for a single holding register. Immutable after load.
///
/// `scale` is the integer divisor between raw and physical: a register
/// holding decivolts carries `scale: 10`, so `physical = raw / 10`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    pub name: String,
    pub address: u16,
    #[serde(default = "one_word")]
    pub words: u8,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "unit_scale")]
    pub scale: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub access: Access,
}

fn one_word() -> u8 {
    1
}

fn unit_scale() -> f64 {
    1.0
}

impl RegisterDescriptor {
    /// Decode raw bus words into a physical value, applying sign
    /// extension and the descriptor scale.
    pub fn decode(&self, words: &[u16]) -> f64 {
        let raw: i64 = match words {
            [w] => {
                if self.signed {
                    *w as i16 as i64
                } else {
                    *w as i64
                }
            }
            [hi, lo] => {
                let combined = ((*hi as u32) << 16) | *lo as u32;
                if self.signed {
                    combined as i32 as i64
                } else {
                    combined as i64
                }
            }
            _ => 0,
        };
        raw as f64 / self.scale
    }

    /// Encode a physical value into a single bus word.
    ///
    /// Writes are single-word on this device family; multi-word write
    /// registers do not exist in the map.
    pub fn encode(&self, physical: f64) -> Result<u16, RegisterMapError> {
        let raw = (physical * self.scale).round();
        if self.signed {
            if raw < i16::MIN as f64 || raw > i16::MAX as f64 {
                return Err(RegisterMapError::OutOfRange {
                    name: self.name.clone(),
                    value: physical,
                });
            }
            Ok(raw as i16 as u16)
        } else {
            if raw < 0.0 || raw > u16::MAX as f64 {
                return Err(RegisterMapError::OutOfRange {
                    name: self.name.clone(),
                    value: physical,
                });
            }
            Ok(raw as u16)
        }
    }
}

/// Wire shape of the register map delivered by bootstrap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterMapDoc {
    #[serde(default)]
    pub read_registers: Vec<RegisterDescriptor>,
    #[serde(default)]
    pub write_registers: Vec<RegisterDescriptor>,
}

/// Named lookup table of register descriptors.
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    by_name: HashMap<String, RegisterDescriptor>,
}

impl RegisterMap {
    pub fn from_doc(doc: RegisterMapDoc) -> Self {
        let mut by_name = HashMap::new();
        for reg in doc.read_registers {
            by_name.insert(reg.name.clone(), reg);
        }
        for mut reg in doc.write_registers {
            reg.access = Access::Rw;
            by_name.insert(reg.name.clone(), reg);
        }
        Self { by_name }
    }

    pub fn lookup(&self, name: &str) -> Result<&RegisterDescriptor, RegisterMapError> {
        self.by_name
            .get(name)
            .ok_or_else(|| RegisterMapError::UnknownRegister(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Registers the EMS must be able to write; a map missing any of
    /// these is a field-bus misconfiguration and the process refuses to
    /// start.
    pub const REQUIRED_WRITES: &'static [&'static str] = &[
        "ems_power_mode",
        "ems_power_set",
        "export_power_cap",
        "feed_power_enable",
        "manufacturer_code",
    ];

    pub fn missing_required(&self) -> Vec<&'static str> {
        Self::REQUIRED_WRITES
            .iter()
            .copied()
            .filter(|n| !self.contains(n))
            .collect()
    }

    /// Built-in descriptor table for the GoodWe ET/EH hybrid family.
    ///
    /// Bootstrap normally supplies the map; this table backs the test
    /// suite and documents the addresses the controller relies on.
    pub fn goodwe_et() -> Self {
        fn r(name: &str, address: u16, signed: bool, scale: f64, unit: &str) -> RegisterDescriptor {
            RegisterDescriptor {
                name: name.to_string(),
                address,
                words: 1,
                signed,
                scale,
                unit: if unit.is_empty() { None } else { Some(unit.to_string()) },
                access: Access::R,
            }
        }
        fn w(name: &str, address: u16, signed: bool, scale: f64, unit: &str) -> RegisterDescriptor {
            let mut reg = r(name, address, signed, scale, unit);
            reg.access = Access::Rw;
            reg
        }
        Self::from_doc(RegisterMapDoc {
            read_registers: vec![
                r("meter_total_active_power", 36025, true, 1.0, "W"),
                r("battery_soc", 37007, false, 1.0, "%"),
                r("battery_voltage", 37003, false, 10.0, "V"),
                r("battery_current", 37004, true, 10.0, "A"),
                r("battery_power", 37005, true, 1.0, "W"),
                r("pv1_power", 35103, false, 1.0, "W"),
                r("pv2_power", 35107, false, 1.0, "W"),
                r("pv3_power", 35111, false, 1.0, "W"),
                r("pv4_power", 35115, false, 1.0, "W"),
                r("mppt1_power", 35337, false, 1.0, "W"),
                r("mppt2_power", 35338, false, 1.0, "W"),
                r("mppt3_power", 35339, false, 1.0, "W"),
                r("mppt4_power", 35340, false, 1.0, "W"),
                r("mppt5_power", 35341, false, 1.0, "W"),
                r("ct2_active_power", 36045, true, 1.0, "W"),
                r("app_mode_display", 10405, false, 1.0, ""),
                r("ems_mode_display", 10456, false, 1.0, ""),
                r("ems_check_status", 40008, false, 1.0, ""),
                r("bms_warning_bits", 39894, false, 1.0, ""),
                r("bms_alarm_bits", 39896, false, 1.0, ""),
                r("bms_soc", 39898, false, 1.0, "%"),
                r("bms_soh_percent", 39899, false, 1.0, "%"),
                r("arc_fault", 36065, false, 1.0, ""),
                r("parallel_comm_status", 36066, false, 1.0, ""),
                r("meter_path", 50091, false, 1.0, ""),
                r("int_meter_comm", 50092, false, 1.0, ""),
                r("ext_meter_comm", 50094, false, 1.0, ""),
            ],
            write_registers: vec![
                w("manufacturer_code", 47505, false, 1.0, ""),
                w("external_meter_enable", 47464, false, 1.0, ""),
                w("feed_power_enable", 47509, false, 1.0, ""),
                w("export_power_cap", 47510, false, 1.0, "W"),
                w("ems_power_mode", 47511, false, 1.0, ""),
                w("ems_power_set", 47512, false, 1.0, "W"),
                w("meter_target_power_offset", 47120, true, 1.0, "W"),
                w("remote_comm_loss_time", 42101, false, 1.0, "s"),
            ],
        })
    }
}
