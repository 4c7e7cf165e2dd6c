use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::device::{AccessMode, Device};

/// Fixed part of the GigE device ids this crate aliases to integers.
pub const DEVICE_ID_PREFIX: &str = "DEV_000F31";

/// Integer alias of a device id: its last 6 hex digits.
pub fn hex_id_to_int_id(id: &str) -> Option<u32> {
    let start = id.len().checked_sub(6)?;
    let digits = id.get(start..)?;
    u32::from_str_radix(digits, 16).ok()
}

/// Inverse of [`hex_id_to_int_id`] for ids carrying [`DEVICE_ID_PREFIX`].
pub fn int_id_to_hex_id(id: u32) -> String {
    format!("{DEVICE_ID_PREFIX}{:06X}", id & 0xFF_FFFF)
}

/// Driver name of user set `index`; out of range selects the default set.
pub fn user_set_string(index: i32) -> String {
    match index {
        1..=3 => format!("UserSet{index}"),
        _ => "Default".to_string(),
    }
}

// Listed camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub simple_id: Option<u32>,
    pub name: String,
    pub model: String,
    pub serial: String,
    pub available: AccessMode,
}

impl DeviceInfo {
    pub fn new(device: &Device) -> Self {
        Self {
            id: device.id().to_string(),
            simple_id: hex_id_to_int_id(device.id()),
            name: device.name().to_string(),
            model: device.model().to_string(),
            serial: device.serial().to_string(),
            available: device.available_access_mode(),
        }
    }
}

/// Human readable table of `devices`, as logged by `list_devices`.
pub fn device_table(devices: &[DeviceInfo]) -> String {
    const RULE: &str =
        "##########################################################################################";

    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "##           LISTING CAMERAS");
    for (i, device) in devices.iter().enumerate() {
        let simple_id = device
            .simple_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".into());
        let _ = writeln!(
            out,
            "##  {i}  name: {}  simple id: {simple_id}  id: {}  available: {}",
            device.name, device.id, device.available
        );
    }
    if devices.is_empty() {
        let _ = writeln!(out, "## no cameras found");
    }
    let _ = writeln!(out, "##");
    let _ = write!(out, "{RULE}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_ids_round_trip() {
        for id in 0..=0xFF_FFFFu32 {
            assert_eq!(hex_id_to_int_id(&int_id_to_hex_id(id)), Some(id), "{id:#x}");
        }
    }

    #[test]
    fn hex_ids_are_padded_and_uppercase() {
        assert_eq!(int_id_to_hex_id(0xab), "DEV_000F310000AB");
        assert_eq!(hex_id_to_int_id("DEV_000F31023A1C"), Some(0x023A1C));
        assert_eq!(hex_id_to_int_id("abc"), None);
        assert_eq!(hex_id_to_int_id("DEV_000F31XYZ123"), None);
    }

    #[test]
    fn user_sets_outside_range_are_default() {
        assert_eq!(user_set_string(1), "UserSet1");
        assert_eq!(user_set_string(3), "UserSet3");
        assert_eq!(user_set_string(0), "Default");
        assert_eq!(user_set_string(4), "Default");
        assert_eq!(user_set_string(-1), "Default");
    }

    #[test]
    fn table_lists_every_device() {
        let devices = [DeviceInfo {
            id: "DEV_000F31000001".into(),
            simple_id: Some(1),
            name: "Front".into(),
            model: "SIM-1".into(),
            serial: "000001".into(),
            available: AccessMode::Master,
        }];
        let table = device_table(&devices);
        assert!(table.contains("name: Front  simple id: 1  id: DEV_000F31000001  available: master"));
        assert!(device_table(&[]).contains("no cameras found"));
    }
}
