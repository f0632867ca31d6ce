use std::{
    collections::{BTreeMap, HashMap},
    net::Ipv4Addr,
    sync::Arc,
};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    schedule::DeviceSchedule,
    types::{DayType, MacAddr},
};

/// One device entry of the pushed/persisted config document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workday: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holiday: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anyday: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DayEntry {
    pub date: String,
    #[serde(rename = "type")]
    pub day_type: DayType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigDocument {
    #[serde(default)]
    pub devices: Option<BTreeMap<String, DeviceEntry>>,
    #[serde(default)]
    pub days: Option<Vec<DayEntry>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub schedule: DeviceSchedule,
}

impl Device {
    pub fn has_schedule(&self) -> bool {
        self.schedule.has_schedule()
    }
}

impl TryFrom<&DeviceEntry> for Device {
    type Error = ConfigError;

    fn try_from(entry: &DeviceEntry) -> Result<Self, Self::Error> {
        let invalid = |reason: &str| ConfigError::InvalidDevice {
            name: entry.name.clone(),
            reason: reason.to_string(),
        };

        if entry.name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        if entry.ip.trim().is_empty() {
            return Err(invalid("ip is empty"));
        }
        let ip: Ipv4Addr = entry
            .ip
            .trim()
            .parse()
            .map_err(|_| invalid("ip is not an IPv4 address"))?;
        if entry.mac.trim().is_empty() {
            return Err(invalid("mac is required for wake actions"));
        }
        let mac: MacAddr = entry.mac.trim().parse()?;

        let schedule = DeviceSchedule {
            workday: DeviceSchedule::parse_rules(entry.workday.as_deref())?,
            holiday: DeviceSchedule::parse_rules(entry.holiday.as_deref())?,
            anyday: DeviceSchedule::parse_rules(entry.anyday.as_deref())?,
        };

        Ok(Self {
            name: entry.name.clone(),
            ip,
            mac,
            schedule,
        })
    }
}

/// Versioned set of devices and the day-type calendar pushed by the server.
#[derive(Debug, Clone, Default)]
pub struct DeviceDirectory {
    version: u32,
    devices: BTreeMap<String, Arc<Device>>,
    calendar: HashMap<NaiveDate, DayType>,
}

impl DeviceDirectory {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn device(&self, name: &str) -> Option<Arc<Device>> {
        self.devices.get(name).cloned()
    }

    pub fn devices(&self) -> impl Iterator<Item = (&str, &Arc<Device>)> {
        self.devices
            .iter()
            .map(|(name, device)| (name.as_str(), device))
    }

    pub fn snapshot(&self) -> Vec<(String, Arc<Device>)> {
        self.devices
            .iter()
            .map(|(name, device)| (name.clone(), Arc::clone(device)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn day_type(&self, date: NaiveDate) -> Option<DayType> {
        self.calendar.get(&date).copied()
    }

    pub fn apply_json(&mut self, raw: &serde_json::Value) -> Result<(), ConfigError> {
        let document = ConfigDocument::deserialize(raw)?;
        self.apply(&document)
    }

    /// Replaces devices and calendar atomically. On error nothing changes.
    pub fn apply(&mut self, document: &ConfigDocument) -> Result<(), ConfigError> {
        let entries = document.devices.as_ref().ok_or(ConfigError::MissingDevices)?;
        let days = document.days.as_ref().ok_or(ConfigError::MissingDays)?;

        let mut devices = BTreeMap::new();
        for (name, entry) in entries {
            devices.insert(name.clone(), Arc::new(Device::try_from(entry)?));
        }

        let mut calendar = HashMap::with_capacity(days.len());
        for day in days {
            let date = NaiveDate::parse_from_str(&day.date, "%Y-%m-%d")
                .map_err(|_| ConfigError::InvalidDate(day.date.clone()))?;
            calendar.insert(date, day.day_type);
        }

        self.devices = devices;
        self.calendar = calendar;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{schedule::TimeRule, types::Direction};

    fn document() -> serde_json::Value {
        json!({
            "devices": {
                "A": {
                    "name": "A",
                    "ip": "10.0.0.5",
                    "mac": "AA:BB:CC:DD:EE:FF",
                    "workday": ["+08:00", "-18:00"]
                },
                "nas": {
                    "name": "nas",
                    "ip": "10.0.0.9",
                    "mac": "00-11-22-33-44-55",
                    "anyday": ["+7:30"]
                }
            },
            "days": [
                { "date": "2026-03-02", "type": "workday" },
                { "date": "2026-03-07", "type": "holiday" }
            ]
        })
    }

    #[test]
    fn valid_document_bumps_version_by_one() {
        let mut directory = DeviceDirectory::default();
        directory.apply_json(&document()).unwrap();

        assert_eq!(directory.version(), 1);
        assert_eq!(directory.len(), 2);

        let device = directory.device("A").unwrap();
        assert_eq!(device.ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(
            device.schedule.workday,
            Some(vec![
                TimeRule::new(Direction::Start, 480),
                TimeRule::new(Direction::Stop, 1080)
            ])
        );
        assert_eq!(
            directory.day_type(NaiveDate::from_ymd_opt(2026, 3, 7).unwrap()),
            Some(DayType::Holiday)
        );
        assert_eq!(
            directory.day_type(NaiveDate::from_ymd_opt(2026, 3, 8).unwrap()),
            None
        );
    }

    #[test]
    fn missing_keys_leave_directory_untouched() {
        let mut directory = DeviceDirectory::default();
        directory.apply_json(&document()).unwrap();

        let no_days = json!({ "devices": {} });
        let no_devices = json!({ "days": [] });

        assert!(matches!(
            directory.apply_json(&no_days),
            Err(ConfigError::MissingDays)
        ));
        assert!(matches!(
            directory.apply_json(&no_devices),
            Err(ConfigError::MissingDevices)
        ));
        assert_eq!(directory.version(), 1);
        assert_eq!(directory.len(), 2);
    }

    #[test]
    fn invalid_device_rejects_whole_document() {
        let mut directory = DeviceDirectory::default();
        let mut raw = document();
        raw["devices"]["nas"]["mac"] = json!("");

        assert!(matches!(
            directory.apply_json(&raw),
            Err(ConfigError::InvalidDevice { .. })
        ));

        raw["devices"]["nas"]["mac"] = json!("00-11-22-33-44-55");
        raw["devices"]["A"]["workday"] = json!(["+25:00"]);
        assert!(matches!(
            directory.apply_json(&raw),
            Err(ConfigError::InvalidTime(_))
        ));
        assert_eq!(directory.version(), 0);
        assert!(directory.is_empty());
    }

    #[test]
    fn version_wraps_at_u32_max() {
        let mut directory = DeviceDirectory {
            version: u32::MAX,
            ..DeviceDirectory::default()
        };
        directory.apply_json(&document()).unwrap();
        assert_eq!(directory.version(), 0);
    }

    #[test]
    fn empty_collections_are_accepted() {
        let mut directory = DeviceDirectory::default();
        directory.apply_json(&document()).unwrap();
        directory
            .apply_json(&json!({ "devices": {}, "days": [] }))
            .unwrap();

        assert_eq!(directory.version(), 2);
        assert!(directory.is_empty());
    }
}
