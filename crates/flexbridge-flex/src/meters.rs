//! Meter roles and the runtime meter-id mapping.
//!
//! Telemetry datagrams carry only a numeric meter id. The radio assigns
//! those ids at runtime and announces them on `meter` status lines, so the
//! bridge keeps a [`MeterMap`] from id to the role it plays in the device
//! state. The map starts from fixed defaults and is corrected as the
//! radio's announcements arrive.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use flexbridge_core::{StateUpdate, watts_from_dbm};

use crate::codec::MeterStatus;

/// Default meter id for the S-meter.
pub const DEFAULT_S_METER_ID: u16 = 1;

/// Default meter id for forward power.
pub const DEFAULT_FORWARD_POWER_ID: u16 = 2;

/// Default meter id for SWR.
pub const DEFAULT_SWR_ID: u16 = 3;

/// What a meter reading means for the device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeterRole {
    /// Receive signal strength, dBm.
    SMeter,
    /// Forward transmit power, reported in dBm and shown in watts.
    ForwardPower,
    /// Standing wave ratio.
    Swr,
}

impl MeterRole {
    /// Identify the role of a meter from its announced name and source.
    ///
    /// Returns `None` for meters the bridge does not display.
    pub fn from_meter(name: &str, source: Option<&str>) -> Option<MeterRole> {
        let name = name.to_ascii_uppercase();
        match name.as_str() {
            "LEVEL" if source.is_none_or(|s| s.starts_with("SLC")) => Some(MeterRole::SMeter),
            "S-METER" | "SIGNAL" => Some(MeterRole::SMeter),
            "FWDPWR" | "POWER_FORWARD" => Some(MeterRole::ForwardPower),
            "SWR" => Some(MeterRole::Swr),
            _ => None,
        }
    }

    /// Turn a scaled reading into the state update for this role.
    pub fn update(self, value_dbm: f32) -> StateUpdate {
        match self {
            MeterRole::SMeter => StateUpdate {
                s_meter_dbm: Some(value_dbm),
                ..StateUpdate::default()
            },
            MeterRole::ForwardPower => StateUpdate {
                power_meter_watts: Some(watts_from_dbm(value_dbm)),
                ..StateUpdate::default()
            },
            MeterRole::Swr => StateUpdate {
                swr_ratio: Some(value_dbm),
                ..StateUpdate::default()
            },
        }
    }

    /// Short name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            MeterRole::SMeter => "s-meter",
            MeterRole::ForwardPower => "forward-power",
            MeterRole::Swr => "swr",
        }
    }
}

/// Bidirectional mapping between meter ids and roles.
///
/// Each role is held by at most one id and each id plays at most one role.
#[derive(Debug, Clone)]
pub struct MeterMap {
    id_to_role: HashMap<u16, MeterRole>,
    role_to_id: HashMap<MeterRole, u16>,
}

/// A meter map shared between the command channel and the telemetry stream.
pub type SharedMeterMap = Arc<Mutex<MeterMap>>;

impl MeterMap {
    /// Create an empty map.
    pub fn empty() -> Self {
        MeterMap {
            id_to_role: HashMap::new(),
            role_to_id: HashMap::new(),
        }
    }

    /// Create a map seeded with the default ids.
    pub fn with_defaults(s_meter: u16, forward_power: u16, swr: u16) -> Self {
        let mut map = Self::empty();
        map.insert(s_meter, MeterRole::SMeter);
        map.insert(forward_power, MeterRole::ForwardPower);
        map.insert(swr, MeterRole::Swr);
        map
    }

    /// Wrap the map for sharing between tasks.
    pub fn shared(self) -> SharedMeterMap {
        Arc::new(Mutex::new(self))
    }

    /// Assign a role to an id, replacing any previous holder of either.
    pub fn insert(&mut self, id: u16, role: MeterRole) {
        if let Some(old_role) = self.id_to_role.remove(&id) {
            self.role_to_id.remove(&old_role);
        }
        if let Some(old_id) = self.role_to_id.remove(&role) {
            self.id_to_role.remove(&old_id);
        }
        self.id_to_role.insert(id, role);
        self.role_to_id.insert(role, id);
    }

    /// Role played by a meter id.
    pub fn role_for_id(&self, id: u16) -> Option<MeterRole> {
        self.id_to_role.get(&id).copied()
    }

    /// Id currently holding a role.
    pub fn id_for_role(&self, role: MeterRole) -> Option<u16> {
        self.role_to_id.get(&role).copied()
    }

    /// Fold a meter announcement into the map.
    ///
    /// Returns the role assigned, or `None` if the meter is not one the
    /// bridge displays.
    pub fn apply_status(&mut self, meter: &MeterStatus) -> Option<MeterRole> {
        let role = MeterRole::from_meter(meter.name.as_deref()?, meter.source.as_deref())?;
        self.insert(meter.id, role);
        Some(role)
    }
}

impl Default for MeterMap {
    fn default() -> Self {
        Self::with_defaults(DEFAULT_S_METER_ID, DEFAULT_FORWARD_POWER_ID, DEFAULT_SWR_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let map = MeterMap::default();
        assert_eq!(map.role_for_id(1), Some(MeterRole::SMeter));
        assert_eq!(map.role_for_id(2), Some(MeterRole::ForwardPower));
        assert_eq!(map.role_for_id(3), Some(MeterRole::Swr));
        assert_eq!(map.role_for_id(4), None);
    }

    #[test]
    fn empty_map() {
        let map = MeterMap::empty();
        assert_eq!(map.role_for_id(1), None);
        assert_eq!(map.id_for_role(MeterRole::Swr), None);
    }

    #[test]
    fn insert_moves_role_to_new_id() {
        let mut map = MeterMap::default();
        map.insert(17, MeterRole::Swr);
        assert_eq!(map.role_for_id(17), Some(MeterRole::Swr));
        assert_eq!(map.role_for_id(3), None);
        assert_eq!(map.id_for_role(MeterRole::Swr), Some(17));
    }

    #[test]
    fn insert_replaces_role_of_id() {
        let mut map = MeterMap::default();
        map.insert(1, MeterRole::Swr);
        assert_eq!(map.role_for_id(1), Some(MeterRole::Swr));
        assert_eq!(map.id_for_role(MeterRole::SMeter), None);
        assert_eq!(map.role_for_id(3), None);
    }

    #[test]
    fn roles_from_announcements() {
        assert_eq!(
            MeterRole::from_meter("LEVEL", Some("SLC")),
            Some(MeterRole::SMeter)
        );
        assert_eq!(MeterRole::from_meter("LEVEL", Some("TX-")), None);
        assert_eq!(
            MeterRole::from_meter("FWDPWR", Some("TX-")),
            Some(MeterRole::ForwardPower)
        );
        assert_eq!(MeterRole::from_meter("swr", None), Some(MeterRole::Swr));
        assert_eq!(MeterRole::from_meter("MICPEAK", Some("TX-")), None);
    }

    #[test]
    fn apply_status_updates_map() {
        let mut map = MeterMap::default();
        let meter = MeterStatus {
            id: 9,
            name: Some("FWDPWR".into()),
            source: Some("TX-".into()),
        };
        assert_eq!(map.apply_status(&meter), Some(MeterRole::ForwardPower));
        assert_eq!(map.role_for_id(9), Some(MeterRole::ForwardPower));
        assert_eq!(map.role_for_id(2), None);

        let unnamed = MeterStatus {
            id: 10,
            name: None,
            source: None,
        };
        assert_eq!(map.apply_status(&unnamed), None);
    }

    #[test]
    fn updates_per_role() {
        assert_eq!(MeterRole::SMeter.update(-73.0).s_meter_dbm, Some(-73.0));
        assert_eq!(MeterRole::Swr.update(1.5).swr_ratio, Some(1.5));
        let watts = MeterRole::ForwardPower
            .update(50.0)
            .power_meter_watts
            .unwrap();
        assert!((watts - 100.0).abs() < 0.01);
    }
}
