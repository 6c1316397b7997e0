//! Persisted Profile Records
//!
//! The JSON records the app keeps per pod, room, and preset, plus the
//! domain rules that operate on them (id allocation, the tunable
//! frequency band, frequency resolution for the active source).
//!
//! Field names and value encodings are fixed by the records already on
//! users' phones; changing them silently orphans existing data.

use crate::domain::models::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Frequencies the pod can be tuned to, in Hz.
pub const FREQUENCY_BAND: RangeInclusive<f64> = 100.0..=140.0;

/// True if the frequency is inside the pod's tunable band.
pub fn frequency_in_band(hz: f64) -> bool {
    FREQUENCY_BAND.contains(&hz)
}

/// Frequencies are entered and stored with one decimal of precision.
pub fn round_frequency(hz: f64) -> f64 {
    (hz * 10.0).round() / 10.0
}

/// Room axis selected for frequency lookup. Stored as 0/1/2 in the
/// per-room dimension map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Dimension {
    Length,
    Width,
    Height,
}

impl Dimension {
    /// Cycle to the next axis, wrapping after height.
    pub fn next(self) -> Self {
        match self {
            Self::Length => Self::Width,
            Self::Width => Self::Height,
            Self::Height => Self::Length,
        }
    }

    pub fn axis_name(self) -> &'static str {
        match self {
            Self::Length => "length",
            Self::Width => "width",
            Self::Height => "height",
        }
    }
}

impl Default for Dimension {
    fn default() -> Self {
        Self::Length
    }
}

impl From<Dimension> for u8 {
    fn from(dimension: Dimension) -> Self {
        match dimension {
            Dimension::Length => 0,
            Dimension::Width => 1,
            Dimension::Height => 2,
        }
    }
}

impl TryFrom<u8> for Dimension {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Length),
            1 => Ok(Self::Width),
            2 => Ok(Self::Height),
            other => Err(format!("invalid dimension value: {}", other)),
        }
    }
}

/// Where the active frequency comes from. Stored as -1/0/1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum SourceMode {
    None,
    Preset,
    Room,
}

impl Default for SourceMode {
    fn default() -> Self {
        Self::None
    }
}

impl From<SourceMode> for i8 {
    fn from(mode: SourceMode) -> Self {
        match mode {
            SourceMode::None => -1,
            SourceMode::Preset => 0,
            SourceMode::Room => 1,
        }
    }
}

impl TryFrom<i8> for SourceMode {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::None),
            0 => Ok(Self::Preset),
            1 => Ok(Self::Room),
            other => Err(format!("invalid source mode value: {}", other)),
        }
    }
}

/// Measured metres and the resonant frequency computed for that span,
/// stored as a two-element array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionSpan(pub f64, pub f64);

impl DimensionSpan {
    pub fn metres(&self) -> f64 {
        self.0
    }

    pub fn hz(&self) -> f64 {
        self.1
    }
}

/// A paired pod and its tuning state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: i64,
    pub name: String,
    /// Missing on records created before pairing stored platform ids.
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    #[serde(default = "default_frequency")]
    pub frequency: f64,
    #[serde(default)]
    pub current_mode: SourceMode,
    /// Id of the active preset or room; -1 when nothing is selected.
    #[serde(default = "default_current_id")]
    pub current_id: i64,
    /// Selected axis per room id.
    #[serde(default)]
    pub current_dimension: BTreeMap<i64, Dimension>,
}

fn default_frequency() -> f64 {
    100.0
}

fn default_current_id() -> i64 {
    -1
}

impl DeviceRecord {
    /// Record for a pod that just completed pairing: no source selected,
    /// every known room starting on its length axis.
    pub fn paired(
        id: i64,
        device_id: DeviceId,
        name: impl Into<String>,
        rooms: &[RoomRecord],
    ) -> Self {
        Self {
            id,
            name: name.into(),
            device_id: Some(device_id),
            frequency: default_frequency(),
            current_mode: SourceMode::None,
            current_id: default_current_id(),
            current_dimension: rooms
                .iter()
                .map(|room| (room.id, Dimension::Length))
                .collect(),
        }
    }

    /// Frequency implied by the active source, if one is selected.
    pub fn resolve_frequency(&self, presets: &[PresetRecord], rooms: &[RoomRecord]) -> Option<f64> {
        if self.current_id < 0 {
            return None;
        }
        match self.current_mode {
            SourceMode::None => None,
            SourceMode::Preset => presets
                .iter()
                .find(|preset| preset.id == self.current_id)
                .map(|preset| preset.frequency),
            SourceMode::Room => rooms.iter().find(|room| room.id == self.current_id).map(
                |room| {
                    let dimension = self
                        .current_dimension
                        .get(&room.id)
                        .copied()
                        .unwrap_or_default();
                    room.span(dimension).hz()
                },
            ),
        }
    }
}

/// A measured room; each axis carries metres and the derived frequency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: i64,
    pub name: String,
    pub length: DimensionSpan,
    pub width: DimensionSpan,
    pub height: DimensionSpan,
}

impl RoomRecord {
    pub fn span(&self, dimension: Dimension) -> DimensionSpan {
        match dimension {
            Dimension::Length => self.length,
            Dimension::Width => self.width,
            Dimension::Height => self.height,
        }
    }
}

/// A named frequency preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetRecord {
    pub id: i64,
    pub name: String,
    pub frequency: f64,
}

/// Smallest non-negative id not yet taken.
pub fn first_free_id<I>(ids: I) -> i64
where
    I: IntoIterator<Item = i64>,
{
    let taken: std::collections::HashSet<i64> = ids.into_iter().collect();
    let mut candidate = 0;
    while taken.contains(&candidate) {
        candidate += 1;
    }
    candidate
}

/// Factory presets shipped with the app.
pub fn default_presets() -> Vec<PresetRecord> {
    vec![
        PresetRecord {
            id: 0,
            name: "Mid Reducer".to_string(),
            frequency: 132.7,
        },
        PresetRecord {
            id: 1,
            name: "Vocal Clarity".to_string(),
            frequency: 128.3,
        },
        PresetRecord {
            id: 2,
            name: "Guitar Recording".to_string(),
            frequency: 100.8,
        },
    ]
}

/// Factory rooms shipped with the app.
pub fn default_rooms() -> Vec<RoomRecord> {
    vec![
        RoomRecord {
            id: 0,
            name: "Home Studio".to_string(),
            length: DimensionSpan(2.5, 125.4),
            width: DimensionSpan(3.5, 104.2),
            height: DimensionSpan(2.0, 116.7),
        },
        RoomRecord {
            id: 1,
            name: "Recording Studio".to_string(),
            length: DimensionSpan(4.5, 100.4),
            width: DimensionSpan(3.5, 104.2),
            height: DimensionSpan(3.0, 195.7),
        },
        RoomRecord {
            id: 2,
            name: "Living Room".to_string(),
            length: DimensionSpan(1.5, 133.6),
            width: DimensionSpan(3.7, 103.9),
            height: DimensionSpan(1.5, 129.4),
        },
    ]
}

/// Placeholder device present on first launch, before any pod is paired.
pub fn default_devices() -> Vec<DeviceRecord> {
    vec![DeviceRecord {
        id: 0,
        name: "Den".to_string(),
        device_id: None,
        frequency: 100.0,
        current_mode: SourceMode::None,
        current_id: -1,
        current_dimension: BTreeMap::new(),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_free_id_fills_gaps() {
        assert_eq!(first_free_id([]), 0);
        assert_eq!(first_free_id([0, 1, 2]), 3);
        assert_eq!(first_free_id([1, 2]), 0);
        assert_eq!(first_free_id([0, 2, 3]), 1);
    }

    #[test]
    fn dimension_cycles_through_axes() {
        assert_eq!(Dimension::Length.next(), Dimension::Width);
        assert_eq!(Dimension::Width.next(), Dimension::Height);
        assert_eq!(Dimension::Height.next(), Dimension::Length);
        assert_eq!(Dimension::Height.axis_name(), "height");
    }

    #[test]
    fn frequency_band_is_inclusive() {
        assert!(frequency_in_band(100.0));
        assert!(frequency_in_band(140.0));
        assert!(frequency_in_band(132.7));
        assert!(!frequency_in_band(99.9));
        assert!(!frequency_in_band(140.1));
    }

    #[test]
    fn frequencies_round_to_one_decimal() {
        assert_eq!(round_frequency(132.6499), 132.6);
        assert_eq!(round_frequency(132.65), 132.7);
        assert_eq!(round_frequency(100.0), 100.0);
    }

    #[test]
    fn device_record_serializes_with_stored_field_names() {
        let record = DeviceRecord::paired(
            1,
            DeviceId::new("AA:BB:CC"),
            "XIAO-BLE-SECURE",
            &default_rooms(),
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 1,
                "name": "XIAO-BLE-SECURE",
                "deviceId": "AA:BB:CC",
                "frequency": 100.0,
                "currentMode": -1,
                "currentId": -1,
                "currentDimension": { "0": 0, "1": 0, "2": 0 },
            })
        );
    }

    #[test]
    fn legacy_device_record_without_device_id_loads() {
        let raw = r#"{"id":0,"currentId":-1,"currentMode":-1,"name":"Den","frequency":100}"#;
        let record: DeviceRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.name, "Den");
        assert_eq!(record.device_id, None);
        assert_eq!(record.current_mode, SourceMode::None);
        assert!(record.current_dimension.is_empty());
    }

    #[test]
    fn room_record_round_trips_axis_arrays() {
        let raw = r#"{"name":"Home Studio","length":[2.5,125.4],"width":[3.5,104.2],"height":[2,116.7],"id":0}"#;
        let room: RoomRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(room.length.metres(), 2.5);
        assert_eq!(room.length.hz(), 125.4);
        assert_eq!(room.span(Dimension::Height).hz(), 116.7);

        let value = serde_json::to_value(&room).unwrap();
        assert_eq!(value["width"], json!([3.5, 104.2]));
    }

    #[test]
    fn resolve_frequency_follows_active_source() {
        let presets = default_presets();
        let rooms = default_rooms();
        let mut record = DeviceRecord::paired(0, DeviceId::new("id"), "Pod", &rooms);

        assert_eq!(record.resolve_frequency(&presets, &rooms), None);

        record.current_mode = SourceMode::Preset;
        record.current_id = 1;
        assert_eq!(record.resolve_frequency(&presets, &rooms), Some(128.3));

        record.current_mode = SourceMode::Room;
        record.current_id = 2;
        record.current_dimension.insert(2, Dimension::Width);
        assert_eq!(record.resolve_frequency(&presets, &rooms), Some(103.9));

        record.current_id = -1;
        assert_eq!(record.resolve_frequency(&presets, &rooms), None);
    }

    #[test]
    fn source_mode_uses_stored_integer_values() {
        assert_eq!(serde_json::to_value(SourceMode::None).unwrap(), json!(-1));
        assert_eq!(serde_json::to_value(SourceMode::Preset).unwrap(), json!(0));
        assert_eq!(serde_json::to_value(SourceMode::Room).unwrap(), json!(1));
        let mode: SourceMode = serde_json::from_value(json!(1)).unwrap();
        assert_eq!(mode, SourceMode::Room);
        assert!(serde_json::from_value::<SourceMode>(json!(7)).is_err());
    }

    #[test]
    fn factory_seeds_keep_their_ids() {
        let presets = default_presets();
        assert_eq!(presets.len(), 3);
        assert_eq!(presets[0].frequency, 132.7);
        assert_eq!(first_free_id(presets.iter().map(|p| p.id)), 3);

        let rooms = default_rooms();
        assert_eq!(rooms[1].name, "Recording Studio");
        assert_eq!(rooms[2].span(Dimension::Length).metres(), 1.5);
    }
}
