//! Accessory categories advertised in the `ci` TXT field and the setup code.

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// HomeKit accessory category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Category {
    Other = 1,
    Bridge = 2,
    Fan = 3,
    GarageDoorOpener = 4,
    Lightbulb = 5,
    DoorLock = 6,
    Outlet = 7,
    Switch = 8,
    Thermostat = 9,
    Sensor = 10,
    SecuritySystem = 11,
    Door = 12,
    Window = 13,
    WindowCovering = 14,
    ProgrammableSwitch = 15,
    RangeExtender = 16,
    IpCamera = 17,
    VideoDoorbell = 18,
    AirPurifier = 19,
    AirHeater = 20,
    AirConditioner = 21,
    AirHumidifier = 22,
    AirDehumidifier = 23,
    AppleTv = 24,
    Homepod = 25,
    Speaker = 26,
    Airport = 27,
    Sprinkler = 28,
    Faucet = 29,
    ShowerHead = 30,
    Television = 31,
    TargetController = 32,
    Router = 33,
    AudioReceiver = 34,
    TvSetTopBox = 35,
    TvStreamingStick = 36,
}

impl Category {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        use Category::*;
        const ALL: [Category; 36] = [
            Other,
            Bridge,
            Fan,
            GarageDoorOpener,
            Lightbulb,
            DoorLock,
            Outlet,
            Switch,
            Thermostat,
            Sensor,
            SecuritySystem,
            Door,
            Window,
            WindowCovering,
            ProgrammableSwitch,
            RangeExtender,
            IpCamera,
            VideoDoorbell,
            AirPurifier,
            AirHeater,
            AirConditioner,
            AirHumidifier,
            AirDehumidifier,
            AppleTv,
            Homepod,
            Speaker,
            Airport,
            Sprinkler,
            Faucet,
            ShowerHead,
            Television,
            TargetController,
            Router,
            AudioReceiver,
            TvSetTopBox,
            TvStreamingStick,
        ];
        ALL.iter().copied().find(|c| c.as_u8() == value)
    }
}

impl From<Category> for u8 {
    fn from(category: Category) -> u8 {
        category.as_u8()
    }
}

impl TryFrom<u8> for Category {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value)
            .ok_or_else(|| ParseError::InvalidValue(format!("unknown category {}", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_u8_covers_every_variant() {
        for value in 1..=36u8 {
            let category = Category::from_u8(value).unwrap();
            assert_eq!(category.as_u8(), value);
        }
        assert_eq!(Category::from_u8(0), None);
        assert_eq!(Category::from_u8(37), None);
    }

    #[test]
    fn serializes_as_number() {
        let json = serde_json::to_string(&Category::Lightbulb).unwrap();
        assert_eq!(json, "5");
        let back: Category = serde_json::from_str("2").unwrap();
        assert_eq!(back, Category::Bridge);
        assert!(serde_json::from_str::<Category>("99").is_err());
    }
}
