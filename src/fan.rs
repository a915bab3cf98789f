use crate::device::Device;
use crate::error::Result;
use crate::types::{AutoComfort, Direction};

/// Lowest and highest cooling setpoint accepted, in °C
pub const COOL_TEMP_MIN: f64 = 10.0;
pub const COOL_TEMP_MAX: f64 = 31.5;

/// Fan-only properties of a [`Device`]
#[derive(Debug, Clone, Copy)]
pub struct Fan<'a> {
    device: &'a Device,
}

impl<'a> Fan<'a> {
    pub(crate) fn new(device: &'a Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &'a Device {
        self.device
    }

    /// Fan is spinning at any speed
    pub fn on(&self) -> Option<bool> {
        self.device.get_on("FAN;PWR")
    }

    pub fn set_on(&self, on: bool) -> Result<()> {
        self.device.set_on_off("FAN;PWR", on)
    }

    pub fn speed(&self) -> Option<u8> {
        self.device.get_parsed("FAN;SPD;ACTUAL")
    }

    /// Set speed, clamped to the fan's maximum when it is known
    pub fn set_speed(&self, speed: u8) -> Result<()> {
        let speed = match self.speed_max() {
            Some(max) => speed.min(max),
            None => speed,
        };
        self.device.set_value("FAN;SPD", speed)
    }

    pub fn speed_min(&self) -> Option<u8> {
        self.device.get_parsed("FAN;SPD;MIN")
    }

    pub fn speed_max(&self) -> Option<u8> {
        self.device.get_parsed("FAN;SPD;MAX")
    }

    /// Min/max speed the room allows
    pub fn speed_limits_room(&self) -> Option<(u8, u8)> {
        self.device.get_pair("FAN;BOOKENDS")
    }

    pub fn set_speed_limits_room(&self, min: u8, max: u8) -> Result<()> {
        self.device.set_bookends("FAN;BOOKENDS", min, max)
    }

    pub fn direction(&self) -> Option<Direction> {
        self.device.get_parsed("FAN;DIR")
    }

    pub fn set_direction(&self, direction: Direction) -> Result<()> {
        self.device.set_value("FAN;DIR", direction.as_str())
    }

    /// Whoosh mode, which varies speed to simulate a natural breeze
    pub fn whoosh(&self) -> Option<bool> {
        self.device.get_on("FAN;WHOOSH;STATUS")
    }

    pub fn set_whoosh(&self, on: bool) -> Result<()> {
        self.device.set_on_off("FAN;WHOOSH", on)
    }

    /// Configured auto comfort mode
    pub fn auto_comfort(&self) -> Option<AutoComfort> {
        self.device.get_parsed("SMARTMODE;STATE")
    }

    pub fn set_auto_comfort(&self, mode: AutoComfort) -> Result<()> {
        self.device.set_value("SMARTMODE;STATE", mode.as_str())
    }

    /// Mode auto comfort is currently acting in
    pub fn smart_mode(&self) -> Option<AutoComfort> {
        self.device.get_parsed("SMARTMODE;ACTUAL")
    }

    /// Cooling setpoint in °C
    pub fn cool_temp(&self) -> Option<f64> {
        self.device
            .get_parsed::<i64>("LEARN;ZEROTEMP")
            .map(|hundredths| hundredths as f64 / 100.0)
    }

    /// Set the cooling setpoint, clamped to 10..=31.5 °C
    pub fn set_cool_temp(&self, celsius: f64) -> Result<()> {
        let celsius = celsius.clamp(COOL_TEMP_MIN, COOL_TEMP_MAX);
        let hundredths = (celsius * 100.0).round_ties_even() as i64;
        self.device.set_value("LEARN;ZEROTEMP", hundredths)
    }

    /// Occupancy switches the fan on and off
    pub fn motion_fan_auto(&self) -> Option<bool> {
        self.device.get_on("FAN;AUTO")
    }

    pub fn set_motion_fan_auto(&self, on: bool) -> Result<()> {
        self.device.set_on_off("FAN;AUTO", on)
    }

    /// Occupancy switches the light on and off
    pub fn motion_light_auto(&self) -> Option<bool> {
        self.device.get_on("LIGHT;AUTO")
    }

    pub fn set_motion_light_auto(&self, on: bool) -> Result<()> {
        self.device.set_on_off("LIGHT;AUTO", on)
    }

    pub fn sleep_mode(&self) -> Option<bool> {
        self.device.get_on("SLEEP;STATE")
    }

    pub fn set_sleep_mode(&self, on: bool) -> Result<()> {
        self.device.set_on_off("SLEEP;STATE", on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{capture, device, seed};

    #[test]
    fn test_fan_getters() {
        let device = device("FAN,HAIKU,HSERIES");
        let fan = device.as_fan().unwrap();
        assert_eq!(fan.speed(), None);

        seed(&device, "FAN;PWR", "ON");
        seed(&device, "FAN;SPD;ACTUAL", "4");
        seed(&device, "FAN;BOOKENDS", "1;7");
        seed(&device, "FAN;DIR", "REV");
        seed(&device, "SMARTMODE;STATE", "FOLLOWTSTAT");
        seed(&device, "SMARTMODE;ACTUAL", "COOLING");
        seed(&device, "LEARN;ZEROTEMP", "2350");
        seed(&device, "FAN;WHOOSH;STATUS", "OFF");

        assert_eq!(fan.on(), Some(true));
        assert_eq!(fan.speed(), Some(4));
        assert_eq!(fan.speed_limits_room(), Some((1, 7)));
        assert_eq!(fan.direction(), Some(Direction::Reverse));
        assert_eq!(fan.auto_comfort(), Some(AutoComfort::FollowThermostat));
        assert_eq!(fan.smart_mode(), Some(AutoComfort::Cooling));
        assert_eq!(fan.cool_temp(), Some(23.5));
        assert_eq!(fan.whoosh(), Some(false));
    }

    #[test]
    fn test_fan_setters() {
        let device = device("FAN,HAIKU,HSERIES");
        seed(&device, "FAN;SPD;MAX", "7");
        let mut sent = capture(&device);
        let fan = device.as_fan().unwrap();

        fan.set_speed(12).unwrap();
        fan.set_direction(Direction::Forward).unwrap();
        fan.set_cool_temp(40.0).unwrap();
        fan.set_cool_temp(22.226).unwrap();
        fan.set_auto_comfort(AutoComfort::Heating).unwrap();
        fan.set_motion_fan_auto(true).unwrap();
        fan.set_motion_light_auto(false).unwrap();
        fan.set_sleep_mode(true).unwrap();
        assert!(fan.set_speed_limits_room(4, 4).is_err());

        let expected = [
            "<Bedroom Fan;FAN;SPD;SET;7>",
            "<Bedroom Fan;FAN;DIR;SET;FWD>",
            "<Bedroom Fan;LEARN;ZEROTEMP;SET;3150>",
            "<Bedroom Fan;LEARN;ZEROTEMP;SET;2223>",
            "<Bedroom Fan;SMARTMODE;STATE;SET;HEATING>",
            "<Bedroom Fan;FAN;AUTO;ON>",
            "<Bedroom Fan;LIGHT;AUTO;OFF>",
            "<Bedroom Fan;SLEEP;STATE;ON>",
        ];
        for command in expected {
            assert_eq!(sent.try_recv().unwrap(), command);
        }
        assert!(sent.try_recv().is_err());
    }
}
