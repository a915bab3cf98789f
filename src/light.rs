use crate::device::Device;
use crate::error::Result;

/// Light-only properties of a [`Device`]
#[derive(Debug, Clone, Copy)]
pub struct Light<'a> {
    device: &'a Device,
}

impl<'a> Light<'a> {
    pub(crate) fn new(device: &'a Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &'a Device {
        self.device
    }

    /// Color temperature in Kelvin
    pub fn color_temp(&self) -> Option<u32> {
        self.device.get_parsed("LIGHT;COLOR;TEMP;VALUE")
    }

    /// Set color temperature, rounded to 100K and clamped to the known range
    pub fn set_color_temp(&self, kelvin: u32) -> Result<()> {
        let mut kelvin = kelvin;
        if let Some(min) = self.color_temp_min() {
            kelvin = kelvin.max(min);
        }
        if let Some(max) = self.color_temp_max() {
            kelvin = kelvin.min(max);
        }
        self.device.set_value("LIGHT;COLOR;TEMP;VALUE", round_to_hundred(kelvin))
    }

    pub fn color_temp_min(&self) -> Option<u32> {
        self.device.get_parsed("LIGHT;COLOR;TEMP;MIN")
    }

    pub fn color_temp_max(&self) -> Option<u32> {
        self.device.get_parsed("LIGHT;COLOR;TEMP;MAX")
    }
}

/// Nearest multiple of 100, ties to the even hundred
fn round_to_hundred(kelvin: u32) -> u32 {
    let (hundreds, rest) = (kelvin / 100, kelvin % 100);
    let up = rest > 50 || (rest == 50 && hundreds % 2 == 1);
    (hundreds + u32::from(up)) * 100
}
