use rppal::gpio::{Gpio, OutputPin};
use tracing::info;

use super::IndicatorPin;

/// LED (or any active-high output) on a BCM-numbered Raspberry Pi pin
pub struct GpioIndicator {
    pin: OutputPin,
}

impl GpioIndicator {
    pub fn new(bcm_pin: u8) -> Result<Self, rppal::gpio::Error> {
        let pin = Gpio::new()?.get(bcm_pin)?.into_output_low();
        info!(bcm_pin, "GPIO indicator initialised");
        Ok(Self { pin })
    }
}

impl IndicatorPin for GpioIndicator {
    fn set_on(&mut self) {
        self.pin.set_high();
    }

    fn set_off(&mut self) {
        self.pin.set_low();
    }
}
