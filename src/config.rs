/*
    Lorraine
    https://github.com/lorraine-emu/lorraine

    Copyright 2022-2025 The Lorraine contributors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    config.rs

    Machine configuration types. A configuration is validated as a whole
    before it is applied; an invalid configuration leaves the machine
    untouched.

*/

use serde_derive::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * 1024;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmigaModel {
    #[default]
    A500,
    A1000,
    A2000,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriveType {
    #[default]
    Dd35,
    Hd35,
    Dd525,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveConfig {
    pub connected: bool,
    pub drive_type: DriveType,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyboardLayout {
    #[default]
    Us,
    De,
    Fr,
    It,
    Es,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterType {
    #[default]
    ButterworthLp,
    None,
}

/// CPU clock multiplier relative to the stock 7.09 MHz part.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuSpeed {
    #[default]
    X1,
    X2,
    X4,
}

impl CpuSpeed {
    /// Color clocks consumed by one CPU bus access at this speed.
    pub fn ccks_per_access(self) -> i64 {
        match self {
            CpuSpeed::X1 => 4,
            CpuSpeed::X2 => 2,
            CpuSpeed::X4 => 1,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlitterAccuracy {
    /// The blit is carried out in one chunk when BLTSIZE is written; bus
    /// cycles are consumed afterwards without touching memory.
    Fast,
    /// The micro-programmed Blitter operates memory one bus slot at a time.
    #[default]
    Accurate,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerialDevice {
    #[default]
    None,
    Loopback,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeniseRevision {
    /// OCS Denise 8362R8.
    #[default]
    Ocs,
    /// ECS Denise 8373. Only the DENISEID readback differs in this core.
    Ecs,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AmigaConfig {
    pub model: AmigaModel,
    pub chip_ram: usize,
    pub slow_ram: usize,
    pub fast_ram: usize,
    pub real_time_clock: bool,
    pub drives: [DriveConfig; 4],
    pub keyboard_layout: KeyboardLayout,
    pub filter_type: FilterType,
    pub cpu_speed: CpuSpeed,
    pub blitter_accuracy: BlitterAccuracy,
    pub disk_fifo_buffering: bool,
    pub serial_device: SerialDevice,
    pub denise_revision: DeniseRevision,
    pub emulate_sprites: bool,
    pub clx_spr_spr: bool,
    pub clx_spr_plf: bool,
    pub clx_plf_plf: bool,
    /// Extended Rom base page, $E0 or $F0.
    pub ext_start: u8,
}

impl Default for AmigaConfig {
    fn default() -> Self {
        Self {
            model: AmigaModel::A500,
            chip_ram: 512 * KB,
            slow_ram: 0,
            fast_ram: 0,
            real_time_clock: false,
            drives: [
                DriveConfig {
                    connected: true,
                    drive_type: DriveType::Dd35,
                },
                DriveConfig::default(),
                DriveConfig::default(),
                DriveConfig::default(),
            ],
            keyboard_layout: KeyboardLayout::Us,
            filter_type: FilterType::ButterworthLp,
            cpu_speed: CpuSpeed::X1,
            blitter_accuracy: BlitterAccuracy::Accurate,
            disk_fifo_buffering: true,
            serial_device: SerialDevice::None,
            denise_revision: DeniseRevision::Ocs,
            emulate_sprites: true,
            clx_spr_spr: true,
            clx_spr_plf: true,
            clx_plf_plf: true,
            ext_start: 0xE0,
        }
    }
}

impl AmigaConfig {
    /// Check every enumerated option against its legal value set. The
    /// machine applies a configuration only if this returns Ok.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.chip_ram {
            s if s == 256 * KB || s == 512 * KB => {}
            s => return Err(ConfigError::InvalidChipRamSize(s / KB)),
        }

        match self.slow_ram {
            0 => {}
            s if s == 256 * KB || s == 512 * KB => {}
            s => return Err(ConfigError::InvalidSlowRamSize(s / KB)),
        }

        if self.fast_ram > 8 * MB || self.fast_ram % (64 * KB) != 0 {
            return Err(ConfigError::InvalidFastRamSize(self.fast_ram / KB));
        }

        if self.ext_start != 0xE0 && self.ext_start != 0xF0 {
            return Err(ConfigError::InvalidExtRomBase(self.ext_start));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(AmigaConfig::default().validate().is_ok());
    }

    #[test]
    fn odd_ram_sizes_are_rejected() {
        let mut config = AmigaConfig::default();

        config.chip_ram = 384 * KB;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidChipRamSize(384))
        ));

        config.chip_ram = 512 * KB;
        config.slow_ram = 128 * KB;
        assert!(config.validate().is_err());

        config.slow_ram = 0;
        config.fast_ram = 8 * MB + 64 * KB;
        assert!(config.validate().is_err());

        config.fast_ram = 96 * KB;
        assert!(config.validate().is_err());

        config.fast_ram = 128 * KB;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ext_base_must_be_e0_or_f0() {
        let mut config = AmigaConfig::default();
        config.ext_start = 0xF0;
        assert!(config.validate().is_ok());
        config.ext_start = 0xE8;
        assert!(config.validate().is_err());
    }
}
