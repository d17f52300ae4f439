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

    controlport.rs

    The two game ports. Mouse movement accumulates into the JOYxDAT
    counters; joystick switch closures are encoded into the counter bits
    the way the hardware wires them. Buttons surface on CIA-A port A and
    on the POT lines.

*/

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PortDevice {
    #[default]
    None,
    Mouse,
    Joystick,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct JoystickState {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub fire: bool,
}

#[derive(Default)]
pub struct ControlPort {
    /// 1 or 2. Decides which CIA-A and POTGO bits the buttons drive.
    nr: u8,
    pub device: PortDevice,

    mouse_counter_x: u8,
    mouse_counter_y: u8,
    mouse_left: bool,
    mouse_right: bool,

    joystick: JoystickState,
}

impl ControlPort {
    pub fn new(nr: u8) -> Self {
        debug_assert!(nr == 1 || nr == 2);
        Self {
            nr,
            ..Default::default()
        }
    }

    pub fn connect_device(&mut self, device: PortDevice) {
        self.device = device;
    }

    /// Host input: relative mouse movement plus button state.
    pub fn mouse_event(&mut self, dx: i8, dy: i8, left: bool, right: bool) {
        self.mouse_counter_x = self.mouse_counter_x.wrapping_add(dx as u8);
        self.mouse_counter_y = self.mouse_counter_y.wrapping_add(dy as u8);
        self.mouse_left = left;
        self.mouse_right = right;
    }

    /// Host input: joystick switch state.
    pub fn joystick_event(&mut self, state: JoystickState) {
        self.joystick = state;
    }

    pub fn joydat(&self) -> u16 {
        match self.device {
            PortDevice::None => 0,
            PortDevice::Mouse => {
                ((self.mouse_counter_y as u16) << 8) | self.mouse_counter_x as u16
            }
            PortDevice::Joystick => {
                /* Switch closures map onto the quadrature counter bits:
                 * right = X1, left = Y1, down = X0 ^ X1, up = Y0 ^ Y1.
                 */
                let x1 = self.joystick.right as u16;
                let y1 = self.joystick.left as u16;
                let x0 = (self.joystick.down as u16) ^ x1;
                let y0 = (self.joystick.up as u16) ^ y1;
                (y1 << 9) | (y0 << 8) | (x1 << 1) | x0
            }
        }
    }

    /// JOYTEST presets the upper six bits of both counters.
    pub fn poke_joytest(&mut self, value: u16) {
        self.mouse_counter_y = (self.mouse_counter_y & 0b0000_0011) | ((value >> 8) as u8 & 0b1111_1100);
        self.mouse_counter_x = (self.mouse_counter_x & 0b0000_0011) | (value as u8 & 0b1111_1100);
    }

    /// Contribution of this port to CIA-A port A (fire buttons are active
    /// low on bits 6 and 7).
    pub fn ciapa(&self) -> u8 {
        let pressed = match self.device {
            PortDevice::None => false,
            PortDevice::Mouse => self.mouse_left,
            PortDevice::Joystick => self.joystick.fire,
        };
        if pressed {
            if self.nr == 1 {
                0xBF
            } else {
                0x7F
            }
        } else {
            0xFF
        }
    }

    /// Contribution to POTGOR (right mouse button pulls the POT line low).
    pub fn potgor(&self) -> u16 {
        if self.device == PortDevice::Mouse && self.mouse_right {
            if self.nr == 1 {
                0xFBFF
            } else {
                0xBFFF
            }
        } else {
            0xFFFF
        }
    }
}
