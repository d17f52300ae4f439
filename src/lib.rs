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

    lib.rs

    Main emulator core

*/

#![allow(dead_code)]

pub mod agnus;
pub mod amiga;
pub mod bus;
pub mod cia;
pub mod config;
pub mod controlport;
pub mod cpu;
pub mod denise;
pub mod error;
pub mod messages;
pub mod paula;
pub mod snapshot;

pub use amiga::Amiga;
pub use config::AmigaConfig;
pub use messages::Msg;

/// One color clock (CCK) is the fundamental time unit of the core. A DMA
/// slot spans two color clocks (one horizontal position), and a CPU bus
/// access spans four.
pub type Cycle = i64;

/// Color clocks per horizontal position.
pub const CCKS_PER_HPOS: Cycle = 2;

#[inline]
pub const fn dma_cycles(hpos: i64) -> Cycle {
    hpos * CCKS_PER_HPOS
}

/// Horizontal positions per PAL scanline.
pub const HPOS_CNT: u16 = 227;

/// Scanlines in a PAL long frame. Short frames have one line less.
pub const VPOS_CNT: u16 = 313;

/// Pixel buffer entries per scanline. Denise synthesizes four buffer
/// entries per color clock (two lores pixels or four hires pixels), so the
/// drawable region ends at 4 * 227 = 908; the remainder is border padding.
pub const HPIXELS: usize = 1024;

/// Pixel coordinate of the last drawable pixel in a line.
pub const LAST_PIXEL: usize = 4 * HPOS_CNT as usize - 1;
