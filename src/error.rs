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

    error.rs

    Defines the error enums used across the core.

*/

use core::fmt::Display;
use std::error::Error;

#[derive(Debug)]
pub enum ConfigError {
    InvalidChipRamSize(usize),
    InvalidSlowRamSize(usize),
    InvalidFastRamSize(usize),
    InvalidExtRomBase(u8),
    InvalidDriveSlot(usize),
}

impl Error for ConfigError {}
impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ConfigError::InvalidChipRamSize(kb) => {
                write!(f, "Unsupported Chip Ram size: {} KB", kb)
            }
            ConfigError::InvalidSlowRamSize(kb) => {
                write!(f, "Unsupported Slow Ram size: {} KB", kb)
            }
            ConfigError::InvalidFastRamSize(kb) => {
                write!(f, "Unsupported Fast Ram size: {} KB", kb)
            }
            ConfigError::InvalidExtRomBase(page) => {
                write!(f, "Extended Rom base page must be $E0 or $F0, got ${:02X}", page)
            }
            ConfigError::InvalidDriveSlot(slot) => {
                write!(f, "Drive slot out of range: {}", slot)
            }
        }
    }
}

#[derive(Debug)]
pub enum MemError {
    RomMissing,
    RomOversized,
    AllocationFailed,
    AddressViolation(u32),
}

impl Error for MemError {}
impl Display for MemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            MemError::RomMissing => write!(f, "No Rom image is installed."),
            MemError::RomOversized => write!(f, "The Rom image exceeds the supported size."),
            MemError::AllocationFailed => write!(f, "A memory bank could not be allocated."),
            MemError::AddressViolation(addr) => {
                write!(f, "Word access to odd address ${:06X}.", addr)
            }
        }
    }
}

#[derive(Debug)]
pub enum SnapshotError {
    BadMagic,
    VersionMismatch { major: u8, minor: u8 },
    Truncated,
}

impl Error for SnapshotError {}
impl Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            SnapshotError::BadMagic => write!(f, "The buffer is not a snapshot."),
            SnapshotError::VersionMismatch { major, minor } => {
                write!(f, "Incompatible snapshot version {}.{}.", major, minor)
            }
            SnapshotError::Truncated => write!(f, "The snapshot buffer is truncated."),
        }
    }
}
