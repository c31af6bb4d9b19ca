//! Fixed-width integer encode/decode helpers for the on-disk record and
//! checkpoint formats.
//!
//! Host-endian integer packing is a latent cross-architecture bug: a
//! checkpoint or segment written on one architecture can't be read
//! correctly on another. This format fixes little-endian as its one
//! canonical on-disk byte order instead.

use byteorder::{ByteOrder, LittleEndian};

type E = LittleEndian;

pub fn read_u16(buf: &[u8]) -> u16 {
    E::read_u16(buf)
}

pub fn read_u32(buf: &[u8]) -> u32 {
    E::read_u32(buf)
}

pub fn read_u64(buf: &[u8]) -> u64 {
    E::read_u64(buf)
}

pub fn write_u16(buf: &mut [u8], v: u16) {
    E::write_u16(buf, v)
}

pub fn write_u32(buf: &mut [u8], v: u32) {
    E::write_u32(buf, v)
}

pub fn write_u64(buf: &mut [u8], v: u64) {
    E::write_u64(buf, v)
}
