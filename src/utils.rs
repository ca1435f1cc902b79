//! Low-level byte I/O primitives shared by the marshal codec.
//!
//! Each function reads or writes exactly the bytes it promises, or returns
//! an error - there is no partial-read/write ambiguity.

use std::io::{Read, Write};

use crate::{Error, Result};

/// Read one byte.
#[inline]
pub(crate) fn u8<R: Read + ?Sized>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b).map_err(|_| Error::TruncatedStream)?;
    Ok(b[0])
}

/// Read a little-endian `u32`.
#[inline]
pub(crate) fn le_u32<R: Read + ?Sized>(r: &mut R) -> Result<u32> {
    Ok(u32::from_le_bytes(bytesa::<4, R>(r)?))
}

/// Read exactly `N` bytes into a fixed-size array.
#[inline]
pub(crate) fn bytesa<const N: usize, R: Read + ?Sized>(r: &mut R) -> Result<[u8; N]> {
    let mut b = [0u8; N];
    r.read_exact(&mut b).map_err(|_| Error::TruncatedStream)?;
    Ok(b)
}

/// Read exactly `len` bytes into a `Vec`.
#[inline]
pub(crate) fn bytesv<R: Read + ?Sized>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut b = vec![0u8; len];
    r.read_exact(&mut b).map_err(|_| Error::TruncatedStream)?;
    Ok(b)
}

/// Write one byte.
#[inline]
pub(crate) fn w_u8<W: Write + ?Sized>(w: &mut W, v: u8) -> Result<()> {
    w.write_all(&[v])?;
    Ok(())
}

/// Write a little-endian `u16`.
#[inline]
pub(crate) fn w_le_u16<W: Write + ?Sized>(w: &mut W, v: u16) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

/// Write a little-endian `u32`.
#[inline]
pub(crate) fn w_le_u32<W: Write + ?Sized>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}
