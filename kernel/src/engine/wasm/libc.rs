//! C string and memory routines the engine module imports from `env`.
//!
//! Each routine works on the module's linear memory as a flat byte slice.
//! Addresses are unsigned 32-bit offsets; anything that would step outside
//! the slice traps instead of wrapping.

use thiserror::Error;
use wasmtime::{Caller, Extern, Linker};

use super::host::HostState;

/// An access outside linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("out-of-bounds access of {len} bytes at {addr:#x}")]
pub struct MemoryFault {
    addr: usize,
    len: usize,
}

#[allow(clippy::cast_sign_loss)]
fn addr(raw: i32) -> usize {
    raw as u32 as usize
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn ptr(addr: usize) -> i32 {
    addr as u32 as i32
}

fn span(mem: &[u8], addr: usize, len: usize) -> Result<std::ops::Range<usize>, MemoryFault> {
    let end = addr.checked_add(len).ok_or(MemoryFault { addr, len })?;
    if end > mem.len() {
        return Err(MemoryFault { addr, len });
    }
    Ok(addr..end)
}

/// Length of the NUL-terminated string at `s`.
pub fn strlen(mem: &[u8], s: usize) -> Result<usize, MemoryFault> {
    let tail = mem.get(s..).ok_or(MemoryFault { addr: s, len: 1 })?;
    tail.iter().position(|&b| b == 0).ok_or(MemoryFault {
        addr: s,
        len: tail.len() + 1,
    })
}

/// Copies `n` bytes from `src` to `dst`. Overlap is handled like `memmove`.
pub fn memmove(mem: &mut [u8], dst: usize, src: usize, n: usize) -> Result<(), MemoryFault> {
    let from = span(mem, src, n)?;
    span(mem, dst, n)?;
    mem.copy_within(from, dst);
    Ok(())
}

/// Fills `n` bytes at `s` with the low byte of `c`.
pub fn memset(mem: &mut [u8], s: usize, c: i32, n: usize) -> Result<(), MemoryFault> {
    let range = span(mem, s, n)?;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    mem[range].fill(c as u8);
    Ok(())
}

/// Compares at most `limit` bytes of two NUL-terminated strings as
/// unsigned bytes.
pub fn strncmp(mem: &[u8], a: usize, b: usize, limit: usize) -> Result<i32, MemoryFault> {
    for i in 0..limit {
        let x = *mem.get(a + i).ok_or(MemoryFault { addr: a + i, len: 1 })?;
        let y = *mem.get(b + i).ok_or(MemoryFault { addr: b + i, len: 1 })?;
        if x != y {
            return Ok(i32::from(x) - i32::from(y));
        }
        if x == 0 {
            break;
        }
    }
    Ok(0)
}

/// Compares two NUL-terminated strings as unsigned bytes.
pub fn strcmp(mem: &[u8], a: usize, b: usize) -> Result<i32, MemoryFault> {
    strncmp(mem, a, b, usize::MAX)
}

/// Copies the string at `src`, terminator included, to `dst`.
pub fn strcpy(mem: &mut [u8], dst: usize, src: usize) -> Result<(), MemoryFault> {
    let len = strlen(mem, src)?;
    memmove(mem, dst, src, len + 1)
}

/// Appends the string at `src` to the string at `dst`.
pub fn strcat(mem: &mut [u8], dst: usize, src: usize) -> Result<(), MemoryFault> {
    let end = dst + strlen(mem, dst)?;
    strcpy(mem, end, src)
}

/// Address of the first `c` in the string at `s`. Searching for NUL finds
/// the terminator.
pub fn strchr(mem: &[u8], s: usize, c: i32) -> Result<Option<usize>, MemoryFault> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let needle = c as u8;
    let len = strlen(mem, s)?;
    Ok(mem[s..=s + len]
        .iter()
        .position(|&b| b == needle)
        .map(|i| s + i))
}

fn with_memory<R>(
    caller: &mut Caller<'_, HostState>,
    f: impl FnOnce(&mut [u8]) -> Result<R, MemoryFault>,
) -> wasmtime::Result<R> {
    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("engine module does not export its memory"))?;
    f(memory.data_mut(caller)).map_err(wasmtime::Error::new)
}

pub(super) fn add_to_linker(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap("env", "strlen", |mut caller: Caller<'_, HostState>, s: i32| {
        with_memory(&mut caller, |mem| strlen(mem, addr(s)).map(ptr))
    })?;
    linker.func_wrap(
        "env",
        "memcpy",
        |mut caller: Caller<'_, HostState>, dst: i32, src: i32, n: i32| -> wasmtime::Result<i32> {
            with_memory(&mut caller, |mem| memmove(mem, addr(dst), addr(src), addr(n)))?;
            Ok(dst)
        },
    )?;
    linker.func_wrap(
        "env",
        "memmove",
        |mut caller: Caller<'_, HostState>, dst: i32, src: i32, n: i32| -> wasmtime::Result<i32> {
            with_memory(&mut caller, |mem| memmove(mem, addr(dst), addr(src), addr(n)))?;
            Ok(dst)
        },
    )?;
    linker.func_wrap(
        "env",
        "memset",
        |mut caller: Caller<'_, HostState>, s: i32, c: i32, n: i32| -> wasmtime::Result<i32> {
            with_memory(&mut caller, |mem| memset(mem, addr(s), c, addr(n)))?;
            Ok(s)
        },
    )?;
    linker.func_wrap("env", "strcmp", |mut caller: Caller<'_, HostState>, a: i32, b: i32| {
        with_memory(&mut caller, |mem| strcmp(mem, addr(a), addr(b)))
    })?;
    linker.func_wrap(
        "env",
        "strncmp",
        |mut caller: Caller<'_, HostState>, a: i32, b: i32, n: i32| {
            with_memory(&mut caller, |mem| strncmp(mem, addr(a), addr(b), addr(n)))
        },
    )?;
    linker.func_wrap("env", "strcpy", |mut caller: Caller<'_, HostState>, dst: i32, src: i32| -> wasmtime::Result<i32> {
        with_memory(&mut caller, |mem| strcpy(mem, addr(dst), addr(src)))?;
        Ok(dst)
    })?;
    linker.func_wrap("env", "strcat", |mut caller: Caller<'_, HostState>, dst: i32, src: i32| -> wasmtime::Result<i32> {
        with_memory(&mut caller, |mem| strcat(mem, addr(dst), addr(src)))?;
        Ok(dst)
    })?;
    linker.func_wrap("env", "strchr", |mut caller: Caller<'_, HostState>, s: i32, c: i32| {
        with_memory(&mut caller, |mem| strchr(mem, addr(s), c)).map(|found| found.map_or(0, ptr))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with(strings: &[(usize, &[u8])]) -> Vec<u8> {
        let mut mem = vec![0xAA; 64];
        for (at, bytes) in strings {
            mem[*at..*at + bytes.len()].copy_from_slice(bytes);
        }
        mem
    }

    #[test]
    fn strlen_stops_at_terminator() {
        let mem = memory_with(&[(4, b"hello\0")]);
        assert_eq!(strlen(&mem, 4), Ok(5));
        assert_eq!(strlen(&mem, 9), Ok(0));
    }

    #[test]
    fn strlen_without_terminator_faults() {
        let mem = vec![b'x'; 8];
        assert!(strlen(&mem, 2).is_err());
        assert!(strlen(&mem, 100).is_err());
    }

    #[test]
    fn memmove_handles_overlap() {
        let mut mem = memory_with(&[(0, b"abcdef")]);
        memmove(&mut mem, 2, 0, 4).unwrap();
        assert_eq!(&mem[..6], b"ababcd");
        memmove(&mut mem, 0, 2, 4).unwrap();
        assert_eq!(&mem[..4], b"abcd");
    }

    #[test]
    fn memmove_out_of_bounds_faults() {
        let mut mem = vec![0; 16];
        assert_eq!(
            memmove(&mut mem, 12, 0, 8),
            Err(MemoryFault { addr: 12, len: 8 })
        );
        assert!(memmove(&mut mem, 0, usize::MAX, 2).is_err());
    }

    #[test]
    fn memset_uses_low_byte() {
        let mut mem = vec![0; 8];
        memset(&mut mem, 2, 0x1_41, 3).unwrap();
        assert_eq!(&mem, &[0, 0, b'A', b'A', b'A', 0, 0, 0]);
    }

    #[test]
    fn string_comparisons_are_unsigned() {
        let mem = memory_with(&[(0, b"abc\0"), (8, b"abd\0"), (16, b"ab\xff\0"), (24, b"abc\0")]);
        assert!(strcmp(&mem, 0, 8).unwrap() < 0);
        assert!(strcmp(&mem, 16, 0).unwrap() > 0);
        assert_eq!(strcmp(&mem, 0, 24), Ok(0));
        assert_eq!(strncmp(&mem, 0, 8, 2), Ok(0));
        assert_eq!(strncmp(&mem, 0, 8, 0), Ok(0));
    }

    #[test]
    fn strcpy_and_strcat_keep_terminator() {
        let mut mem = memory_with(&[(0, b"vat\0"), (16, b"visor\0")]);
        strcat(&mut mem, 0, 16).unwrap();
        assert_eq!(&mem[..9], b"vatvisor\0");
        strcpy(&mut mem, 32, 0).unwrap();
        assert_eq!(strlen(&mem, 32), Ok(8));
    }

    #[test]
    fn strchr_finds_byte_or_terminator() {
        let mem = memory_with(&[(10, b"a/b/c\0")]);
        assert_eq!(strchr(&mem, 10, i32::from(b'/')), Ok(Some(11)));
        assert_eq!(strchr(&mem, 10, i32::from(b'z')), Ok(None));
        assert_eq!(strchr(&mem, 10, 0), Ok(Some(15)));
    }
}
