//! The diagnostic dump walks every zone and prints the allocated
//! chunks to standard output.  The host program may be running its
//! own I/O on top of this allocator, so nothing here may allocate:
//! lines are rendered into stack buffers and pushed through the raw
//! `write(2)` wrapper, never a formatting library.
use std::ffi::c_void;

use crate::chunk;
use crate::class::SizeClass;
use crate::manager;
use crate::manager::Manager;
use crate::zone::Zone;
use crate::zone::MAX_CHUNK_WALK;

/// Enough for two 16-digit addresses plus the fixed punctuation.
const LINE_BUF: usize = 96;

/// Writes `bytes` to standard output, riding out short writes.
fn put(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let written =
            unsafe { libc::write(1, bytes.as_ptr() as *const c_void, bytes.len()) };

        if written <= 0 {
            return;
        }

        bytes = &bytes[written as usize..];
    }
}

/// Renders `value` in uppercase hex, no leading zeros, into the tail
/// of `buf`; returns the used suffix.
fn format_hex(value: usize, buf: &mut [u8; 16]) -> &[u8] {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";

    if value == 0 {
        buf[15] = b'0';
        return &buf[15..];
    }

    let mut v = value;
    let mut pos = 16;

    while v > 0 {
        pos -= 1;
        buf[pos] = DIGITS[v % 16];
        v /= 16;
    }

    &buf[pos..]
}

/// Renders `value` in decimal into the tail of `buf`; returns the
/// used suffix.
fn format_dec(value: usize, buf: &mut [u8; 20]) -> &[u8] {
    if value == 0 {
        buf[19] = b'0';
        return &buf[19..];
    }

    let mut v = value;
    let mut pos = 20;

    while v > 0 {
        pos -= 1;
        buf[pos] = b'0' + (v % 10) as u8;
        v /= 10;
    }

    &buf[pos..]
}

fn append(line: &mut [u8], mut pos: usize, piece: &[u8]) -> usize {
    for byte in piece.iter().copied() {
        if pos >= line.len() {
            break;
        }
        line[pos] = byte;
        pos += 1;
    }

    pos
}

/// Renders `"<label> : 0x<HEX>\n"`.
fn render_zone_line<'a>(line: &'a mut [u8; LINE_BUF], label: &str, addr: usize) -> &'a [u8] {
    let mut scratch = [0u8; 16];
    let mut pos = 0;

    pos = append(line, pos, label.as_bytes());
    pos = append(line, pos, b" : 0x");
    pos = append(line, pos, format_hex(addr, &mut scratch));
    pos = append(line, pos, b"\n");

    &line[..pos]
}

/// Renders `"0x<HEX> - 0x<HEX> : <dec> bytes\n"`.
fn render_chunk_line<'a>(
    line: &'a mut [u8; LINE_BUF],
    start: usize,
    end: usize,
    size: usize,
) -> &'a [u8] {
    let mut scratch = [0u8; 16];
    let mut decimal = [0u8; 20];
    let mut pos = 0;

    pos = append(line, pos, b"0x");
    pos = append(line, pos, format_hex(start, &mut scratch));
    pos = append(line, pos, b" - 0x");
    pos = append(line, pos, format_hex(end, &mut scratch));
    pos = append(line, pos, b" : ");
    pos = append(line, pos, format_dec(size, &mut decimal));
    pos = append(line, pos, b" bytes\n");

    &line[..pos]
}

/// Renders `"Total : <dec> bytes\n"`.
fn render_total_line<'a>(line: &'a mut [u8; LINE_BUF], total: usize) -> &'a [u8] {
    let mut decimal = [0u8; 20];
    let mut pos = 0;

    pos = append(line, pos, b"Total : ");
    pos = append(line, pos, format_dec(total, &mut decimal));
    pos = append(line, pos, b" bytes\n");

    &line[..pos]
}

/// Returns true iff the zone holds at least one allocated chunk.
/// Zones without one are skipped entirely by the dump.
unsafe fn has_allocated_chunk(zone: *const Zone) -> bool {
    let mut cur = (*zone).first;
    let mut steps = 0;

    while !cur.is_null() && steps < MAX_CHUNK_WALK {
        if (*cur).is_allocated() {
            return true;
        }

        cur = (*cur).next;
        steps += 1;
    }

    false
}

unsafe fn dump_class(mgr: &Manager, class: SizeClass) -> usize {
    let mut line = [0u8; LINE_BUF];
    let mut class_total = 0;

    let bound = mgr.zone_count(class) as usize + 1;
    let mut zone = mgr.head(class);
    let mut zone_steps = 0;

    while !zone.is_null() && zone_steps <= bound {
        if !Zone::validate(zone) {
            break;
        }

        if has_allocated_chunk(zone) {
            put(render_zone_line(
                &mut line,
                class.label(),
                (*zone).start as usize,
            ));

            let mut cur = (*zone).first;
            let mut steps = 0;

            while !cur.is_null() && steps < MAX_CHUNK_WALK {
                // The full gauntlet, not just the state bit: a dump
                // of a corrupted heap should skip incoherent headers
                // rather than print garbage ranges.
                if chunk::validate(cur) {
                    let user = (*cur).user_ptr() as usize;
                    let size = (*cur).payload_size;

                    put(render_chunk_line(&mut line, user, user + size, size));
                    class_total += size;
                }

                cur = (*cur).next;
                steps += 1;
            }
        }

        zone = (*zone).next;
        zone_steps += 1;
    }

    class_total
}

/// Writes the allocation listing for every class, in TINY, SMALL,
/// LARGE order, followed by the grand total.
pub fn dump() {
    let mgr = manager::lock();
    dump_locked(&mgr);
}

pub(crate) fn dump_locked(mgr: &Manager) {
    let mut total = 0;

    for class in SizeClass::ALL.iter().copied() {
        total += unsafe { dump_class(mgr, class) };
    }

    let mut line = [0u8; LINE_BUF];
    put(render_total_line(&mut line, total));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_formatting() {
        let mut buf = [0u8; 16];

        assert_eq!(format_hex(0, &mut buf), b"0");
        assert_eq!(format_hex(0xA, &mut buf), b"A");
        assert_eq!(format_hex(0xAAAA, &mut buf), b"AAAA");
        assert_eq!(format_hex(0xDEAD_BEEF, &mut buf), b"DEADBEEF");
        assert_eq!(format_hex(usize::MAX, &mut buf), b"FFFFFFFFFFFFFFFF");
    }

    #[test]
    fn dec_formatting() {
        let mut buf = [0u8; 20];

        assert_eq!(format_dec(0, &mut buf), b"0");
        assert_eq!(format_dec(112, &mut buf), b"112");
        assert_eq!(format_dec(425_984, &mut buf), b"425984");
    }

    // The exact byte strings of the wire format.
    #[test]
    fn line_formats() {
        let mut line = [0u8; LINE_BUF];

        assert_eq!(
            render_zone_line(&mut line, "TINY", 0xA000),
            b"TINY : 0xA000\n"
        );
        assert_eq!(
            render_chunk_line(&mut line, 0xAAAA, 0xAAB0, 112),
            b"0xAAAA - 0xAAB0 : 112 bytes\n"
        );
        assert_eq!(render_total_line(&mut line, 112), b"Total : 112 bytes\n");
        assert_eq!(render_total_line(&mut line, 0), b"Total : 0 bytes\n");
    }

    // Exercise the full walk against a private manager; the output
    // goes to stdout, so only the accounting is asserted here.
    #[test]
    fn dump_walks_private_manager() {
        use crate::individual::{allocate_locked, release_locked};
        use crate::manager::Manager;

        let mut mgr = Manager::new();

        unsafe {
            let a = allocate_locked(&mut mgr, 100);
            let b = allocate_locked(&mut mgr, 2000);

            dump_locked(&mgr);

            release_locked(&mut mgr, a);
            release_locked(&mut mgr, b);

            // With nothing allocated, every zone is skipped.
            dump_locked(&mgr);

            mgr.destroy_all();
        }
    }

    #[test]
    fn dump_through_global_entry() {
        // Smoke only: the global manager is shared with other tests.
        dump();
    }
}
