#![forbid(unsafe_code)]

use std::sync::OnceLock;

use log::*;

////////////////////////////////////////////////////////////////////////////////

pub const MAX_BITS: usize = 15;

/// Worst-case decode-table sizes for root widths 9 (lit/len) and 6 (dist),
/// per exhaustive search over all valid code-length sets.
pub const ENOUGH_LENS: usize = 852;
pub const ENOUGH_DISTS: usize = 592;
pub const ENOUGH: usize = ENOUGH_LENS + ENOUGH_DISTS;

/// Root index widths used when building each table kind.
pub const ROOT_CLEN: u32 = 7;
pub const ROOT_LITLEN: u32 = 9;
pub const ROOT_DIST: u32 = 6;

////////////////////////////////////////////////////////////////////////////////

/// One packed decode-table entry.
///
/// `op` encodes the operation:
///   0        literal, `val` is the byte (or the raw symbol for the
///            code-length table)
///   16 | e   length/distance base in `val` with `e` extra bits to read
///   32       end of block
///   64 | b   sub-table link: the next `b` bits index the table at arena
///            offset `val`
///   96       invalid code
///
/// `bits` is how many bits of the code this entry consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry {
    pub op: u8,
    pub bits: u8,
    pub val: u16,
}

pub const OP_LITERAL: u8 = 0;
pub const OP_EXTRA: u8 = 16;
pub const OP_END: u8 = 32;
pub const OP_LINK: u8 = 64;
pub const OP_INVALID: u8 = 96;

const INVALID: Entry = Entry {
    op: OP_INVALID,
    bits: 1,
    val: 0,
};

/// A built table: offset of its root in the arena plus the root index width
/// actually used (reduced from the request when the longest code is shorter).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Table {
    pub offset: usize,
    pub root: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    /// The 19-symbol code that transmits the other two trees' lengths.
    CodeLengths,
    /// Literal/length tree, up to 286 symbols.
    LitLen,
    /// Distance tree, up to 30 symbols (31/32 are reserved, decoded invalid).
    Dist,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableError {
    /// The code lengths describe more codes than a prefix tree can hold.
    Oversubscribed,
    /// The code lengths leave unassigned codes (and this is not the legal
    /// single-symbol distance-tree case).
    Incomplete,
}

////////////////////////////////////////////////////////////////////////////////

// Length bases and extra-bit ops for symbols 257..=285 (RFC 1951 §3.2.5).
// The op values already carry the OP_EXTRA flag.
pub(crate) const LBASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];
pub(crate) const LEXT: [u8; 29] = [
    16, 16, 16, 16, 16, 16, 16, 16, 17, 17, 17, 17, 18, 18, 18, 18, 19, 19, 19, 19, 20, 20, 20,
    20, 21, 21, 21, 21, 16,
];

// Distance bases and extra-bit ops for symbols 0..=29.
pub(crate) const DBASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
pub(crate) const DEXT: [u8; 30] = [
    16, 16, 16, 16, 17, 17, 18, 18, 19, 19, 20, 20, 21, 21, 22, 22, 23, 23, 24, 24, 25, 25, 26,
    26, 27, 27, 28, 28, 29, 29,
];

fn symbol_entry(kind: TableKind, sym: usize) -> (u8, u16) {
    match kind {
        TableKind::CodeLengths => (OP_LITERAL, sym as u16),
        TableKind::LitLen => {
            if sym < 256 {
                (OP_LITERAL, sym as u16)
            } else if sym == 256 {
                (OP_END, 0)
            } else if sym <= 285 {
                (LEXT[sym - 257], LBASE[sym - 257])
            } else {
                (OP_INVALID, 0)
            }
        }
        TableKind::Dist => {
            if sym < 30 {
                (DEXT[sym], DBASE[sym])
            } else {
                (OP_INVALID, 0)
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Build a packed decode table from per-symbol code lengths.
///
/// Canonical Huffman assignment: codes within a length class go to symbols in
/// symbol-index order. The root table is indexed by the next `root` input
/// bits taken LSB-first (the bit-reversed code), with entries replicated for
/// codes shorter than `root` and chained to sub-tables for longer ones. The
/// table is appended to `arena` and referenced by offset only.
pub fn build(
    kind: TableKind,
    lens: &[u16],
    root_request: u32,
    arena: &mut Vec<Entry>,
) -> Result<Table, TableError> {
    let mut count = [0u16; MAX_BITS + 1];
    for &len in lens {
        debug_assert!((len as usize) <= MAX_BITS);
        count[len as usize] += 1;
    }

    let mut max = MAX_BITS;
    while max >= 1 && count[max] == 0 {
        max -= 1;
    }
    if max == 0 {
        // No symbols at all: a 1-bit table of invalid entries, so any decode
        // attempt fails cleanly. Legal for an unused distance tree.
        let offset = arena.len();
        arena.push(INVALID);
        arena.push(INVALID);
        return Ok(Table { offset, root: 1 });
    }
    let mut min = 1;
    while count[min] == 0 {
        min += 1;
    }
    let root = (root_request as usize).clamp(min, max);

    // Kraft check: oversubscribed is always fatal, incomplete is allowed only
    // for the degenerate one-symbol case (and never for the code-length code).
    let mut left: i32 = 1;
    for len in 1..=MAX_BITS {
        left <<= 1;
        left -= count[len] as i32;
        if left < 0 {
            return Err(TableError::Oversubscribed);
        }
    }
    if left > 0 && (kind == TableKind::CodeLengths || max != 1) {
        return Err(TableError::Incomplete);
    }

    // Sort symbols by (code length, symbol index).
    let mut offs = [0u16; MAX_BITS + 1];
    for len in 1..MAX_BITS {
        offs[len + 1] = offs[len] + count[len];
    }
    let mut work = vec![0u16; lens.len()];
    for (sym, &len) in lens.iter().enumerate() {
        if len != 0 {
            work[offs[len as usize] as usize] = sym as u16;
            offs[len as usize] += 1;
        }
    }

    let offset = arena.len();
    let mut used = 1usize << root;
    if table_too_big(kind, used) {
        return Err(TableError::Oversubscribed);
    }
    arena.resize(offset + used, INVALID);

    // Fill loop state: `huff` is the current code in bit-reversed form,
    // `drop_` the number of root bits dropped when filling a sub-table,
    // `next` the arena offset of the table being filled, `curr` its index
    // width, `low` the root prefix of the sub-table being filled.
    let mut huff: usize = 0;
    let mut sym: usize = 0;
    let mut len = min;
    let mut next = offset;
    let mut curr = root;
    let mut drop_ = 0usize;
    let mut low = usize::MAX;
    let mask = (1usize << root) - 1;

    loop {
        let (op, val) = symbol_entry(kind, work[sym] as usize);
        let here = Entry {
            op,
            bits: (len - drop_) as u8,
            val,
        };

        // Replicate the entry over all indices whose low bits match the code.
        let incr = 1usize << (len - drop_);
        let mut fill = 1usize << curr;
        loop {
            fill -= incr;
            arena[next + (huff >> drop_) + fill] = here;
            if fill == 0 {
                break;
            }
        }

        // Increment the bit-reversed code.
        let mut bump = 1usize << (len - 1);
        while huff & bump != 0 {
            bump >>= 1;
        }
        huff = if bump != 0 { (huff & (bump - 1)) + bump } else { 0 };

        sym += 1;
        count[len] -= 1;
        if count[len] == 0 {
            if len == max {
                break;
            }
            len = lens[work[sym] as usize] as usize;
        }

        // Start a new sub-table when the next code is longer than the root
        // and enters a fresh root prefix.
        if len > root && (huff & mask) != low {
            if drop_ == 0 {
                drop_ = root;
            }
            next += 1usize << curr;

            // Width of the new sub-table: just enough for the codes that
            // share this prefix.
            curr = len - drop_;
            let mut space = 1i32 << curr;
            while curr + drop_ < max {
                space -= count[curr + drop_] as i32;
                if space <= 0 {
                    break;
                }
                curr += 1;
                space <<= 1;
            }

            used += 1usize << curr;
            if table_too_big(kind, used) {
                return Err(TableError::Oversubscribed);
            }
            arena.resize(offset + used, INVALID);

            low = huff & mask;
            arena[offset + low] = Entry {
                op: OP_LINK | curr as u8,
                bits: root as u8,
                val: next as u16,
            };
        }
    }

    // The only way to get here with unassigned codes is the one-symbol
    // degenerate tree; mark its single leftover slot invalid.
    if huff != 0 {
        arena[next + (huff >> drop_)] = Entry {
            op: OP_INVALID,
            bits: (len - drop_) as u8,
            val: 0,
        };
    }

    trace!(
        "built {:?} table: root {} bits, {} entries",
        kind,
        root,
        used
    );
    Ok(Table {
        offset,
        root: root as u32,
    })
}

fn table_too_big(kind: TableKind, used: usize) -> bool {
    match kind {
        TableKind::LitLen => used > ENOUGH_LENS,
        TableKind::Dist => used > ENOUGH_DISTS,
        TableKind::CodeLengths => false,
    }
}

////////////////////////////////////////////////////////////////////////////////

/// The fixed-Huffman tables of RFC 1951 §3.2.6, built once.
pub struct FixedTables {
    pub arena: Vec<Entry>,
    pub litlen: Table,
    pub dist: Table,
}

pub fn fixed_tables() -> &'static FixedTables {
    static TABLES: OnceLock<FixedTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut lens = [0u16; 288];
        for (sym, len) in lens.iter_mut().enumerate() {
            *len = match sym {
                0..=143 => 8,
                144..=255 => 9,
                256..=279 => 7,
                _ => 8,
            };
        }
        let mut arena = Vec::new();
        let litlen = build(TableKind::LitLen, &lens, ROOT_LITLEN, &mut arena)
            .unwrap_or_else(|_| unreachable!("fixed literal/length code is complete"));
        // All 32 distance symbols get 5-bit codes; 30 and 31 decode invalid.
        let dist = build(TableKind::Dist, &[5u16; 32], ROOT_DIST, &mut arena)
            .unwrap_or_else(|_| unreachable!("fixed distance code is complete"));
        FixedTables {
            arena,
            litlen,
            dist,
        }
    })
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    // Index of a code in a built table: DEFLATE emits Huffman codes MSB
    // first into an LSB-first stream, so the table index is the code
    // bit-reversed.
    fn rev(code: usize, len: usize) -> usize {
        let mut out = 0;
        for i in 0..len {
            out |= ((code >> i) & 1) << (len - 1 - i);
        }
        out
    }

    #[test]
    fn canonical_assignment() {
        let mut arena = Vec::new();
        let table = build(
            TableKind::CodeLengths,
            &[2, 3, 4, 3, 3, 4, 2],
            7,
            &mut arena,
        )
        .unwrap();
        assert_eq!(table.root, 4);

        // Canonical codes: 0->00, 6->01, 1->100, 3->101, 4->110, 2->1110,
        // 5->1111.
        let ent = |code, len| arena[table.offset + rev(code, len)];
        assert_eq!(ent(0b00, 2), Entry { op: 0, bits: 2, val: 0 });
        assert_eq!(ent(0b01, 2), Entry { op: 0, bits: 2, val: 6 });
        assert_eq!(ent(0b100, 3), Entry { op: 0, bits: 3, val: 1 });
        assert_eq!(ent(0b101, 3), Entry { op: 0, bits: 3, val: 3 });
        assert_eq!(ent(0b110, 3), Entry { op: 0, bits: 3, val: 4 });
        assert_eq!(ent(0b1110, 4), Entry { op: 0, bits: 4, val: 2 });
        assert_eq!(ent(0b1111, 4), Entry { op: 0, bits: 4, val: 5 });

        // Short codes are replicated across the high index bits.
        assert_eq!(arena[table.offset + rev(0b00, 2) + 0b0100].val, 0);
        assert_eq!(arena[table.offset + rev(0b00, 2) + 0b1100].val, 0);
    }

    #[test]
    fn subtable_chaining() {
        // Lengths [1,2,3,4,4] with a 2-bit root force codes 3..4 bits long
        // through a second-level table.
        let mut arena = Vec::new();
        let table = build(TableKind::CodeLengths, &[1, 2, 3, 4, 4], 2, &mut arena).unwrap();
        assert_eq!(table.root, 2);

        // Codes: 0->0, 1->10, 2->110, 3->1110, 4->1111. Prefix 11 links out.
        let link = arena[table.offset + 0b11];
        assert_eq!(link.op & OP_LINK, OP_LINK);
        assert_eq!(link.bits, 2);
        let sub_bits = (link.op & 15) as usize;
        assert_eq!(sub_bits, 2);

        let sub = link.val as usize;
        // Remaining bits after the 2-bit root prefix, still bit-reversed.
        assert_eq!(arena[sub + 0b00].val, 2); // 110: one more bit "0"
        assert_eq!(arena[sub + 0b10].val, 2); // replicated
        assert_eq!(arena[sub + 0b01].val, 3); // 1110: bits "10" reversed
        assert_eq!(arena[sub + 0b11].val, 4); // 1111
    }

    #[test]
    fn oversubscribed_rejected() {
        let mut arena = Vec::new();
        assert_eq!(
            build(TableKind::CodeLengths, &[1, 1, 1], 7, &mut arena),
            Err(TableError::Oversubscribed)
        );
    }

    #[test]
    fn incomplete_rejected() {
        let mut arena = Vec::new();
        assert_eq!(
            build(TableKind::CodeLengths, &[2, 2, 2], 7, &mut arena),
            Err(TableError::Incomplete)
        );
        // ...but a single 1-bit distance code is the legal degenerate case.
        assert!(build(TableKind::Dist, &[1], 6, &mut arena).is_ok());
    }

    #[test]
    fn empty_distance_tree() {
        let mut arena = Vec::new();
        let table = build(TableKind::Dist, &[0, 0], 6, &mut arena).unwrap();
        assert_eq!(table.root, 1);
        assert_eq!(arena[table.offset].op, OP_INVALID);
    }

    #[test]
    fn fixed_tables_shape() {
        let fixed = fixed_tables();
        assert_eq!(fixed.litlen.root, 9);
        assert_eq!(fixed.dist.root, 5);

        // Symbol 0 has the 8-bit code 0x30; symbol 256 (end of block) the
        // 7-bit code 0.
        let lit = fixed.arena[fixed.litlen.offset + rev(0x30, 8)];
        assert_eq!((lit.op, lit.val), (OP_LITERAL, 0));
        let end = fixed.arena[fixed.litlen.offset + rev(0, 7)];
        assert_eq!(end.op, OP_END);

        // Reserved distance symbols 30/31 decode invalid.
        let bad = fixed.arena[fixed.dist.offset + rev(30, 5)];
        assert_eq!(bad.op, OP_INVALID);
    }
}
