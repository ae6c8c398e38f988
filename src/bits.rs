//! Bit-packed integer stream.
//!
//! A [`BitStream`] is a logical, monotonically addressed sequence of bits that
//! holds unary, fixed-width binary and Elias coded integers back to back.
//! Storage is a table of data blocks; a write that does not fit in the current
//! block opens a new block at the same logical address, so bits already
//! written never move and positions stay valid.
//!
//! Bits are stored most significant first inside each 64-bit word.

use std::io::{self, Read, Write};

/// Default logical size of one data block, in bits.
pub const DEFAULT_BLOCK_BITS: u64 = 1 << 22;

#[inline]
fn mask(width: u64) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Keep the leftmost `64 - n` bits.
#[inline]
fn clear_right(word: u64, n: u64) -> u64 {
    if n >= 64 {
        0
    } else {
        word & !mask(n)
    }
}

/// Keep the rightmost `64 - n` bits.
#[inline]
fn clear_left(word: u64, n: u64) -> u64 {
    if n >= 64 {
        0
    } else {
        word & (u64::MAX >> n)
    }
}

#[inline]
fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

#[inline]
fn words_for(bits: u64) -> usize {
    bits.div_ceil(64) as usize
}

#[derive(Debug, Clone, Default)]
struct DataBlock {
    /// Logical address of the first bit.
    bgn: u64,
    /// Bits written.
    len: u64,
    /// Bits this block may hold before writes spill into a new block.
    cap: u64,
    words: Vec<u64>,
}

impl DataBlock {
    fn new(bgn: u64, cap: u64) -> Self {
        Self {
            bgn,
            len: 0,
            cap,
            words: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BitStream {
    max_block_bits: u64,
    blocks: Vec<DataBlock>,
    blk: usize,
    pos: u64,
}

impl Default for BitStream {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_BITS)
    }
}

impl BitStream {
    pub fn new(max_block_bits: u64) -> Self {
        let max_block_bits = max_block_bits.max(64).next_multiple_of(64);
        Self {
            max_block_bits,
            blocks: vec![DataBlock::new(0, max_block_bits)],
            blk: 0,
            pos: 0,
        }
    }

    pub fn max_block_bits(&self) -> u64 {
        self.max_block_bits
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Logical position of the cursor.
    pub fn position(&self) -> u64 {
        self.blocks[self.blk].bgn + self.pos
    }

    /// Total number of bits written.
    pub fn len(&self) -> u64 {
        self.blocks.iter().map(|b| b.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move the cursor to `position`; `length` is the number of bits the next
    /// read wants to find in one piece.
    pub fn set_position(&mut self, position: u64, length: u64) {
        let idx = self.blocks.partition_point(|b| b.bgn <= position);
        self.blk = idx.saturating_sub(1);
        self.pos = position - self.blocks[self.blk].bgn;
        if length > 0 {
            self.update_blk(length);
        }
    }

    #[inline]
    fn word(&self, wrd: usize) -> u64 {
        self.blocks[self.blk].words.get(wrd).copied().unwrap_or(0)
    }

    /// Before reading `n` bits: step into the next block if this one ended early.
    fn update_blk(&mut self, n: u64) {
        let block = &self.blocks[self.blk];
        if self.pos + n > block.len && self.pos >= block.len && self.blk + 1 < self.blocks.len() {
            self.blk += 1;
            self.pos = 0;
        }
    }

    /// Before writing `n` bits: make sure they land in one block with
    /// allocated words behind them.
    fn ensure_space(&mut self, n: u64) {
        if self.pos + n > self.blocks[self.blk].cap {
            let bgn = self.blocks[self.blk].bgn + self.pos;
            self.blocks[self.blk].len = self.pos;

            if self.blk + 1 < self.blocks.len() && self.blocks[self.blk + 1].cap >= n {
                self.blocks[self.blk + 1].bgn = bgn;
            } else {
                let cap = self.max_block_bits.max(n.next_multiple_of(64));
                self.blocks.truncate(self.blk + 1);
                self.blocks.push(DataBlock::new(bgn, cap));
            }

            self.blk += 1;
            self.pos = 0;
        }

        let block = &mut self.blocks[self.blk];
        let needed = words_for(self.pos + n);
        if block.words.len() < needed {
            let cap_words = words_for(block.cap);
            let grown = (block.words.len() * 2).clamp(needed, cap_words.max(needed));
            block.words.resize(grown, 0);
        }
    }

    #[inline]
    fn update_len(&mut self) {
        let block = &mut self.blocks[self.blk];
        if block.len < self.pos {
            block.len = self.pos;
        }
    }

    /// Read a unary coded value: zero bits up to a terminating one bit.
    pub fn get_unary(&mut self) -> u64 {
        self.update_blk(1);

        let mut value = 0u64;
        let mut wrd = (self.pos / 64) as usize;
        let mut rem = 64 - self.pos % 64;

        //  Word align; the bits shifted in are zero.
        let mut word = self.word(wrd) << (64 - rem);

        while word == 0 {
            value += rem;
            self.pos += rem;
            wrd += 1;
            rem = 64;

            if wrd >= self.blocks[self.blk].words.len() {
                return value;
            }
            word = self.word(wrd);
        }

        let zeros = word.leading_zeros() as u64;
        value += zeros;
        self.pos += zeros + 1;

        value
    }

    /// Write `value` zero bits and a one bit; returns the bits written.
    pub fn set_unary(&mut self, value: u64) -> u64 {
        let size = value + 1;
        self.ensure_space(size);

        let mut wrd = (self.pos / 64) as usize;
        let rem = 64 - self.pos % 64;
        let words = &mut self.blocks[self.blk].words;

        if size < rem {
            let m = mask(size) << (rem - size);
            words[wrd] = (words[wrd] & !m) | (1u64 << (rem - size));
            self.pos += size;
        } else if size == rem {
            words[wrd] = clear_right(words[wrd], rem) | 1;
            self.pos += size;
        } else {
            words[wrd] = clear_right(words[wrd], rem);
            self.pos += rem;
            wrd += 1;

            let mut left = value - rem;
            while left >= 64 {
                words[wrd] = 0;
                left -= 64;
                self.pos += 64;
                wrd += 1;
            }

            //  `left` zeros then the sentinel, at the start of a word.
            let w = left + 1;
            let m = mask(w) << (64 - w);
            words[wrd] = (words[wrd] & !m) | (1u64 << (64 - w));
            self.pos += w;
        }

        self.update_len();
        size
    }

    /// Read a `width`-bit binary value, `width` in `0..=64`.
    pub fn get_binary(&mut self, width: u32) -> u64 {
        debug_assert!(width <= 64);
        let width = width as u64;
        if width == 0 {
            return 0;
        }

        self.update_blk(width);

        let wrd = (self.pos / 64) as usize;
        let rem = 64 - self.pos % 64;

        let value = if width < rem {
            (self.word(wrd) >> (rem - width)) & mask(width)
        } else if width == rem {
            self.word(wrd) & mask(width)
        } else {
            let w2 = width - rem;
            let l = (self.word(wrd) & mask(rem)) << w2;
            let r = self.word(wrd + 1) >> (64 - w2);
            l | r
        };

        self.pos += width;
        value
    }

    /// Write the low `width` bits of `value`; returns the bits written.
    pub fn set_binary(&mut self, width: u32, value: u64) -> u64 {
        debug_assert!(width <= 64);
        let width = width as u64;
        if width == 0 {
            return 0;
        }

        self.ensure_space(width);

        let value = value & mask(width);
        let wrd = (self.pos / 64) as usize;
        let rem = 64 - self.pos % 64;
        let words = &mut self.blocks[self.blk].words;

        if width < rem {
            let m = mask(width) << (rem - width);
            words[wrd] = (words[wrd] & !m) | (value << (rem - width));
        } else if width == rem {
            words[wrd] = clear_right(words[wrd], rem) | value;
        } else {
            let w2 = width - rem;
            words[wrd] = clear_right(words[wrd], rem) | (value >> w2);
            words[wrd + 1] = clear_left(words[wrd + 1], w2) | (value << (64 - w2));
        }

        self.pos += width;
        self.update_len();
        width
    }

    /// Elias gamma: unary coded bit length, then the value without its top bit.
    /// Only positive values.
    pub fn get_elias_gamma(&mut self) -> u64 {
        let n = self.get_unary() as u32;
        let v = self.get_binary(n);
        v | (1u64 << n)
    }

    pub fn set_elias_gamma(&mut self, value: u64) -> u64 {
        debug_assert!(value > 0);
        let n = 63 - value.leading_zeros();
        self.set_unary(n as u64) + self.set_binary(n, value)
    }

    /// Elias delta: like gamma, but the bit length is itself gamma coded.
    pub fn get_elias_delta(&mut self) -> u64 {
        let n = self.get_elias_gamma() as u32;
        let v = self.get_binary(n - 1);
        v | (1u64 << (n - 1))
    }

    pub fn set_elias_delta(&mut self, value: u64) -> u64 {
        debug_assert!(value > 0);
        let n = 64 - value.leading_zeros();
        self.set_elias_gamma(n as u64) + self.set_binary(n - 1, value)
    }

    /// Bits left in the current data block, after stepping past its end.
    fn block_remaining(&mut self, n: u64) -> u64 {
        self.update_blk(n);
        self.blocks[self.blk].len.saturating_sub(self.pos)
    }

    /// Like [`get_unary`](Self::get_unary), but `None` when the stream ends
    /// before the terminating one bit.
    pub fn try_get_unary(&mut self) -> Option<u64> {
        let left = self.block_remaining(1);
        let value = self.get_unary();
        (value < left).then_some(value)
    }

    /// Like [`get_binary`](Self::get_binary), but `None` for a width over 64
    /// or fewer than `width` bits left.
    pub fn try_get_binary(&mut self, width: u32) -> Option<u64> {
        if width > 64 {
            return None;
        }
        if width == 0 {
            return Some(0);
        }
        if self.block_remaining(width as u64) < width as u64 {
            return None;
        }
        Some(self.get_binary(width))
    }

    /// Checked Elias gamma read; a bit length of 64 or more is corrupt.
    pub fn try_get_elias_gamma(&mut self) -> Option<u64> {
        let n = self.try_get_unary()?;
        if n >= 64 {
            return None;
        }
        let n = n as u32;
        self.try_get_binary(n).map(|v| v | (1u64 << n))
    }

    /// Serialize the block table; returns the number of bytes written.
    pub fn dump_to<W: Write>(&self, out: &mut W) -> io::Result<u64> {
        let mut bytes = 0u64;

        out.write_all(&self.max_block_bits.to_le_bytes())?;
        out.write_all(&(self.blocks.len() as u32).to_le_bytes())?;
        bytes += 12;

        for block in &self.blocks {
            out.write_all(&block.bgn.to_le_bytes())?;
            out.write_all(&block.len.to_le_bytes())?;
            bytes += 16;
        }

        for block in &self.blocks {
            let n = words_for(block.len);
            for ii in 0..n {
                let word = block.words.get(ii).copied().unwrap_or(0);
                out.write_all(&word.to_le_bytes())?;
            }
            bytes += 8 * n as u64;
        }

        Ok(bytes)
    }

    /// Replace the contents with a block table written by [`dump_to`].
    ///
    /// Returns `Ok(false)` if no header could be read, which is how the end of
    /// a file of back-to-back streams shows up.
    ///
    /// [`dump_to`]: BitStream::dump_to
    pub fn load_from<R: Read>(&mut self, input: &mut R) -> io::Result<bool> {
        let mut head = [0u8; 12];
        match input.read_exact(&mut head) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e),
        }

        let in_max = le_u64(&head[0..8]);
        let in_len = u32::from_le_bytes([head[8], head[9], head[10], head[11]]) as usize;

        //  Blocks of another size can't be reused.
        if in_max != self.max_block_bits {
            self.blocks.clear();
            self.max_block_bits = in_max.max(64).next_multiple_of(64);
        }

        self.blocks.truncate(in_len.max(1));
        self.blocks.resize_with(in_len.max(1), DataBlock::default);

        let mut entry = [0u8; 16];
        for block in self.blocks.iter_mut().take(in_len) {
            input.read_exact(&mut entry)?;
            block.bgn = le_u64(&entry[0..8]);
            block.len = le_u64(&entry[8..16]);
            block.cap = self.max_block_bits.max(block.len.next_multiple_of(64));
        }
        if in_len == 0 {
            self.blocks[0] = DataBlock::new(0, self.max_block_bits);
        }

        let mut scratch = Vec::new();
        for block in self.blocks.iter_mut().take(in_len) {
            let n = words_for(block.len);
            scratch.resize(n * 8, 0);
            input.read_exact(&mut scratch)?;

            block.words.clear();
            block.words.extend(scratch.chunks_exact(8).map(le_u64));
        }

        self.blk = 0;
        self.pos = 0;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Unary(u64),
        Binary(u32, u64),
        Gamma(u64),
        Delta(u64),
    }

    fn write_all(bits: &mut BitStream, ops: &[Op]) {
        for op in ops {
            match *op {
                Op::Unary(v) => {
                    bits.set_unary(v);
                }
                Op::Binary(w, v) => {
                    bits.set_binary(w, v);
                }
                Op::Gamma(v) => {
                    bits.set_elias_gamma(v);
                }
                Op::Delta(v) => {
                    bits.set_elias_delta(v);
                }
            }
        }
    }

    fn check_all(bits: &mut BitStream, ops: &[Op]) {
        for (ii, op) in ops.iter().enumerate() {
            match *op {
                Op::Unary(v) => assert_eq!(bits.get_unary(), v, "op {ii}: {op:?}"),
                Op::Binary(w, v) => {
                    assert_eq!(bits.get_binary(w), v & mask(w as u64), "op {ii}: {op:?}")
                }
                Op::Gamma(v) => assert_eq!(bits.get_elias_gamma(), v, "op {ii}: {op:?}"),
                Op::Delta(v) => assert_eq!(bits.get_elias_delta(), v, "op {ii}: {op:?}"),
            }
        }
    }

    fn random_ops(seed: u64, n: usize) -> Vec<Op> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| match rng.gen_range(0..4) {
                0 => Op::Unary(if rng.gen_bool(0.1) {
                    rng.gen_range(0..400)
                } else {
                    rng.gen_range(0..8)
                }),
                1 => {
                    let w = rng.gen_range(0..=64);
                    Op::Binary(w, rng.gen())
                }
                2 => {
                    let shift = rng.gen_range(0..64);
                    Op::Gamma(rng.gen_range(1..=u64::MAX >> shift))
                }
                _ => {
                    let shift = rng.gen_range(0..64);
                    Op::Delta(rng.gen_range(1..=u64::MAX >> shift))
                }
            })
            .collect()
    }

    #[test]
    fn unary_zero_costs_one_bit() {
        let mut bits = BitStream::new(1024);
        assert_eq!(bits.set_unary(0), 1);
        assert_eq!(bits.position(), 1);
        assert_eq!(bits.len(), 1);
    }

    #[test]
    fn binary_64_spanning_words() {
        let mut bits = BitStream::new(1024);
        bits.set_binary(37, 0x1234_5678_9);
        bits.set_binary(64, 0xdead_beef_cafe_f00d);
        bits.set_binary(64, u64::MAX);
        bits.set_binary(27, 5);

        bits.set_position(0, 0);
        assert_eq!(bits.get_binary(37), 0x1234_5678_9);
        assert_eq!(bits.get_binary(64), 0xdead_beef_cafe_f00d);
        assert_eq!(bits.get_binary(64), u64::MAX);
        assert_eq!(bits.get_binary(27), 5);
        assert_eq!(bits.position(), 37 + 64 + 64 + 27);
    }

    #[test]
    fn binary_exactly_fills_word() {
        let mut bits = BitStream::new(1024);
        bits.set_binary(40, 77);
        bits.set_binary(24, 0xabcdef);
        bits.set_binary(3, 5);

        bits.set_position(0, 0);
        assert_eq!(bits.get_binary(40), 77);
        assert_eq!(bits.get_binary(24), 0xabcdef);
        assert_eq!(bits.get_binary(3), 5);
    }

    #[test]
    fn unary_spanning_three_words() {
        let mut bits = BitStream::new(4096);
        bits.set_binary(60, 1);
        bits.set_unary(200);
        bits.set_unary(3);
        bits.set_unary(63);
        bits.set_unary(64);

        bits.set_position(0, 0);
        assert_eq!(bits.get_binary(60), 1);
        assert_eq!(bits.get_unary(), 200);
        assert_eq!(bits.get_unary(), 3);
        assert_eq!(bits.get_unary(), 63);
        assert_eq!(bits.get_unary(), 64);
        assert_eq!(bits.position(), 60 + 201 + 4 + 64 + 65);
    }

    #[test]
    fn unary_exactly_fills_word() {
        let mut bits = BitStream::new(1024);
        bits.set_binary(10, 3);
        bits.set_unary(53);
        bits.set_unary(0);

        bits.set_position(0, 0);
        assert_eq!(bits.get_binary(10), 3);
        assert_eq!(bits.get_unary(), 53);
        assert_eq!(bits.position(), 64);
        assert_eq!(bits.get_unary(), 0);
    }

    #[test]
    fn random_sequence_round_trips() {
        let ops = random_ops(7, 5000);
        let mut bits = BitStream::new(DEFAULT_BLOCK_BITS);
        write_all(&mut bits, &ops);
        bits.set_position(0, 0);
        check_all(&mut bits, &ops);
    }

    #[test]
    fn small_blocks_grow_without_truncation() {
        let ops = random_ops(11, 2000);
        let mut bits = BitStream::new(128);
        write_all(&mut bits, &ops);
        assert!(bits.num_blocks() > 10);

        bits.set_position(0, 0);
        check_all(&mut bits, &ops);
    }

    #[test]
    fn oversized_unary_gets_its_own_block() {
        let mut bits = BitStream::new(64);
        bits.set_binary(17, 99);
        bits.set_unary(500);
        bits.set_binary(64, 42);

        bits.set_position(0, 0);
        assert_eq!(bits.get_binary(17), 99);
        assert_eq!(bits.get_unary(), 500);
        assert_eq!(bits.get_binary(64), 42);
        assert_eq!(bits.len(), 17 + 501 + 64);
    }

    #[test]
    fn rewrite_in_place() {
        let mut bits = BitStream::new(1024);
        bits.set_binary(64, 0);
        bits.set_binary(64, u64::MAX);
        bits.set_position(30, 0);
        bits.set_binary(40, 0xff_ffff_ffff);

        bits.set_position(0, 0);
        assert_eq!(bits.get_binary(30), 0);
        assert_eq!(bits.get_binary(40), 0xff_ffff_ffff);
        assert_eq!(bits.get_binary(58), mask(58));
        assert_eq!(bits.len(), 128);
    }

    #[test]
    fn checked_reads_stop_at_the_end() {
        let mut bits = BitStream::new(64);
        bits.set_elias_gamma(5);
        bits.set_elias_delta(1000);
        bits.set_binary(10, 77);
        bits.set_unary(3);
        bits.set_position(0, 0);

        assert_eq!(bits.try_get_elias_gamma(), Some(5));
        assert_eq!(bits.get_elias_delta(), 1000);
        assert_eq!(bits.try_get_binary(10), Some(77));
        assert_eq!(bits.try_get_unary(), Some(3));
        assert_eq!(bits.try_get_unary(), None);
        assert_eq!(bits.try_get_binary(1), None);
        assert_eq!(bits.try_get_binary(0), Some(0));
        assert_eq!(bits.try_get_binary(65), None);
    }

    #[test]
    fn checked_reads_cross_blocks() {
        let mut bits = BitStream::new(64);
        for v in 0..20u64 {
            bits.set_binary(10, v);
        }
        assert!(bits.num_blocks() > 1);
        bits.set_position(0, 0);
        for v in 0..20u64 {
            assert_eq!(bits.try_get_binary(10), Some(v));
        }
        assert_eq!(bits.try_get_binary(10), None);
    }

    #[test]
    fn gamma_length_of_64_is_rejected() {
        //  64 zeros then the stop bit: no u64 has that many bits below its top.
        let mut bits = BitStream::default();
        bits.set_unary(64);
        bits.set_binary(64, u64::MAX);
        bits.set_position(0, 0);
        assert_eq!(bits.try_get_elias_gamma(), None);
    }

    #[test]
    fn dump_and_load() {
        let ops = random_ops(3, 1500);
        let mut bits = BitStream::new(256);
        write_all(&mut bits, &ops);

        let mut buf = Vec::new();
        let size = bits.dump_to(&mut buf).unwrap();
        assert_eq!(size as usize, buf.len());

        //  Loading into a stream with a different block size reallocates.
        let mut loaded = BitStream::new(DEFAULT_BLOCK_BITS);
        let mut cursor = std::io::Cursor::new(&buf);
        assert!(loaded.load_from(&mut cursor).unwrap());
        assert_eq!(loaded.max_block_bits(), 256);
        assert_eq!(loaded.len(), bits.len());
        check_all(&mut loaded, &ops);

        //  Nothing left: no header.
        assert!(!loaded.load_from(&mut cursor).unwrap());
    }

    #[test]
    fn back_to_back_streams_in_one_buffer() {
        let mut buf = Vec::new();
        for v in 0..5u64 {
            let mut bits = BitStream::new(512);
            bits.set_binary(64, v * 1000);
            bits.set_unary(v);
            bits.dump_to(&mut buf).unwrap();
        }

        let mut cursor = std::io::Cursor::new(&buf);
        let mut bits = BitStream::new(512);
        let mut v = 0;
        while bits.load_from(&mut cursor).unwrap() {
            assert_eq!(bits.get_binary(64), v * 1000);
            assert_eq!(bits.get_unary(), v);
            v += 1;
        }
        assert_eq!(v, 5);
    }
}
