// Copyright (C) 2019-2020  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Pcapng block encoder.
//!
//! Serializes captured raw packets into the "packet capture next generation"
//! container, the append-only block format understood by Wireshark, tshark,
//! and friends. Only the encoding side is implemented here.
//!
//! A capture output always starts with a Section Header Block followed by a
//! single Interface Description Block (link type Ethernet), then any number
//! of Enhanced Packet Blocks. Every block is self-describing: a type tag, a
//! total length, type-specific fields, optional option records, and the same
//! total length repeated at the end so that readers can walk the file in
//! either direction. All blocks are padded to a 4-byte boundary.
//!
//! The encoder is parameterized over the byte order. Readers detect the
//! order from the byte-order-magic field of the Section Header Block, so
//! both variants produce valid files; little endian is what the rest of the
//! ecosystem writes in practice and is the default.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::time::Duration;
use std::{io, marker::PhantomData};

mod clock;

pub use clock::CaptureClock;

/// Block type tag of the Section Header Block.
pub const BLOCK_TYPE_SECTION_HEADER: u32 = 0x0a0d_0d0a;
/// Block type tag of the Interface Description Block.
pub const BLOCK_TYPE_INTERFACE_DESCRIPTION: u32 = 0x0000_0001;
/// Block type tag of the Enhanced Packet Block.
pub const BLOCK_TYPE_ENHANCED_PACKET: u32 = 0x0000_0006;

/// Byte-order magic written in the Section Header Block. Readers compare it
/// against both byte orders to detect the endianness of the file.
pub const BYTE_ORDER_MAGIC: u32 = 0x1a2b_3c4d;

/// Option code of a comment option, valid in any block.
pub const OPTION_COMMENT: u16 = 1;
/// Option code terminating an option list.
const OPTION_END_OF_OPTIONS: u16 = 0;

/// LINKTYPE_ETHERNET, the only link type we emit.
const LINK_TYPE_ETHERNET: u16 = 1;

/// Maximum encoded size of a comment option value, in bytes. The option
/// length field is what effectively bounds this; longer comments are
/// truncated, never an error.
pub const MAX_COMMENT_BYTES: usize = 32767;
/// Comments longer than this many characters are cut before encoding.
pub const MAX_COMMENT_CHARS: usize = 10000;

/// Stateless encoder for individual pcapng blocks.
///
/// The type parameter selects the byte order of everything except the raw
/// packet bytes, which are copied verbatim.
pub struct CaptureEncoder<E: ByteOrder = LittleEndian> {
    marker: PhantomData<E>,
}

impl<E: ByteOrder> CaptureEncoder<E> {
    pub fn new() -> Self {
        CaptureEncoder {
            marker: PhantomData,
        }
    }

    /// Encodes the Section Header Block that starts a capture output.
    ///
    /// The section length is left as "unknown" (`0xffff_ffff_ffff_ffff`),
    /// which is what append-only writers do: the section ends at the end of
    /// the file.
    pub fn section_header_block(&self) -> Vec<u8> {
        let mut block = BlockBuilder::<E>::new(BLOCK_TYPE_SECTION_HEADER);
        block.put_u32(BYTE_ORDER_MAGIC);
        block.put_u16(1); // major version
        block.put_u16(0); // minor version
        block.put_u64(u64::max_value()); // section length unknown
        block.finish()
    }

    /// Encodes the Interface Description Block for interface 0.
    ///
    /// A snap length of 0 means "no limit"; packets are recorded whole.
    pub fn interface_description_block(&self) -> Vec<u8> {
        let mut block = BlockBuilder::<E>::new(BLOCK_TYPE_INTERFACE_DESCRIPTION);
        block.put_u16(LINK_TYPE_ETHERNET);
        block.put_u16(0); // reserved
        block.put_u32(0); // snaplen: unlimited
        block.finish()
    }

    /// Encodes one Enhanced Packet Block holding `packet`.
    ///
    /// `timestamp_us` is the capture time in microseconds; it is split into
    /// high and low 32-bit halves as the format requires. `comment`, when
    /// present, is attached as a comment option; it is truncated to
    /// [`MAX_COMMENT_CHARS`] characters and [`MAX_COMMENT_BYTES`] encoded
    /// bytes rather than failing the packet write.
    pub fn enhanced_packet_block(
        &self,
        packet: &[u8],
        timestamp_us: u64,
        comment: Option<&str>,
    ) -> Vec<u8> {
        let mut block = BlockBuilder::<E>::new(BLOCK_TYPE_ENHANCED_PACKET);
        block.put_u32(0); // interface id
        block.put_u32((timestamp_us >> 32) as u32);
        block.put_u32(timestamp_us as u32);
        block.put_u32(packet.len() as u32); // captured length
        block.put_u32(packet.len() as u32); // original length
        block.put_bytes_padded(packet);

        if let Some(comment) = comment {
            let comment = truncate_comment(comment);
            block.put_u16(OPTION_COMMENT);
            block.put_u16(comment.len() as u16);
            block.put_bytes_padded(comment.as_bytes());
            block.put_u16(OPTION_END_OF_OPTIONS);
            block.put_u16(0);
        }

        block.finish()
    }
}

/// Cuts `comment` down to the encodable limits, always on a character
/// boundary.
fn truncate_comment(comment: &str) -> &str {
    let mut end = comment.len();
    if comment.chars().count() > MAX_COMMENT_CHARS {
        end = comment
            .char_indices()
            .nth(MAX_COMMENT_CHARS)
            .map(|(idx, _)| idx)
            .unwrap_or(comment.len());
    }
    while end > MAX_COMMENT_BYTES || !comment.is_char_boundary(end) {
        end -= 1;
    }
    if end != comment.len() {
        log::debug!(
            "truncating capture comment from {} to {} bytes",
            comment.len(),
            end
        );
    }
    &comment[..end]
}

/// Accumulates the body of one block and finalizes the duplicated length
/// fields. Total lengths are always a multiple of 4; `put_bytes_padded`
/// maintains the alignment for variable-length content.
struct BlockBuilder<E: ByteOrder> {
    buffer: Vec<u8>,
    marker: PhantomData<E>,
}

impl<E: ByteOrder> BlockBuilder<E> {
    fn new(block_type: u32) -> Self {
        let mut buffer = Vec::with_capacity(64);
        buffer.write_u32::<E>(block_type).unwrap();
        buffer.write_u32::<E>(0).unwrap(); // patched in finish()
        BlockBuilder {
            buffer,
            marker: PhantomData,
        }
    }

    fn put_u16(&mut self, value: u16) {
        self.buffer.write_u16::<E>(value).unwrap();
    }

    fn put_u32(&mut self, value: u32) {
        self.buffer.write_u32::<E>(value).unwrap();
    }

    fn put_u64(&mut self, value: u64) {
        self.buffer.write_u64::<E>(value).unwrap();
    }

    fn put_bytes_padded(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        while self.buffer.len() % 4 != 0 {
            self.buffer.push(0);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        debug_assert_eq!(self.buffer.len() % 4, 0);
        let total_len = (self.buffer.len() + 4) as u32;
        E::write_u32(&mut self.buffer[4..8], total_len);
        self.buffer.write_u32::<E>(total_len).unwrap();
        self.buffer
    }
}

/// Append-only pcapng writer over any [`io::Write`].
///
/// The Section Header Block and Interface Description Block preamble is
/// written once, by the constructor. Each call to
/// [`CaptureWriter::write_packet`] appends one Enhanced Packet Block.
pub struct CaptureWriter<W: io::Write, E: ByteOrder = LittleEndian> {
    out: W,
    encoder: CaptureEncoder<E>,
    clock: CaptureClock,
}

impl<W: io::Write, E: ByteOrder> CaptureWriter<W, E> {
    /// Writes the capture preamble to `out` and returns a writer whose
    /// clock reports plain UTC.
    pub fn new(out: W) -> io::Result<Self> {
        CaptureWriter::with_offset(out, Duration::from_secs(0))
    }

    /// Like [`CaptureWriter::new`], with a fixed timezone offset baked
    /// into every timestamp the writer's own clock supplies.
    pub fn with_offset(mut out: W, utc_offset: Duration) -> io::Result<Self> {
        let encoder = CaptureEncoder::<E>::new();
        out.write_all(&encoder.section_header_block())?;
        out.write_all(&encoder.interface_description_block())?;
        Ok(CaptureWriter {
            out,
            encoder,
            clock: CaptureClock::new(utc_offset),
        })
    }

    /// Appends one packet. When `timestamp_us` is `None`, the writer's own
    /// capture clock supplies the time.
    pub fn write_packet(
        &mut self,
        packet: &[u8],
        timestamp_us: Option<u64>,
        comment: Option<&str>,
    ) -> io::Result<()> {
        let ts = timestamp_us.unwrap_or_else(|| self.clock.now_micros());
        self.out
            .write_all(&self.encoder.enhanced_packet_block(packet, ts, comment))
    }

    /// Flushes and returns the underlying output.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}
