use std::io::{self, Read};

use crate::utils::DynError;

// EventIO sync marker as it appears on disk for little-endian producers.
// Big-endian producers write the same four bytes reversed.
pub const SYNC_LE: [u8; 4] = [0x37, 0x8A, 0x1F, 0xD4];
pub const SYNC_BE: [u8; 4] = [0xD4, 0x1F, 0x8A, 0x37];

const HEADER_BYTES: usize = 12;

/// Header of one top-level data block or nested sub-item.
///
/// Three 32-bit words in stream byte order: type and version, ident,
/// payload length in bytes (low 30 bits).
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_type: u16,
    pub version: u16,
    pub ident: i32,
    pub length: usize,
    pub big_endian: bool,
}

fn read_u32(bytes: &[u8], big_endian: bool) -> u32 {
    let b: [u8; 4] = bytes[..4].try_into().unwrap_or([0; 4]);
    if big_endian {
        u32::from_be_bytes(b)
    } else {
        u32::from_le_bytes(b)
    }
}

fn parse_header(bytes: &[u8], big_endian: bool) -> BlockHeader {
    let w0 = read_u32(&bytes[0..4], big_endian);
    let ident = read_u32(&bytes[4..8], big_endian) as i32;
    let w2 = read_u32(&bytes[8..12], big_endian);
    BlockHeader {
        block_type: (w0 & 0xFFFF) as u16,
        version: ((w0 >> 20) & 0x0FFF) as u16,
        ident,
        length: (w2 & 0x3FFF_FFFF) as usize,
        big_endian,
    }
}

/// Streaming reader for EventIO block envelopes.
///
/// Mirrors the Find/Read/Skip access pattern of the producer side: `find`
/// locates the next sync marker and decodes the header, after which the
/// caller either loads the payload with `read` or discards it with `skip`.
pub struct EventIoReader<R: Read> {
    input: R,
    max_length: usize,
}

impl<R: Read> EventIoReader<R> {
    pub fn new(input: R, max_length: usize) -> Self {
        EventIoReader { input, max_length }
    }

    fn next_byte(&mut self) -> Result<Option<u8>, DynError> {
        let mut byte = [0u8; 1];
        loop {
            match self.input.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Scan forward to the next sync marker and decode the block header.
    /// Returns `None` on a clean end of input. Scanning byte-wise lets the
    /// reader resynchronize after trailing garbage between blocks.
    pub fn find(&mut self) -> Result<Option<BlockHeader>, DynError> {
        let mut window = [0u8; 4];
        let mut have = 0usize;
        let big_endian = loop {
            let byte = match self.next_byte()? {
                Some(b) => b,
                None => return Ok(None),
            };
            if have < 4 {
                window[have] = byte;
                have += 1;
            } else {
                window.rotate_left(1);
                window[3] = byte;
            }
            if have == 4 {
                if window == SYNC_LE {
                    break false;
                }
                if window == SYNC_BE {
                    break true;
                }
            }
        };

        let mut head = [0u8; HEADER_BYTES];
        self.input
            .read_exact(&mut head)
            .map_err(|e| format!("Truncated block header: {e}"))?;
        let header = parse_header(&head, big_endian);
        if header.length > self.max_length {
            return Err(format!(
                "Block of type {} is {} bytes, above the {} byte limit (see --maxbuf)",
                header.block_type, header.length, self.max_length
            )
            .into());
        }
        Ok(Some(header))
    }

    /// Load the payload of the block whose header `find` just returned.
    pub fn read(&mut self, header: &BlockHeader) -> Result<Block, DynError> {
        let mut data = vec![0u8; header.length];
        self.input
            .read_exact(&mut data)
            .map_err(|e| format!("Truncated block of type {}: {e}", header.block_type))?;
        Ok(Block {
            header: *header,
            data,
        })
    }

    /// Discard the payload without decoding it.
    pub fn skip(&mut self, header: &BlockHeader) -> Result<(), DynError> {
        let copied = io::copy(
            &mut self.input.by_ref().take(header.length as u64),
            &mut io::sink(),
        )?;
        if copied as usize != header.length {
            return Err(format!("Truncated block of type {}", header.block_type).into());
        }
        Ok(())
    }
}

/// One fully loaded top-level data block.
pub struct Block {
    pub header: BlockHeader,
    data: Vec<u8>,
}

impl Block {
    pub fn reader(&self) -> ItemReader<'_> {
        ItemReader {
            data: &self.data,
            pos: 0,
            big_endian: self.header.big_endian,
        }
    }
}

/// Nested sub-item inside a container block, sharing the parent's buffer.
#[allow(dead_code)]
pub struct SubItem<'a> {
    pub block_type: u16,
    pub version: u16,
    pub ident: i32,
    pub reader: ItemReader<'a>,
}

/// Sequential field extractor over one block payload.
pub struct ItemReader<'a> {
    data: &'a [u8],
    pos: usize,
    big_endian: bool,
}

impl<'a> ItemReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DynError> {
        if self.pos + n > self.data.len() {
            return Err("Data block ended before all declared fields were read".into());
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn get_i16(&mut self) -> Result<i16, DynError> {
        let b: [u8; 2] = self.take(2)?.try_into()?;
        Ok(if self.big_endian {
            i16::from_be_bytes(b)
        } else {
            i16::from_le_bytes(b)
        })
    }

    pub fn get_i32(&mut self) -> Result<i32, DynError> {
        let b = read_u32(self.take(4)?, self.big_endian);
        Ok(b as i32)
    }

    pub fn get_f32(&mut self) -> Result<f32, DynError> {
        let b = read_u32(self.take(4)?, self.big_endian);
        Ok(f32::from_bits(b))
    }

    pub fn get_i16s(&mut self, out: &mut [i16]) -> Result<(), DynError> {
        for v in out.iter_mut() {
            *v = self.get_i16()?;
        }
        Ok(())
    }

    pub fn get_f32_vec(&mut self, n: usize) -> Result<Vec<f32>, DynError> {
        // Never trust a declared count beyond the bytes actually present.
        let mut out = Vec::with_capacity(n.min(self.remaining() / 4));
        for _ in 0..n {
            out.push(self.get_f32()?);
        }
        Ok(out)
    }

    /// Length-prefixed string (u16 byte count, then the bytes).
    pub fn get_string16(&mut self) -> Result<String, DynError> {
        let len = self.get_i16()? as u16 as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Type of the next nested sub-item, if enough payload remains for a
    /// sub-item header. Does not consume anything.
    pub fn peek_sub_type(&self) -> Option<u16> {
        if self.remaining() < HEADER_BYTES {
            return None;
        }
        let header = parse_header(&self.data[self.pos..], self.big_endian);
        Some(header.block_type)
    }

    /// Descend into the next nested sub-item. Sub-items carry the same
    /// three-word header as top-level blocks but no sync marker.
    pub fn sub_item(&mut self) -> Result<SubItem<'a>, DynError> {
        let head = self.take(HEADER_BYTES)?;
        let header = parse_header(head, self.big_endian);
        let body = self.take(header.length)?;
        Ok(SubItem {
            block_type: header.block_type,
            version: header.version,
            ident: header.ident,
            reader: ItemReader {
                data: body,
                pos: 0,
                big_endian: self.big_endian,
            },
        })
    }
}


#[cfg(test)]
mod tests {
    use super::build::StreamBuilder;
    use super::EventIoReader;

    #[test]
    fn scalar_fields_round_trip() {
        let mut b = StreamBuilder::new();
        b.block(1200, |p| {
            p.put_i16(-7).put_i32(123_456).put_f32(2.5).put_string16("RUNH");
        });
        let bytes = b.into_bytes();

        let mut reader = EventIoReader::new(&bytes[..], 1 << 20);
        let header = reader.find().unwrap().expect("one block");
        assert_eq!(header.block_type, 1200);
        assert!(!header.big_endian);
        let block = reader.read(&header).unwrap();
        let mut item = block.reader();
        assert_eq!(item.get_i16().unwrap(), -7);
        assert_eq!(item.get_i32().unwrap(), 123_456);
        assert_eq!(item.get_f32().unwrap(), 2.5);
        assert_eq!(item.get_string16().unwrap(), "RUNH");
        assert_eq!(item.remaining(), 0);
        assert!(reader.find().unwrap().is_none());
    }

    #[test]
    fn declared_array_counts_never_outgrow_the_payload() {
        // A corrupt count prefix must fail on the short read, not balloon
        // the allocation up front.
        let mut b = StreamBuilder::new();
        b.block(1202, |p| {
            p.put_i32(0x4000_0000).put_f32(1.5);
        });
        let bytes = b.into_bytes();

        let mut reader = EventIoReader::new(&bytes[..], 1 << 20);
        let header = reader.find().unwrap().unwrap();
        let block = reader.read(&header).unwrap();
        let mut item = block.reader();
        let declared = item.get_i32().unwrap() as usize;
        assert!(item.get_f32_vec(declared).is_err());
    }

    #[test]
    fn reader_resynchronizes_after_leading_garbage() {
        let mut b = StreamBuilder::new();
        b.raw(&[0x00, 0xFF, 0x37, 0x8A]);
        b.block(1209, |p| {
            p.put_i32(42);
        });
        let bytes = b.into_bytes();

        let mut reader = EventIoReader::new(&bytes[..], 1 << 20);
        let header = reader.find().unwrap().expect("block after garbage");
        assert_eq!(header.block_type, 1209);
    }

    #[test]
    fn skip_discards_payload_and_lands_on_next_block() {
        let mut b = StreamBuilder::new();
        b.block(1206, |p| {
            p.put_f32s(&[1.0; 64]);
        });
        b.block(1210, |p| {
            p.put_i32(7);
        });
        let bytes = b.into_bytes();

        let mut reader = EventIoReader::new(&bytes[..], 1 << 20);
        let first = reader.find().unwrap().unwrap();
        assert_eq!(first.block_type, 1206);
        reader.skip(&first).unwrap();
        let second = reader.find().unwrap().unwrap();
        assert_eq!(second.block_type, 1210);
    }

    #[test]
    fn oversized_blocks_are_rejected() {
        let mut b = StreamBuilder::new();
        b.block(1205, |p| {
            p.put_f32s(&[0.0; 100]);
        });
        let bytes = b.into_bytes();

        let mut reader = EventIoReader::new(&bytes[..], 16);
        assert!(reader.find().is_err());
    }

    #[test]
    fn nested_sub_items_iterate_in_order() {
        let mut b = StreamBuilder::new();
        b.block(1204, |p| {
            p.sub_block(1205, |s| {
                s.put_i16(1).put_i16(0);
            });
            p.sub_block(1205, |s| {
                s.put_i16(1).put_i16(1);
            });
        });
        let bytes = b.into_bytes();

        let mut reader = EventIoReader::new(&bytes[..], 1 << 20);
        let header = reader.find().unwrap().unwrap();
        let block = reader.read(&header).unwrap();
        let mut item = block.reader();

        let mut tel_numbers = Vec::new();
        while item.peek_sub_type() == Some(1205) {
            let mut sub = item.sub_item().unwrap();
            assert_eq!(sub.block_type, 1205);
            let _array = sub.reader.get_i16().unwrap();
            tel_numbers.push(sub.reader.get_i16().unwrap());
        }
        assert_eq!(tel_numbers, vec![0, 1]);
        assert_eq!(item.remaining(), 0);
    }

    #[test]
    fn truncated_payload_reports_an_error() {
        let mut b = StreamBuilder::new();
        b.block(1202, |p| {
            p.put_i32(5);
        });
        let mut bytes = b.into_bytes();
        bytes.truncate(bytes.len() - 2);

        let mut reader = EventIoReader::new(&bytes[..], 1 << 20);
        let header = reader.find().unwrap().unwrap();
        assert!(reader.read(&header).is_err());
    }
}
