//! buffers for use when writing and reading dns packets

use std::collections::{BTreeMap, HashSet};

use derive_more::{Display, Error, From};

/// Longest wire-encoded name permitted, terminating zero included
pub const MAX_NAME_LENGTH: usize = 255;

/// Longest single label permitted
pub const MAX_LABEL_LENGTH: usize = 63;

/// Highest offset a compression pointer can address
const MAX_POINTER_OFFSET: usize = 0x3FFF;

#[derive(Debug, Display, From, Error)]
pub enum BufferError {
    Io(std::io::Error),
    EndOfBuffer,
    PointerLoop,
    LabelTooLong,
    EmptyLabel,
    NameTooLong,
    ReservedLabelType,
}

type Result<T> = std::result::Result<T, BufferError>;

pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get(&mut self, pos: usize) -> Result<u8>;
    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]>;
    fn write(&mut self, val: u8) -> Result<()>;
    fn set(&mut self, pos: usize, val: u8) -> Result<()>;
    fn pos(&self) -> usize;
    fn seek(&mut self, pos: usize) -> Result<()>;
    fn step(&mut self, steps: usize) -> Result<()>;
    fn find_label(&self, label: &str) -> Option<usize>;
    fn save_label(&mut self, label: &str, pos: usize);

    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)?;

        Ok(())
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write(((val >> 24) & 0xFF) as u8)?;
        self.write(((val >> 16) & 0xFF) as u8)?;
        self.write(((val >> 8) & 0xFF) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        for b in data {
            self.write(*b)?;
        }

        Ok(())
    }

    /// Writes a name, replacing any suffix already present in the buffer
    /// with a compression pointer.
    fn write_qname(&mut self, qname: &str) -> Result<()> {
        let qname = qname.trim_end_matches('.');
        if qname.is_empty() {
            self.write_u8(0)?;
            return Ok(());
        }

        let labels: Vec<&str> = qname.split('.').collect();

        let mut wire_len = 1;
        for label in &labels {
            if label.is_empty() {
                return Err(BufferError::EmptyLabel);
            }
            if label.len() > MAX_LABEL_LENGTH {
                return Err(BufferError::LabelTooLong);
            }
            wire_len += label.len() + 1;
        }
        if wire_len > MAX_NAME_LENGTH {
            return Err(BufferError::NameTooLong);
        }

        for (i, label) in labels.iter().enumerate() {
            let suffix = labels[i..].join(".");
            if let Some(prev_pos) = self.find_label(&suffix) {
                let jump_inst = (prev_pos as u16) | 0xC000;
                self.write_u16(jump_inst)?;
                return Ok(());
            }

            let pos = self.pos();
            if pos <= MAX_POINTER_OFFSET {
                self.save_label(&suffix, pos);
            }

            self.write_u8(label.len() as u8)?;
            self.write_bytes(label.as_bytes())?;
        }

        self.write_u8(0)?;

        Ok(())
    }

    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xFF) as u8)?;

        Ok(())
    }

    fn read_u16(&mut self) -> Result<u16> {
        let res = ((self.read()? as u16) << 8) | (self.read()? as u16);

        Ok(res)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let res = ((self.read()? as u32) << 24)
            | ((self.read()? as u32) << 16)
            | ((self.read()? as u32) << 8)
            | (self.read()? as u32);

        Ok(res)
    }

    /// Reads a possibly compressed name into `outstr`.
    ///
    /// Pointers are followed iteratively. Every pointer target is recorded,
    /// and a pointer to an offset that was already visited fails the decode,
    /// which bounds the work done on hostile input. The buffer position ends
    /// up right after the first pointer (or the terminating zero when the
    /// name was not compressed).
    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        let mut pos = self.pos();
        let mut jumped = false;
        let mut visited = HashSet::new();
        let mut wire_len = 0;

        let mut delim = "";
        loop {
            let len = self.get(pos)?;

            if (len & 0xC0) == 0xC0 {
                if !jumped {
                    self.seek(pos + 2)?;
                }

                let b2 = self.get(pos + 1)? as u16;
                let offset = ((((len as u16) ^ 0xC0) << 8) | b2) as usize;
                if !visited.insert(offset) {
                    return Err(BufferError::PointerLoop);
                }

                pos = offset;
                jumped = true;
                continue;
            }

            if (len & 0xC0) != 0 {
                return Err(BufferError::ReservedLabelType);
            }

            pos += 1;
            wire_len += len as usize + 1;
            if wire_len > MAX_NAME_LENGTH {
                return Err(BufferError::NameTooLong);
            }

            if len == 0 {
                break;
            }

            outstr.push_str(delim);

            let str_buffer = self.get_range(pos, len as usize)?;
            outstr.push_str(&String::from_utf8_lossy(str_buffer));

            delim = ".";

            pos += len as usize;
        }

        if !jumped {
            self.seek(pos)?;
        }

        Ok(())
    }
}

/// Growable buffer that remembers every name suffix it has written, so that
/// repeated names are emitted as compression pointers.
#[derive(Default, Clone, Debug)]
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
    pub label_lookup: BTreeMap<String, usize>,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::new(),
            pos: 0,
            label_lookup: BTreeMap::new(),
        }
    }

    /// Wraps received bytes for decoding.
    pub fn from_bytes(data: &[u8]) -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: data.to_vec(),
            pos: 0,
            label_lookup: BTreeMap::new(),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn find_label(&self, label: &str) -> Option<usize> {
        self.label_lookup.get(label).cloned()
    }

    fn save_label(&mut self, label: &str, pos: usize) {
        self.label_lookup.insert(label.to_string(), pos);
    }

    fn read(&mut self) -> Result<u8> {
        let res = *self.buffer.get(self.pos).ok_or(BufferError::EndOfBuffer)?;
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        self.buffer
            .get(pos)
            .cloned()
            .ok_or(BufferError::EndOfBuffer)
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        let end = start.checked_add(len).ok_or(BufferError::EndOfBuffer)?;
        self.buffer
            .get(start..end)
            .ok_or(BufferError::EndOfBuffer)
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos < self.buffer.len() {
            self.buffer[self.pos] = val;
        } else {
            self.buffer.push(val);
        }
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        let slot = self.buffer.get_mut(pos).ok_or(BufferError::EndOfBuffer)?;
        *slot = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        let pos = self.pos.checked_add(steps).ok_or(BufferError::EndOfBuffer)?;
        self.seek(pos)
    }
}
