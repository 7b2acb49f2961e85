// Machine image buffer and SBIN output.

use std::io::{self, Write};

/// Size of the zeroed region reserved at the start of every image for the
/// virtual machine's memory-mapped control bytes.
pub const IO_SPACE_SIZE: usize = 256;

/// Magic identifier opening every emitted binary.
pub const SBIN_MAGIC: &[u8; 4] = b"SBIN";

/// The fixed 16-byte header preceding the program image.
///
/// All word fields are little-endian, matching the image's data order;
/// instruction words inside the image are big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbinHeader {
    pub program_counter: u32,
    pub stack_pointer: u32,
    pub alloc_size: u32,
}

impl SbinHeader {
    /// Derive the header for an image of `program_len` bytes with the
    /// configured stack and heap reservations above it.
    pub fn for_image(
        program_len: u32,
        program_counter: u32,
        stack_size: u32,
        heap_size: u32,
    ) -> Self {
        let stack_pointer = program_len.wrapping_add(stack_size);
        Self {
            program_counter,
            stack_pointer,
            alloc_size: stack_pointer.wrapping_add(heap_size),
        }
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(SBIN_MAGIC);
        bytes[4..8].copy_from_slice(&self.program_counter.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.stack_pointer.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.alloc_size.to_le_bytes());
        bytes
    }
}

/// Growing byte buffer holding the emitted program image. The write
/// position always sits at the end of the buffer.
#[derive(Debug, Default)]
pub struct ImageStore {
    code: Vec<u8>,
}

impl ImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current byte-position cursor.
    pub fn position(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn bytes(&self) -> &[u8] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Reserve the zero-filled I/O window. Called once per pass, before
    /// any program bytes.
    pub fn write_io_window(&mut self) {
        self.code.extend(std::iter::repeat_n(0u8, IO_SPACE_SIZE));
    }

    pub fn append_slice(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Write the complete binary: header followed by the program image.
    pub fn write_sbin_file<W: Write>(&self, out: &mut W, header: &SbinHeader) -> io::Result<()> {
        out.write_all(&header.to_bytes())?;
        out.write_all(&self.code)
    }
}
