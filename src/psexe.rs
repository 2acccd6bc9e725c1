// PSX-EXE header: a fixed 2048-byte header followed immediately by the
// program's text section. Parsed once by the loader (an external
// collaborator) and handed to `Machine::hand_off_to_executable`.

use crate::error::{CoreError, CoreResult};

const MAGIC: &[u8; 8] = b"PS-X EXE";
const HEADER_SIZE: usize = 2048;

#[derive(Debug, Clone)]
pub struct PsxExe {
    pub initial_pc: u32,
    pub initial_gp: u32,
    pub text_destination: u32,
    pub text_size: u32,
    pub data_destination: u32,
    pub data_size: u32,
    pub bss_start: u32,
    pub bss_size: u32,
    pub initial_sp_base: u32,
    pub initial_sp_offset: u32,
    pub identifier: String,
    /// The program image itself, starting at file offset 2048.
    pub text: Vec<u8>,
}

impl PsxExe {
    /// Parses a complete `.exe`/`.psx` file image, including its trailing
    /// text section.
    pub fn parse(path: &str, data: &[u8]) -> CoreResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(CoreError::MalformedExecutable { path: path.into(), reason: format!("file is {} bytes, shorter than the {HEADER_SIZE}-byte header", data.len()) });
        }
        if &data[0..8] != MAGIC {
            return Err(CoreError::MalformedExecutable { path: path.into(), reason: "missing \"PS-X EXE\" magic".into() });
        }

        let read_u32 = |offset: usize| u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]);

        let initial_pc = read_u32(0x10);
        let initial_gp = read_u32(0x14);
        let text_destination = read_u32(0x18);
        let text_size = read_u32(0x1C);
        let data_destination = read_u32(0x20);
        let data_size = read_u32(0x24);
        let bss_start = read_u32(0x28);
        let bss_size = read_u32(0x2C);
        let initial_sp_base = read_u32(0x30);
        let initial_sp_offset = read_u32(0x34);

        let identifier_bytes = &data[0x4C..0x4C + 64.min(data.len() - 0x4C)];
        let identifier = String::from_utf8_lossy(identifier_bytes).trim_end_matches('\0').trim().to_string();

        let text_end = HEADER_SIZE + text_size as usize;
        if data.len() < text_end {
            return Err(CoreError::MalformedExecutable { path: path.into(), reason: format!("text section ({text_size} bytes) extends past end of file") });
        }
        let text = data[HEADER_SIZE..text_end].to_vec();

        Ok(Self {
            initial_pc,
            initial_gp,
            text_destination,
            text_size,
            data_destination,
            data_size,
            bss_start,
            bss_size,
            initial_sp_base,
            initial_sp_offset,
            identifier,
            text,
        })
    }

    pub fn initial_sp(&self) -> u32 {
        if self.initial_sp_base == 0 {
            0x801F_FFF0
        } else {
            self.initial_sp_base.wrapping_add(self.initial_sp_offset)
        }
    }

    /// Copies the text section into RAM at its destination address and
    /// zero-fills the BSS region, per the loader contract the BIOS's
    /// `LoadEXEC`/entry-point side-load uses.
    pub fn load_into(&self, bus: &mut crate::memory::Bus) {
        for (i, chunk) in self.text.chunks(4).enumerate() {
            let mut word_bytes = [0u8; 4];
            word_bytes[..chunk.len()].copy_from_slice(chunk);
            let word = u32::from_le_bytes(word_bytes);
            bus.write(self.text_destination.wrapping_add((i * 4) as u32), crate::memory::Size::Word, word);
        }
        if self.bss_size > 0 {
            for i in 0..(self.bss_size / 4) {
                bus.write(self.bss_start.wrapping_add(i * 4), crate::memory::Size::Word, 0);
            }
        }
        bus.notify_ram_written(self.text_destination, self.text_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Vec<u8> {
        let mut data = vec![0u8; HEADER_SIZE + 16];
        data[0..8].copy_from_slice(MAGIC);
        data[0x10..0x14].copy_from_slice(&0x8001_0000u32.to_le_bytes()); // initial_pc
        data[0x14..0x18].copy_from_slice(&0x0u32.to_le_bytes()); // initial_gp
        data[0x18..0x1C].copy_from_slice(&0x8001_0000u32.to_le_bytes()); // text_destination
        data[0x1C..0x20].copy_from_slice(&16u32.to_le_bytes()); // text_size
        data[0x4C..0x4C + 11].copy_from_slice(b"Sample-1.00");
        data[HEADER_SIZE..].copy_from_slice(&[0xAA; 16]);
        data
    }

    #[test]
    fn parse_rejects_missing_magic() {
        let mut data = sample_header();
        data[0] = b'X';
        assert!(PsxExe::parse("game.exe", &data).is_err());
    }

    #[test]
    fn parse_extracts_entry_point_and_text_section() {
        let data = sample_header();
        let exe = PsxExe::parse("game.exe", &data).unwrap();
        assert_eq!(exe.initial_pc, 0x8001_0000);
        assert_eq!(exe.text_destination, 0x8001_0000);
        assert_eq!(exe.text.len(), 16);
        assert_eq!(exe.identifier, "Sample-1.00");
    }

    #[test]
    fn parse_rejects_truncated_text_section() {
        let mut data = sample_header();
        data[0x1C..0x20].copy_from_slice(&1_000_000u32.to_le_bytes());
        assert!(PsxExe::parse("game.exe", &data).is_err());
    }
}
