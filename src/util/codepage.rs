//! Device codepage handling
//!
//! USK devices speak a single-byte Cyrillic codepage. The protocol code only
//! needs a byte-to-text mapping, so the codec is a trait and Windows-1251 is
//! the stock implementation.

/// Single-byte text codec used for frame payloads
pub trait TextCodec: Send + Sync {
    /// Decodes device bytes into text, one character per byte
    fn decode(&self, bytes: &[u8]) -> String;

    /// Encodes text into device bytes, one byte per character
    fn encode(&self, text: &str) -> Vec<u8>;
}

/// Upper half (0x80..=0xBF) of Windows-1251; 0xC0..=0xFF is А..я in order.
const CP1251_HIGH: [char; 64] = [
    '\u{0402}', '\u{0403}', '\u{201A}', '\u{0453}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{20AC}', '\u{2030}', '\u{0409}', '\u{2039}', '\u{040A}', '\u{040C}', '\u{040B}', '\u{040F}',
    '\u{0452}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{0098}', '\u{2122}', '\u{0459}', '\u{203A}', '\u{045A}', '\u{045C}', '\u{045B}', '\u{045F}',
    '\u{00A0}', '\u{040E}', '\u{045E}', '\u{0408}', '\u{00A4}', '\u{0490}', '\u{00A6}', '\u{00A7}',
    '\u{0401}', '\u{00A9}', '\u{0404}', '\u{00AB}', '\u{00AC}', '\u{00AD}', '\u{00AE}', '\u{0407}',
    '\u{00B0}', '\u{00B1}', '\u{0406}', '\u{0456}', '\u{0491}', '\u{00B5}', '\u{00B6}', '\u{00B7}',
    '\u{0451}', '\u{2116}', '\u{0454}', '\u{00BB}', '\u{0458}', '\u{0405}', '\u{0455}', '\u{0457}',
];

const CYRILLIC_A: u32 = 0x0410;
const CYRILLIC_YA_SMALL: u32 = 0x044F;

/// Replacement byte for characters outside the codepage
const UNMAPPABLE: u8 = b'?';

/// Windows-1251 codec
#[derive(Debug, Clone, Copy, Default)]
pub struct Cp1251;

impl Cp1251 {
    fn decode_byte(byte: u8) -> char {
        match byte {
            0x00..=0x7F => byte as char,
            0x80..=0xBF => CP1251_HIGH[(byte - 0x80) as usize],
            // А..я occupy 0xC0..=0xFF contiguously
            _ => char::from_u32(CYRILLIC_A + (byte - 0xC0) as u32).unwrap_or('?'),
        }
    }

    fn encode_char(ch: char) -> u8 {
        let code = ch as u32;
        if code < 0x80 {
            return code as u8;
        }
        if (CYRILLIC_A..=CYRILLIC_YA_SMALL).contains(&code) {
            return 0xC0 + (code - CYRILLIC_A) as u8;
        }
        CP1251_HIGH
            .iter()
            .position(|&c| c == ch)
            .map(|idx| 0x80 + idx as u8)
            .unwrap_or(UNMAPPABLE)
    }
}

impl TextCodec for Cp1251 {
    fn decode(&self, bytes: &[u8]) -> String {
        bytes.iter().map(|&b| Self::decode_byte(b)).collect()
    }

    fn encode(&self, text: &str) -> Vec<u8> {
        text.chars().map(Self::encode_char).collect()
    }
}
