use std::fmt;

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};

use crate::error::{FatError, Result};

pub const DIR_ENTRY_SIZE: usize = 32;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

/// First name byte of a conventionally deleted entry.
const DELETED_MARK: u8 = 0xE5;
/// Stand-in for a name that really starts with 0xE5.
const KANJI_LEAD: u8 = 0x05;

/// Packed FAT time: `hour << 11 | minute << 5 | second / 2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl FatTime {
    pub fn from_raw(raw: u16) -> Self {
        Self {
            hour: (raw >> 11) as u8 & 0x1F,
            minute: (raw >> 5) as u8 & 0x3F,
            second: (raw & 0x1F) as u8 * 2,
        }
    }

    pub fn raw(self) -> u16 {
        (self.hour as u16) << 11 | (self.minute as u16) << 5 | (self.second as u16 / 2)
    }
}

/// Packed FAT date: `(year - 1980) << 9 | month << 5 | day`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl FatDate {
    pub fn from_raw(raw: u16) -> Self {
        Self {
            year: (raw >> 9) + 1980,
            month: (raw >> 5) as u8 & 0x0F,
            day: (raw & 0x1F) as u8,
        }
    }

    pub fn raw(self) -> u16 {
        (self.year.saturating_sub(1980) & 0x7F) << 9 | (self.month as u16) << 5 | self.day as u16
    }

    /// An all-zero field means the date was never recorded.
    pub fn is_set(self) -> bool {
        self.raw() != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatDateTime {
    pub date: FatDate,
    pub time: FatTime,
}

impl FatDateTime {
    pub fn from_raw(date: u16, time: u16) -> Self {
        Self {
            date: FatDate::from_raw(date),
            time: FatTime::from_raw(time),
        }
    }

    /// Clamp into the representable 1980..=2107 range; seconds lose their
    /// lowest bit.
    pub fn from_naive(dt: &NaiveDateTime) -> Self {
        let year = dt.year().clamp(1980, 2107) as u16;
        Self {
            date: FatDate {
                year,
                month: dt.month() as u8,
                day: dt.day() as u8,
            },
            time: FatTime {
                hour: dt.hour() as u8,
                minute: dt.minute() as u8,
                second: (dt.second() as u8 / 2) * 2,
            },
        }
    }

    pub fn now() -> Self {
        Self::from_naive(&Local::now().naive_local())
    }

    /// `None` when the fields do not form a real calendar date.
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(
            self.date.year as i32,
            self.date.month as u32,
            self.date.day as u32,
        )?
        .and_hms_opt(
            self.time.hour as u32,
            self.time.minute as u32,
            self.time.second as u32,
        )
    }
}

impl fmt::Display for FatDateTime {
    /// `YYYY-MM-DD HH:MM:SS`, or nothing when the date is unset.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.date.is_set() {
            return Ok(());
        }
        let FatDate { year, month, day } = self.date;
        let FatTime {
            hour,
            minute,
            second,
        } = self.time;
        write!(
            f,
            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
        )
    }
}

/// Where an entry's 32-byte record lives: the directory's first cluster and
/// the byte offset within that directory's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirSlot {
    pub dir_cluster: u32,
    pub offset: u32,
}

/// How a raw directory slot should be treated while scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Free,
    Deleted,
    LongName,
    VolumeLabel,
    Used,
}

impl SlotKind {
    pub fn of(raw: &[u8; DIR_ENTRY_SIZE]) -> Self {
        let attr = raw[11];
        if raw[0] == DELETED_MARK {
            SlotKind::Deleted
        } else if attr & 0x3F == ATTR_LONG_NAME {
            SlotKind::LongName
        } else if attr == 0 || raw[0] == 0 {
            SlotKind::Free
        } else if attr & ATTR_VOLUME_ID != 0 {
            SlotKind::VolumeLabel
        } else {
            SlotKind::Used
        }
    }

    /// Whether a new entry may be written here.
    pub fn is_reusable(self) -> bool {
        matches!(self, SlotKind::Free | SlotKind::Deleted)
    }
}

/// A decoded short-name directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    name: [u8; 11],
    pub attributes: u8,
    pub created: FatDateTime,
    pub accessed: FatDate,
    pub modified: FatDateTime,
    pub start_cluster: u32,
    pub size: u32,
    slot: Option<DirSlot>,
}

impl Entry {
    pub fn decode(raw: &[u8; DIR_ENTRY_SIZE]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([raw[i], raw[i + 1]]);
        let mut name = [0u8; 11];
        name.copy_from_slice(&raw[..11]);
        Self {
            name,
            attributes: raw[11],
            created: FatDateTime::from_raw(u16_at(16), u16_at(14)),
            accessed: FatDate::from_raw(u16_at(18)),
            modified: FatDateTime::from_raw(u16_at(24), u16_at(22)),
            start_cluster: (u16_at(20) as u32) << 16 | u16_at(26) as u32,
            size: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
            slot: None,
        }
    }

    pub fn encode(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw[..11].copy_from_slice(&self.name);
        raw[11] = self.attributes;
        raw[14..16].copy_from_slice(&self.created.time.raw().to_le_bytes());
        raw[16..18].copy_from_slice(&self.created.date.raw().to_le_bytes());
        raw[18..20].copy_from_slice(&self.accessed.raw().to_le_bytes());
        raw[20..22].copy_from_slice(&((self.start_cluster >> 16) as u16).to_le_bytes());
        raw[22..24].copy_from_slice(&self.modified.time.raw().to_le_bytes());
        raw[24..26].copy_from_slice(&self.modified.date.raw().to_le_bytes());
        raw[26..28].copy_from_slice(&(self.start_cluster as u16).to_le_bytes());
        raw[28..32].copy_from_slice(&self.size.to_le_bytes());
        raw
    }

    /// Fresh entry stamped with the current local time.
    pub fn new(name: [u8; 11], attributes: u8, start_cluster: u32) -> Self {
        let now = FatDateTime::now();
        Self {
            name,
            attributes,
            created: now,
            accessed: now.date,
            modified: now,
            start_cluster,
            size: 0,
            slot: None,
        }
    }

    /// The root directory has no record on disk; this stands in for one.
    pub fn root(root_cluster: u32) -> Self {
        Self::directory_at(root_cluster)
    }

    /// Nameless directory entry for the chain starting at `cluster`.
    pub(crate) fn directory_at(cluster: u32) -> Self {
        let unset = FatDateTime::from_raw(0, 0);
        Self {
            name: [b' '; 11],
            attributes: ATTR_DIRECTORY,
            created: unset,
            accessed: unset.date,
            modified: unset,
            start_cluster: cluster,
            size: 0,
            slot: None,
        }
    }

    pub(crate) fn with_slot(mut self, slot: DirSlot) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn slot(&self) -> Option<DirSlot> {
        self.slot
    }

    /// 8.3 display name, e.g. `README.TXT` or `BOOTMGR`.
    pub fn name(&self) -> String {
        decode_short_name(&self.name)
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    pub fn is_file(&self) -> bool {
        self.attributes & (ATTR_DIRECTORY | ATTR_VOLUME_ID) == 0
    }

}

/// Encode a display name into the padded 11-byte on-disk form.
///
/// The name is upper-cased and split on its first `.`; the base may have up
/// to 8 characters and the extension up to 3.
pub fn encode_short_name(name: &str) -> Result<[u8; 11]> {
    let invalid = || FatError::InvalidName(name.to_string());
    let (base, ext) = name.split_once('.').unwrap_or((name, ""));
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return Err(invalid());
    }
    let legal = |c: char| c.is_ascii_graphic() && !"\"*+,./:;<=>?[\\]|".contains(c);
    if !base.chars().chain(ext.chars()).all(legal) {
        return Err(invalid());
    }

    let mut out = [b' '; 11];
    for (dst, src) in out[..8].iter_mut().zip(base.bytes()) {
        *dst = src.to_ascii_uppercase();
    }
    for (dst, src) in out[8..].iter_mut().zip(ext.bytes()) {
        *dst = src.to_ascii_uppercase();
    }
    Ok(out)
}

/// Decode an 11-byte short name to `NAME.EXT`, leaving out the dot when the
/// extension is blank.
///
/// Short names are in the OEM codepage (CP437); bytes 0x80-0xFF are mapped
/// through the CP437 table rather than treated as UTF-8.
pub fn decode_short_name(raw: &[u8; 11]) -> String {
    let mut base: String = raw[..8].iter().map(|&b| cp437_to_char(b)).collect();
    if raw[0] == KANJI_LEAD {
        base.replace_range(..1, &cp437_to_char(DELETED_MARK).to_string());
    }
    let ext: String = raw[8..].iter().map(|&b| cp437_to_char(b)).collect();
    let base = base.trim_end();
    let ext = ext.trim_end();
    if ext.is_empty() {
        base.to_string()
    } else {
        format!("{base}.{ext}")
    }
}

fn cp437_to_char(b: u8) -> char {
    if b < 0x80 {
        b as char
    } else {
        CP437_HIGH[b as usize - 0x80]
    }
}

#[rustfmt::skip]
const CP437_HIGH: [char; 128] = [
    'Ç','ü','é','â','ä','à','å','ç', 'ê','ë','è','ï','î','ì','Ä','Å',
    'É','æ','Æ','ô','ö','ò','û','ù', 'ÿ','Ö','Ü','¢','£','¥','₧','ƒ',
    'á','í','ó','ú','ñ','Ñ','ª','º', '¿','⌐','¬','½','¼','¡','«','»',
    '░','▒','▓','│','┤','╡','╢','╖', '╕','╣','║','╗','╝','╜','╛','┐',
    '└','┴','┬','├','─','┼','╞','╟', '╚','╔','╩','╦','╠','═','╬','╧',
    '╨','╤','╥','╙','╘','╒','╓','╫', '╪','┘','┌','█','▄','▌','▐','▀',
    'α','ß','Γ','π','Σ','σ','µ','τ', 'Φ','Θ','Ω','δ','∞','φ','ε','∩',
    '≡','±','≥','≤','⌠','⌡','÷','≈', '°','∙','·','√','ⁿ','²','■','\u{00A0}',
];
