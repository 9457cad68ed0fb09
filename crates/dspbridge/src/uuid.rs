use core::fmt;
use core::str::FromStr;

/// Identity of a loadable accelerator object.
///
/// The layout mirrors the driver's: a 4-byte, two 2-byte and one 8-byte field. The 8-byte
/// field is the concatenation of the clock-sequence bytes and the node bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DspUuid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl DspUuid {
    pub const fn from_fields(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }
}

impl fmt::Display for DspUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseUuidError;

impl fmt::Display for ParseUuidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected a uuid of the form xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx")
    }
}

impl std::error::Error for ParseUuidError {}

impl FromStr for DspUuid {
    type Err = ParseUuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.chars().all(|c| c == '-' || c.is_ascii_hexdigit()) {
            return Err(ParseUuidError);
        }
        let groups: Vec<&str> = s.split('-').collect();
        let [g1, g2, g3, g4, g5] = groups.as_slice() else {
            return Err(ParseUuidError);
        };
        if g1.len() != 8 || g2.len() != 4 || g3.len() != 4 || g4.len() != 4 || g5.len() != 12 {
            return Err(ParseUuidError);
        }
        let hex_u32 = |g: &str| u32::from_str_radix(g, 16).map_err(|_| ParseUuidError);
        let hex_u16 = |g: &str| u16::from_str_radix(g, 16).map_err(|_| ParseUuidError);

        let mut data4 = [0u8; 8];
        let tail = format!("{g4}{g5}");
        for (i, byte) in data4.iter_mut().enumerate() {
            let pair = tail.get(i * 2..i * 2 + 2).ok_or(ParseUuidError)?;
            *byte = u8::from_str_radix(pair, 16).map_err(|_| ParseUuidError)?;
        }

        Ok(Self {
            data1: hex_u32(g1)?,
            data2: hex_u16(g2)?,
            data3: hex_u16(g3)?,
            data4,
        })
    }
}

/// What a registered object is, as the driver's object database distinguishes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Node,
    Processor,
    Library,
    CreateLibrary,
    ExecuteLibrary,
    DeleteLibrary,
}
