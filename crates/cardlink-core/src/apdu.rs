/// Status word reported by a card when a command completed normally.
pub const SW_OK: u16 = 0x9000;

/// A smart-card command: class/instruction header, two parameter bytes, and
/// an optional payload of at most 255 bytes. Immutable once constructed; the
/// transport only ever moves its serialized form, never interprets it.
#[derive(Clone, PartialEq, Eq)]
pub struct ApduCommand {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Vec<u8>,
    needs_le: bool,
}

impl ApduCommand {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        debug_assert!(data.len() <= 255, "short APDU payload exceeds 255 bytes");
        Self {
            cla,
            ins,
            p1,
            p2,
            data,
            needs_le: false,
        }
    }

    /// Appends a zero Le byte to the serialized form, requesting the maximum
    /// available response length.
    pub fn with_le(mut self) -> Self {
        self.needs_le = true;
        self
    }

    pub fn cla(&self) -> u8 {
        self.cla
    }

    pub fn ins(&self) -> u8 {
        self.ins
    }

    pub fn p1(&self) -> u8 {
        self.p1
    }

    pub fn p2(&self) -> u8 {
        self.p2
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// On-wire form: header, Lc (when a payload is present), payload, and an
    /// optional trailing Le of zero.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 1 + self.data.len() + 1);
        out.push(self.cla);
        out.push(self.ins);
        out.push(self.p1);
        out.push(self.p2);
        if !self.data.is_empty() {
            out.push(self.data.len() as u8);
            out.extend_from_slice(&self.data);
        }
        if self.needs_le {
            out.push(0x00);
        }
        out
    }
}

impl std::fmt::Debug for ApduCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ApduCommand(cla={:02x} ins={:02x} p1={:02x} p2={:02x} data={})",
            self.cla,
            self.ins,
            self.p1,
            self.p2,
            hex::encode(&self.data)
        )
    }
}

/// A card response: payload plus the two-byte status word. Produced by the
/// framing algorithm from a reassembled buffer; never constructed by the
/// transport itself.
#[derive(Clone, PartialEq, Eq)]
pub struct ApduResponse {
    data: Vec<u8>,
    sw: u16,
}

impl ApduResponse {
    /// Splits a raw reassembled buffer into payload and status word.
    /// Returns `None` when the buffer is too short to carry a status word.
    pub fn from_raw(raw: &[u8]) -> Option<Self> {
        if raw.len() < 2 {
            return None;
        }
        let (data, sw) = raw.split_at(raw.len() - 2);
        Some(Self {
            data: data.to_vec(),
            sw: u16::from_be_bytes([sw[0], sw[1]]),
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn sw(&self) -> u16 {
        self.sw
    }

    pub fn sw1(&self) -> u8 {
        (self.sw >> 8) as u8
    }

    pub fn sw2(&self) -> u8 {
        (self.sw & 0xff) as u8
    }

    pub fn is_ok(&self) -> bool {
        self.sw == SW_OK
    }

    /// Fails with the raw status word when the card did not report success.
    pub fn check_ok(&self) -> Result<&Self, u16> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(self.sw)
        }
    }
}

impl std::fmt::Debug for ApduResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ApduResponse(sw={:04x} data={})",
            self.sw,
            hex::encode(&self.data)
        )
    }
}
