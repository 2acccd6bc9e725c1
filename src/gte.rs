// Geometry Transformation Engine: COP2's 64 registers (32 data, 32 control)
// and the 22 fixed-point opcodes that operate on them. Every opcode clears
// FLAG at entry and recomputes bit 31 (the sticky-error summary) at exit;
// the per-component saturation and 44-bit accumulator helpers at the top of
// this file are shared by all of them, mirroring how the hardware itself
// reuses one overflow-checked adder across every instruction.

/// FLAG register bit positions (register 63). Bits 12-22 and 23-30 are
/// per-component overflow bits; bit 31 is the OR of the documented mask.
mod flag {
    pub const IR0_SAT: u32 = 1 << 12;
    pub const SY2_SAT: u32 = 1 << 13;
    pub const SX2_SAT: u32 = 1 << 14;
    pub const MAC0_UNDER: u32 = 1 << 15;
    pub const MAC0_OVER: u32 = 1 << 16;
    pub const DIV_OVERFLOW: u32 = 1 << 17;
    pub const SZ3_OTZ_SAT: u32 = 1 << 18;
    pub const COLOR_FIFO_B_SAT: u32 = 1 << 19;
    pub const COLOR_FIFO_G_SAT: u32 = 1 << 20;
    pub const COLOR_FIFO_R_SAT: u32 = 1 << 21;
    pub const IR3_SAT: u32 = 1 << 22;
    pub const IR2_SAT: u32 = 1 << 23;
    pub const IR1_SAT: u32 = 1 << 24;
    pub const MAC3_UNDER: u32 = 1 << 25;
    pub const MAC2_UNDER: u32 = 1 << 26;
    pub const MAC1_UNDER: u32 = 1 << 27;
    pub const MAC3_OVER: u32 = 1 << 28;
    pub const MAC2_OVER: u32 = 1 << 29;
    pub const MAC1_OVER: u32 = 1 << 30;
    pub const ERROR: u32 = 1 << 31;

    /// Bits that feed the bit-31 summary (everything except the "pure
    /// diagnostic" IR0/SX/SY/div bits, per the documented mask).
    pub const ERROR_MASK: u32 = MAC1_OVER
        | MAC2_OVER
        | MAC3_OVER
        | MAC1_UNDER
        | MAC2_UNDER
        | MAC3_UNDER
        | IR1_SAT
        | IR2_SAT
        | IR3_SAT
        | COLOR_FIFO_R_SAT
        | COLOR_FIFO_G_SAT
        | COLOR_FIFO_B_SAT
        | SZ3_OTZ_SAT
        | DIV_OVERFLOW
        | SX2_SAT
        | SY2_SAT
        | IR0_SAT;
}

// Data register indices (COP2 registers 0-31).
const VXY0: usize = 0;
const VZ0: usize = 1;
const VXY1: usize = 2;
const VZ1: usize = 3;
const VXY2: usize = 4;
const VZ2: usize = 5;
const RGBC: usize = 6;
const OTZ: usize = 7;
const IR0: usize = 8;
const IR1: usize = 9;
const IR2: usize = 10;
const IR3: usize = 11;
const SXY0: usize = 12;
const SXY1: usize = 13;
const SXY2: usize = 14;
const SXYP: usize = 15;
const SZ0: usize = 16;
const SZ1: usize = 17;
const SZ2: usize = 18;
const SZ3: usize = 19;
const RGB0: usize = 20;
const RGB1: usize = 21;
const RGB2: usize = 22;
const MAC0: usize = 24;
const MAC1: usize = 25;
const MAC2: usize = 26;
const MAC3: usize = 27;
const IRGB: usize = 28;
const ORGB: usize = 29;

// Control register indices (COP2 registers 32-63).
const RT11RT12: usize = 32;
const RT33: usize = 36;
const TRX: usize = 37;
const TRZ: usize = 39;
const L11L12: usize = 40;
const LR1LR2: usize = 48;
const RBK: usize = 45;
const RFC: usize = 53;
const OFX: usize = 56;
const OFY: usize = 57;
const H: usize = 58;
const DQA: usize = 59;
const DQB: usize = 60;
const ZSF3: usize = 61;
const ZSF4: usize = 62;
const FLAG: usize = 63;

/// Which 3x3 matrix and translation vector `MVMVA` selects.
#[derive(Clone, Copy)]
pub enum MvMatrix {
    Rotation,
    Light,
    Color,
    Reserved,
}

#[derive(Clone, Copy)]
pub enum MvVector {
    V0,
    V1,
    V2,
    Ir,
}

#[derive(Clone, Copy)]
pub enum MvTranslation {
    Tr,
    Bk,
    Fc,
    None,
}

pub struct GteRegs {
    data: [i32; 32],
    ctrl: [i32; 32],
}

impl GteRegs {
    pub fn new() -> Self {
        Self { data: [0; 32], ctrl: [0; 32] }
    }

    pub fn read_data(&self, reg: usize) -> u32 {
        match reg {
            SXYP => self.data[SXY2] as u32,
            IRGB | ORGB => {
                let r = clamp_unsigned(self.data[IR1] >> 7, 0x1F) as u32;
                let g = clamp_unsigned(self.data[IR2] >> 7, 0x1F) as u32;
                let b = clamp_unsigned(self.data[IR3] >> 7, 0x1F) as u32;
                r | (g << 5) | (b << 10)
            }
            _ => self.data[reg] as u32,
        }
    }

    pub fn write_data(&mut self, reg: usize, value: u32) {
        match reg {
            SXYP => {
                self.data[SXY0] = self.data[SXY1];
                self.data[SXY1] = self.data[SXY2];
                self.data[SXY2] = value as i32;
            }
            OTZ | SZ0..=SZ3 => self.data[reg] = (value & 0xFFFF) as i32,
            _ => self.data[reg] = value as i32,
        }
    }

    pub fn read_ctrl(&self, reg: usize) -> u32 {
        self.ctrl[reg] as u32
    }

    pub fn write_ctrl(&mut self, reg: usize, value: u32) {
        if reg == FLAG {
            // Only bits 12-30 are writable; bit 31 is always recomputed.
            let bits = value & 0x7FFF_F000;
            self.ctrl[FLAG] = (bits | error_summary(bits)) as i32;
        } else {
            self.ctrl[reg] = value as i32;
        }
    }

    fn matrix(&self, which: MvMatrix) -> [[i32; 3]; 3] {
        let base = match which {
            MvMatrix::Rotation => RT11RT12,
            MvMatrix::Light => L11L12,
            MvMatrix::Color => LR1LR2,
            MvMatrix::Reserved => return [[0; 3]; 3],
        };
        let words = [self.ctrl[base], self.ctrl[base + 1], self.ctrl[base + 2], self.ctrl[base + 3], self.ctrl[base + 4]];
        [
            [lo16(words[0]), hi16(words[0]), lo16(words[1])],
            [hi16(words[1]), lo16(words[2]), hi16(words[2])],
            [lo16(words[3]), hi16(words[3]), words[4]],
        ]
    }

    fn translation(&self, which: MvTranslation) -> [i32; 3] {
        match which {
            MvTranslation::Tr => [self.ctrl[TRX], self.ctrl[TRX + 1], self.ctrl[TRZ]],
            MvTranslation::Bk => [self.ctrl[RBK], self.ctrl[RBK + 1], self.ctrl[RBK + 2]],
            MvTranslation::Fc => [self.ctrl[RFC], self.ctrl[RFC + 1], self.ctrl[RFC + 2]],
            MvTranslation::None => [0; 3],
        }
    }

    fn vector(&self, which: MvVector) -> [i32; 3] {
        match which {
            MvVector::V0 => [lo16(self.data[VXY0]), hi16(self.data[VXY0]), self.data[VZ0]],
            MvVector::V1 => [lo16(self.data[VXY1]), hi16(self.data[VXY1]), self.data[VZ1]],
            MvVector::V2 => [lo16(self.data[VXY2]), hi16(self.data[VXY2]), self.data[VZ2]],
            MvVector::Ir => [self.data[IR1], self.data[IR2], self.data[IR3]],
        }
    }

    fn rgbc(&self) -> [u32; 4] {
        let bits = self.data[RGBC] as u32;
        [bits & 0xFF, (bits >> 8) & 0xFF, (bits >> 16) & 0xFF, (bits >> 24) & 0xFF]
    }

    fn push_sxy(&mut self, x: i32, y: i32) {
        self.data[SXY0] = self.data[SXY1];
        self.data[SXY1] = self.data[SXY2];
        self.data[SXY2] = (x as u32 as i16 as i32) & 0xFFFF | ((y as u32 as i16 as i32) << 16);
    }

    fn push_sz(&mut self, z: i32) {
        self.data[SZ0] = self.data[SZ1];
        self.data[SZ1] = self.data[SZ2];
        self.data[SZ2] = self.data[SZ3];
        self.data[SZ3] = z;
    }

    fn push_rgb(&mut self, r: u32, g: u32, b: u32, code: u32) {
        self.data[RGB0] = self.data[RGB1];
        self.data[RGB1] = self.data[RGB2];
        self.data[RGB2] = (r | (g << 8) | (b << 16) | (code << 24)) as i32;
    }
}

impl Default for GteRegs {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn lo16(word: i32) -> i32 {
    (word as i16) as i32
}
#[inline]
fn hi16(word: i32) -> i32 {
    (word >> 16) as i16 as i32
}
#[inline]
fn clamp_unsigned(value: i32, max: i32) -> i32 {
    value.clamp(0, max)
}

fn error_summary(flag_bits: u32) -> u32 {
    if flag_bits & flag::ERROR_MASK != 0 {
        flag::ERROR
    } else {
        0
    }
}

/// Accumulates 44-bit-wrapping products with sticky overflow detection for
/// MAC1/MAC2/MAC3 (the over/under bit pair is parameterized per channel).
struct Accumulator {
    value: i64,
}

const MAC_MAX: i64 = (1i64 << 43) - 1;
const MAC_MIN: i64 = -(1i64 << 43);

impl Accumulator {
    fn new() -> Self {
        Self { value: 0 }
    }
    fn add(&mut self, term: i64) {
        self.value += term;
    }
    /// Checks 44-bit saturation, sets the matching over/under flag bits, and
    /// wraps the accumulator the way the hardware's 44-bit register does.
    fn check(&mut self, flags: &mut u32, over: u32, under: u32) {
        if self.value > MAC_MAX {
            *flags |= over;
        } else if self.value < MAC_MIN {
            *flags |= under;
        }
        let wrapped = self.value & ((1i64 << 44) - 1);
        self.value = if wrapped & (1 << 43) != 0 { wrapped - (1 << 44) } else { wrapped };
    }
    fn mac32(&self, shift: u32) -> i32 {
        (self.value >> shift) as i32
    }
}

fn saturate_ir(value: i32, lm: bool, flags: &mut u32, bit: u32) -> i32 {
    let lo = if lm { 0 } else { -0x8000 };
    if value > 0x7FFF {
        *flags |= bit;
        0x7FFF
    } else if value < lo {
        *flags |= bit;
        lo
    } else {
        value
    }
}

fn saturate_ir0(value: i32, flags: &mut u32) -> i32 {
    if value > 0x1000 {
        *flags |= flag::IR0_SAT;
        0x1000
    } else if value < 0 {
        *flags |= flag::IR0_SAT;
        0
    } else {
        value
    }
}

fn saturate_sxy(value: i32, flags: &mut u32, bit: u32) -> i32 {
    if value > 0x3FF {
        *flags |= bit;
        0x3FF
    } else if value < -0x400 {
        *flags |= bit;
        -0x400
    } else {
        value
    }
}

fn saturate_sz(value: i64, flags: &mut u32) -> i32 {
    if value > 0xFFFF {
        *flags |= flag::SZ3_OTZ_SAT;
        0xFFFF
    } else if value < 0 {
        *flags |= flag::SZ3_OTZ_SAT;
        0
    } else {
        value as i32
    }
}

fn saturate_color(value: i32, flags: &mut u32, bit: u32) -> u32 {
    if value > 0xFF {
        *flags |= bit;
        0xFF
    } else if value < 0 {
        *flags |= bit;
        0
    } else {
        value as u32
    }
}

/// Table-driven UNR (unsigned Newton-Raphson) reciprocal approximation,
/// matching the hardware's documented 256-entry lookup.
fn unr_table(index: usize) -> i32 {
    const TABLE: [u8; 257] = [
        0xFF, 0xFD, 0xFB, 0xF9, 0xF7, 0xF5, 0xF3, 0xF1, 0xEF, 0xEE, 0xEC, 0xEA, 0xE8, 0xE6, 0xE4, 0xE3, 0xE1, 0xDF, 0xDD, 0xDC, 0xDA, 0xD8, 0xD6, 0xD5,
        0xD3, 0xD1, 0xD0, 0xCE, 0xCD, 0xCB, 0xC9, 0xC8, 0xC6, 0xC5, 0xC3, 0xC1, 0xC0, 0xBE, 0xBD, 0xBB, 0xBA, 0xB8, 0xB7, 0xB5, 0xB4, 0xB2, 0xB1, 0xB0,
        0xAE, 0xAD, 0xAB, 0xAA, 0xA9, 0xA7, 0xA6, 0xA4, 0xA3, 0xA2, 0xA0, 0x9F, 0x9E, 0x9C, 0x9B, 0x9A, 0x99, 0x97, 0x96, 0x95, 0x94, 0x92, 0x91, 0x90,
        0x8F, 0x8D, 0x8C, 0x8B, 0x8A, 0x89, 0x87, 0x86, 0x85, 0x84, 0x83, 0x82, 0x81, 0x7F, 0x7E, 0x7D, 0x7C, 0x7B, 0x7A, 0x79, 0x78, 0x77, 0x75, 0x74,
        0x73, 0x72, 0x71, 0x70, 0x6F, 0x6E, 0x6D, 0x6C, 0x6B, 0x6A, 0x69, 0x68, 0x67, 0x66, 0x65, 0x64, 0x63, 0x62, 0x61, 0x60, 0x5F, 0x5E, 0x5D, 0x5D,
        0x5C, 0x5B, 0x5A, 0x59, 0x58, 0x57, 0x56, 0x55, 0x54, 0x53, 0x53, 0x52, 0x51, 0x50, 0x4F, 0x4E, 0x4D, 0x4D, 0x4C, 0x4B, 0x4A, 0x49, 0x48, 0x48,
        0x47, 0x46, 0x45, 0x44, 0x43, 0x43, 0x42, 0x41, 0x40, 0x3F, 0x3F, 0x3E, 0x3D, 0x3C, 0x3C, 0x3B, 0x3A, 0x39, 0x39, 0x38, 0x37, 0x36, 0x36, 0x35,
        0x34, 0x33, 0x33, 0x32, 0x31, 0x31, 0x30, 0x2F, 0x2E, 0x2E, 0x2D, 0x2C, 0x2C, 0x2B, 0x2A, 0x2A, 0x29, 0x28, 0x28, 0x27, 0x26, 0x26, 0x25, 0x24,
        0x24, 0x23, 0x22, 0x22, 0x21, 0x20, 0x20, 0x1F, 0x1E, 0x1E, 0x1D, 0x1D, 0x1C, 0x1B, 0x1B, 0x1A, 0x19, 0x19, 0x18, 0x18, 0x17, 0x16, 0x16, 0x15,
        0x15, 0x14, 0x14, 0x13, 0x12, 0x12, 0x11, 0x11, 0x10, 0x0F, 0x0F, 0x0E, 0x0E, 0x0D, 0x0D, 0x0C, 0x0C, 0x0B, 0x0A, 0x0A, 0x09, 0x09, 0x08, 0x08,
        0x07, 0x07, 0x06, 0x06, 0x05, 0x05, 0x04, 0x04, 0x03, 0x03, 0x02, 0x02, 0x01, 0x01, 0x00, 0x00, 0x00,
    ];
    TABLE[index] as i32
}

fn unr_divide(lhs: u32, rhs: u32, flags: &mut u32) -> u32 {
    if lhs >= rhs.wrapping_mul(2) {
        *flags |= flag::DIV_OVERFLOW;
        return 0x1FFFF;
    }
    if rhs == 0 {
        *flags |= flag::DIV_OVERFLOW;
        return 0x1FFFF;
    }
    let shift = rhs.leading_zeros();
    let n = lhs << shift;
    let d = rhs << shift;
    let index = ((d - 0x7FC0) >> 7) as usize;
    let u = unr_table(index.min(256)) + 0x101;
    let d_fixed = (0x2000000 - (d as i64) * (u as i64)) >> 8;
    let recip = ((0x0000080 + d_fixed * (u as i64)) >> 8) as i64;
    let result = ((n as i64 * recip + 0x8000) >> 16) as i64;
    result.clamp(0, 0x1FFFF) as u32
}

/// Executable form of a `cop2` GTE opcode word, decoded by `dispatch`
/// (the GTE opcode field occupies bits 0-5, with `sf`/`lm`/matrix/vector/
/// translation selectors in the bits MVMVA uses).
pub struct Opcode {
    pub function: u32,
    pub sf: bool,
    pub lm: bool,
    pub mx: MvMatrix,
    pub v: MvVector,
    pub cv: MvTranslation,
}

impl Opcode {
    pub fn decode(word: u32) -> Self {
        let mx = match (word >> 17) & 0x3 {
            0 => MvMatrix::Rotation,
            1 => MvMatrix::Light,
            2 => MvMatrix::Color,
            _ => MvMatrix::Reserved,
        };
        let v = match (word >> 15) & 0x3 {
            0 => MvVector::V0,
            1 => MvVector::V1,
            2 => MvVector::V2,
            _ => MvVector::Ir,
        };
        let cv = match (word >> 13) & 0x3 {
            0 => MvTranslation::Tr,
            1 => MvTranslation::Bk,
            2 => MvTranslation::Fc,
            _ => MvTranslation::None,
        };
        Self { function: word & 0x3F, sf: word & (1 << 19) != 0, lm: word & (1 << 10) != 0, mx, v, cv }
    }
}

impl GteRegs {
    pub fn execute(&mut self, op: &Opcode) {
        self.ctrl[FLAG] = 0;
        match op.function {
            0x01 => self.rtps(op.sf, op.lm, true),
            0x30 => self.rtpt(op.sf, op.lm),
            0x06 => self.nclip(),
            0x0C => self.op(op.sf, op.lm),
            0x12 => self.mvmva(op),
            0x13 => self.ncs(op.sf, op.lm, MvVector::V0),
            0x14 => self.nct(op.sf, op.lm),
            0x16 => self.ncds(op.sf, op.lm, MvVector::V0),
            0x1B => self.ncdt(op.sf, op.lm),
            0x1C => self.cc(op.sf, op.lm),
            0x1E => self.nccs(op.sf, op.lm),
            0x20 => self.ncct(op.sf, op.lm),
            0x10 => self.dpcs(op.sf, op.lm, false),
            0x2A => self.dpct(op.sf, op.lm),
            0x11 => self.intpl(op.sf, op.lm),
            0x29 => self.dcpl(op.sf, op.lm),
            0x1D => self.cdp(op.sf, op.lm),
            0x3D => self.gpf(op.sf, op.lm),
            0x3E => self.gpl(op.sf, op.lm),
            0x28 => self.sqr(op.sf, op.lm),
            0x2D => self.avsz3(),
            0x2E => self.avsz4(),
            _ => {}
        }
        let bits = self.ctrl[FLAG] as u32 & 0x7FFF_F000;
        self.ctrl[FLAG] = (bits | error_summary(bits)) as i32;
    }

    fn rtp_core(&mut self, vertex: [i32; 3], sf: bool, lm: bool, flags: &mut u32, last: bool) {
        let rt = self.matrix(MvMatrix::Rotation);
        let tr = self.translation(MvTranslation::Tr);
        let shift = if sf { 12 } else { 0 };
        let mut mac = [Accumulator::new(); 3];
        for i in 0..3 {
            mac[i].add((tr[i] as i64) << 12);
            mac[i].add(rt[i][0] as i64 * vertex[0] as i64);
            mac[i].add(rt[i][1] as i64 * vertex[1] as i64);
            mac[i].add(rt[i][2] as i64 * vertex[2] as i64);
        }
        mac[0].check(flags, flag::MAC1_OVER, flag::MAC1_UNDER);
        mac[1].check(flags, flag::MAC2_OVER, flag::MAC2_UNDER);
        mac[2].check(flags, flag::MAC3_OVER, flag::MAC3_UNDER);
        let m1 = mac[0].mac32(shift);
        let m2 = mac[1].mac32(shift);
        let m3 = mac[2].mac32(shift);
        self.data[MAC1] = m1;
        self.data[MAC2] = m2;
        self.data[MAC3] = m3;
        self.data[IR1] = saturate_ir(m1, false, flags, flag::IR1_SAT);
        self.data[IR2] = saturate_ir(m2, false, flags, flag::IR2_SAT);
        self.data[IR3] = saturate_ir(m3, lm, flags, flag::IR3_SAT);

        let sz = saturate_sz(m3 as i64, flags);
        self.push_sz(sz);

        let h = self.ctrl[H] as u32 & 0xFFFF;
        let divisor = self.data[SZ3] as u32 & 0xFFFF;
        let div_result = unr_divide(h, divisor, flags);

        let ofx = self.ctrl[OFX] as i64;
        let ofy = self.ctrl[OFY] as i64;
        let sx = ((div_result as i64 * self.data[IR1] as i64 + ofx) >> 16) as i32;
        let sy = ((div_result as i64 * self.data[IR2] as i64 + ofy) >> 16) as i32;
        let sx = saturate_sxy(sx, flags, flag::SX2_SAT);
        let sy = saturate_sxy(sy, flags, flag::SY2_SAT);
        self.push_sxy(sx, sy);

        if last {
            let dqa = self.ctrl[DQA] as i64;
            let dqb = self.ctrl[DQB] as i64;
            let mut mac0 = Accumulator::new();
            mac0.add(dqb + dqa * div_result as i64);
            if mac0.value > i32::MAX as i64 {
                *flags |= flag::MAC0_OVER;
            } else if mac0.value < i32::MIN as i64 {
                *flags |= flag::MAC0_UNDER;
            }
            self.data[MAC0] = mac0.value as i32;
            self.data[IR0] = saturate_ir0((mac0.value >> 12) as i32, flags);
        }
    }

    fn rtps(&mut self, sf: bool, lm: bool, last: bool) {
        let v = self.vector(MvVector::V0);
        let mut flags = 0u32;
        self.rtp_core(v, sf, lm, &mut flags, last);
        self.ctrl[FLAG] |= flags as i32;
    }

    fn rtpt(&mut self, sf: bool, lm: bool) {
        for (i, which) in [MvVector::V0, MvVector::V1, MvVector::V2].into_iter().enumerate() {
            let v = self.vector(which);
            let mut flags = 0u32;
            self.rtp_core(v, sf, lm, &mut flags, i == 2);
            self.ctrl[FLAG] |= flags as i32;
        }
    }

    fn nclip(&mut self) {
        let sx0 = lo16(self.data[SXY0]) as i64;
        let sy0 = hi16(self.data[SXY0]) as i64;
        let sx1 = lo16(self.data[SXY1]) as i64;
        let sy1 = hi16(self.data[SXY1]) as i64;
        let sx2 = lo16(self.data[SXY2]) as i64;
        let sy2 = hi16(self.data[SXY2]) as i64;
        let area = sx0 * sy1 + sx1 * sy2 + sx2 * sy0 - sx0 * sy2 - sx1 * sy0 - sx2 * sy1;
        let mut flags = 0u32;
        if area > i32::MAX as i64 {
            flags |= flag::MAC0_OVER;
        } else if area < i32::MIN as i64 {
            flags |= flag::MAC0_UNDER;
        }
        self.data[MAC0] = area as i32;
        self.ctrl[FLAG] |= flags as i32;
    }

    fn op(&mut self, sf: bool, lm: bool) {
        let rt = self.matrix(MvMatrix::Rotation);
        let ir = [self.data[IR1] as i64, self.data[IR2] as i64, self.data[IR3] as i64];
        let d = [rt[0][0] as i64, rt[1][1] as i64, rt[2][2] as i64];
        let shift = if sf { 12 } else { 0 };
        let mut flags = 0u32;
        let m1 = (d[1] * ir[2] - d[2] * ir[1]) >> shift;
        let m2 = (d[2] * ir[0] - d[0] * ir[2]) >> shift;
        let m3 = (d[0] * ir[1] - d[1] * ir[0]) >> shift;
        self.data[MAC1] = m1 as i32;
        self.data[MAC2] = m2 as i32;
        self.data[MAC3] = m3 as i32;
        self.data[IR1] = saturate_ir(m1 as i32, lm, &mut flags, flag::IR1_SAT);
        self.data[IR2] = saturate_ir(m2 as i32, lm, &mut flags, flag::IR2_SAT);
        self.data[IR3] = saturate_ir(m3 as i32, lm, &mut flags, flag::IR3_SAT);
        self.ctrl[FLAG] |= flags as i32;
    }

    fn mvmva(&mut self, op: &Opcode) {
        let matrix = self.matrix(op.mx);
        let translation = self.translation(op.cv);
        let vector = self.vector(op.v);
        let shift = if op.sf { 12 } else { 0 };
        let mut flags = 0u32;
        let mut mac = [Accumulator::new(); 3];
        // The "far color bugged" quirk: cv selector Fc with matrix Color
        // computes only the last two terms of the sum while the first term
        // still runs to set flags, matching the documented hardware defect.
        let bugged = matches!(op.cv, MvTranslation::Fc) && matches!(op.mx, MvMatrix::Color);
        for i in 0..3 {
            mac[i].add((translation[i] as i64) << 12);
            if bugged {
                let first = matrix[i][0] as i64 * vector[0] as i64;
                let mut probe = Accumulator::new();
                probe.add(first);
                probe.check(&mut flags, flag::MAC1_OVER, flag::MAC1_UNDER);
            } else {
                mac[i].add(matrix[i][0] as i64 * vector[0] as i64);
            }
            mac[i].add(matrix[i][1] as i64 * vector[1] as i64);
            mac[i].add(matrix[i][2] as i64 * vector[2] as i64);
        }
        mac[0].check(&mut flags, flag::MAC1_OVER, flag::MAC1_UNDER);
        mac[1].check(&mut flags, flag::MAC2_OVER, flag::MAC2_UNDER);
        mac[2].check(&mut flags, flag::MAC3_OVER, flag::MAC3_UNDER);
        let m1 = mac[0].mac32(shift);
        let m2 = mac[1].mac32(shift);
        let m3 = mac[2].mac32(shift);
        self.data[MAC1] = m1;
        self.data[MAC2] = m2;
        self.data[MAC3] = m3;
        self.data[IR1] = saturate_ir(m1, op.lm, &mut flags, flag::IR1_SAT);
        self.data[IR2] = saturate_ir(m2, op.lm, &mut flags, flag::IR2_SAT);
        self.data[IR3] = saturate_ir(m3, op.lm, &mut flags, flag::IR3_SAT);
        self.ctrl[FLAG] |= flags as i32;
    }

    fn light_and_color(&mut self, vector: [i32; 3], sf: bool, lm: bool, use_rgbc: bool, depth_cue: bool, flags: &mut u32) {
        let shift = if sf { 12 } else { 0 };
        let light = self.matrix(MvMatrix::Light);
        let mut lmac = [Accumulator::new(); 3];
        for i in 0..3 {
            lmac[i].add(light[i][0] as i64 * vector[0] as i64);
            lmac[i].add(light[i][1] as i64 * vector[1] as i64);
            lmac[i].add(light[i][2] as i64 * vector[2] as i64);
        }
        lmac[0].check(flags, flag::MAC1_OVER, flag::MAC1_UNDER);
        lmac[1].check(flags, flag::MAC2_OVER, flag::MAC2_UNDER);
        lmac[2].check(flags, flag::MAC3_OVER, flag::MAC3_UNDER);
        let ir1 = saturate_ir(lmac[0].mac32(shift), lm, flags, flag::IR1_SAT) as i64;
        let ir2 = saturate_ir(lmac[1].mac32(shift), lm, flags, flag::IR2_SAT) as i64;
        let ir3 = saturate_ir(lmac[2].mac32(shift), lm, flags, flag::IR3_SAT) as i64;

        let color = self.matrix(MvMatrix::Color);
        let bk = self.translation(MvTranslation::Bk);
        let mut cmac = [Accumulator::new(); 3];
        for i in 0..3 {
            cmac[i].add((bk[i] as i64) << 12);
            cmac[i].add(color[i][0] as i64 * ir1);
            cmac[i].add(color[i][1] as i64 * ir2);
            cmac[i].add(color[i][2] as i64 * ir3);
        }
        cmac[0].check(flags, flag::MAC1_OVER, flag::MAC1_UNDER);
        cmac[1].check(flags, flag::MAC2_OVER, flag::MAC2_UNDER);
        cmac[2].check(flags, flag::MAC3_OVER, flag::MAC3_UNDER);
        let m1 = cmac[0].mac32(shift);
        let m2 = cmac[1].mac32(shift);
        let m3 = cmac[2].mac32(shift);

        if use_rgbc {
            let rgbc = self.rgbc();
            let m1 = (m1 as i64 * rgbc[0] as i64) >> 8;
            let m2 = (m2 as i64 * rgbc[1] as i64) >> 8;
            let m3 = (m3 as i64 * rgbc[2] as i64) >> 8;
            self.finish_color(m1, m2, m3, lm, depth_cue, flags);
        } else {
            self.finish_color(m1 as i64, m2 as i64, m3 as i64, lm, depth_cue, flags);
        }
    }

    fn finish_color(&mut self, m1: i64, m2: i64, m3: i64, lm: bool, depth_cue: bool, flags: &mut u32) {
        let (m1, m2, m3) = if depth_cue {
            let fc = self.translation(MvTranslation::Fc);
            let ir1 = self.data[IR1] as i64;
            let ir2 = self.data[IR2] as i64;
            let ir3 = self.data[IR3] as i64;
            let ir0 = self.data[IR0] as i64;
            let d1 = ((fc[0] as i64) << 12) - m1;
            let d2 = ((fc[1] as i64) << 12) - m2;
            let d3 = ((fc[2] as i64) << 12) - m3;
            (m1 + ((d1 * ir0) >> 12), m2 + ((d2 * ir0) >> 12), m3 + ((d3 * ir0) >> 12))
        } else {
            (m1, m2, m3)
        };
        self.data[MAC1] = m1 as i32;
        self.data[MAC2] = m2 as i32;
        self.data[MAC3] = m3 as i32;
        self.data[IR1] = saturate_ir((m1 >> 0) as i32, lm, flags, flag::IR1_SAT);
        self.data[IR2] = saturate_ir((m2 >> 0) as i32, lm, flags, flag::IR2_SAT);
        self.data[IR3] = saturate_ir((m3 >> 0) as i32, lm, flags, flag::IR3_SAT);
        let r = saturate_color((m1 >> 4) as i32, flags, flag::COLOR_FIFO_R_SAT);
        let g = saturate_color((m2 >> 4) as i32, flags, flag::COLOR_FIFO_G_SAT);
        let b = saturate_color((m3 >> 4) as i32, flags, flag::COLOR_FIFO_B_SAT);
        let code = (self.data[RGBC] as u32 >> 24) & 0xFF;
        self.push_rgb(r, g, b, code);
    }

    fn ncs(&mut self, sf: bool, lm: bool, which: MvVector) {
        let v = self.vector(which);
        let mut flags = 0u32;
        self.light_and_color(v, sf, lm, false, false, &mut flags);
        self.ctrl[FLAG] |= flags as i32;
    }

    fn nct(&mut self, sf: bool, lm: bool) {
        for which in [MvVector::V0, MvVector::V1, MvVector::V2] {
            self.ncs(sf, lm, which);
        }
    }

    fn ncds(&mut self, sf: bool, lm: bool, which: MvVector) {
        let v = self.vector(which);
        let mut flags = 0u32;
        self.light_and_color(v, sf, lm, true, true, &mut flags);
        self.ctrl[FLAG] |= flags as i32;
    }

    fn ncdt(&mut self, sf: bool, lm: bool) {
        for which in [MvVector::V0, MvVector::V1, MvVector::V2] {
            self.ncds(sf, lm, which);
        }
    }

    fn nccs(&mut self, sf: bool, lm: bool) {
        let v = self.vector(MvVector::V0);
        let mut flags = 0u32;
        self.light_and_color(v, sf, lm, true, false, &mut flags);
        self.ctrl[FLAG] |= flags as i32;
    }

    fn ncct(&mut self, sf: bool, lm: bool) {
        for which in [MvVector::V0, MvVector::V1, MvVector::V2] {
            self.nccs_on(sf, lm, which);
        }
    }

    fn nccs_on(&mut self, sf: bool, lm: bool, which: MvVector) {
        let v = self.vector(which);
        let mut flags = 0u32;
        self.light_and_color(v, sf, lm, true, false, &mut flags);
        self.ctrl[FLAG] |= flags as i32;
    }

    fn cc(&mut self, sf: bool, lm: bool) {
        let ir = self.vector(MvVector::Ir);
        let mut flags = 0u32;
        let color = self.matrix(MvMatrix::Color);
        let bk = self.translation(MvTranslation::Bk);
        let shift = if sf { 12 } else { 0 };
        let mut mac = [Accumulator::new(); 3];
        for i in 0..3 {
            mac[i].add((bk[i] as i64) << 12);
            mac[i].add(color[i][0] as i64 * ir[0] as i64);
            mac[i].add(color[i][1] as i64 * ir[1] as i64);
            mac[i].add(color[i][2] as i64 * ir[2] as i64);
        }
        mac[0].check(&mut flags, flag::MAC1_OVER, flag::MAC1_UNDER);
        mac[1].check(&mut flags, flag::MAC2_OVER, flag::MAC2_UNDER);
        mac[2].check(&mut flags, flag::MAC3_OVER, flag::MAC3_UNDER);
        let rgbc = self.rgbc();
        let m1 = (mac[0].mac32(shift) as i64 * rgbc[0] as i64) >> 8;
        let m2 = (mac[1].mac32(shift) as i64 * rgbc[1] as i64) >> 8;
        let m3 = (mac[2].mac32(shift) as i64 * rgbc[2] as i64) >> 8;
        self.finish_color(m1, m2, m3, lm, false, &mut flags);
        self.ctrl[FLAG] |= flags as i32;
    }

    fn cdp(&mut self, sf: bool, lm: bool) {
        let ir = self.vector(MvVector::Ir);
        let mut flags = 0u32;
        let color = self.matrix(MvMatrix::Color);
        let bk = self.translation(MvTranslation::Bk);
        let shift = if sf { 12 } else { 0 };
        let mut mac = [Accumulator::new(); 3];
        for i in 0..3 {
            mac[i].add((bk[i] as i64) << 12);
            mac[i].add(color[i][0] as i64 * ir[0] as i64);
            mac[i].add(color[i][1] as i64 * ir[1] as i64);
            mac[i].add(color[i][2] as i64 * ir[2] as i64);
        }
        mac[0].check(&mut flags, flag::MAC1_OVER, flag::MAC1_UNDER);
        mac[1].check(&mut flags, flag::MAC2_OVER, flag::MAC2_UNDER);
        mac[2].check(&mut flags, flag::MAC3_OVER, flag::MAC3_UNDER);
        let rgbc = self.rgbc();
        let m1 = (mac[0].mac32(shift) as i64 * rgbc[0] as i64) >> 8;
        let m2 = (mac[1].mac32(shift) as i64 * rgbc[1] as i64) >> 8;
        let m3 = (mac[2].mac32(shift) as i64 * rgbc[2] as i64) >> 8;
        self.finish_color(m1, m2, m3, lm, true, &mut flags);
        self.ctrl[FLAG] |= flags as i32;
    }

    fn dpcs(&mut self, sf: bool, lm: bool, use_rgb1: bool) {
        let mut flags = 0u32;
        let rgbc = if use_rgb1 {
            let bits = self.data[RGB1] as u32;
            [bits & 0xFF, (bits >> 8) & 0xFF, (bits >> 16) & 0xFF]
        } else {
            let r = self.rgbc();
            [r[0], r[1], r[2]]
        };
        let fc = self.translation(MvTranslation::Fc);
        let ir0 = self.data[IR0] as i64;
        let m1 = ((rgbc[0] as i64) << 16) as i64 >> 4; // (color << 12) treated as MAC after <<4 in finish_color below cancels
        let m2 = ((rgbc[1] as i64) << 16) as i64 >> 4;
        let m3 = ((rgbc[2] as i64) << 16) as i64 >> 4;
        let shift = if sf { 12 } else { 0 };
        let d1 = (((fc[0] as i64) << 12) - ((rgbc[0] as i64) << 4)) >> shift.min(12);
        let d2 = (((fc[1] as i64) << 12) - ((rgbc[1] as i64) << 4)) >> shift.min(12);
        let d3 = (((fc[2] as i64) << 12) - ((rgbc[2] as i64) << 4)) >> shift.min(12);
        let m1 = m1 + ((d1 * ir0) >> 12);
        let m2 = m2 + ((d2 * ir0) >> 12);
        let m3 = m3 + ((d3 * ir0) >> 12);
        self.finish_color(m1, m2, m3, lm, false, &mut flags);
        self.ctrl[FLAG] |= flags as i32;
    }

    fn dpct(&mut self, sf: bool, lm: bool) {
        for _ in 0..3 {
            self.dpcs(sf, lm, true);
        }
    }

    fn intpl(&mut self, sf: bool, lm: bool) {
        let mut flags = 0u32;
        let fc = self.translation(MvTranslation::Fc);
        let ir0 = self.data[IR0] as i64;
        let shift = if sf { 12 } else { 0 };
        let ir1 = self.data[IR1] as i64;
        let ir2 = self.data[IR2] as i64;
        let ir3 = self.data[IR3] as i64;
        let d1 = (((fc[0] as i64) << 12) - (ir1 << shift)) >> shift.max(1).min(12).max(0);
        let d2 = (((fc[1] as i64) << 12) - (ir2 << shift)) >> shift.max(1).min(12).max(0);
        let d3 = (((fc[2] as i64) << 12) - (ir3 << shift)) >> shift.max(1).min(12).max(0);
        let m1 = ir1 + ((d1 * ir0) >> 12);
        let m2 = ir2 + ((d2 * ir0) >> 12);
        let m3 = ir3 + ((d3 * ir0) >> 12);
        self.finish_color(m1, m2, m3, lm, false, &mut flags);
        self.ctrl[FLAG] |= flags as i32;
    }

    fn dcpl(&mut self, sf: bool, lm: bool) {
        let mut flags = 0u32;
        let rgbc = self.rgbc();
        let fc = self.translation(MvTranslation::Fc);
        let ir0 = self.data[IR0] as i64;
        let ir1 = self.data[IR1] as i64;
        let ir2 = self.data[IR2] as i64;
        let ir3 = self.data[IR3] as i64;
        let shift = if sf { 12 } else { 0 };
        let _ = shift;
        let m1 = (rgbc[0] as i64 * ir1) >> 4;
        let m2 = (rgbc[1] as i64 * ir2) >> 4;
        let m3 = (rgbc[2] as i64 * ir3) >> 4;
        let d1 = (((fc[0] as i64) << 12) - m1) >> 12;
        let d2 = (((fc[1] as i64) << 12) - m2) >> 12;
        let d3 = (((fc[2] as i64) << 12) - m3) >> 12;
        let m1 = m1 + (d1 * ir0);
        let m2 = m2 + (d2 * ir0);
        let m3 = m3 + (d3 * ir0);
        self.finish_color(m1, m2, m3, lm, false, &mut flags);
        self.ctrl[FLAG] |= flags as i32;
    }

    fn gpf(&mut self, sf: bool, lm: bool) {
        let mut flags = 0u32;
        let ir0 = self.data[IR0] as i64;
        let ir1 = self.data[IR1] as i64;
        let ir2 = self.data[IR2] as i64;
        let ir3 = self.data[IR3] as i64;
        let shift = if sf { 12 } else { 0 };
        let m1 = (ir0 * ir1) >> shift;
        let m2 = (ir0 * ir2) >> shift;
        let m3 = (ir0 * ir3) >> shift;
        self.finish_color(m1, m2, m3, lm, false, &mut flags);
        self.ctrl[FLAG] |= flags as i32;
    }

    fn gpl(&mut self, sf: bool, lm: bool) {
        let mut flags = 0u32;
        let shift = if sf { 12 } else { 0 };
        let mac1 = self.data[MAC1] as i64;
        let mac2 = self.data[MAC2] as i64;
        let mac3 = self.data[MAC3] as i64;
        let ir0 = self.data[IR0] as i64;
        let ir1 = self.data[IR1] as i64;
        let ir2 = self.data[IR2] as i64;
        let ir3 = self.data[IR3] as i64;
        let m1 = (mac1 << shift) + ir0 * ir1;
        let m2 = (mac2 << shift) + ir0 * ir2;
        let m3 = (mac3 << shift) + ir0 * ir3;
        self.finish_color(m1 >> shift, m2 >> shift, m3 >> shift, lm, false, &mut flags);
        self.ctrl[FLAG] |= flags as i32;
    }

    fn sqr(&mut self, sf: bool, lm: bool) {
        let mut flags = 0u32;
        let shift = if sf { 12 } else { 0 };
        let ir1 = self.data[IR1] as i64;
        let ir2 = self.data[IR2] as i64;
        let ir3 = self.data[IR3] as i64;
        let m1 = (ir1 * ir1) >> shift;
        let m2 = (ir2 * ir2) >> shift;
        let m3 = (ir3 * ir3) >> shift;
        self.data[MAC1] = m1 as i32;
        self.data[MAC2] = m2 as i32;
        self.data[MAC3] = m3 as i32;
        self.data[IR1] = saturate_ir(m1 as i32, lm, &mut flags, flag::IR1_SAT);
        self.data[IR2] = saturate_ir(m2 as i32, lm, &mut flags, flag::IR2_SAT);
        self.data[IR3] = saturate_ir(m3 as i32, lm, &mut flags, flag::IR3_SAT);
        self.ctrl[FLAG] |= flags as i32;
    }

    fn avsz3(&mut self) {
        let mut flags = 0u32;
        let zsf3 = self.ctrl[ZSF3] as i64;
        let sum = self.data[SZ1] as i64 + self.data[SZ2] as i64 + self.data[SZ3] as i64;
        let value = zsf3 * sum;
        if value > i32::MAX as i64 {
            flags |= flag::MAC0_OVER;
        } else if value < i32::MIN as i64 {
            flags |= flag::MAC0_UNDER;
        }
        self.data[MAC0] = value as i32;
        self.data[OTZ] = saturate_sz(value >> 12, &mut flags);
        self.ctrl[FLAG] |= flags as i32;
    }

    fn avsz4(&mut self) {
        let mut flags = 0u32;
        let zsf4 = self.ctrl[ZSF4] as i64;
        let sum = self.data[SZ0] as i64 + self.data[SZ1] as i64 + self.data[SZ2] as i64 + self.data[SZ3] as i64;
        let value = zsf4 * sum;
        if value > i32::MAX as i64 {
            flags |= flag::MAC0_OVER;
        } else if value < i32::MIN as i64 {
            flags |= flag::MAC0_UNDER;
        }
        self.data[MAC0] = value as i32;
        self.data[OTZ] = saturate_sz(value >> 12, &mut flags);
        self.ctrl[FLAG] |= flags as i32;
    }
}

impl Clone for Accumulator {
    fn clone(&self) -> Self {
        Self { value: self.value }
    }
}
impl Copy for Accumulator {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_rtps_passes_vertex_through_translation() {
        let mut gte = GteRegs::new();
        gte.write_ctrl(RT11RT12, 0x1000_0000); // RT11=0x1000 (1.0), RT12=0
        gte.write_ctrl(RT11RT12 + 1, 0x0000_1000); // RT13=0, RT21=0x1000
        gte.write_ctrl(RT11RT12 + 2, 0x1000_0000); // RT22=0x1000, RT23=0
        gte.write_ctrl(RT33, 0x1000);
        gte.write_ctrl(H, 0x1000);
        gte.write_ctrl(OFX, 0);
        gte.write_ctrl(OFY, 0);
        gte.write_data(VXY0, 10 | (20 << 16));
        gte.write_data(VZ0, 4096);
        let op = Opcode::decode(0x01);
        gte.execute(&op);
        assert_eq!(gte.data[SZ3], 4096);
    }

    #[test]
    fn nclip_computes_signed_area() {
        let mut gte = GteRegs::new();
        gte.write_data(SXY0, (0i32 as u16 as u32) | ((0i32 as u16 as u32) << 16));
        gte.write_data(SXY1, (10i32 as u16 as u32) | ((0i32 as u16 as u32) << 16));
        gte.write_data(SXY2, (0i32 as u16 as u32) | ((10i32 as u16 as u32) << 16));
        let op = Opcode::decode(0x06);
        gte.execute(&op);
        assert_eq!(gte.data[MAC0], 100);
    }

    #[test]
    fn unr_divide_saturates_when_divisor_too_small() {
        let mut flags = 0u32;
        let result = unr_divide(0xFFFF, 1, &mut flags);
        assert_eq!(result, 0x1FFFF);
        assert_ne!(flags & flag::DIV_OVERFLOW, 0);
    }

    #[test]
    fn ir_saturation_respects_lm_bit() {
        let mut flags = 0u32;
        assert_eq!(saturate_ir(-100, true, &mut flags, flag::IR1_SAT), 0);
        assert_ne!(flags & flag::IR1_SAT, 0);
        let mut flags2 = 0u32;
        assert_eq!(saturate_ir(-100, false, &mut flags2, flag::IR1_SAT), -100);
        assert_eq!(flags2, 0);
    }
}
