//! Z80 instruction interpreter.
//!
//! This is a harness-grade decoder: instruction-granular, enough opcode
//! coverage to drive the guest protocol and test scenarios this crate
//! targets, but it does not claim cycle-exact timing or full undocumented
//! flag fidelity across the whole table. The CPU never touches memory or
//! I/O directly; every access goes through [`CpuBus`], which the host
//! (`VirtualMachine`) implements.

use crate::registers::{flags, CpuRegisters, InterruptMode};

/// The six bus operations a Z80 issues: three memory-request variants and
/// three I/O-request variants. A `VirtualMachine` implements this trait and
/// is handed to [`Cpu::clock`] for the duration of one instruction.
pub trait CpuBus {
    /// Opcode fetch (M1 cycle).
    fn mreq_m1(&mut self, addr: u16) -> u8;
    /// Memory read.
    fn mreq_rd(&mut self, addr: u16) -> u8;
    /// Memory write.
    fn mreq_wr(&mut self, addr: u16, data: u8);
    /// Interrupt-acknowledge fetch; no device drives a vector in this VM.
    fn iorq_m1(&mut self) -> u8 {
        0x00
    }
    /// I/O port read.
    fn iorq_rd(&mut self, port: u16) -> u8;
    /// I/O port write.
    fn iorq_wr(&mut self, port: u16, data: u8);
}

/// The Z80 CPU: register file plus the fetch/decode/execute loop.
pub struct Cpu {
    pub regs: CpuRegisters,
    irq_pending: bool,
    nmi_pending: bool,
    /// `EI` delays interrupt acceptance until after the *next* instruction.
    ei_delay: bool,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            regs: CpuRegisters::new(),
            irq_pending: false,
            nmi_pending: false,
            ei_delay: false,
        }
    }

    pub fn reset(&mut self) {
        self.regs.reset();
        self.irq_pending = false;
        self.nmi_pending = false;
        self.ei_delay = false;
    }

    /// Raise the maskable interrupt line. Acceptance is deferred to the
    /// start of the next instruction and gated on IFF1.
    pub fn pulse_int(&mut self) {
        self.irq_pending = true;
    }

    /// Raise the non-maskable interrupt line.
    pub fn pulse_nmi(&mut self) {
        self.nmi_pending = true;
    }

    /// Execute one Z80 instruction, honoring any pending interrupt first.
    pub fn clock(&mut self, bus: &mut impl CpuBus) {
        if self.nmi_pending {
            self.nmi_pending = false;
            self.regs.halted = false;
            self.regs.iff2 = self.regs.iff1;
            self.regs.iff1 = false;
            self.call(bus, 0x0066);
            self.regs.t_states += 11;
            self.regs.m_cycles += 2;
            return;
        }

        if self.irq_pending && self.regs.iff1 && !self.ei_delay {
            self.irq_pending = false;
            self.regs.halted = false;
            self.regs.iff1 = false;
            self.regs.iff2 = false;
            let _vector = bus.iorq_m1();
            match self.regs.im {
                InterruptMode::Mode0 | InterruptMode::Mode1 => {
                    self.call(bus, 0x0038);
                    self.regs.t_states += 13;
                    self.regs.m_cycles += 2;
                }
                InterruptMode::Mode2 => {
                    // No device drives a vector in this VM; fall back to the
                    // mode-1 entry point rather than reading garbage memory.
                    self.call(bus, 0x0038);
                    self.regs.t_states += 19;
                    self.regs.m_cycles += 3;
                }
            }
            return;
        }
        self.ei_delay = false;

        if self.regs.halted {
            self.regs.t_states += 4;
            self.regs.m_cycles += 1;
            self.regs.instruction_period = 4;
            return;
        }

        let start_t = self.regs.t_states;
        let opcode = self.fetch_m1(bus);
        self.execute(bus, opcode);
        self.regs.instruction_period = (self.regs.t_states - start_t) as u32;
    }

    fn fetch_m1(&mut self, bus: &mut impl CpuBus) -> u8 {
        let addr = self.regs.pc;
        self.regs.pc = self.regs.pc.wrapping_add(1);
        self.regs.bump_r();
        self.regs.m_cycles += 1;
        self.regs.t_states += 4;
        bus.mreq_m1(addr)
    }

    fn fetch_byte(&mut self, bus: &mut impl CpuBus) -> u8 {
        let addr = self.regs.pc;
        self.regs.pc = self.regs.pc.wrapping_add(1);
        self.regs.m_cycles += 1;
        self.regs.t_states += 3;
        bus.mreq_rd(addr)
    }

    fn fetch_word(&mut self, bus: &mut impl CpuBus) -> u16 {
        let lo = self.fetch_byte(bus);
        let hi = self.fetch_byte(bus);
        u16::from_le_bytes([lo, hi])
    }

    fn read_mem(&mut self, bus: &mut impl CpuBus, addr: u16) -> u8 {
        self.regs.m_cycles += 1;
        self.regs.t_states += 3;
        bus.mreq_rd(addr)
    }

    fn write_mem(&mut self, bus: &mut impl CpuBus, addr: u16, data: u8) {
        self.regs.m_cycles += 1;
        self.regs.t_states += 3;
        bus.mreq_wr(addr, data);
    }

    fn push_word(&mut self, bus: &mut impl CpuBus, v: u16) {
        let [lo, hi] = v.to_le_bytes();
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        self.write_mem(bus, self.regs.sp, hi);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        self.write_mem(bus, self.regs.sp, lo);
    }

    fn pop_word(&mut self, bus: &mut impl CpuBus) -> u16 {
        let lo = self.read_mem(bus, self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(1);
        let hi = self.read_mem(bus, self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(1);
        u16::from_le_bytes([lo, hi])
    }

    fn call(&mut self, bus: &mut impl CpuBus, target: u16) {
        let ret = self.regs.pc;
        self.push_word(bus, ret);
        self.regs.pc = target;
    }

    // -- 8-bit register access by the standard Z80 r-field encoding --

    fn get_r8(&mut self, bus: &mut impl CpuBus, r: u8) -> u8 {
        match r {
            0 => self.regs.b,
            1 => self.regs.c,
            2 => self.regs.d,
            3 => self.regs.e,
            4 => self.regs.h,
            5 => self.regs.l,
            6 => self.read_mem(bus, self.regs.hl()),
            7 => self.regs.a,
            _ => unreachable!(),
        }
    }

    fn set_r8(&mut self, bus: &mut impl CpuBus, r: u8, v: u8) {
        match r {
            0 => self.regs.b = v,
            1 => self.regs.c = v,
            2 => self.regs.d = v,
            3 => self.regs.e = v,
            4 => self.regs.h = v,
            5 => self.regs.l = v,
            6 => {
                let addr = self.regs.hl();
                self.write_mem(bus, addr, v);
            }
            7 => self.regs.a = v,
            _ => unreachable!(),
        }
    }

    fn get_rp(&self, p: u8) -> u16 {
        match p {
            0 => self.regs.bc(),
            1 => self.regs.de(),
            2 => self.regs.hl(),
            3 => self.regs.sp,
            _ => unreachable!(),
        }
    }

    fn set_rp(&mut self, p: u8, v: u16) {
        match p {
            0 => self.regs.set_bc(v),
            1 => self.regs.set_de(v),
            2 => self.regs.set_hl(v),
            3 => self.regs.sp = v,
            _ => unreachable!(),
        }
    }

    fn test_cc(&self, cc: u8) -> bool {
        match cc {
            0 => !self.regs.flag(flags::Z),
            1 => self.regs.flag(flags::Z),
            2 => !self.regs.flag(flags::C),
            3 => self.regs.flag(flags::C),
            4 => !self.regs.flag(flags::PV),
            5 => self.regs.flag(flags::PV),
            6 => !self.regs.flag(flags::S),
            7 => self.regs.flag(flags::S),
            _ => unreachable!(),
        }
    }

    fn parity(v: u8) -> bool {
        v.count_ones().is_multiple_of(2)
    }

    fn set_sz53(&mut self, v: u8) {
        self.regs.set_flag(flags::S, v & 0x80 != 0);
        self.regs.set_flag(flags::Z, v == 0);
        self.regs.set_flag(flags::F3, v & 0x08 != 0);
        self.regs.set_flag(flags::F5, v & 0x20 != 0);
    }

    fn alu_add8(&mut self, a: u8, b: u8, carry: u8) -> u8 {
        let result = a as u16 + b as u16 + carry as u16;
        let r = result as u8;
        self.set_sz53(r);
        self.regs.set_flag(flags::N, false);
        self.regs.set_flag(flags::C, result > 0xFF);
        self.regs
            .set_flag(flags::H, (a & 0x0F) + (b & 0x0F) + carry > 0x0F);
        let overflow = (a ^ b) & 0x80 == 0 && (a ^ r) & 0x80 != 0;
        self.regs.set_flag(flags::PV, overflow);
        r
    }

    fn alu_sub8(&mut self, a: u8, b: u8, carry: u8) -> u8 {
        let result = a as i16 - b as i16 - carry as i16;
        let r = result as u8;
        self.set_sz53(r);
        self.regs.set_flag(flags::N, true);
        self.regs.set_flag(flags::C, result < 0);
        self.regs
            .set_flag(flags::H, (a & 0x0F) as i16 - (b & 0x0F) as i16 - (carry as i16) < 0);
        let overflow = (a ^ b) & 0x80 != 0 && (a ^ r) & 0x80 != 0;
        self.regs.set_flag(flags::PV, overflow);
        r
    }

    fn alu_and(&mut self, a: u8, b: u8) -> u8 {
        let r = a & b;
        self.set_sz53(r);
        self.regs.set_flag(flags::H, true);
        self.regs.set_flag(flags::N, false);
        self.regs.set_flag(flags::C, false);
        self.regs.set_flag(flags::PV, Self::parity(r));
        r
    }

    fn alu_or(&mut self, a: u8, b: u8) -> u8 {
        let r = a | b;
        self.set_sz53(r);
        self.regs.set_flag(flags::H, false);
        self.regs.set_flag(flags::N, false);
        self.regs.set_flag(flags::C, false);
        self.regs.set_flag(flags::PV, Self::parity(r));
        r
    }

    fn alu_xor(&mut self, a: u8, b: u8) -> u8 {
        let r = a ^ b;
        self.set_sz53(r);
        self.regs.set_flag(flags::H, false);
        self.regs.set_flag(flags::N, false);
        self.regs.set_flag(flags::C, false);
        self.regs.set_flag(flags::PV, Self::parity(r));
        r
    }

    fn alu_inc(&mut self, v: u8) -> u8 {
        let r = v.wrapping_add(1);
        self.set_sz53(r);
        self.regs.set_flag(flags::H, v & 0x0F == 0x0F);
        self.regs.set_flag(flags::PV, v == 0x7F);
        self.regs.set_flag(flags::N, false);
        r
    }

    fn alu_dec(&mut self, v: u8) -> u8 {
        let r = v.wrapping_sub(1);
        self.set_sz53(r);
        self.regs.set_flag(flags::H, v & 0x0F == 0x00);
        self.regs.set_flag(flags::PV, v == 0x80);
        self.regs.set_flag(flags::N, true);
        r
    }

    fn add16(&mut self, a: u16, b: u16) -> u16 {
        let result = a as u32 + b as u32;
        self.regs.set_flag(flags::N, false);
        self.regs.set_flag(flags::C, result > 0xFFFF);
        self.regs
            .set_flag(flags::H, (a & 0x0FFF) + (b & 0x0FFF) > 0x0FFF);
        result as u16
    }

    fn execute(&mut self, bus: &mut impl CpuBus, opcode: u8) {
        match opcode {
            0x00 => self.t(4, 1),
            0x76 => {
                self.regs.halted = true;
                self.t(4, 1);
            }
            0xF3 => {
                self.regs.iff1 = false;
                self.regs.iff2 = false;
                self.t(4, 1);
            }
            0xFB => {
                self.regs.iff1 = true;
                self.regs.iff2 = true;
                self.ei_delay = true;
                self.t(4, 1);
            }
            0xC3 => {
                let nn = self.fetch_word(bus);
                self.regs.pc = nn;
            }
            0xC2 | 0xCA | 0xD2 | 0xDA | 0xE2 | 0xEA | 0xF2 | 0xFA => {
                let cc = (opcode >> 3) & 7;
                let nn = self.fetch_word(bus);
                if self.test_cc(cc) {
                    self.regs.pc = nn;
                }
            }
            0x18 => {
                let d = self.fetch_byte(bus) as i8;
                self.regs.pc = self.regs.pc.wrapping_add(d as u16);
                self.t(5, 1);
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let cc = (opcode >> 3) & 3;
                let d = self.fetch_byte(bus) as i8;
                if self.test_cc(cc) {
                    self.regs.pc = self.regs.pc.wrapping_add(d as u16);
                    self.t(5, 1);
                }
            }
            0xCD => {
                let nn = self.fetch_word(bus);
                self.call(bus, nn);
                self.t(7, 2);
            }
            0xC4 | 0xCC | 0xD4 | 0xDC | 0xE4 | 0xEC | 0xF4 | 0xFC => {
                let cc = (opcode >> 3) & 7;
                let nn = self.fetch_word(bus);
                if self.test_cc(cc) {
                    self.call(bus, nn);
                    self.t(7, 2);
                }
            }
            0xC9 => {
                let addr = self.pop_word(bus);
                self.regs.pc = addr;
            }
            0xC0 | 0xC8 | 0xD0 | 0xD8 | 0xE0 | 0xE8 | 0xF0 | 0xF8 => {
                let cc = (opcode >> 3) & 7;
                self.t(1, 1);
                if self.test_cc(cc) {
                    let addr = self.pop_word(bus);
                    self.regs.pc = addr;
                }
            }
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                let target = (opcode & 0x38) as u16;
                self.call(bus, target);
                self.t(4, 1);
            }
            0xC5 | 0xD5 | 0xE5 | 0xF5 => {
                let p = (opcode >> 4) & 3;
                let v = if p == 3 { self.regs.af() } else { self.get_rp(p) };
                self.push_word(bus, v);
                self.t(1, 1);
            }
            0xC1 | 0xD1 | 0xE1 | 0xF1 => {
                let p = (opcode >> 4) & 3;
                let v = self.pop_word(bus);
                if p == 3 {
                    self.regs.set_af(v);
                } else {
                    self.set_rp(p, v);
                }
            }
            0x01 | 0x11 | 0x21 | 0x31 => {
                let p = (opcode >> 4) & 3;
                let nn = self.fetch_word(bus);
                self.set_rp(p, nn);
            }
            0x09 | 0x19 | 0x29 | 0x39 => {
                let p = (opcode >> 4) & 3;
                let v = self.add16(self.regs.hl(), self.get_rp(p));
                self.regs.set_hl(v);
                self.t(7, 1);
            }
            0x03 | 0x13 | 0x23 | 0x33 => {
                let p = (opcode >> 4) & 3;
                let v = self.get_rp(p).wrapping_add(1);
                self.set_rp(p, v);
                self.t(2, 1);
            }
            0x0B | 0x1B | 0x2B | 0x3B => {
                let p = (opcode >> 4) & 3;
                let v = self.get_rp(p).wrapping_sub(1);
                self.set_rp(p, v);
                self.t(2, 1);
            }
            0x02 => {
                let addr = self.regs.bc();
                self.write_mem(bus, addr, self.regs.a);
            }
            0x12 => {
                let addr = self.regs.de();
                self.write_mem(bus, addr, self.regs.a);
            }
            0x0A => {
                let addr = self.regs.bc();
                self.regs.a = self.read_mem(bus, addr);
            }
            0x1A => {
                let addr = self.regs.de();
                self.regs.a = self.read_mem(bus, addr);
            }
            0x22 => {
                let addr = self.fetch_word(bus);
                let v = self.regs.hl();
                let [lo, hi] = v.to_le_bytes();
                self.write_mem(bus, addr, lo);
                self.write_mem(bus, addr.wrapping_add(1), hi);
            }
            0x2A => {
                let addr = self.fetch_word(bus);
                let lo = self.read_mem(bus, addr);
                let hi = self.read_mem(bus, addr.wrapping_add(1));
                self.regs.set_hl(u16::from_le_bytes([lo, hi]));
            }
            0x32 => {
                let addr = self.fetch_word(bus);
                self.write_mem(bus, addr, self.regs.a);
            }
            0x3A => {
                let addr = self.fetch_word(bus);
                self.regs.a = self.read_mem(bus, addr);
            }
            0x34 => {
                let addr = self.regs.hl();
                let v = self.read_mem(bus, addr);
                let r = self.alu_inc(v);
                self.write_mem(bus, addr, r);
            }
            0x35 => {
                let addr = self.regs.hl();
                let v = self.read_mem(bus, addr);
                let r = self.alu_dec(v);
                self.write_mem(bus, addr, r);
            }
            0x36 => {
                let n = self.fetch_byte(bus);
                let addr = self.regs.hl();
                self.write_mem(bus, addr, n);
            }
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x3C => {
                let r = (opcode >> 3) & 7;
                let v = self.get_r8(bus, r);
                let res = self.alu_inc(v);
                self.set_r8(bus, r, res);
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x3D => {
                let r = (opcode >> 3) & 7;
                let v = self.get_r8(bus, r);
                let res = self.alu_dec(v);
                self.set_r8(bus, r, res);
            }
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x3E => {
                let r = (opcode >> 3) & 7;
                let n = self.fetch_byte(bus);
                self.set_r8(bus, r, n);
            }
            0x07 => {
                let c = self.regs.a & 0x80 != 0;
                self.regs.a = self.regs.a.rotate_left(1);
                self.regs.set_flag(flags::C, c);
                self.regs.set_flag(flags::H, false);
                self.regs.set_flag(flags::N, false);
            }
            0x0F => {
                let c = self.regs.a & 0x01 != 0;
                self.regs.a = self.regs.a.rotate_right(1);
                self.regs.set_flag(flags::C, c);
                self.regs.set_flag(flags::H, false);
                self.regs.set_flag(flags::N, false);
            }
            0x17 => {
                let c_in = self.regs.flag(flags::C) as u8;
                let c_out = self.regs.a & 0x80 != 0;
                self.regs.a = (self.regs.a << 1) | c_in;
                self.regs.set_flag(flags::C, c_out);
                self.regs.set_flag(flags::H, false);
                self.regs.set_flag(flags::N, false);
            }
            0x1F => {
                let c_in = self.regs.flag(flags::C) as u8;
                let c_out = self.regs.a & 0x01 != 0;
                self.regs.a = (self.regs.a >> 1) | (c_in << 7);
                self.regs.set_flag(flags::C, c_out);
                self.regs.set_flag(flags::H, false);
                self.regs.set_flag(flags::N, false);
            }
            0x2F => {
                self.regs.a = !self.regs.a;
                self.regs.set_flag(flags::H, true);
                self.regs.set_flag(flags::N, true);
            }
            0x37 => {
                self.regs.set_flag(flags::C, true);
                self.regs.set_flag(flags::H, false);
                self.regs.set_flag(flags::N, false);
            }
            0x3F => {
                let c = self.regs.flag(flags::C);
                self.regs.set_flag(flags::H, c);
                self.regs.set_flag(flags::C, !c);
                self.regs.set_flag(flags::N, false);
            }
            0x08 => {
                std::mem::swap(&mut self.regs.a, &mut self.regs.a_prime);
                std::mem::swap(&mut self.regs.f, &mut self.regs.f_prime);
            }
            0xD9 => {
                std::mem::swap(&mut self.regs.b, &mut self.regs.b_prime);
                std::mem::swap(&mut self.regs.c, &mut self.regs.c_prime);
                std::mem::swap(&mut self.regs.d, &mut self.regs.d_prime);
                std::mem::swap(&mut self.regs.e, &mut self.regs.e_prime);
                std::mem::swap(&mut self.regs.h, &mut self.regs.h_prime);
                std::mem::swap(&mut self.regs.l, &mut self.regs.l_prime);
            }
            0xEB => {
                let de = self.regs.de();
                let hl = self.regs.hl();
                self.regs.set_de(hl);
                self.regs.set_hl(de);
            }
            0xE3 => {
                let addr = self.regs.sp;
                let lo = self.read_mem(bus, addr);
                let hi = self.read_mem(bus, addr.wrapping_add(1));
                let hl = self.regs.hl();
                let [hl_lo, hl_hi] = hl.to_le_bytes();
                self.write_mem(bus, addr, hl_lo);
                self.write_mem(bus, addr.wrapping_add(1), hl_hi);
                self.regs.set_hl(u16::from_le_bytes([lo, hi]));
                self.t(2, 1);
            }
            0xE9 => self.regs.pc = self.regs.hl(),
            0xF9 => {
                self.regs.sp = self.regs.hl();
                self.t(2, 1);
            }
            0xD3 => {
                let n = self.fetch_byte(bus) as u16;
                let port = (self.regs.a as u16) << 8 | n;
                bus.iorq_wr(port, self.regs.a);
                self.regs.m_cycles += 1;
                self.regs.t_states += 4;
            }
            0xDB => {
                let n = self.fetch_byte(bus) as u16;
                let port = (self.regs.a as u16) << 8 | n;
                self.regs.a = bus.iorq_rd(port);
                self.regs.m_cycles += 1;
                self.regs.t_states += 4;
            }
            // LD r,r' and HALT's slot (0x76) already handled above
            0x40..=0x7F => {
                let dst = (opcode >> 3) & 7;
                let src = opcode & 7;
                let v = self.get_r8(bus, src);
                self.set_r8(bus, dst, v);
            }
            0x80..=0x87 => {
                let v = self.get_r8(bus, opcode & 7);
                self.regs.a = self.alu_add8(self.regs.a, v, 0);
            }
            0x88..=0x8F => {
                let v = self.get_r8(bus, opcode & 7);
                let c = self.regs.flag(flags::C) as u8;
                self.regs.a = self.alu_add8(self.regs.a, v, c);
            }
            0x90..=0x97 => {
                let v = self.get_r8(bus, opcode & 7);
                self.regs.a = self.alu_sub8(self.regs.a, v, 0);
            }
            0x98..=0x9F => {
                let v = self.get_r8(bus, opcode & 7);
                let c = self.regs.flag(flags::C) as u8;
                self.regs.a = self.alu_sub8(self.regs.a, v, c);
            }
            0xA0..=0xA7 => {
                let v = self.get_r8(bus, opcode & 7);
                self.regs.a = self.alu_and(self.regs.a, v);
            }
            0xA8..=0xAF => {
                let v = self.get_r8(bus, opcode & 7);
                self.regs.a = self.alu_xor(self.regs.a, v);
            }
            0xB0..=0xB7 => {
                let v = self.get_r8(bus, opcode & 7);
                self.regs.a = self.alu_or(self.regs.a, v);
            }
            0xB8..=0xBF => {
                let v = self.get_r8(bus, opcode & 7);
                self.alu_sub8(self.regs.a, v, 0);
            }
            0xC6 => {
                let n = self.fetch_byte(bus);
                self.regs.a = self.alu_add8(self.regs.a, n, 0);
            }
            0xCE => {
                let n = self.fetch_byte(bus);
                let c = self.regs.flag(flags::C) as u8;
                self.regs.a = self.alu_add8(self.regs.a, n, c);
            }
            0xD6 => {
                let n = self.fetch_byte(bus);
                self.regs.a = self.alu_sub8(self.regs.a, n, 0);
            }
            0xDE => {
                let n = self.fetch_byte(bus);
                let c = self.regs.flag(flags::C) as u8;
                self.regs.a = self.alu_sub8(self.regs.a, n, c);
            }
            0xE6 => {
                let n = self.fetch_byte(bus);
                self.regs.a = self.alu_and(self.regs.a, n);
            }
            0xEE => {
                let n = self.fetch_byte(bus);
                self.regs.a = self.alu_xor(self.regs.a, n);
            }
            0xF6 => {
                let n = self.fetch_byte(bus);
                self.regs.a = self.alu_or(self.regs.a, n);
            }
            0xFE => {
                let n = self.fetch_byte(bus);
                self.alu_sub8(self.regs.a, n, 0);
            }
            0xCB => self.execute_cb(bus),
            0xED => self.execute_ed(bus),
            0xDD | 0xFD => {
                // Index-register prefixes are not decoded; treat as a NOP
                // and let the following byte decode normally.
                self.t(4, 1);
            }
            _ => self.t(4, 1),
        }
    }

    fn execute_cb(&mut self, bus: &mut impl CpuBus) {
        let opcode = self.fetch_byte(bus);
        let r = opcode & 7;
        let group = opcode >> 6;
        let bit = (opcode >> 3) & 7;
        match group {
            0 => {
                let v = self.get_r8(bus, r);
                let op = (opcode >> 3) & 7;
                let result = match op {
                    0 => {
                        let c = v & 0x80 != 0;
                        let res = v.rotate_left(1);
                        self.regs.set_flag(flags::C, c);
                        res
                    }
                    1 => {
                        let c = v & 0x01 != 0;
                        let res = v.rotate_right(1);
                        self.regs.set_flag(flags::C, c);
                        res
                    }
                    2 => {
                        let c_in = self.regs.flag(flags::C) as u8;
                        let c_out = v & 0x80 != 0;
                        let res = (v << 1) | c_in;
                        self.regs.set_flag(flags::C, c_out);
                        res
                    }
                    3 => {
                        let c_in = self.regs.flag(flags::C) as u8;
                        let c_out = v & 0x01 != 0;
                        let res = (v >> 1) | (c_in << 7);
                        self.regs.set_flag(flags::C, c_out);
                        res
                    }
                    4 => {
                        let c = v & 0x80 != 0;
                        let res = v << 1;
                        self.regs.set_flag(flags::C, c);
                        res
                    }
                    5 => {
                        let c = v & 0x01 != 0;
                        let res = (v >> 1) | (v & 0x80);
                        self.regs.set_flag(flags::C, c);
                        res
                    }
                    6 => {
                        let c = v & 0x80 != 0;
                        let res = (v << 1) | 1;
                        self.regs.set_flag(flags::C, c);
                        res
                    }
                    7 => {
                        let c = v & 0x01 != 0;
                        let res = v >> 1;
                        self.regs.set_flag(flags::C, c);
                        res
                    }
                    _ => unreachable!(),
                };
                self.regs.set_flag(flags::H, false);
                self.regs.set_flag(flags::N, false);
                self.regs.set_flag(flags::PV, Self::parity(result));
                self.set_sz53(result);
                self.set_r8(bus, r, result);
            }
            1 => {
                let v = self.get_r8(bus, r);
                let z = v & (1 << bit) == 0;
                self.regs.set_flag(flags::Z, z);
                self.regs.set_flag(flags::PV, z);
                self.regs.set_flag(flags::H, true);
                self.regs.set_flag(flags::N, false);
                self.regs.set_flag(flags::S, bit == 7 && !z);
            }
            2 => {
                let v = self.get_r8(bus, r);
                self.set_r8(bus, r, v & !(1 << bit));
            }
            3 => {
                let v = self.get_r8(bus, r);
                self.set_r8(bus, r, v | (1 << bit));
            }
            _ => unreachable!(),
        }
        self.regs.t_states += if r == 6 { 15 } else { 8 };
        self.regs.m_cycles += 2;
    }

    fn execute_ed(&mut self, bus: &mut impl CpuBus) {
        let opcode = self.fetch_byte(bus);
        match opcode {
            0x46 | 0x4E | 0x56 | 0x5E | 0x66 | 0x6E | 0x76 | 0x7E => {
                self.regs.im = match opcode {
                    0x56 | 0x76 => InterruptMode::Mode1,
                    0x5E | 0x7E => InterruptMode::Mode2,
                    _ => InterruptMode::Mode0,
                };
                self.t(8, 2);
            }
            0x47 => {
                self.regs.i = self.regs.a;
                self.t(9, 2);
            }
            0x4F => {
                self.regs.r = self.regs.a;
                self.t(9, 2);
            }
            0x57 => {
                self.regs.a = self.regs.i;
                self.set_sz53(self.regs.a);
                self.regs.set_flag(flags::PV, self.regs.iff2);
                self.regs.set_flag(flags::H, false);
                self.regs.set_flag(flags::N, false);
                self.t(9, 2);
            }
            0x5F => {
                self.regs.a = self.regs.r;
                self.set_sz53(self.regs.a);
                self.regs.set_flag(flags::PV, self.regs.iff2);
                self.regs.set_flag(flags::H, false);
                self.regs.set_flag(flags::N, false);
                self.t(9, 2);
            }
            0x42 | 0x52 | 0x62 | 0x72 => {
                let p = (opcode >> 4) & 3;
                let v = self.regs.hl() as i32
                    - self.get_rp(p) as i32
                    - self.regs.flag(flags::C) as i32;
                self.regs.set_flag(flags::N, true);
                self.regs.set_flag(flags::C, v < 0);
                self.regs.set_hl(v as u16);
                self.set_sz53((v as u16 & 0xFF) as u8);
                self.regs.set_flag(flags::Z, (v as u16) == 0);
                self.t(15, 2);
            }
            0x4A | 0x5A | 0x6A | 0x7A => {
                let p = (opcode >> 4) & 3;
                let v = self.regs.hl() as i32
                    + self.get_rp(p) as i32
                    + self.regs.flag(flags::C) as i32;
                self.regs.set_flag(flags::N, false);
                self.regs.set_flag(flags::C, v > 0xFFFF);
                self.regs.set_hl(v as u16);
                self.regs.set_flag(flags::Z, (v as u16) == 0);
                self.t(15, 2);
            }
            0x45 | 0x4D | 0x55 | 0x5D | 0x65 | 0x6D | 0x75 | 0x7D => {
                // RETN/RETI family: restore IFF1 from IFF2 and return.
                self.regs.iff1 = self.regs.iff2;
                let addr = self.pop_word(bus);
                self.regs.pc = addr;
                self.t(14, 4);
            }
            0xA0 | 0xA1 | 0xA8 | 0xA9 | 0xB0 | 0xB1 | 0xB8 | 0xB9 => {
                self.execute_ed_block(bus, opcode);
            }
            _ => self.t(8, 2),
        }
    }

    fn execute_ed_block(&mut self, bus: &mut impl CpuBus, opcode: u8) {
        let inc = opcode & 0x08 == 0;
        let repeat = opcode & 0x10 != 0;
        let is_compare = opcode & 0x01 == 0;
        loop {
            let hl = self.regs.hl();
            if is_compare {
                let v = self.read_mem(bus, hl);
                self.alu_sub8(self.regs.a, v, 0);
            } else {
                let v = self.read_mem(bus, hl);
                let de = self.regs.de();
                self.write_mem(bus, de, v);
                let de = if inc { de.wrapping_add(1) } else { de.wrapping_sub(1) };
                self.regs.set_de(de);
            }
            let hl = if inc { hl.wrapping_add(1) } else { hl.wrapping_sub(1) };
            self.regs.set_hl(hl);
            let bc = self.regs.bc().wrapping_sub(1);
            self.regs.set_bc(bc);
            self.regs.set_flag(flags::PV, bc != 0);
            self.regs.set_flag(flags::N, is_compare);
            self.t(16, 4);
            if !repeat || bc == 0 || (is_compare && self.regs.flag(flags::Z)) {
                break;
            }
        }
    }

    fn t(&mut self, t_states: u32, m_cycles: u64) {
        self.regs.t_states += t_states as u64;
        self.regs.m_cycles += m_cycles;
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct TestBus {
        mem: [u8; 0x10000],
        ports_out: HashMap<u16, u8>,
    }

    impl TestBus {
        fn new() -> Self {
            Self {
                mem: [0; 0x10000],
                ports_out: HashMap::new(),
            }
        }
        fn load(&mut self, at: u16, bytes: &[u8]) {
            for (i, b) in bytes.iter().enumerate() {
                self.mem[at as usize + i] = *b;
            }
        }
    }

    impl CpuBus for TestBus {
        fn mreq_m1(&mut self, addr: u16) -> u8 {
            self.mem[addr as usize]
        }
        fn mreq_rd(&mut self, addr: u16) -> u8 {
            self.mem[addr as usize]
        }
        fn mreq_wr(&mut self, addr: u16, data: u8) {
            self.mem[addr as usize] = data;
        }
        fn iorq_rd(&mut self, _port: u16) -> u8 {
            0xFF
        }
        fn iorq_wr(&mut self, port: u16, data: u8) {
            self.ports_out.insert(port & 0xFF, data);
        }
    }

    #[test]
    fn halt_sets_halted_flag() {
        let mut cpu = Cpu::new();
        let mut bus = TestBus::new();
        bus.load(0, &[0x76]);
        cpu.clock(&mut bus);
        assert!(cpu.regs.halted);
    }

    #[test]
    fn out_writes_accumulator_to_port() {
        let mut cpu = Cpu::new();
        let mut bus = TestBus::new();
        cpu.regs.a = 0x00;
        bus.load(0, &[0xD3, 0x01]);
        cpu.clock(&mut bus);
        assert_eq!(bus.ports_out.get(&0x01), Some(&0x00));
    }

    #[test]
    fn ld_immediate_and_add() {
        let mut cpu = Cpu::new();
        let mut bus = TestBus::new();
        bus.load(0, &[0x3E, 0x05, 0xC6, 0x03]);
        cpu.clock(&mut bus);
        assert_eq!(cpu.regs.a, 0x05);
        cpu.clock(&mut bus);
        assert_eq!(cpu.regs.a, 0x08);
    }

    #[test]
    fn jp_sets_pc() {
        let mut cpu = Cpu::new();
        let mut bus = TestBus::new();
        bus.load(0, &[0xC3, 0x00, 0x40]);
        cpu.clock(&mut bus);
        assert_eq!(cpu.regs.pc, 0x4000);
    }

    #[test]
    fn call_and_ret_round_trip_pc() {
        let mut cpu = Cpu::new();
        let mut bus = TestBus::new();
        cpu.regs.sp = 0xFFF0;
        bus.load(0, &[0xCD, 0x00, 0x40]);
        bus.load(0x4000, &[0xC9]);
        cpu.clock(&mut bus);
        assert_eq!(cpu.regs.pc, 0x4000);
        cpu.clock(&mut bus);
        assert_eq!(cpu.regs.pc, 0x0003);
    }

    #[test]
    fn pending_irq_is_deferred_one_instruction_after_ei() {
        let mut cpu = Cpu::new();
        let mut bus = TestBus::new();
        cpu.regs.sp = 0xFFF0;
        bus.load(0, &[0xFB, 0x00, 0x00]);
        cpu.pulse_int();
        cpu.clock(&mut bus); // EI
        assert_eq!(cpu.regs.pc, 0x0001);
        cpu.clock(&mut bus); // NOP, interrupt still deferred by ei_delay
        assert_eq!(cpu.regs.pc, 0x0002);
        cpu.clock(&mut bus); // interrupt now taken
        assert_eq!(cpu.regs.pc, 0x0038);
    }
}
