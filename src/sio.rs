//! MC6850-style ACIA channel bound to a pair of file descriptors.
//!
//! Each channel is polled once per scheduler tick with a zero timeout so the
//! VM never blocks waiting on a guest terminal. Status/control registers
//! follow the MC6850 bit ordering exactly (spec §4.5).

use std::os::fd::{BorrowedFd, RawFd};

use rustix::event::{poll, PollFd, PollFlags};
use rustix::termios::{self, OptionalActions};
use tracing::{debug, warn};

/// Status register bits (`SR_*`).
pub mod sr {
    pub const RDRF: u8 = 0x01;
    pub const TDRE: u8 = 0x02;
    pub const DCD: u8 = 0x04;
    pub const CTS: u8 = 0x08;
    pub const FE: u8 = 0x10;
    pub const OVRN: u8 = 0x20;
    pub const PE: u8 = 0x40;
    pub const IRQ: u8 = 0x80;
}

/// Control register bits (`CR_*`).
pub mod cr {
    pub const IRQ: u8 = 0x80;
}

/// Sentinel for a detached endpoint.
pub const FD_NONE: RawFd = -1;

/// One MC6850-style ACIA channel.
pub struct SioChannel {
    name: &'static str,
    rx_fd: RawFd,
    tx_fd: RawFd,
    status: u8,
    control: u8,
    rx_data: u8,
    tx_data: u8,
    enabled: bool,
    /// Suppress bare `\r` on transmit (build-time flag for a web host, per spec §4.5).
    suppress_cr: bool,
}

impl SioChannel {
    pub fn new(name: &'static str, rx_fd: RawFd, tx_fd: RawFd) -> Self {
        Self {
            name,
            rx_fd,
            tx_fd,
            status: 0,
            control: 0,
            rx_data: 0,
            tx_data: 0,
            enabled: false,
            suppress_cr: false,
        }
    }

    pub fn with_suppress_cr(mut self, suppress: bool) -> Self {
        self.suppress_cr = suppress;
        self
    }

    /// Binds (or detaches) this channel's endpoints before a `reset`.
    pub fn attach(&mut self, rx_fd: RawFd, tx_fd: RawFd) {
        self.rx_fd = rx_fd;
        self.tx_fd = tx_fd;
    }

    pub fn rx_fd(&self) -> RawFd {
        self.rx_fd
    }

    pub fn tx_fd(&self) -> RawFd {
        self.tx_fd
    }

    /// Defaults any detached endpoint to stdin/stdout, puts attached TTYs
    /// into raw mode, and clears `enabled` (spec §4.5 lifecycle, §6 termios).
    pub fn reset(&mut self, default_rx: RawFd, default_tx: RawFd) {
        if self.rx_fd == FD_NONE {
            self.rx_fd = default_rx;
        }
        if self.tx_fd == FD_NONE {
            self.tx_fd = default_tx;
        }
        self.enabled = false;
        self.status = 0;
        self.control = 0;

        for fd in [self.rx_fd, self.tx_fd] {
            if fd != FD_NONE {
                if let Err(e) = set_raw_mode(fd) {
                    debug!(channel = self.name, fd, error = %e, "fd is not a TTY or raw-mode setup failed, ignoring");
                }
            }
        }
    }

    /// First-touch enable: models the guest's ACIA master-reset sequence.
    fn touch(&mut self) {
        if !self.enabled {
            self.status = sr::TDRE;
            self.enabled = true;
            debug!(channel = self.name, "ACIA channel enabled on first touch");
        }
    }

    pub fn rd_stat(&mut self) -> u8 {
        self.touch();
        self.status
    }

    pub fn wr_ctrl(&mut self, data: u8) {
        self.touch();
        self.control = data;
    }

    /// Reads the data register, translating DEL (`0x7F`) to backspace
    /// (`0x08`) per spec §4.5. Leaves status untouched if RDRF is clear, in
    /// which case the bus's floating `data` byte passes through unchanged
    /// (spec §8 invariant 6; first-touch-enable does not apply here, only to
    /// `rd_stat`/`wr_ctrl`).
    pub fn rd_data(&mut self, data: u8) -> u8 {
        if self.status & sr::RDRF != 0 {
            self.status &= !(sr::RDRF | sr::IRQ);
            return if self.rx_data == 0x7F { 0x08 } else { self.rx_data };
        }
        data
    }

    /// Writes the data register if TDRE is set; otherwise the byte is
    /// dropped (the guest is expected to poll TDRE first). First-touch-enable
    /// does not apply here, only to `rd_stat`/`wr_ctrl` (spec §4.5).
    pub fn wr_data(&mut self, data: u8) {
        if self.status & sr::TDRE != 0 {
            self.status &= !sr::TDRE;
            self.tx_data = if self.suppress_cr && data == b'\r' { 0 } else { data };
        }
    }

    /// Per-tick poll: services both endpoints with a zero timeout and
    /// returns `true` if an interrupt request should be raised this step.
    pub fn clock(&mut self) -> bool {
        if !self.enabled {
            return false;
        }

        if self.status & sr::RDRF == 0 && self.rx_fd >= 0 {
            if let Some(fd) = borrow(self.rx_fd) {
                let mut fds = [PollFd::new(&fd, PollFlags::IN | PollFlags::ERR | PollFlags::HUP)];
                if poll(&mut fds, Some(&rustix::event::Timespec::default())).is_ok()
                    && !fds[0].revents().is_empty()
                {
                    let mut buf = [0u8; 1];
                    match rustix::io::read(fd, &mut buf) {
                        Ok(1) => {
                            self.rx_data = buf[0];
                            self.status |= sr::RDRF | sr::IRQ;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(channel = self.name, error = %e, "rx read failed, byte dropped"),
                    }
                }
            }
        }

        if self.status & sr::TDRE == 0 && self.tx_fd >= 0 {
            if let Some(fd) = borrow(self.tx_fd) {
                let mut fds = [PollFd::new(&fd, PollFlags::OUT | PollFlags::ERR | PollFlags::HUP)];
                if poll(&mut fds, Some(&rustix::event::Timespec::default())).is_ok()
                    && !fds[0].revents().is_empty()
                {
                    match rustix::io::write(fd, &[self.tx_data]) {
                        Ok(_) => self.status |= sr::TDRE,
                        Err(e) => warn!(channel = self.name, error = %e, "tx write failed, byte dropped"),
                    }
                }
            }
        }

        self.status & sr::IRQ != 0 && self.control & cr::IRQ != 0
    }

    /// Direct synchronous write to `tx_fd`, bypassing buffering. Used by the
    /// MMU console-out doorbell and by shutdown's trailing newline.
    pub fn print(&self, data: u8) {
        if self.tx_fd < 0 {
            return;
        }
        if let Some(fd) = borrow(self.tx_fd) {
            if let Err(e) = rustix::io::write(fd, &[data]) {
                warn!(channel = self.name, error = %e, "console print failed");
            }
        }
    }
}

impl Drop for SioChannel {
    /// Each SIO channel emits a trailing newline to `tx_fd` on destruction
    /// (spec §4.7 lifecycle).
    fn drop(&mut self) {
        self.print(b'\n');
    }
}

fn borrow(fd: RawFd) -> Option<BorrowedFd<'static>> {
    if fd < 0 {
        return None;
    }
    // SAFETY: the caller (VirtualMachine) owns these descriptors for the
    // lifetime of the VM and never closes them out from under the channel.
    Some(unsafe { BorrowedFd::borrow_raw(fd) })
}

fn set_raw_mode(fd: RawFd) -> std::io::Result<()> {
    let borrowed = borrow(fd).expect("fd already checked non-negative");
    if !termios::isatty(borrowed) {
        return Ok(());
    }
    let mut t = termios::tcgetattr(borrowed)?;
    t.input_modes |= termios::InputModes::INLCR;
    t.input_modes -= termios::InputModes::IGNCR | termios::InputModes::ICRNL;
    t.output_modes |= termios::OutputModes::ONOCR;
    t.output_modes -= termios::OutputModes::OFILL;
    t.local_modes |= termios::LocalModes::ISIG;
    t.local_modes -= termios::LocalModes::ECHO
        | termios::LocalModes::ECHOE
        | termios::LocalModes::ECHOK
        | termios::LocalModes::ECHONL
        | termios::LocalModes::ICANON;
    termios::tcsetattr(borrowed, OptionalActions::Now, &t)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::{FromRawFd, IntoRawFd};
    use std::os::unix::net::UnixStream;

    /// Returns a pair of connected, ownership-transferred raw fds. The
    /// caller is responsible for reclaiming and closing both ends.
    fn socket_pair() -> (RawFd, RawFd) {
        let (a, b) = UnixStream::pair().unwrap();
        (a.into_raw_fd(), b.into_raw_fd())
    }

    #[test]
    fn first_touch_enable_sets_tdre_and_clears_rest() {
        let mut ch = SioChannel::new("test", FD_NONE, FD_NONE);
        assert_eq!(ch.rd_stat(), sr::TDRE);
    }

    #[test]
    fn rd_data_with_rdrf_clear_returns_the_floating_bus_byte_unchanged() {
        let mut ch = SioChannel::new("test", FD_NONE, FD_NONE);
        let before = ch.status;
        let v = ch.rd_data(0x5A);
        assert_eq!(v, 0x5A);
        assert_eq!(ch.status, before);
    }

    #[test]
    fn rd_data_does_not_trigger_first_touch_enable() {
        let mut ch = SioChannel::new("test", FD_NONE, FD_NONE);
        assert!(!ch.enabled);
        ch.rd_data(0x00);
        assert!(!ch.enabled);
        assert_eq!(ch.status, 0);
    }

    #[test]
    fn del_translates_to_backspace_on_read() {
        let mut ch = SioChannel::new("test", FD_NONE, FD_NONE);
        ch.rd_stat();
        ch.rx_data = 0x7F;
        ch.status |= sr::RDRF;
        assert_eq!(ch.rd_data(0x00), 0x08);
    }

    #[test]
    fn wr_data_is_dropped_when_tdre_clear() {
        let mut ch = SioChannel::new("test", FD_NONE, FD_NONE);
        ch.rd_stat();
        ch.status &= !sr::TDRE;
        ch.wr_data(0x41);
        assert_eq!(ch.tx_data, 0);
    }

    #[test]
    fn wr_data_does_not_trigger_first_touch_enable() {
        let mut ch = SioChannel::new("test", FD_NONE, FD_NONE);
        assert!(!ch.enabled);
        ch.wr_data(0x41);
        assert!(!ch.enabled);
        assert_eq!(ch.status, 0);
        assert_eq!(ch.tx_data, 0);
    }

    #[test]
    fn clock_reads_a_pending_byte_and_raises_irq_when_enabled() {
        let (ours, theirs) = socket_pair();
        let mut peer = unsafe { UnixStream::from_raw_fd(theirs) };
        peer.write_all(b"A").unwrap();

        let mut ch = SioChannel::new("test", ours, FD_NONE);
        ch.rd_stat();
        ch.wr_ctrl(cr::IRQ);
        let irq = ch.clock();
        assert!(irq);
        assert_eq!(ch.rx_data, b'A');

        drop(ch);
        drop(peer);
        let _ = unsafe { UnixStream::from_raw_fd(ours) };
    }

    #[test]
    fn clock_writes_tdre_clear_byte_to_peer() {
        let (ours, theirs) = socket_pair();
        let mut peer = unsafe { UnixStream::from_raw_fd(theirs) };

        let mut ch = SioChannel::new("test", FD_NONE, ours);
        ch.rd_stat();
        ch.wr_data(b'Z');
        ch.clock();

        let mut buf = [0u8; 1];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], b'Z');

        drop(ch);
        // Consume the trailing newline SioChannel's Drop writes on shutdown.
        let mut nl = [0u8; 1];
        let _ = peer.read_exact(&mut nl);
        let _ = unsafe { UnixStream::from_raw_fd(ours) };
    }
}
