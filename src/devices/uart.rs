//! 16550-style UART.
//!
//! The register file is a byte array guarded by a single mutex. A background
//! thread performs blocking one-byte reads of host stdin and deposits them
//! into RHR under the lock, waiting on a condition variable while the guest
//! has not yet consumed the previous byte. Reference register map:
//! <http://byterunner.com/16550.html>.

use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

pub const UART_BASE: u64 = 0x1000_0000;
pub const UART_SIZE: u64 = 0x100;

// Register offsets.
const RHR: u64 = 0; // receive holding (read)
const THR: u64 = 0; // transmit holding (write)
const IER: u64 = 1; // interrupt enable
const ISR: u64 = 2; // interrupt status (read)
const FCR: u64 = 2; // FIFO control (write)
const LCR: u64 = 3; // line control
const MCR: u64 = 4; // modem control
const LSR: u64 = 5; // line status

pub const LSR_RX: u8 = 0x01;
pub const LSR_TX: u8 = 0x20;
const IER_RX_ENABLE: u8 = 0x01;
const IER_THR_EMPTY: u8 = 0x02;

struct UartRegs {
    reg: [u8; 8],
    /// Transmit-empty interrupt latched by a THR write.
    thre_pending: bool,
    /// One-shot interrupt flag consumed by the bus tick. The PLIC latches
    /// it into its pending word, so a raise is never lost while masked.
    interrupting: bool,
}

struct Shared {
    regs: Mutex<UartRegs>,
    /// Signalled when the guest drains RHR, so the reader thread may
    /// deposit the next byte.
    rx_free: Condvar,
}

pub struct Uart {
    shared: Arc<Shared>,
}

impl Uart {
    pub fn new() -> Self {
        let mut reg = [0u8; 8];
        reg[LSR as usize] = LSR_TX;
        Self {
            shared: Arc::new(Shared {
                regs: Mutex::new(UartRegs {
                    reg,
                    thre_pending: false,
                    interrupting: false,
                }),
                rx_free: Condvar::new(),
            }),
        }
    }

    /// Spawn the blocking stdin reader thread. The thread is detached; it
    /// exits on EOF and its raw-mode guard restores the terminal state.
    pub fn spawn_input_thread(&self) {
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("uart-input".to_string())
            .spawn(move || {
                let _raw = RawModeGuard::new();
                let mut stdin = io::stdin();
                let mut buf = [0u8; 1];
                loop {
                    match stdin.read(&mut buf) {
                        Ok(1) => {
                            let mut regs = shared.regs.lock().unwrap();
                            while regs.reg[LSR as usize] & LSR_RX != 0 {
                                regs = shared.rx_free.wait(regs).unwrap();
                            }
                            regs.reg[RHR as usize] = buf[0];
                            regs.reg[LSR as usize] |= LSR_RX;
                            regs.interrupting = true;
                        }
                        Ok(_) => break, // EOF
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(_) => break,
                    }
                }
            })
            .expect("failed to spawn uart input thread");
    }

    /// Deposit a byte as if it arrived from the host. Drops the byte when
    /// RHR is still full (the thread path blocks instead).
    pub fn push_input(&self, byte: u8) {
        let mut regs = self.shared.regs.lock().unwrap();
        if regs.reg[LSR as usize] & LSR_RX == 0 {
            regs.reg[RHR as usize] = byte;
            regs.reg[LSR as usize] |= LSR_RX;
            regs.interrupting = true;
        }
    }

    /// Consume the one-shot interrupt flag. The bus polls this each tick
    /// and forwards a raise to the PLIC; the flag only fires when the
    /// matching enable bit in IER is set.
    pub fn take_interrupt(&self) -> bool {
        let mut regs = self.shared.regs.lock().unwrap();
        if regs.interrupting && Self::interrupt_id(&regs) != 0 {
            regs.interrupting = false;
            true
        } else {
            false
        }
    }

    fn interrupt_id(regs: &UartRegs) -> u8 {
        let ier = regs.reg[IER as usize];
        if ier & IER_RX_ENABLE != 0 && regs.reg[LSR as usize] & LSR_RX != 0 {
            return 0x04; // received data available
        }
        if ier & IER_THR_EMPTY != 0 && regs.thre_pending {
            return 0x02; // transmitter holding register empty
        }
        0
    }

    pub fn load(&self, offset: u64, size: u8) -> u64 {
        if size != 8 {
            return 0;
        }
        let mut regs = self.shared.regs.lock().unwrap();
        match offset {
            RHR => {
                let byte = regs.reg[RHR as usize];
                regs.reg[LSR as usize] &= !LSR_RX;
                self.shared.rx_free.notify_one();
                byte as u64
            }
            ISR => {
                let id = Self::interrupt_id(&regs);
                if id == 0x02 {
                    regs.thre_pending = false;
                }
                // Bit 0 low means "interrupt pending" on a 16550.
                if id != 0 {
                    id as u64
                } else {
                    0x01
                }
            }
            IER | LCR | MCR | LSR | 6 | 7 => regs.reg[offset as usize] as u64,
            _ => 0,
        }
    }

    pub fn store(&self, offset: u64, size: u8, value: u64) {
        if size != 8 {
            return;
        }
        let byte = value as u8;
        let mut regs = self.shared.regs.lock().unwrap();
        match offset {
            THR => {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                let _ = out.write_all(&[byte]);
                let _ = out.flush();
                // The byte is transmitted instantly, so THR is empty again.
                regs.reg[LSR as usize] |= LSR_TX;
                regs.thre_pending = true;
                if regs.reg[IER as usize] & IER_THR_EMPTY != 0 {
                    regs.interrupting = true;
                }
            }
            FCR => {
                if byte & 0x02 != 0 {
                    regs.reg[LSR as usize] &= !LSR_RX;
                    self.shared.rx_free.notify_one();
                }
            }
            IER | LCR | MCR | 6 | 7 => regs.reg[offset as usize] = byte,
            _ => {}
        }
    }
}

impl Default for Uart {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard putting the controlling terminal into raw mode for the
/// lifetime of the reader thread.
struct RawModeGuard {
    original: Option<libc::termios>,
}

impl RawModeGuard {
    fn new() -> Self {
        use std::os::unix::io::AsRawFd;

        let fd = io::stdin().as_raw_fd();
        // SAFETY: plain termios syscalls on a file descriptor we own.
        unsafe {
            let mut original: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut original) != 0 {
                // Not a terminal (pipe, CI); leave the stream alone.
                return Self { original: None };
            }
            let mut raw = original;
            raw.c_lflag &= !(libc::ICANON | libc::ECHO);
            raw.c_cc[libc::VMIN] = 1;
            raw.c_cc[libc::VTIME] = 0;
            libc::tcsetattr(fd, libc::TCSANOW, &raw);
            Self {
                original: Some(original),
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        if let Some(original) = self.original {
            let fd = io::stdin().as_raw_fd();
            // SAFETY: restoring the attributes captured in new().
            unsafe {
                libc::tcsetattr(fd, libc::TCSANOW, &original);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_sets_and_read_clears_data_ready() {
        let uart = Uart::new();
        uart.push_input(b'x');
        assert_eq!(uart.load(LSR, 8) & LSR_RX as u64, LSR_RX as u64);
        assert_eq!(uart.load(RHR, 8), b'x' as u64);
        assert_eq!(uart.load(LSR, 8) & LSR_RX as u64, 0);
    }

    #[test]
    fn rx_interrupt_requires_enable() {
        let uart = Uart::new();
        uart.push_input(b'a');
        // Gated by IER: the raise stays parked until receive interrupts
        // are enabled.
        assert!(!uart.take_interrupt());
        uart.store(IER, 8, IER_RX_ENABLE as u64);
        assert!(uart.take_interrupt());
        // One-shot: consumed until the next event.
        assert!(!uart.take_interrupt());
    }

    #[test]
    fn thre_interrupt_after_transmit() {
        let uart = Uart::new();
        uart.store(IER, 8, IER_THR_EMPTY as u64);
        uart.store(THR, 8, b'\n' as u64);
        assert!(uart.take_interrupt());
        // ISR read reports transmit-empty and clears it.
        assert_eq!(uart.load(ISR, 8), 0x02);
        assert_eq!(uart.load(ISR, 8), 0x01);
        assert!(!uart.take_interrupt());
    }

    #[test]
    fn transmitter_always_reports_empty() {
        let uart = Uart::new();
        assert_eq!(uart.load(LSR, 8) & LSR_TX as u64, LSR_TX as u64);
        uart.store(THR, 8, b'.' as u64);
        assert_eq!(uart.load(LSR, 8) & LSR_TX as u64, LSR_TX as u64);
    }

    #[test]
    fn input_thread_handshake() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let uart = Arc::new(Uart::new());
        let done = Arc::new(AtomicBool::new(false));

        // Emulate the reader thread's deposit-wait loop with a second byte
        // arriving while the first is still unread.
        let producer = {
            let uart = Arc::clone(&uart);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for b in [b'1', b'2'] {
                    let mut regs = uart.shared.regs.lock().unwrap();
                    while regs.reg[LSR as usize] & LSR_RX != 0 {
                        regs = uart.shared.rx_free.wait(regs).unwrap();
                    }
                    regs.reg[RHR as usize] = b;
                    regs.reg[LSR as usize] |= LSR_RX;
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        // Consume both bytes from the "guest" side.
        let mut got = Vec::new();
        for _ in 0..200 {
            if uart.load(LSR, 8) & LSR_RX as u64 != 0 {
                got.push(uart.load(RHR, 8) as u8);
            }
            if got.len() == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        producer.join().unwrap();
        assert_eq!(got, vec![b'1', b'2']);
        assert!(done.load(Ordering::SeqCst));
    }
}
