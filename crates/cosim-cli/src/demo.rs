//! Built-in CPU model and platform used when no module library is given.

use std::io::Write;

use cosim_bridge::{Executor, QuantumExit};
use cosim_mem::{MmioHandler, PendingIrqs, Response, TargetCtx};

pub const RAM_SIZE: u64 = 16 * 1024 * 1024;
pub const UART_BASE: u64 = 0x1000_0000;
pub const UART_LEN: u64 = 0x100;
/// Writing a line number here raises that interrupt line.
pub const DOORBELL: u64 = UART_BASE + 0x10;

/// Transmit-only UART: byte writes at offset 0 go to stdout.
pub struct Uart<W> {
    out: W,
}

impl<W: Write + Send> Uart<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> MmioHandler for Uart<W> {
    fn read(&mut self, _offset: u64, data: &mut [u8], _ctx: &mut TargetCtx<'_>) -> Response {
        // Transmitter is always ready.
        data.fill(0);
        Response::Ok
    }

    fn write(&mut self, offset: u64, data: &[u8], ctx: &mut TargetCtx<'_>) -> Response {
        match offset {
            0 => match self.out.write_all(data).and_then(|()| self.out.flush()) {
                Ok(()) => Response::Ok,
                Err(err) => {
                    tracing::warn!("uart write failed: {err}");
                    Response::AddressError
                }
            },
            0x10 => ctx.raise_irq(data.first().copied().map_or(0, u64::from), 1),
            _ => Response::AddressError,
        }
    }
}

/// A toy CPU: prints a banner and rings the doorbell, then each quantum stores and verifies one
/// word in RAM (and in the DMI window when one is configured) before yielding.
pub struct DemoCpu {
    pub dmi_base: Option<u64>,
    pub irqs: PendingIrqs,
}

impl DemoCpu {
    /// `false` as soon as one byte is refused.
    fn print(&self, exec: &Executor, text: &str) -> bool {
        text.bytes()
            .all(|byte| exec.write(UART_BASE, vec![byte]) == Response::Ok)
    }

    fn check(&self, exec: &Executor, address: u64, value: u32) -> bool {
        exec.write_u32(address, value) == Response::Ok && exec.read_u32(address) == Some(value)
    }
}

impl cosim_bridge::CpuModel for DemoCpu {
    fn run(self, exec: &Executor) {
        if !self.print(exec, "cosim demo: hello\n") {
            tracing::error!(uart = UART_BASE, "demo console is not reachable");
            exec.request_stop();
            return;
        }
        let doorbell = exec.write(DOORBELL, vec![1u8]);
        if doorbell != Response::Ok {
            tracing::warn!(?doorbell, "demo doorbell write failed");
        }
        for (line, value) in self.irqs.take_all() {
            tracing::info!(line, value, "demo received interrupt");
        }
        let mut quantum: u32 = 0;
        loop {
            let ram_ok = self.check(exec, 0x100 + u64::from(quantum % 64) * 4, quantum);
            let dmi_ok = self
                .dmi_base
                .map_or(true, |base| self.check(exec, base + u64::from(quantum % 64) * 4, !quantum));
            if !(ram_ok && dmi_ok) {
                tracing::error!(quantum, ram_ok, dmi_ok, "demo memory check failed");
                exec.request_stop();
                return;
            }
            tracing::debug!(quantum, now_ns = exec.now_ns(), "demo quantum done");
            quantum = quantum.wrapping_add(1);
            if exec.end_of_quantum() == QuantumExit::Stopped {
                break;
            }
        }
    }
}
