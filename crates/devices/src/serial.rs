//! Byte-level serial transport.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};

/// The operations the balance driver needs from a serial port.
pub trait SerialLink: Send {
    /// Drop any bytes already waiting in the input buffer.
    fn clear_input(&mut self) -> std::io::Result<()>;

    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;

    /// Number of bytes ready to be read without blocking.
    fn bytes_waiting(&mut self) -> std::io::Result<usize>;

    /// Read up to `len` bytes that are already waiting.
    fn read_waiting(&mut self, len: usize) -> std::io::Result<Vec<u8>>;
}

/// A real port opened through the `serialport` crate.
pub struct SerialPortLink {
    port: Box<dyn SerialPort>,
}

impl SerialPortLink {
    pub fn open(path: &str, baud: u32, timeout: Duration) -> serialport::Result<Self> {
        let port = serialport::new(path, baud).timeout(timeout).open()?;
        Ok(Self { port })
    }
}

impl SerialLink for SerialPortLink {
    fn clear_input(&mut self) -> std::io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(std::io::Error::from)
    }

    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.port.write_all(frame)?;
        self.port.flush()
    }

    fn bytes_waiting(&mut self) -> std::io::Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(std::io::Error::from)
    }

    fn read_waiting(&mut self, len: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self.port.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}
