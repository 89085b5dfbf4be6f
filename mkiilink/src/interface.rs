use std::{
    io::{Read, Write},
    time::Duration,
};

use serialport::SerialPort;

use crate::{connection::Port, error::Error};

/// Wrapper around SerialPort where platform-specific modifications can be implemented.
pub struct Interface {
    pub serial_port: Box<dyn SerialPort>,
}

impl Interface {
    pub fn new(serial_port: Box<dyn SerialPort>) -> Self {
        Self { serial_port }
    }

    pub fn into_serial(self) -> Box<dyn SerialPort> {
        self.serial_port
    }

    pub fn serial_port(&self) -> &dyn SerialPort {
        self.serial_port.as_ref()
    }

    pub fn serial_port_mut(&mut self) -> &mut dyn SerialPort {
        self.serial_port.as_mut()
    }
}

// using `dyn SerialPort` as `dyn Read` requires trait upcasting
impl Read for Interface {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.serial_port.read(buf)
    }
}

impl Write for Interface {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.serial_port.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.serial_port.flush()
    }
}

impl Port for Interface {
    fn timeout(&self) -> Duration {
        self.serial_port.timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.serial_port.set_timeout(timeout)?;
        Ok(())
    }
}
