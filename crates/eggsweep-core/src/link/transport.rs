//! Byte transport abstraction under the serial links
//!
//! Links read and write through [`Transport`] halves produced by a
//! [`TransportFactory`], so the same worker code runs over a real serial
//! port or an in-memory pipe in tests. The factory is also the reconnect
//! hook: after a transport failure the reader worker simply opens a fresh
//! pair.

use std::io;
use std::time::Duration;

use crate::config::LinkConfig;
use crate::{Error, Result};

/// One direction of a byte-duplex channel
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

impl<T> Transport for T
where
    T: io::Read + io::Write + Send,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(self, buf)
    }
}

/// Read half and write half of a freshly opened channel
pub type TransportPair = (Box<dyn Transport>, Box<dyn Transport>);

/// Opens (and re-opens) the byte channel for a link
pub trait TransportFactory: Send {
    fn open(&mut self) -> Result<TransportPair>;
}

impl<F> TransportFactory for F
where
    F: FnMut() -> Result<TransportPair> + Send,
{
    fn open(&mut self) -> Result<TransportPair> {
        self()
    }
}

/// Serial read timeout; bounds how long the reader worker blocks per loop
const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Factory opening the configured serial device
///
/// The port is cloned into separate read and write handles so the two
/// workers never contend on one descriptor.
pub fn serial_factory(config: &LinkConfig) -> impl TransportFactory {
    let port = config.port.clone();
    let baudrate = config.baudrate;
    move || -> Result<TransportPair> {
        let writer = serialport::new(&port, baudrate)
            .timeout(SERIAL_READ_TIMEOUT)
            .open()
            .map_err(|e| Error::Disconnected(format!("cannot open {}: {}", port, e)))?;
        let reader = writer
            .try_clone()
            .map_err(|e| Error::Disconnected(format!("cannot clone {}: {}", port, e)))?;
        Ok((Box::new(reader), Box::new(writer)))
    }
}
