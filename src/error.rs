/// Errors reported by the register decoders, the drivers and the serial transport.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport could not deliver a reply (timeout, malformed frame, bus error).
    #[error("Communication error: {0}")]
    Communication(String),
    /// The device answered with fewer registers than the block requires.
    #[error("Short read - required={required} received={received}")]
    ShortRead { required: usize, received: usize },
    /// The device delivered more values than the configuration accounts for.
    #[error("Unexpected size - required={required} received={received}")]
    SizeMismatch { required: usize, received: usize },
    /// No device answered the connection probe.
    #[error("No device found on {device} after {attempts} attempts")]
    ConnectionNotFound { device: String, attempts: u8 },
    /// The CRC of a received frame does not match its content.
    #[error("Invalid checksum - calculated={calculated:#06X} received={received:#06X}")]
    Checksum { calculated: u16, received: u16 },
    /// The device answered with a Modbus exception code.
    #[error("Modbus exception code {0:#04X}")]
    Exception(u8),
    /// An I/O error, typically from the serial port communication.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// An error from the `serialport` crate.
    #[cfg(feature = "serialport")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
