//! Blocking Modbus RTU register client using the `serialport` crate.

use crate::protocol::{Address, RegisterClient, Word, MINIMUM_DELAY, READ_HOLDING_REGISTERS};
use crate::{Error, Result};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

const EXCEPTION_FLAG: u8 = 0x80;
/// slave address, function code and byte count (or exception code)
const HEADER_LENGTH: usize = 3;
const CRC_LENGTH: usize = 2;

/// CRC-16/MODBUS (polynomial 0xA001 reflected, initial value 0xFFFF).
pub fn calc_crc(buffer: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in buffer {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn append_crc(buffer: &mut Vec<u8>) {
    let crc = calc_crc(buffer);
    buffer.extend_from_slice(&crc.to_le_bytes());
}

fn validate_checksum(frame: &[u8]) -> Result<()> {
    let (payload, crc) = frame.split_at(frame.len() - CRC_LENGTH);
    let calculated = calc_crc(payload);
    let received = u16::from_le_bytes([crc[0], crc[1]]);
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={:04X?} received={:04X?} frame={:02X?}",
            calculated,
            received,
            frame
        );
        return Err(Error::Checksum {
            calculated,
            received,
        });
    }
    Ok(())
}

/// Builds a "read holding registers" request frame.
pub fn read_request(slave: Address, address: u16, quantity: u16) -> Vec<u8> {
    let mut tx_buffer = Vec::with_capacity(8);
    tx_buffer.push(*slave);
    tx_buffer.push(READ_HOLDING_REGISTERS);
    tx_buffer.extend_from_slice(&address.to_be_bytes());
    tx_buffer.extend_from_slice(&quantity.to_be_bytes());
    append_crc(&mut tx_buffer);
    tx_buffer
}

/// Decodes the register values of a complete "read holding registers" reply frame.
pub fn decode_reply(slave: Address, frame: &[u8]) -> Result<Vec<Word>> {
    if frame.len() < HEADER_LENGTH + CRC_LENGTH {
        return Err(Error::Communication(format!(
            "Reply too short: {:02X?}",
            frame
        )));
    }
    validate_checksum(frame)?;
    if frame[0] != *slave {
        return Err(Error::Communication(format!(
            "Reply from slave {} instead of {}",
            frame[0], slave
        )));
    }
    if frame[1] == READ_HOLDING_REGISTERS | EXCEPTION_FLAG {
        return Err(Error::Exception(frame[2]));
    }
    if frame[1] != READ_HOLDING_REGISTERS {
        return Err(Error::Communication(format!(
            "Unexpected function code {:#04X}",
            frame[1]
        )));
    }
    let data = &frame[HEADER_LENGTH..frame.len() - CRC_LENGTH];
    if data.len() != frame[2] as usize || data.len() % 2 != 0 {
        return Err(Error::Communication(format!(
            "Invalid byte count {} for {} data bytes",
            frame[2],
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

#[derive(Debug)]
pub struct ModbusRtu {
    serial: Box<dyn serialport::SerialPort>,
    last_execution: Instant,
    delay: Duration,
}

impl ModbusRtu {
    /// Opens `port` with 9600 baud, 8N1 and the default timeout of 400ms.
    pub fn new(port: &str) -> Result<Self> {
        Ok(Self {
            serial: serialport::new(port, 9600)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(crate::protocol::DEFAULT_TIMEOUT)
                .open()?,
            last_execution: Instant::now(),
            delay: MINIMUM_DELAY,
        })
    }

    fn serial_await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            std::thread::sleep(time_until_delay_reached);
        }
    }

    fn send_bytes(&mut self, tx_buffer: &[u8]) -> Result<()> {
        // clear all incoming serial to avoid data collision
        loop {
            let pending = self.serial.bytes_to_read()?;
            if pending > 0 {
                log::trace!("Got {} pending bytes", pending);
                let mut buf: Vec<u8> = vec![0; 64];
                let received = self.serial.read(buf.as_mut_slice())?;
                log::trace!("Read {} pending bytes", received);
            } else {
                break;
            }
        }
        self.serial_await_delay();

        log::trace!("send_bytes: {:02X?}", tx_buffer);
        self.serial.write_all(tx_buffer)?;
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Vec<u8>> {
        let mut rx_buffer = vec![0; HEADER_LENGTH];
        self.serial.read_exact(&mut rx_buffer)?;
        let remaining = if rx_buffer[1] & EXCEPTION_FLAG != 0 {
            CRC_LENGTH
        } else {
            rx_buffer[2] as usize + CRC_LENGTH
        };
        rx_buffer.resize(HEADER_LENGTH + remaining, 0);
        self.serial.read_exact(&mut rx_buffer[HEADER_LENGTH..])?;

        self.last_execution = Instant::now();

        log::trace!("receive_frame: {:02X?}", rx_buffer);
        Ok(rx_buffer)
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.serial.set_timeout(timeout).map_err(Error::from)
    }

    /// Sets the pause between two requests, at least [`MINIMUM_DELAY`].
    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = Duration::max(delay, MINIMUM_DELAY);
    }
}

impl RegisterClient for ModbusRtu {
    fn read_holding_registers(
        &mut self,
        slave: Address,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<Word>> {
        self.send_bytes(&read_request(slave, address, quantity))?;
        let frame = self.receive_frame()?;
        decode_reply(slave, &frame)
    }
}
