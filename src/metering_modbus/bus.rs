use log::{debug, info};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{BusConfig, DirectionConfig};
use crate::metering_modbus::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Transmit,
    Receive,
}

/// Switches the RS-485 transceiver between driving the bus and listening.
///
/// Implementations own whatever handle toggles the DE/RE line.
pub trait DirectionControl: Send {
    fn set_direction(&mut self, direction: Direction) -> io::Result<()>;
}

impl<F> DirectionControl for F
where
    F: FnMut(Direction) -> io::Result<()> + Send,
{
    fn set_direction(&mut self, direction: Direction) -> io::Result<()> {
        self(direction)
    }
}

/// Raw byte access to the bus
pub trait BusPort: Send {
    /// Writes the frame and returns once it left the UART
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
    /// Fails with `TimedOut` when the slave does not answer in time
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;
    fn discard_input(&mut self) -> io::Result<()>;
}

pub struct SerialBus {
    port: Box<dyn SerialPort>,
}

impl SerialBus {
    /// Opens the UART 8N1 and builds the direction control configured for it
    pub fn open(config: &BusConfig) -> Result<(Self, Box<dyn DirectionControl>), ProtocolError> {
        let port = serialport::new(config.port.as_str(), config.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .timeout(Duration::from_millis(config.response_timeout_ms))
            .open()
            .map_err(|e| ProtocolError::Open(config.port.clone(), e))?;

        let direction: Box<dyn DirectionControl> = match config.direction {
            DirectionConfig::Rts => {
                let handle = port.try_clone().map_err(|e| ProtocolError::Open(config.port.clone(), e))?;
                Box::new(RtsDirection { port: handle })
            }
            DirectionConfig::Gpio(pin) => Box::new(GpioDirection::export(pin)?),
        };

        info!("Opened {} with {} baud", config.port, config.baud_rate);
        return Ok((SerialBus { port }, direction));
    }
}

impl BusPort for SerialBus {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.port.write_all(frame)?;
        /* flush drains the output queue, the transceiver must not switch earlier */
        self.port.flush()
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        Read::read_exact(&mut self.port, buf)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// DE/RE wired to the RTS line of the UART
pub struct RtsDirection {
    port: Box<dyn SerialPort>,
}

impl DirectionControl for RtsDirection {
    fn set_direction(&mut self, direction: Direction) -> io::Result<()> {
        self.port
            .write_request_to_send(direction == Direction::Transmit)
            .map_err(io::Error::from)
    }
}

/// DE/RE wired to a GPIO exported through sysfs
pub struct GpioDirection {
    value: PathBuf,
}

impl GpioDirection {
    pub fn export(pin: u32) -> Result<Self, ProtocolError> {
        let base = PathBuf::from(format!("/sys/class/gpio/gpio{pin}"));
        if !base.exists() {
            debug!("Exporting GPIO {pin}");
            fs::write("/sys/class/gpio/export", pin.to_string())?;
        }
        fs::write(base.join("direction"), "out")?;

        let mut gpio = GpioDirection { value: base.join("value") };
        gpio.set_direction(Direction::Receive)?;
        return Ok(gpio);
    }
}

impl DirectionControl for GpioDirection {
    fn set_direction(&mut self, direction: Direction) -> io::Result<()> {
        let level = match direction {
            Direction::Transmit => "1",
            Direction::Receive => "0",
        };
        fs::write(&self.value, level)
    }
}
