use log::{debug, error, info};
use rmodbus::{client::ModbusRequest, guess_response_frame_len, ModbusProto};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::Config;
use crate::models::{MeterEndpoint, Reading};
use crate::pipeline::ReadingProducer;

pub mod bus;
pub mod registers;

use bus::{BusPort, Direction, DirectionControl};

/// Pause between two meters so slow slaves release the bus
pub const SETTLE_DELAY: Duration = Duration::from_millis(50);

/* address, function and byte count (or exception code) */
const RESPONSE_HEAD_LEN: usize = 3;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Bus I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to open bus {0}: {1}")]
    Open(String, serialport::Error),
    #[error("Unable to build request: {0}")]
    Request(String),
    #[error("Slave {0} answered with error: {1}")]
    Response(u8, String),
    #[error("Slave {slave} returned {got} registers, expected {expected}")]
    ShortResponse { slave: u8, got: usize, expected: usize },
    #[error("Bus worker stopped: {0}")]
    Worker(String),
}

/// Single master on a half duplex RS-485 bus
pub struct TelemetryReader<B: BusPort> {
    bus: B,
    direction: Box<dyn DirectionControl>,
}

impl<B: BusPort> TelemetryReader<B> {
    pub fn new(bus: B, direction: Box<dyn DirectionControl>) -> Self {
        return TelemetryReader { bus, direction };
    }

    /// Leaves the transceiver listening with an empty input buffer
    pub fn begin(&mut self) -> Result<(), ProtocolError> {
        self.direction.set_direction(Direction::Receive)?;
        self.bus.discard_input()?;
        info!("Modbus RS485 started");
        return Ok(());
    }

    /// Reads one meter, either both transactions succeed or there is no reading
    pub fn read_meter(&mut self, meter: &MeterEndpoint) -> Result<Reading, ProtocolError> {
        let slave = meter.modbus_id;

        let regs = self.read_holdings(slave, registers::INSTANT_BLOCK_START, registers::INSTANT_BLOCK_LEN)?;
        let instant = registers::decode_instantaneous(&regs);

        let regs = self.read_holdings(slave, registers::ENERGY_START, registers::ENERGY_LEN)?;
        let total_kwh = registers::decode_energy(&regs);

        return Ok(Reading {
            channel: meter.channel_index,
            voltage: instant.voltage,
            current: instant.current,
            power: instant.power,
            total_kwh,
        });
    }

    fn read_holdings(&mut self, slave: u8, start: u16, count: u16) -> Result<Vec<u16>, ProtocolError> {
        let mut mreq = ModbusRequest::new(slave, ModbusProto::Rtu);
        let mut request = Vec::new();
        mreq.generate_get_holdings(start, count, &mut request)
            .map_err(|e| ProtocolError::Request(format!("{e:?}")))?;

        self.bus.discard_input()?;

        self.direction.set_direction(Direction::Transmit)?;
        let sent = self.bus.write_frame(&request);
        /* release the bus even if the write failed */
        self.direction.set_direction(Direction::Receive)?;
        sent?;

        let mut response = vec![0u8; RESPONSE_HEAD_LEN];
        self.bus.read_exact(&mut response)?;

        let len = guess_response_frame_len(&response, ModbusProto::Rtu)
            .map_err(|e| ProtocolError::Response(slave, format!("{e:?}")))? as usize;
        if len > RESPONSE_HEAD_LEN {
            let mut rest = vec![0u8; len - RESPONSE_HEAD_LEN];
            self.bus.read_exact(&mut rest)?;
            response.extend(rest);
        }

        let mut data = Vec::new();
        mreq.parse_u16(&response, &mut data)
            .map_err(|e| ProtocolError::Response(slave, format!("{e:?}")))?;

        if data.len() < count as usize {
            return Err(ProtocolError::ShortResponse { slave, got: data.len(), expected: count as usize });
        }
        return Ok(data);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub read: usize,
    pub failed: usize,
}

/// Polls all configured meters one after another and feeds the reading queue
pub struct TelemetryPoller<B: BusPort + 'static> {
    reader: Option<TelemetryReader<B>>,
    config: watch::Receiver<Arc<Config>>,
    producer: ReadingProducer,
}

impl<B: BusPort + 'static> TelemetryPoller<B> {
    pub fn new(reader: TelemetryReader<B>, config: watch::Receiver<Arc<Config>>, producer: ReadingProducer) -> Self {
        return TelemetryPoller { reader: Some(reader), config, producer };
    }

    pub async fn start_thread(mut self) -> Result<(), ProtocolError> {
        if let Some(reader) = self.reader.as_mut() {
            reader.begin()?;
        }

        loop {
            let report = self.sweep().await?;
            let interval = self.config.borrow().mqtt.interval.max(1);
            debug!("Sweep done, {} read, {} failed, sleeping {interval}s", report.read, report.failed);
            tokio::time::sleep(Duration::from_secs(interval)).await;
        }
    }

    /// One pass over the meters of the current configuration snapshot
    pub async fn sweep(&mut self) -> Result<SweepReport, ProtocolError> {
        let snapshot = self.config.borrow_and_update().clone();
        let mut report = SweepReport::default();

        for meter in snapshot.meters.iter() {
            let mut reader = self.reader.take()
                .ok_or_else(|| ProtocolError::Worker("reader lost".to_string()))?;
            let m = meter.clone();

            /* serial I/O blocks, the reader travels to the blocking pool and back */
            let (reader, result) = tokio::task::spawn_blocking(move || {
                let result = reader.read_meter(&m);
                (reader, result)
            })
            .await
            .map_err(|e| ProtocolError::Worker(e.to_string()))?;
            self.reader = Some(reader);

            match result {
                Ok(reading) => {
                    debug!("Meter {} (slave {}) read: {:?}", meter.name, meter.modbus_id, reading);
                    report.read += 1;
                    /* a full queue is logged by the producer, the reading is gone either way */
                    let _ = self.producer.enqueue(reading).await;
                }
                Err(e) => {
                    error!("Modbus error on meter {} (slave {}): {e}", meter.name, meter.modbus_id);
                    report.failed += 1;
                }
            }

            tokio::time::sleep(SETTLE_DELAY).await;
        }

        return Ok(report);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline;
    use std::collections::{HashMap, VecDeque};
    use std::io;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum BusEvent {
        Direction(Direction),
        Write(Vec<u8>),
    }

    fn crc16(frame: &[u8]) -> u16 {
        let mut crc: u16 = 0xFFFF;
        for b in frame {
            crc ^= *b as u16;
            for _ in 0..8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xA001;
                } else {
                    crc >>= 1;
                }
            }
        }
        crc
    }

    fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
        let crc = crc16(&frame);
        frame.extend(crc.to_le_bytes());
        frame
    }

    /// Simulated meters answering holding register reads
    #[derive(Clone, Default)]
    pub struct MockBus {
        pub registers: HashMap<u8, HashMap<u16, u16>>,
        /* slave -> register start that answers with an exception */
        pub exceptions: HashMap<u8, u16>,
        pending: VecDeque<u8>,
        pub events: Arc<Mutex<Vec<BusEvent>>>,
    }

    impl MockBus {
        pub fn with_meter(mut self, slave: u8, instant: [u16; 10], energy: [u16; 2]) -> Self {
            let mut regs = HashMap::new();
            for (i, v) in instant.iter().enumerate() {
                regs.insert(registers::INSTANT_BLOCK_START + i as u16, *v);
            }
            regs.insert(registers::ENERGY_START, energy[0]);
            regs.insert(registers::ENERGY_START + 1, energy[1]);
            self.registers.insert(slave, regs);
            self
        }

        pub fn direction(&self) -> Box<dyn DirectionControl> {
            let events = self.events.clone();
            Box::new(move |d: Direction| -> io::Result<()> {
                events.lock().unwrap().push(BusEvent::Direction(d));
                Ok(())
            })
        }
    }

    impl BusPort for MockBus {
        fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            self.events.lock().unwrap().push(BusEvent::Write(frame.to_vec()));

            let slave = frame[0];
            let start = u16::from_be_bytes([frame[2], frame[3]]);
            let count = u16::from_be_bytes([frame[4], frame[5]]);

            if self.exceptions.get(&slave) == Some(&start) {
                self.pending.extend(with_crc(vec![slave, 0x83, 0x02]));
                return Ok(());
            }

            /* unknown slaves stay silent */
            let regs = match self.registers.get(&slave) {
                Some(r) => r,
                None => return Ok(()),
            };

            let mut response = vec![slave, 0x03, (count * 2) as u8];
            for r in start..start + count {
                response.extend(regs.get(&r).copied().unwrap_or(0).to_be_bytes());
            }
            self.pending.extend(with_crc(response));
            Ok(())
        }

        fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
            if self.pending.len() < buf.len() {
                self.pending.clear();
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no answer"));
            }
            for b in buf.iter_mut() {
                *b = self.pending.pop_front().unwrap();
            }
            Ok(())
        }

        fn discard_input(&mut self) -> io::Result<()> {
            self.pending.clear();
            Ok(())
        }
    }

    fn meter(id: u32, channel_index: u32, modbus_id: u8) -> MeterEndpoint {
        MeterEndpoint { id, channel_index, modbus_id, name: format!("meter {id}") }
    }

    fn sample_bus() -> MockBus {
        MockBus::default().with_meter(10, [2205, 123, 0, 271, 0, 0, 0, 0, 0, 0], [0x0001, 0xE240])
    }

    #[test]
    fn test_read_meter_decodes_both_transactions() {
        let bus = sample_bus();
        let direction = bus.direction();
        let mut reader = TelemetryReader::new(bus, direction);

        let reading = reader.read_meter(&meter(1, 2, 10)).unwrap();
        assert_eq!(reading, Reading { channel: 2, voltage: 220.5, current: 1.23, power: 271.0, total_kwh: 1234.56 });
    }

    #[test]
    fn test_direction_wraps_every_request() {
        let bus = sample_bus();
        let events = bus.events.clone();
        let direction = bus.direction();
        let mut reader = TelemetryReader::new(bus, direction);

        reader.read_meter(&meter(1, 1, 10)).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 6);
        for chunk in events.chunks(3) {
            assert_eq!(chunk[0], BusEvent::Direction(Direction::Transmit));
            assert!(matches!(chunk[1], BusEvent::Write(_)));
            assert_eq!(chunk[2], BusEvent::Direction(Direction::Receive));
        }
    }

    #[test]
    fn test_request_frames() {
        let bus = sample_bus();
        let events = bus.events.clone();
        let direction = bus.direction();
        let mut reader = TelemetryReader::new(bus, direction);

        reader.read_meter(&meter(1, 1, 10)).unwrap();

        let writes: Vec<Vec<u8>> = events.lock().unwrap().iter().filter_map(|e| match e {
            BusEvent::Write(f) => Some(f.clone()),
            _ => None,
        }).collect();
        assert_eq!(writes[0], with_crc(vec![10, 0x03, 0x00, 0x0C, 0x00, 0x0A]));
        assert_eq!(writes[1], with_crc(vec![10, 0x03, 0x00, 0x00, 0x00, 0x02]));
    }

    #[test]
    fn test_exception_on_first_block_aborts() {
        let mut bus = sample_bus();
        bus.exceptions.insert(10, registers::INSTANT_BLOCK_START);
        let events = bus.events.clone();
        let direction = bus.direction();
        let mut reader = TelemetryReader::new(bus, direction);

        assert!(matches!(reader.read_meter(&meter(1, 1, 10)), Err(ProtocolError::Response(10, _))));
        /* the energy register was never asked for */
        let writes = events.lock().unwrap().iter().filter(|e| matches!(e, BusEvent::Write(_))).count();
        assert_eq!(writes, 1);
    }

    #[test]
    fn test_exception_on_energy_fails_reading() {
        let mut bus = sample_bus();
        bus.exceptions.insert(10, registers::ENERGY_START);
        let direction = bus.direction();
        let mut reader = TelemetryReader::new(bus, direction);

        assert!(reader.read_meter(&meter(1, 1, 10)).is_err());
    }

    #[test]
    fn test_silent_slave_times_out() {
        let bus = sample_bus();
        let direction = bus.direction();
        let mut reader = TelemetryReader::new(bus, direction);

        match reader.read_meter(&meter(2, 2, 99)) {
            Err(ProtocolError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sweep_skips_failing_meter() {
        let bus = sample_bus().with_meter(11, [2300, 50, 0, 115, 0, 0, 0, 0, 0, 0], [0, 100]);
        let direction = bus.direction();
        let reader = TelemetryReader::new(bus, direction);

        let mut config = Config::default();
        config.meters = vec![meter(1, 1, 10), meter(2, 2, 99), meter(3, 7, 11)];
        let handle = crate::config::ConfigHandle::new(config);

        let (producer, mut consumer) = pipeline::channel();
        let mut poller = TelemetryPoller::new(reader, handle.subscribe(), producer);

        let report = poller.sweep().await.unwrap();
        assert_eq!(report, SweepReport { read: 2, failed: 1 });

        assert_eq!(consumer.dequeue().await.unwrap().channel, 1);
        let second = consumer.dequeue().await.unwrap();
        assert_eq!(second.channel, 7);
        assert_eq!(second.total_kwh, 1.0);
        assert!(consumer.is_empty());
    }
}
