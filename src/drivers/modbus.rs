// SoundWatch - Modbus RTU Master (sound-level module)
//
// Register-level driver for the decibel meter. One request/response pair per
// poll: "read holding registers" for a single register holding dB x 10.
//
//   request  (8): [addr][0x03][reg_hi][reg_lo][cnt_hi][cnt_lo][crc_lo][crc_hi]
//   response (7): [addr][0x03][byte_count][data_hi][data_lo][crc_lo][crc_hi]

use std::time::{Duration, Instant};

use crate::drivers::crc;
use crate::error::FieldBusError;

pub const FUNCTION_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const REQUEST_LEN: usize = 8;
pub const RESPONSE_LEN: usize = 7;
const DATA_OFFSET: usize = 3;

/// A complete response frame. The length is fixed: `byte_count` is never
/// used to infer it.
pub type RawFrame = [u8; RESPONSE_LEN];

/// Byte-level access to the serial line the sensor hangs off.
pub trait SerialPort {
    fn write(&mut self, bytes: &[u8]) -> Result<(), FieldBusError>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout` for the first
    /// one. Returns 0 when nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, FieldBusError>;
}

/// Build a "read holding registers" request.
pub fn build_request(device_address: u8, register_address: u16, register_count: u16) -> [u8; REQUEST_LEN] {
    let [reg_hi, reg_lo] = register_address.to_be_bytes();
    let [cnt_hi, cnt_lo] = register_count.to_be_bytes();
    let mut frame = [
        device_address,
        FUNCTION_READ_HOLDING_REGISTERS,
        reg_hi,
        reg_lo,
        cnt_hi,
        cnt_lo,
        0,
        0,
    ];
    let [crc_lo, crc_hi] = crc::crc16(&frame[..6]).to_le_bytes();
    frame[6] = crc_lo;
    frame[7] = crc_hi;
    frame
}

/// Slave side of a single-register read, as the sound-level module answers.
pub fn build_response(device_address: u8, raw: u16) -> RawFrame {
    let [hi, lo] = raw.to_be_bytes();
    let mut frame = [device_address, FUNCTION_READ_HOLDING_REGISTERS, 2, hi, lo, 0, 0];
    let [crc_lo, crc_hi] = crc::crc16(&frame[..RESPONSE_LEN - 2]).to_le_bytes();
    frame[RESPONSE_LEN - 2] = crc_lo;
    frame[RESPONSE_LEN - 1] = crc_hi;
    frame
}

/// Validate a response and convert its data word to decibels.
pub fn parse_reading(frame: &RawFrame) -> Result<f32, FieldBusError> {
    let Some((body, received)) = crc::split_trailer(frame) else {
        return Err(FieldBusError::Timeout {
            received: frame.len(),
            expected: RESPONSE_LEN,
        });
    };
    let computed = crc::crc16(body);
    if computed != received {
        return Err(FieldBusError::Checksum { computed, received });
    }

    let raw = u16::from_be_bytes([frame[DATA_OFFSET], frame[DATA_OFFSET + 1]]);
    Ok(f32::from(raw) / 10.0)
}

pub struct FieldBusClient<P> {
    port: P,
    timeout: Duration,
}

impl<P: SerialPort> FieldBusClient<P> {
    pub fn new(port: P, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    /// Send a register read request.
    pub fn request_reading(
        &mut self,
        device_address: u8,
        register_address: u16,
        register_count: u16,
    ) -> Result<(), FieldBusError> {
        let request = build_request(device_address, register_address, register_count);
        self.port.write(&request)
    }

    /// Block until a full response frame arrives or the deadline passes.
    pub fn read_response(&mut self) -> Result<RawFrame, FieldBusError> {
        let mut frame = [0u8; RESPONSE_LEN];
        self.read_exact(&mut frame)?;
        Ok(frame)
    }

    /// Fill `buf` completely within one read deadline.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), FieldBusError> {
        let deadline = Instant::now() + self.timeout;
        let mut received = 0;

        while received < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FieldBusError::Timeout {
                    received,
                    expected: buf.len(),
                });
            }
            received += self.port.read(&mut buf[received..], remaining)?;
        }
        Ok(())
    }

    /// One full poll: request, wait for the response, decode.
    pub fn read_decibels(
        &mut self,
        device_address: u8,
        register_address: u16,
        register_count: u16,
    ) -> Result<f32, FieldBusError> {
        self.request_reading(device_address, register_address, register_count)?;
        let frame = self.read_response()?;
        parse_reading(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::thread;

    /// Serial port fed from a script of chunks. An exhausted script behaves
    /// like a silent line.
    #[derive(Default)]
    struct ScriptedPort {
        written: Vec<Vec<u8>>,
        chunks: VecDeque<Vec<u8>>,
    }

    impl SerialPort for ScriptedPort {
        fn write(&mut self, bytes: &[u8]) -> Result<(), FieldBusError> {
            self.written.push(bytes.to_vec());
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, FieldBusError> {
            match self.chunks.pop_front() {
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.chunks.push_front(chunk.split_off(n));
                    }
                    Ok(n)
                }
                None => {
                    thread::sleep(timeout);
                    Ok(0)
                }
            }
        }
    }

    fn response(byte_count: u8, raw: u16) -> RawFrame {
        let [hi, lo] = raw.to_be_bytes();
        let mut frame = [0x01, 0x03, byte_count, hi, lo, 0, 0];
        let [crc_lo, crc_hi] = crc::crc16(&frame[..5]).to_le_bytes();
        frame[5] = crc_lo;
        frame[6] = crc_hi;
        frame
    }

    fn client(chunks: Vec<Vec<u8>>) -> FieldBusClient<ScriptedPort> {
        let port = ScriptedPort {
            chunks: chunks.into(),
            ..Default::default()
        };
        FieldBusClient::new(port, Duration::from_millis(30))
    }

    #[test]
    fn request_frame_layout() {
        assert_eq!(
            build_request(0x01, 0x0000, 1),
            [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]
        );

        let frame = build_request(0x11, 0x1234, 0x0002);
        assert_eq!(frame[..6], [0x11, 0x03, 0x12, 0x34, 0x00, 0x02]);
        assert!(crc::validate(&frame));
    }

    #[test]
    fn decodes_tenths_of_a_decibel() {
        assert_eq!(parse_reading(&response(2, 652)).unwrap(), 65.2);
        assert_eq!(parse_reading(&response(2, 0)).unwrap(), 0.0);
    }

    #[test]
    fn slave_response_round_trips() {
        let frame = build_response(0x01, 734);
        assert_eq!(frame, response(2, 734));
        assert_eq!(parse_reading(&frame).unwrap(), 73.4);
    }

    #[test]
    fn corrupted_response_is_rejected() {
        let mut frame = response(2, 652);
        frame[4] ^= 0x01;
        assert!(matches!(parse_reading(&frame), Err(FieldBusError::Checksum { .. })));
    }

    #[test]
    fn checksum_error_reports_trailer_and_body_crc() {
        let mut frame = response(2, 652);
        frame[5] ^= 0xFF;
        let expected_computed = crc::crc16(&frame[..5]);
        let expected_received = u16::from_le_bytes([frame[5], frame[6]]);

        match parse_reading(&frame) {
            Err(FieldBusError::Checksum { computed, received }) => {
                assert_eq!(computed, expected_computed);
                assert_eq!(received, expected_received);
                assert!(!crc::validate(&frame));
            }
            other => panic!("expected checksum error, got {other:?}"),
        }
    }

    #[test]
    fn inconsistent_byte_count_is_accepted_at_fixed_length() {
        // byte_count claims 4 data bytes; the frame is still the fixed 7 bytes
        // with a valid checksum, so it decodes.
        assert_eq!(parse_reading(&response(4, 700)).unwrap(), 70.0);
    }

    #[test]
    fn poll_writes_request_and_reads_split_response() {
        let frame = response(2, 583);
        let mut bus = client(vec![frame[..2].to_vec(), frame[2..].to_vec()]);

        let value = bus.read_decibels(0x01, 0x0000, 1).unwrap();

        assert_eq!(value, 58.3);
        assert_eq!(bus.port.written, vec![build_request(0x01, 0x0000, 1).to_vec()]);
    }

    #[test]
    fn short_read_times_out() {
        let frame = response(2, 583);
        let mut bus = client(vec![frame[..4].to_vec()]);

        match bus.read_response() {
            Err(FieldBusError::Timeout { received, expected }) => {
                assert_eq!(received, 4);
                assert_eq!(expected, RESPONSE_LEN);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn silent_line_times_out_with_nothing_received() {
        let mut bus = client(Vec::new());
        assert!(matches!(
            bus.read_decibels(0x01, 0x0000, 1),
            Err(FieldBusError::Timeout { received: 0, .. })
        ));
    }
}
