use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Function code 4, "read input registers".
pub const READ_INPUT_REGISTERS: u8 = 0x04;

/// The most registers a single function code 4 request may ask for.
pub const MAX_READ_COUNT: u16 = 125;

const EXCEPTION_FLAG: u8 = 0x80;

const CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub device_id: u8,
    pub operation: Operation,
}

impl Request {
    /// Length of the encoded request frame on the wire.
    pub fn encoded_length(&self) -> u16 {
        match self.operation {
            // address, function, 2 bytes start, 2 bytes count, 2 bytes crc.
            Operation::GetInputs { .. } => 8,
        }
    }

    /// Estimate how many bytes of response will be necessary to respond to this request.
    ///
    /// This is used to compute how long the bus will be busy with the response at a given
    /// baudrate.
    pub fn expected_response_length(&self) -> u16 {
        match self.operation {
            // address, function, byte count, payload, 2 bytes crc.
            Operation::GetInputs { address: _, count } => count.saturating_mul(2).saturating_add(5),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Operation {
    GetInputs { address: u16, count: u16 },
}

#[derive(Debug)]
pub struct Response {
    pub device_id: u8,
    pub function_code: u8,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::ErrorCode(c) => Some(*c),
            ResponseKind::GetInputs { values: _ } => None,
        }
    }
}

#[derive(Debug)]
pub enum ResponseKind {
    ErrorCode(u8),
    GetInputs { values: Vec<u8> },
}

impl ResponseKind {
    /// The payload of a successful read as big-endian 16-bit words.
    pub fn words(&self) -> Option<Vec<u16>> {
        match self {
            ResponseKind::ErrorCode(_) => None,
            ResponseKind::GetInputs { values } => Some(
                values.chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]])).collect(),
            ),
        }
    }
}

fn invalid_data(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}

/// Modbus RTU framing: `[address, function, payload.., crc_lo, crc_hi]`.
#[derive(Default)]
pub struct ModbusRTUCodec {}

impl Encoder<&Request> for ModbusRTUCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        match req.operation {
            Operation::GetInputs { address, count } => {
                if count == 0 || count > MAX_READ_COUNT {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("cannot read {count} input registers in one request"),
                    ));
                }
                dst.extend([req.device_id, READ_INPUT_REGISTERS]);
                dst.extend(address.to_be_bytes());
                dst.extend(count.to_be_bytes());
            }
        };
        let crc = CRC.checksum(&dst[start..]);
        dst.extend(crc.to_le_bytes());
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusRTUCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            let [device_id, function_code, code, ..] = src[..] else {
                return Ok(None);
            };
            // Anything that is not a response to function 4 is line noise, e.g. a glitch while
            // the transceiver turns the bus around. Skip until a frame header lines up.
            if function_code & !EXCEPTION_FLAG != READ_INPUT_REGISTERS {
                trace!(message = "skipping stray byte", byte = device_id);
                src.advance(1);
                continue;
            }
            let frame_length = if function_code & EXCEPTION_FLAG != 0 {
                5
            } else {
                5 + usize::from(code)
            };
            let Some(frame) = src.get(..frame_length) else {
                src.reserve(frame_length - src.len());
                return Ok(None);
            };
            let (body, checksum) = frame.split_at(frame_length - 2);
            let received = u16::from_le_bytes([checksum[0], checksum[1]]);
            let computed = CRC.checksum(body);
            if received != computed {
                return Err(invalid_data(format!(
                    "crc mismatch (received {received:#06x}, computed {computed:#06x})"
                )));
            }
            let kind = if function_code & EXCEPTION_FLAG != 0 {
                ResponseKind::ErrorCode(code)
            } else {
                ResponseKind::GetInputs { values: body[3..].to_vec() }
            };
            src.advance(frame_length);
            return Ok(Some(Response {
                device_id,
                function_code: function_code & !EXCEPTION_FLAG,
                kind,
            }));
        }
    }
}

#[cfg(test)]
pub(crate) fn frame(body: &[u8]) -> Vec<u8> {
    let mut frame = body.to_vec();
    frame.extend(CRC.checksum(body).to_le_bytes());
    frame
}
