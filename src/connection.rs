use crate::modbus::{ModbusRTUCodec, Operation, Request, Response};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::time::Instant;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder as _, Encoder as _};
use tracing::{debug, info, trace};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open {1:?} for reading and writing")]
    OpenDevice(#[source] tokio_serial::Error, PathBuf),
    #[error("could not encode the request")]
    Encode(#[source] std::io::Error),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not flush out the request")]
    Flush(#[source] std::io::Error),
    #[error("could not read data from the serial device")]
    Receive(#[source] std::io::Error),
    #[error("received a malformed response")]
    Decode(#[source] std::io::Error),
    #[error("the serial device was closed")]
    Closed,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("device responded with exception code {0}")]
    Exception(u8),
    #[error("response came from node {received} instead of node {expected}")]
    WrongDevice { expected: u8, received: u8 },
    #[error("expected {expected} registers in the response, got {received}")]
    WrongLength { expected: u16, received: usize },
}

/// The capability to read input registers from a single, already addressed device.
///
/// Implementations are used by one pass at a time, hence `&mut self`.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn read_input_registers(&mut self, address: u16, count: u16)
    -> Result<Vec<u16>, Error>;
}

impl<T: Transport> Transport for &mut T {
    async fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, Error> {
        (**self).read_input_registers(address, count).await
    }
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Serial device the RS-485 adapter is available at.
    #[arg(short = 's', long = "serialport", default_value = "/dev/ttyAMA0")]
    pub serial_port: PathBuf,

    /// Baudrate for RS-485 communication.
    #[arg(short = 'b', long = "baud", default_value = "9600")]
    pub baudrate: u32,

    /// Address (RS-485 node address) of the meter.
    #[arg(short = 'a', long = "address", default_value = "1")]
    pub device_id: u8,

    /// If the modbus response isn't received in this amount of time plus the time the response
    /// takes to transmit at the configured baudrate, consider the register read failed.
    #[arg(long, default_value = "1s")]
    pub read_timeout: humantime::Duration,
}

impl Args {
    /// Time it takes to move `bytes` over the wire, at 10 bits per character.
    fn transmit_time(&self, bytes: u16) -> Duration {
        let chars_per_second = u64::from(self.baudrate.max(10) / 10);
        Duration::from_micros(u64::from(bytes) * 1_000_000 / chars_per_second)
    }

    /// Silent interval delimiting RTU frames: 3.5 characters, at least 1.75ms.
    fn frame_gap(&self) -> Duration {
        (self.transmit_time(7) / 2).max(Duration::from_micros(1750))
    }
}

pub struct Connection<IO> {
    io: IO,
    codec: ModbusRTUCodec,
    buffer: BytesMut,
    args: Args,
    /// Set when a response may still be in flight, e.g. after a timeout.
    desynchronized: bool,
}

impl Connection<tokio_serial::SerialStream> {
    pub fn open(args: Args) -> Result<Self, Error> {
        use tokio_serial::SerialPortBuilderExt as _;
        info!(
            message = "opening serial device",
            path = %args.serial_port.display(),
            baudrate = args.baudrate,
            device_id = args.device_id
        );
        let path = args.serial_port.to_string_lossy();
        let io = tokio_serial::new(path, args.baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .map_err(|e| Error::OpenDevice(e, args.serial_port.clone()))?;
        Ok(Self::new(io, args))
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> Connection<IO> {
    pub fn new(io: IO, args: Args) -> Self {
        Self {
            io,
            codec: ModbusRTUCodec::default(),
            buffer: BytesMut::with_capacity(256),
            args,
            desynchronized: false,
        }
    }

    /// Send a request and wait for the matching response frame.
    pub async fn send(&mut self, operation: Operation) -> Result<Response, Error> {
        let request = Request { device_id: self.args.device_id, operation };
        if self.desynchronized {
            self.discard_stale().await?;
        }
        self.buffer.clear();
        let mut out = BytesMut::with_capacity(usize::from(request.encoded_length()));
        self.codec.encode(&request, &mut out).map_err(Error::Encode)?;
        self.io.write_all(&out).await.map_err(Error::Send)?;
        self.io.flush().await.map_err(Error::Flush)?;

        let bus_time =
            self.args.transmit_time(request.encoded_length() + request.expected_response_length());
        let window = bus_time + *self.args.read_timeout;
        let deadline = Instant::now() + window;
        let response = loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(response)) => break response,
                Ok(None) => {}
                Err(e) => {
                    self.desynchronized = true;
                    return Err(Error::Decode(e));
                }
            }
            let read = tokio::time::timeout_at(deadline, self.io.read_buf(&mut self.buffer)).await;
            match read {
                Err(_) => {
                    self.desynchronized = true;
                    return Err(Error::Timeout(window));
                }
                Ok(Err(e)) => return Err(Error::Receive(e)),
                Ok(Ok(0)) => return Err(Error::Closed),
                Ok(Ok(n)) => trace!(message = "received bytes", count = n),
            }
        };
        if response.device_id != request.device_id {
            self.desynchronized = true;
            return Err(Error::WrongDevice {
                expected: request.device_id,
                received: response.device_id,
            });
        }
        Ok(response)
    }

    /// Drop whatever arrives on the line until it stays silent for a frame gap.
    ///
    /// A response to a request that already timed out would otherwise be mistaken for the
    /// response to the next request.
    async fn discard_stale(&mut self) -> Result<(), Error> {
        let gap = self.args.frame_gap();
        loop {
            self.buffer.clear();
            match tokio::time::timeout(gap, self.io.read_buf(&mut self.buffer)).await {
                Err(_) => break,
                Ok(Ok(0)) => return Err(Error::Closed),
                Ok(Ok(n)) => debug!(message = "discarded stale bytes", count = n),
                Ok(Err(e)) => return Err(Error::Receive(e)),
            }
        }
        self.buffer.clear();
        self.desynchronized = false;
        Ok(())
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> Transport for Connection<IO> {
    async fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, Error> {
        let response = self.send(Operation::GetInputs { address, count }).await?;
        if let Some(code) = response.exception_code() {
            return Err(Error::Exception(code));
        }
        let words = response.kind.words().unwrap_or_default();
        if words.len() != usize::from(count) {
            return Err(Error::WrongLength { expected: count, received: words.len() });
        }
        Ok(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::frame;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};

    fn args() -> Args {
        Args {
            serial_port: PathBuf::from("/dev/null"),
            baudrate: 9600,
            device_id: 1,
            read_timeout: Duration::from_millis(500).into(),
        }
    }

    fn connection() -> (Connection<DuplexStream>, DuplexStream) {
        let (ours, device) = tokio::io::duplex(256);
        (Connection::new(ours, args()), device)
    }

    async fn expect_request(device: &mut DuplexStream, expected: &[u8]) {
        let mut request = vec![0; expected.len()];
        device.read_exact(&mut request).await.unwrap();
        assert_eq!(request, expected);
    }

    #[tokio::test]
    async fn reads_registers() {
        let (mut connection, mut device) = connection();
        let device_task = tokio::spawn(async move {
            expect_request(&mut device, &[0x01, 0x04, 0x00, 0x00, 0x00, 0x02, 0x71, 0xCB]).await;
            let response = frame(&[0x01, 0x04, 0x04, 0x43, 0x66, 0x80, 0x00]);
            // Split the frame to exercise partial reads.
            device.write_all(&response[..3]).await.unwrap();
            device.write_all(&response[3..]).await.unwrap();
            device
        });
        let words = connection.read_input_registers(0, 2).await.unwrap();
        assert_eq!(words, vec![0x4366, 0x8000]);
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn reports_exceptions() {
        let (mut connection, mut device) = connection();
        tokio::spawn(async move {
            let mut request = [0; 8];
            device.read_exact(&mut request).await.unwrap();
            device.write_all(&frame(&[0x01, 0x84, 0x02])).await.unwrap();
            device
        });
        let err = connection.read_input_registers(0x9999, 2).await.unwrap_err();
        assert!(matches!(err, Error::Exception(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_recovers() {
        let (mut connection, mut device) = connection();
        let device_task = tokio::spawn(async move {
            let mut request = [0; 8];
            // First request is never answered.
            device.read_exact(&mut request).await.unwrap();
            device.read_exact(&mut request).await.unwrap();
            assert_eq!(request[..6], [0x01, 0x04, 0x00, 0x02, 0x00, 0x02]);
            device.write_all(&frame(&[0x01, 0x04, 0x04, 0x00, 0x00, 0x00, 0x00])).await.unwrap();
            device
        });
        let err = connection.read_input_registers(0, 2).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        let words = connection.read_input_registers(2, 2).await.unwrap();
        assert_eq!(words, vec![0, 0]);
        device_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_a_corrupted_response() {
        let (mut connection, mut device) = connection();
        let device_task = tokio::spawn(async move {
            let mut request = [0; 8];
            device.read_exact(&mut request).await.unwrap();
            let mut corrupted = frame(&[0x01, 0x04, 0x04, 0x43, 0x66, 0x80, 0x00]);
            let last = corrupted.len() - 1;
            corrupted[last] ^= 0xFF;
            device.write_all(&corrupted).await.unwrap();
            device.read_exact(&mut request).await.unwrap();
            assert_eq!(request[..6], [0x01, 0x04, 0x00, 0x02, 0x00, 0x02]);
            device.write_all(&frame(&[0x01, 0x04, 0x04, 0x3F, 0x80, 0x00, 0x00])).await.unwrap();
            device
        });
        let err = connection.read_input_registers(0, 2).await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        let words = connection.read_input_registers(2, 2).await.unwrap();
        assert_eq!(words, vec![0x3F80, 0x0000]);
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_other_nodes() {
        let (mut connection, mut device) = connection();
        tokio::spawn(async move {
            let mut request = [0; 8];
            device.read_exact(&mut request).await.unwrap();
            device.write_all(&frame(&[0x07, 0x04, 0x04, 0, 0, 0, 0])).await.unwrap();
            device
        });
        let err = connection.read_input_registers(0, 2).await.unwrap_err();
        assert!(matches!(err, Error::WrongDevice { expected: 1, received: 7 }));
    }

    #[tokio::test]
    async fn rejects_short_responses() {
        let (mut connection, mut device) = connection();
        tokio::spawn(async move {
            let mut request = [0; 8];
            device.read_exact(&mut request).await.unwrap();
            device.write_all(&frame(&[0x01, 0x04, 0x02, 0, 0])).await.unwrap();
            device
        });
        let err = connection.read_input_registers(0, 2).await.unwrap_err();
        assert!(matches!(err, Error::WrongLength { expected: 2, received: 1 }));
    }

    #[test]
    fn response_window_scales_with_baudrate() {
        let mut args = args();
        assert_eq!(args.transmit_time(960), Duration::from_secs(1));
        args.baudrate = 19200;
        assert_eq!(args.transmit_time(960), Duration::from_millis(500));
        assert_eq!(args.frame_gap(), Duration::from_nanos(1_822_500));
        args.baudrate = 115200;
        assert_eq!(args.frame_gap(), Duration::from_micros(1750));
    }
}
