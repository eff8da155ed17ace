//! BGAPI over a serial channel.

use crate::serial::{ChannelId, SerialError, Transport};
use bgapi_proto::{Command, Frame, ReadError, ReadExact, HEADER_LEN};
use core::fmt;
use tracing::trace;

/// Longest command the host ever sends: an upload with a full chunk.
const MAX_COMMAND_LEN: usize = HEADER_LEN + 1 + Command::MAX_UPLOAD_CHUNK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// Reading or writing the channel failed
    Serial(SerialError),
    /// A message could not be encoded or decoded
    Protocol(bgapi_proto::Error),
}

impl From<SerialError> for LinkError {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

impl From<bgapi_proto::Error> for LinkError {
    fn from(e: bgapi_proto::Error) -> Self {
        Self::Protocol(e)
    }
}

impl From<ReadError<SerialError>> for LinkError {
    fn from(e: ReadError<SerialError>) -> Self {
        match e {
            ReadError::Io(e) => Self::Serial(e),
            ReadError::Frame(e) => Self::Protocol(e),
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial(e) => write!(f, "serial link: {e}"),
            Self::Protocol(e) => write!(f, "bgapi: {e}"),
        }
    }
}

/// Reads a channel's receive ring as a byte stream.
struct ChannelReader<'t, T: ?Sized> {
    transport: &'t mut T,
    channel: ChannelId,
}

impl<T: Transport + ?Sized> ReadExact for ChannelReader<'_, T> {
    type Error = SerialError;

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SerialError> {
        self.transport.buffered_read(self.channel, buf).map(drop)
    }
}

/// Waits for the next message on `channel`.
pub fn read_frame<'b, T>(
    transport: &mut T,
    channel: ChannelId,
    buf: &'b mut [u8],
) -> Result<Frame<'b>, LinkError>
where
    T: Transport + ?Sized,
{
    let mut reader = ChannelReader { transport, channel };
    let frame = bgapi_proto::read_frame(&mut reader, buf)?;
    trace!(%channel, id = %frame.id(), len = frame.payload.len(), "rx");
    Ok(frame)
}

pub fn send_command<T>(transport: &mut T, channel: ChannelId, cmd: &Command<'_>) -> Result<(), LinkError>
where
    T: Transport + ?Sized,
{
    let mut buf = [0u8; MAX_COMMAND_LEN];
    let encoded = cmd.encode_to(&mut buf)?;
    transport.blocking_write(channel, encoded)?;
    trace!(%channel, id = %cmd.id(), len = encoded.len(), "tx");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use bgapi_proto::{Message, MessageId};
    use std::collections::VecDeque;

    const MODULE: ChannelId = ChannelId::from_const(2);

    #[derive(Default)]
    struct Loopback {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl Transport for Loopback {
        fn blocking_write(&mut self, _: ChannelId, bytes: &[u8]) -> Result<usize, SerialError> {
            self.tx.extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn blocking_read(&mut self, ch: ChannelId, buf: &mut [u8]) -> Result<usize, SerialError> {
            self.buffered_read(ch, buf)
        }

        fn buffered_read(&mut self, channel: ChannelId, buf: &mut [u8]) -> Result<usize, SerialError> {
            if self.rx.len() < buf.len() {
                return Err(SerialError::Timeout {
                    channel,
                    wanted: buf.len(),
                    received: self.rx.len(),
                });
            }
            for slot in buf.iter_mut() {
                *slot = self.rx.pop_front().unwrap();
            }
            Ok(buf.len())
        }

        fn wait_buffered(&mut self, _: ChannelId, _: usize) -> Result<(), SerialError> {
            Ok(())
        }

        fn buffered_len(&self, _: ChannelId) -> Result<usize, SerialError> {
            Ok(self.rx.len())
        }

        fn clear_buffered(&mut self, _: ChannelId) -> Result<(), SerialError> {
            self.rx.clear();
            Ok(())
        }
    }

    #[test]
    fn reads_frames_after_reset_noise() {
        let mut tp = Loopback::default();
        let mut scratch = [0u8; 32];
        let boot = Message::DfuBoot {
            bootloader_version: 0x0102_0304,
        };
        tp.rx.push_back(0);
        tp.rx.extend(boot.encode_to(&mut scratch).unwrap().iter());

        let mut buf = [0u8; 64];
        let frame = read_frame(&mut tp, MODULE, &mut buf).unwrap();
        assert_eq!(frame.message(), Ok(boot));
        assert!(tp.rx.is_empty());
    }

    #[test]
    fn short_reads_surface_as_serial_errors() {
        let mut tp = Loopback::default();
        tp.rx.extend([0xa0, 0x04, 0x00, 0x00, 0x01]);
        let mut buf = [0u8; 64];
        assert!(matches!(
            read_frame(&mut tp, MODULE, &mut buf),
            Err(LinkError::Serial(SerialError::Timeout { wanted: 4, .. }))
        ));
    }

    #[test]
    fn sends_encoded_commands() {
        let mut tp = Loopback::default();
        send_command(&mut tp, MODULE, &Command::DfuReset { dfu: true }).unwrap();
        assert_eq!(tp.tx, [0x20, 0x01, 0x00, 0x00, 0x01]);

        let chunk = [0x55; Command::MAX_UPLOAD_CHUNK];
        tp.tx.clear();
        send_command(&mut tp, MODULE, &Command::DfuFlashUpload { data: &chunk }).unwrap();
        assert_eq!(tp.tx.len(), MAX_COMMAND_LEN);

        let mut buf = [0u8; MAX_COMMAND_LEN];
        let mut bytes = &tp.tx[..];
        let frame = bgapi_proto::read_frame(&mut bytes, &mut buf).unwrap();
        assert_eq!(frame.id(), MessageId::DFU_FLASH_UPLOAD);
    }
}
